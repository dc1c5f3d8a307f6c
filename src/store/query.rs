//! Query evaluation shared by every backend.

use std::cmp::Ordering;

use crate::error::{Result, StoreError};
use crate::models::{Job, JobHistory};

use super::{JobHistoryFilter, JobQuery, JobSortField};

/// Whether `job` passes the client and tag filters of `query`.
///
/// Annotations are walked in order. An include-tag match marks the job as
/// included; an exclude-tag match marks it excluded and ends the walk, so
/// an exclude match always wins.
pub(crate) fn job_matches(query: &JobQuery, job: &Job) -> bool {
    if !query.return_all {
        if let Some(client_id) = query.client_id.as_deref() {
            if !client_id.is_empty() && client_id != job.client_id {
                return false;
            }
        }
    }

    let mut included = query.include_tags.is_empty();
    for tag in &job.spec.annotations {
        if query.include_tags.contains(tag) {
            included = true;
        }
        if query.exclude_tags.contains(tag) {
            included = false;
            break;
        }
    }
    included
}

/// Sorts matching jobs, then applies offset and limit. `jobs` must be in
/// insertion order; equal sort keys keep that order.
pub(crate) fn sort_and_page(mut jobs: Vec<Job>, query: &JobQuery) -> Vec<Job> {
    let key = |a: &Job, b: &Job| -> Ordering {
        match query.sort_by {
            Some(JobSortField::Id) => a.id.cmp(&b.id),
            Some(JobSortField::CreatedAt) => a.created_at.cmp(&b.created_at),
            None => Ordering::Equal,
        }
    };

    if query.sort_by.is_some() {
        if query.sort_reverse {
            jobs.sort_by(|a, b| key(b, a));
        } else {
            jobs.sort_by(key);
        }
    } else if query.sort_reverse {
        jobs.reverse();
    }

    let limit = if query.limit == 0 {
        usize::MAX
    } else {
        query.limit
    };
    jobs.into_iter().skip(query.offset).take(limit).collect()
}

/// Picks the job a (possibly short) ID refers to among candidate full IDs.
pub(crate) fn resolve_job_id(id: &str, mut candidates: Vec<String>) -> Result<String> {
    if candidates.iter().any(|c| c == id) {
        return Ok(id.to_string());
    }
    match candidates.len() {
        0 => Err(StoreError::JobNotFound(id.to_string())),
        1 => Ok(candidates.remove(0)),
        _ => {
            candidates.sort();
            Err(StoreError::MultipleJobsFound {
                id: id.to_string(),
                matches: candidates,
            })
        }
    }
}

/// Applies the filter and orders entries by time. `entries` must be in
/// insertion order.
pub(crate) fn filter_history(
    entries: Vec<JobHistory>,
    filter: &JobHistoryFilter,
) -> Vec<JobHistory> {
    let mut entries: Vec<JobHistory> = entries.into_iter().filter(|e| filter.matches(e)).collect();
    entries.sort_by_key(|e| e.time);
    entries
}
