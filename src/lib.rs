pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod shutdown;
pub mod store;

pub use error::{ErrorKind, Result, StoreError};
pub use store::JobStore;
