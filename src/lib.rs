pub mod blob;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod logging;
pub mod model;
pub mod retention;
pub mod storage;

pub use database::Database;
pub use error::StoreError;
