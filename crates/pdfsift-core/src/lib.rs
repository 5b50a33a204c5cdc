pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod pdf;
pub mod retention;
pub mod schema;
pub mod storage;

pub use config::AppConfig;
pub use db::Database;
pub use error::{CoreError, Result};
