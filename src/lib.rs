pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod models;
pub mod options;
pub mod paths;
pub mod pool;
pub mod retry;
pub mod session;
pub mod task;
pub mod task_log;
pub mod validation;
pub mod ytdlp;

pub use error::{EngineError, Result};
