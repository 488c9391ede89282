pub mod bridge;
pub mod cmd;
pub mod config;
mod error;
pub mod ffmpeg;
pub mod format;
pub mod history;
pub mod logging;
pub mod metadata;
pub mod paths;
pub mod progress;
pub mod queue;
pub mod store;
pub mod supervisor;
pub mod thumbnail;
pub mod tools;

pub use error::{EngineError, Result};
