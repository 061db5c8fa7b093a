pub mod controller;
pub mod error;
pub mod handler;
pub mod llm;
pub mod parsing;
pub mod prompts;
pub mod repl;
pub mod session;

pub use controller::{Controller, ControllerConfig};
pub use error::{ControllerError, EnvironmentError, HandlerError, RlmError};
