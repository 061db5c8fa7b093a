use thiserror::Error;

use crate::llm::LlmError;

/// Errors produced while driving the root-model / REPL loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("repl environment not initialized")]
    EnvironmentNotReady,
    #[error("root model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("too many consecutive handler failures ({0})")]
    HandlerFailureBudgetExceeded(usize),
    #[error("sandbox could not be (re)initialized: {0}")]
    FatalEnvironment(String),
}

/// Errors raised by the REPL Environment during setup or execution.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("python interpreter init error: {0}")]
    Init(String),
    #[error("python execution error: {0}")]
    Execution(String),
    #[error("repl worker channel closed")]
    WorkerGone,
    #[error("reserved context key '{0}' cannot be set this way")]
    ReservedKey(String),
    #[error("tool call loop exceeded {0} iterations")]
    ToolLoopExceeded(usize),
    #[error("llm_query requires a tool_handler when tools are supplied")]
    MissingToolHandler,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the LM Handler's transport layer (stream channel or HTTP broker).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("request canceled")]
    Canceled,
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("recursion depth exhausted")]
    DepthExhausted,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Crate-wide error used at the public `completion` boundary; carries enough
/// detail to populate `RlmChatCompletion::error` without forcing every caller
/// to match on the component-specific enums above.
#[derive(Debug, Error)]
pub enum RlmError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}
