//! The REPL Environment: a RustPython-backed namespace that persists across
//! iterations of one completion. Owns the reserved keys (`completion_context`,
//! `session_context_i`, `context_history`, `session_history`) and the injected
//! helpers (`llm_query`, `llm_query_batched`, `FINAL_VAR`).

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustpython_pylib;
use rustpython_stdlib;
use rustpython_vm as vm;
use rustpython_vm::builtins::{PyBaseException, PyDictRef};
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, InterpreterBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::EnvironmentError;
use crate::handler::{LmRequest, send_stream_request};
use crate::llm::Message;
use crate::parsing::{ContextData, ContextInput, context_from_value};

/// Issues a recursive RLM call (a full completion, not a flat LM call) from
/// inside the REPL. Implemented by the Iteration Controller so that
/// `rlm_query` can spawn a depth-bounded child controller.
#[async_trait]
pub trait RecursiveRunner: Send + Sync {
    async fn completion(&self, query: String, context: ContextInput) -> anyhow::Result<String>;
}

#[derive(Clone, Debug)]
pub struct LocalValue {
    pub name: String,
    pub repr: String,
    pub is_simple: bool,
    pub string_value: Option<String>,
}

#[derive(Debug)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    pub locals: Vec<LocalValue>,
    pub locals_map: Vec<(String, String)>,
    pub execution_time: f64,
    /// The repr of the last bare expression's value, when `__rlm_exec` found one.
    pub value: Option<String>,
    /// Set when the executed code raised; `None` means a clean run.
    pub error: Option<EnvironmentError>,
}

#[derive(Debug, Deserialize)]
struct RlmQueryPayload {
    query: Option<String>,
    context: Option<Value>,
}

#[derive(Serialize)]
struct LlmCallRequest<'a> {
    messages: Vec<Message>,
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct LlmCallResult {
    text: String,
    error: Option<String>,
}

pub const EXECUTION_TIMEOUT_SECS: f64 = 10.0;
pub const MAX_SUBCALL_TOTAL_TOKENS_APPROX: usize = 120_000;
pub const MAX_SUBCALL_MESSAGE_TOKENS_APPROX: usize = 105_000;
pub const MAX_SUBCALL_TOTAL_CHARS: usize = 480_000;
pub const MAX_SUBCALL_MESSAGE_CHARS: usize = 420_000;
/// Bounds the `llm_query(..., tools=..., tool_handler=...)` request/invoke loop.
pub const MAX_TOOL_ITERATIONS: usize = 5;

enum ReplCommand {
    Setup {
        response: oneshot::Sender<anyhow::Result<()>>,
    },
    SetCompletionContext {
        context: ContextData,
        response: oneshot::Sender<anyhow::Result<()>>,
    },
    AddSessionContext {
        context: ContextData,
        response: oneshot::Sender<anyhow::Result<usize>>,
    },
    AddHistory {
        messages: Vec<Message>,
        response: oneshot::Sender<anyhow::Result<usize>>,
    },
    Execute {
        code: String,
        response: oneshot::Sender<anyhow::Result<ReplResult>>,
    },
    GetVariable {
        name: String,
        response: oneshot::Sender<anyhow::Result<Option<String>>>,
    },
    Cleanup {
        response: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ReplHandle {
    sender: mpsc::UnboundedSender<ReplCommand>,
}

struct ReplCore {
    handler_addr: String,
    runtime_handle: Handle,
    recursive_runner: Option<Arc<dyn RecursiveRunner>>,
    recursion_depth: usize,
    current_depth: usize,
    recursive_call_timeout: Duration,
    repl_env: Option<ReplEnv>,
}

pub struct ReplEnv {
    interpreter: Interpreter,
    scope: Scope,
    temp_dir: TempDir,
    handler_addr: String,
    runtime_handle: Handle,
    recursive_runner: Option<Arc<dyn RecursiveRunner>>,
    recursion_depth: usize,
    current_depth: usize,
    recursive_call_timeout: Duration,
    execution_lock: Mutex<()>,
    next_session_index: usize,
    next_history_index: usize,
}

impl ReplEnv {
    /// `handler_addr` points at the in-process `StreamServer` the owning
    /// `Controller` binds for this completion; every sub-LM call made from
    /// inside the REPL is routed through it rather than holding an `LlmClient`
    /// (and its credentials) directly in the interpreter thread.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_addr: String,
        recursive_runner: Option<Arc<dyn RecursiveRunner>>,
        recursion_depth: usize,
        current_depth: usize,
        recursive_call_timeout: Duration,
        runtime_handle: Handle,
    ) -> Result<Self, EnvironmentError> {
        let builder = InterpreterBuilder::new();
        let interpreter = init_stdlib(builder).interpreter();
        let scope = interpreter
            .enter(|vm: &vm::VirtualMachine| {
                let scope = vm.new_scope_with_builtins();
                Ok(scope)
            })
            .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Init(format!("{err:?}")))?;
        let temp_dir = TempDir::new()?;

        let mut env = Self {
            interpreter,
            scope,
            temp_dir,
            handler_addr,
            runtime_handle,
            recursive_runner,
            recursion_depth,
            current_depth,
            recursive_call_timeout,
            execution_lock: Mutex::new(()),
            next_session_index: 0,
            next_history_index: 0,
        };
        env.setup()?;
        Ok(env)
    }

    /// Injects the safe builtins, import allow-list, sandboxed `open`, the
    /// `llm_query`/`llm_query_batched`/`FINAL_VAR` helpers, and the reserved
    /// `completion_context`/`context_history`/`session_history` bindings.
    fn setup(&mut self) -> Result<(), EnvironmentError> {
        let handler_addr = self.handler_addr.clone();
        let current_depth = self.current_depth;
        let recursive_call_timeout = self.recursive_call_timeout;
        let runtime_handle = self.runtime_handle.clone();
        let recursive_runner = self.recursive_runner.clone();
        let recursion_depth = self.recursion_depth;
        let scope = self.scope.clone();
        let temp_dir = self.temp_dir.path().to_path_buf();
        let temp_dir_str = temp_dir.to_string_lossy().to_string();

        let enter_result = self
            .interpreter
            .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<()> {
            scope
                .globals
                .set_item(
                    "__rlm_temp_dir",
                    vm.ctx.new_str(temp_dir_str.as_str()).into(),
                    vm,
                )?;

            let llm_runtime_handle = runtime_handle.clone();
            let llm_handler_addr = handler_addr.clone();
            let llm_call_depth = current_depth;
            let llm_fn = vm.new_function(
                "__rlm_llm_call",
                move |request_json: String| -> vm::PyResult<String> {
                    let (messages, model) = match serde_json::from_str::<LlmCallRequestOwned>(&request_json)
                    {
                        Ok(req) => (req.messages, req.model),
                        Err(_) => (vec![Message::user(request_json.clone())], None),
                    };
                    if let Err(err) = validate_subcall_messages(&messages) {
                        let result = LlmCallResult {
                            text: String::new(),
                            error: Some(err),
                        };
                        return Ok(serde_json::to_string(&result).unwrap_or_default());
                    }
                    let _ = model;
                    let addr = llm_handler_addr.clone();
                    let runtime_handle = llm_runtime_handle.clone();
                    let depth = llm_call_depth;
                    let result = runtime_handle.block_on(async move {
                        let request = LmRequest::new(messages, depth);
                        match send_stream_request(&addr, &request).await {
                            Ok(response) => match response.error {
                                Some(err) => LlmCallResult {
                                    text: String::new(),
                                    error: Some(err),
                                },
                                None => LlmCallResult {
                                    text: response.response,
                                    error: None,
                                },
                            },
                            Err(err) => LlmCallResult {
                                text: String::new(),
                                error: Some(err.to_string()),
                            },
                        }
                    });
                    Ok(serde_json::to_string(&result).unwrap_or_default())
                },
            );
            scope.globals.set_item("__rlm_llm_call", llm_fn.into(), vm)?;

            let llm_batch_runtime_handle = runtime_handle.clone();
            let llm_batch_handler_addr = handler_addr.clone();
            let llm_batch_depth = current_depth;
            let llm_batch_fn = vm.new_function(
                "__rlm_llm_call_batch",
                move |items_json: String| -> vm::PyResult<String> {
                    let items: Vec<LlmCallRequestOwned> = match serde_json::from_str(&items_json) {
                        Ok(items) => items,
                        Err(err) => {
                            let msg = format!("Error parsing llm_query_batched payload: {err}");
                            return Ok(serde_json::to_string(&vec![LlmCallResult {
                                text: String::new(),
                                error: Some(msg),
                            }])
                            .unwrap_or_default());
                        }
                    };
                    let addr = llm_batch_handler_addr.clone();
                    let runtime_handle = llm_batch_runtime_handle.clone();
                    let depth = llm_batch_depth;
                    let results = runtime_handle.block_on(async move {
                        let mut handles = Vec::with_capacity(items.len());
                        for item in items {
                            let addr = addr.clone();
                            handles.push(tokio::spawn(async move {
                                if let Err(err) = validate_subcall_messages(&item.messages) {
                                    return LlmCallResult {
                                        text: String::new(),
                                        error: Some(err),
                                    };
                                }
                                let request = LmRequest::new(item.messages, depth);
                                match send_stream_request(&addr, &request).await {
                                    Ok(response) => match response.error {
                                        Some(err) => LlmCallResult {
                                            text: String::new(),
                                            error: Some(err),
                                        },
                                        None => LlmCallResult {
                                            text: response.response,
                                            error: None,
                                        },
                                    },
                                    Err(err) => LlmCallResult {
                                        text: String::new(),
                                        error: Some(err.to_string()),
                                    },
                                }
                            }));
                        }
                        let mut results = Vec::with_capacity(handles.len());
                        for handle in handles {
                            results.push(handle.await.unwrap_or_else(|err| LlmCallResult {
                                text: String::new(),
                                error: Some(format!("task join error: {err}")),
                            }));
                        }
                        results
                    });
                    Ok(serde_json::to_string(&results).unwrap_or_default())
                },
            );
            scope
                .globals
                .set_item("__rlm_llm_call_batch", llm_batch_fn.into(), vm)?;

            let recursive_runner_many = recursive_runner.clone();
            let rlm_runtime_handle = runtime_handle.clone();
            let rlm_handler_addr = handler_addr.clone();
            let rlm_call_depth = current_depth;
            let rlm_call_timeout = recursive_call_timeout;
            let rlm_fn = vm.new_function(
                "__rlm_rlm_query",
                move |payload_json: String| -> vm::PyResult<String> {
                    let payloads: Vec<RlmQueryPayload> = match serde_json::from_str(&payload_json)
                    {
                        Ok(payloads) => payloads,
                        Err(err) => {
                            return Ok(format!("Error parsing rlm_query payloads: {err}"));
                        }
                    };
                    if payloads.is_empty() {
                        return Ok("[]".to_owned());
                    }
                    let can_recurse = recursion_depth > 0 && recursive_runner_many.is_some();
                    let runner = recursive_runner_many.clone();
                    let runtime_handle = rlm_runtime_handle.clone();
                    let addr = rlm_handler_addr.clone();
                    let depth = rlm_call_depth;
                    let call_timeout = rlm_call_timeout;
                    let outputs = runtime_handle.block_on(async move {
                        let mut outputs = Vec::with_capacity(payloads.len());
                        for payload in payloads {
                            let query = payload
                                .query
                                .clone()
                                .unwrap_or_else(|| crate::prompts::DEFAULT_QUERY.to_owned());
                            if can_recurse {
                                let context = context_from_value(payload.context);
                                let runner = runner.clone().expect("recursive runner checked above");
                                match tokio::time::timeout(call_timeout, runner.completion(query, context))
                                    .await
                                {
                                    Ok(Ok(result)) => outputs.push(result),
                                    Ok(Err(err)) => {
                                        outputs.push(format!("Error running rlm_query: {err}"))
                                    }
                                    Err(_) => outputs.push(
                                        "Error running rlm_query: recursive call timed out".to_owned(),
                                    ),
                                }
                                continue;
                            }
                            // No recursion budget left (or no runner attached, e.g. the
                            // sandboxed worker): degrade to a flat completion instead of
                            // refusing the call outright.
                            let message_text = match &payload.context {
                                Some(Value::String(text)) if !text.is_empty() => {
                                    format!("Context:\n{text}\n\nQuery:\n{query}")
                                }
                                Some(other) => format!("Context:\n{other}\n\nQuery:\n{query}"),
                                None => query.clone(),
                            };
                            let request = LmRequest::new(vec![Message::user(message_text)], depth);
                            match send_stream_request(&addr, &request).await {
                                Ok(response) => match response.error {
                                    Some(err) => {
                                        outputs.push(format!("Error running rlm_query: {err}"))
                                    }
                                    None => outputs.push(response.response),
                                },
                                Err(err) => outputs.push(format!("Error running rlm_query: {err}")),
                            }
                        }
                        outputs
                    });
                    Ok(serde_json::to_string(&outputs).unwrap_or_else(|_| "[]".to_owned()))
                },
            );
            scope
                .globals
                .set_item("__rlm_rlm_query", rlm_fn.into(), vm)?;

            for (label, code) in INIT_SEGMENTS {
                vm.run_string(scope.clone(), code, format!("<rlm_init_{label}>"))?;
            }
            Ok(())
        });
        enter_result.map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Init(format!("{err:?}")))?;
        Ok(())
    }

    /// Overwrites `completion_context` each call; does not touch `context_history`.
    pub fn set_completion_context(&mut self, context: ContextData) -> Result<(), EnvironmentError> {
        self.load_context_into("completion_context", context, false)
    }

    /// Pushes the next `session_context_i`, mirrors it into `context_history`, returns `i`.
    pub fn add_session_context(&mut self, context: ContextData) -> Result<usize, EnvironmentError> {
        let index = self.next_session_index;
        let var_name = format!("session_context_{index}");
        self.load_context_into(&var_name, context, true)?;
        self.next_session_index += 1;
        Ok(index)
    }

    /// Appends a prior turn's messages to `session_history`, returns its index.
    pub fn add_history(&mut self, messages: Vec<Message>) -> Result<usize, EnvironmentError> {
        let index = self.next_history_index;
        let payload = serde_json::to_string(&messages)?;
        let scope = self.scope.clone();
        self.interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<()> {
                scope
                    .globals
                    .set_item("__rlm_history_payload", vm.ctx.new_str(payload.as_str()).into(), vm)?;
                let code = "import json\nsession_history.append(json.loads(__rlm_history_payload))\n";
                vm.run_string(scope.clone(), code, "<rlm_history_append>".to_owned())?;
                Ok(())
            })
            .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))?;
        self.next_history_index += 1;
        Ok(index)
    }

    fn load_context_into(
        &mut self,
        var_name: &str,
        context: ContextData,
        append_history: bool,
    ) -> Result<(), EnvironmentError> {
        if var_name == "context_history" || var_name == "session_history" {
            return Err(EnvironmentError::ReservedKey(var_name.to_owned()));
        }
        let scope = self.scope.clone();
        let temp_dir = self.temp_dir.path().to_path_buf();

        if let Some(json_value) = context.json {
            let path = temp_dir.join(format!("{var_name}.json"));
            let payload = serde_json::to_vec_pretty(&json_value)?;
            fs::write(&path, payload)?;
            let path_str = path.to_string_lossy().to_string();
            let var_literal = var_name.to_owned();
            self.interpreter
                .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<()> {
                    scope
                        .globals
                        .set_item("__rlm_ctx_path", vm.ctx.new_str(path_str.as_str()).into(), vm)?;
                    let code = format!(
                        "import json\nwith open(__rlm_ctx_path, \"r\") as f:\n    {var_literal} = json.load(f)\n"
                    );
                    vm.run_string(scope.clone(), &code, format!("<rlm_ctx_{var_literal}>"))?;
                    if append_history {
                        let hist_code = format!("context_history.append({var_literal})\n");
                        vm.run_string(scope.clone(), &hist_code, format!("<rlm_ctxhist_{var_literal}>"))?;
                    }
                    Ok(())
                })
                .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))?;
        } else if let Some(text) = context.text {
            let path = temp_dir.join(format!("{var_name}.txt"));
            fs::write(&path, text)?;
            let path_str = path.to_string_lossy().to_string();
            let var_literal = var_name.to_owned();
            let scope = self.scope.clone();
            self.interpreter
                .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<()> {
                    scope
                        .globals
                        .set_item("__rlm_ctx_path", vm.ctx.new_str(path_str.as_str()).into(), vm)?;
                    let code = format!(
                        "with open(__rlm_ctx_path, \"r\") as f:\n    {var_literal} = f.read()\n"
                    );
                    vm.run_string(scope.clone(), &code, format!("<rlm_ctx_{var_literal}>"))?;
                    if append_history {
                        let hist_code = format!("context_history.append({var_literal})\n");
                        vm.run_string(scope.clone(), &hist_code, format!("<rlm_ctxhist_{var_literal}>"))?;
                    }
                    Ok(())
                })
                .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))?;
        } else {
            let var_literal = var_name.to_owned();
            let scope = self.scope.clone();
            self.interpreter
                .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<()> {
                    let code = format!("{var_literal} = None\n");
                    vm.run_string(scope.clone(), &code, format!("<rlm_ctx_{var_literal}>"))?;
                    Ok(())
                })
                .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))?;
        }
        Ok(())
    }

    pub fn execute(&mut self, code: &str) -> Result<ReplResult, EnvironmentError> {
        let _lock = self
            .execution_lock
            .lock()
            .map_err(|_| EnvironmentError::Execution("repl lock poisoned".to_owned()))?;
        let scope = self.scope.clone();
        let temp_dir = self.temp_dir.path().to_path_buf();
        let start = Instant::now();

        let mut result = self
            .interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<ReplResult> {
            let temp_dir_str = temp_dir.to_string_lossy().to_string();
            scope.globals.set_item(
                "__rlm_temp_dir",
                vm.ctx.new_str(temp_dir_str.as_str()).into(),
                vm,
            )?;
            let preamble = format!(
                "import io, sys, time\n__rlm_old_stdout = sys.stdout\n__rlm_old_stderr = sys.stderr\n__rlm_stdout = io.StringIO()\n__rlm_stderr = io.StringIO()\nsys.stdout = __rlm_stdout\nsys.stderr = __rlm_stderr\n__rlm_exec_deadline = time.time() + {EXECUTION_TIMEOUT_SECS}\n\ndef __rlm_trace(frame, event, arg):\n    if time.time() > __rlm_exec_deadline:\n        raise TimeoutError('Execution time limit exceeded')\n    return __rlm_trace\n\nsys.settrace(__rlm_trace)\n"
            );
            vm.run_string(scope.clone(), &preamble, "<rlm_preamble>".to_owned())?;
            scope
                .globals
                .set_item("__rlm_code", vm.ctx.new_str(code).into(), vm)?;
            let error = match vm.run_string(scope.clone(), "__rlm_exec(__rlm_code)\n", "<rlm_exec>".to_owned())
            {
                Ok(_) => None,
                Err(exc) => {
                    let message = format!("{exc:?}");
                    vm.print_exception(exc);
                    Some(classify_exception_message(&message))
                }
            };

            let postamble = "import sys\nsys.settrace(None)\nsys.stdout = __rlm_old_stdout\nsys.stderr = __rlm_old_stderr\n__rlm_stdout_value = __rlm_stdout.getvalue()\n__rlm_stderr_value = __rlm_stderr.getvalue()\n__rlm_locals['_stdout'] = __rlm_stdout_value\n__rlm_locals['_stderr'] = __rlm_stderr_value\n";
            vm.run_string(scope.clone(), postamble, "<rlm_postamble>".to_owned())?;

            let stdout = get_string_from_scope(vm, &scope, "__rlm_stdout_value");
            let stderr = get_string_from_scope(vm, &scope, "__rlm_stderr_value");
            let locals = collect_locals(vm, &scope);
            let locals_map = collect_locals_map(vm, &scope);
            let value = get_optional_local_string(vm, &scope, "_value");
            Ok(ReplResult {
                stdout,
                stderr,
                locals,
                locals_map,
                execution_time: start.elapsed().as_secs_f64(),
                value,
                error,
            })
        })
            .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))?;

        result.execution_time = start.elapsed().as_secs_f64();
        Ok(result)
    }

    pub fn get_variable(&self, name: &str) -> Result<Option<String>, EnvironmentError> {
        let scope = self.scope.clone();
        self.interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<Option<String>> {
                let locals = get_locals_dict(vm, &scope);
                let value = locals.and_then(|dict| dict.get_item(name, vm).ok());
                if let Some(value) = value {
                    let text = match value.str(vm) {
                        Ok(py_str) => py_str.as_str().to_owned(),
                        Err(_) => value.repr(vm)?.as_str().to_owned(),
                    };
                    Ok(Some(text))
                } else {
                    Ok(None)
                }
            })
            .map_err(|err: vm::PyRef<PyBaseException>| EnvironmentError::Execution(format!("{err:?}")))
    }
}

#[derive(Deserialize)]
struct LlmCallRequestOwned {
    messages: Vec<Message>,
    #[serde(default)]
    model: Option<String>,
}

impl ReplCore {
    #[allow(clippy::too_many_arguments)]
    fn new(
        handler_addr: String,
        runtime_handle: Handle,
        recursive_runner: Option<Arc<dyn RecursiveRunner>>,
        recursion_depth: usize,
        current_depth: usize,
        recursive_call_timeout: Duration,
    ) -> Self {
        Self {
            handler_addr,
            runtime_handle,
            recursive_runner,
            recursion_depth,
            current_depth,
            recursive_call_timeout,
            repl_env: None,
        }
    }

    fn setup(&mut self) -> Result<(), EnvironmentError> {
        let env = ReplEnv::new(
            self.handler_addr.clone(),
            self.recursive_runner.clone(),
            self.recursion_depth,
            self.current_depth,
            self.recursive_call_timeout,
            self.runtime_handle.clone(),
        )?;
        self.repl_env = Some(env);
        Ok(())
    }

    fn with_env<T>(
        &mut self,
        f: impl FnOnce(&mut ReplEnv) -> Result<T, EnvironmentError>,
    ) -> Result<T, EnvironmentError> {
        let env = self.repl_env.as_mut().ok_or(EnvironmentError::WorkerGone)?;
        f(env)
    }
}

impl ReplHandle {
    /// `handler_addr` is the address of an in-process `StreamServer` the
    /// caller has already bound; `current_depth` is this environment's
    /// absolute recursion depth, used to tag outgoing `LmRequest`s.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_addr: String,
        recursive_runner: Option<Arc<dyn RecursiveRunner>>,
        recursion_depth: usize,
        current_depth: usize,
        recursive_call_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let runtime_handle = Handle::try_current()
            .map_err(|err| anyhow::anyhow!("tokio runtime handle unavailable: {err}"))?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("rlm-repl-worker".to_owned())
            .spawn(move || {
                let mut core = ReplCore::new(
                    handler_addr,
                    runtime_handle,
                    recursive_runner,
                    recursion_depth,
                    current_depth,
                    recursive_call_timeout,
                );
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        ReplCommand::Setup { response } => {
                            let _ = response.send(core.setup().map_err(anyhow::Error::from));
                        }
                        ReplCommand::SetCompletionContext { context, response } => {
                            let _ = response.send(
                                core.with_env(|env| env.set_completion_context(context))
                                    .map_err(anyhow::Error::from),
                            );
                        }
                        ReplCommand::AddSessionContext { context, response } => {
                            let _ = response.send(
                                core.with_env(|env| env.add_session_context(context))
                                    .map_err(anyhow::Error::from),
                            );
                        }
                        ReplCommand::AddHistory { messages, response } => {
                            let _ = response.send(
                                core.with_env(|env| env.add_history(messages))
                                    .map_err(anyhow::Error::from),
                            );
                        }
                        ReplCommand::Execute { code, response } => {
                            let _ = response.send(
                                core.with_env(|env| env.execute(&code)).map_err(anyhow::Error::from),
                            );
                        }
                        ReplCommand::GetVariable { name, response } => {
                            let _ = response.send(
                                core.with_env(|env| env.get_variable(&name))
                                    .map_err(anyhow::Error::from),
                            );
                        }
                        ReplCommand::Cleanup { response } => {
                            core.repl_env = None;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { sender })
    }

    pub async fn setup(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::Setup { response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped setup response"))?
    }

    pub async fn set_completion_context(&self, context: ContextData) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::SetCompletionContext { context, response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped response"))?
    }

    pub async fn add_session_context(&self, context: ContextData) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::AddSessionContext { context, response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped response"))?
    }

    pub async fn add_history(&self, messages: Vec<Message>) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::AddHistory { messages, response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped response"))?
    }

    pub async fn execute(&self, code: String) -> anyhow::Result<ReplResult> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::Execute { code, response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped response"))?
    }

    pub async fn get_variable(&self, name: String) -> anyhow::Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::GetVariable { name, response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped response"))?
    }

    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReplCommand::Cleanup { response: tx })
            .map_err(|_| anyhow::anyhow!("repl worker gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("repl worker dropped cleanup response"))?;
        Ok(())
    }
}

fn init_stdlib(builder: InterpreterBuilder) -> InterpreterBuilder {
    let defs = rustpython_stdlib::stdlib_module_defs(&builder.ctx);
    builder
        .add_native_modules(&defs)
        .add_frozen_modules(rustpython_pylib::FROZEN_STDLIB)
        .init_hook(set_frozen_stdlib_dir)
}

fn set_frozen_stdlib_dir(vm: &mut vm::VirtualMachine) {
    use rustpython_vm::common::rc::PyRc;

    let state = PyRc::get_mut(&mut vm.state).expect("vm state");
    state.config.paths.stdlib_dir = Some(rustpython_pylib::LIB_PATH.to_owned());
}

fn get_string_from_scope(vm: &vm::VirtualMachine, scope: &Scope, name: &str) -> String {
    scope
        .globals
        .get_item(name, vm)
        .ok()
        .and_then(|value| value.try_to_value::<String>(vm).ok())
        .unwrap_or_default()
}

fn get_locals_dict(vm: &vm::VirtualMachine, scope: &Scope) -> Option<PyDictRef> {
    scope
        .globals
        .get_item("__rlm_locals", vm)
        .ok()
        .and_then(|value| value.downcast::<vm::builtins::PyDict>().ok())
}

/// Reads a single key out of `__rlm_locals`, treating Python `None` the same
/// as the key being absent.
fn get_optional_local_string(vm: &vm::VirtualMachine, scope: &Scope, key: &str) -> Option<String> {
    let dict = get_locals_dict(vm, scope)?;
    let value = dict.get_item(key, vm).ok()?;
    if vm.is_none(&value) {
        return None;
    }
    value.try_to_value::<String>(vm).ok()
}

/// Classifies a captured Python traceback against the messages `llm_query`
/// itself raises, falling back to a generic execution error.
fn classify_exception_message(message: &str) -> EnvironmentError {
    if message.contains("requires a tool_handler") {
        EnvironmentError::MissingToolHandler
    } else if message.contains("tool call loop exceeded") {
        EnvironmentError::ToolLoopExceeded(MAX_TOOL_ITERATIONS)
    } else {
        EnvironmentError::Execution(message.to_owned())
    }
}

fn collect_locals(vm: &vm::VirtualMachine, scope: &Scope) -> Vec<LocalValue> {
    let dict = match get_locals_dict(vm, scope) {
        Some(dict) => dict,
        None => return Vec::new(),
    };
    let types = &vm.ctx.types;
    dict.into_iter()
        .filter_map(|(key, value)| {
            let name = key.try_to_value::<String>(vm).ok()?;
            let is_simple = is_simple_type(vm, &value);
            let is_string = value
                .is_instance(types.str_type.as_ref(), vm)
                .unwrap_or(false);
            let string_value = if is_string {
                value.try_to_value::<String>(vm).ok()
            } else {
                None
            };
            let repr = value
                .repr(vm)
                .map(|py_str| py_str.as_str().to_owned())
                .unwrap_or_else(|_| format!("<{}>", value.class().name()));
            Some(LocalValue {
                name,
                repr,
                is_simple,
                string_value,
            })
        })
        .collect()
}

fn collect_locals_map(vm: &vm::VirtualMachine, scope: &Scope) -> Vec<(String, String)> {
    let dict = match get_locals_dict(vm, scope) {
        Some(dict) => dict,
        None => return Vec::new(),
    };
    dict.into_iter()
        .filter_map(|(key, value)| {
            let name = key.try_to_value::<String>(vm).ok()?;
            let repr = value
                .repr(vm)
                .map(|py_str| py_str.as_str().to_owned())
                .unwrap_or_else(|_| format!("<{}>", value.class().name()));
            Some((name, repr))
        })
        .collect()
}

fn is_simple_type(vm: &vm::VirtualMachine, value: &vm::PyObjectRef) -> bool {
    let types = &vm.ctx.types;
    let candidates = [
        types.str_type.as_ref(),
        types.int_type.as_ref(),
        types.float_type.as_ref(),
        types.bool_type.as_ref(),
        types.list_type.as_ref(),
        types.dict_type.as_ref(),
        types.tuple_type.as_ref(),
    ];
    candidates
        .iter()
        .any(|ty| value.is_instance(ty, vm).unwrap_or(false))
}

fn validate_subcall_messages(messages: &[Message]) -> Result<String, String> {
    let total_chars: usize = messages.iter().map(|msg| msg.content.len()).sum();
    let total_tokens_approx = estimate_tokens(total_chars);
    if total_chars > MAX_SUBCALL_TOTAL_CHARS {
        return Err(format!(
            "sub-query too large ({total_chars} chars > {MAX_SUBCALL_TOTAL_CHARS}). Chunk the context before calling llm_query."
        ));
    }
    if total_tokens_approx > MAX_SUBCALL_TOTAL_TOKENS_APPROX {
        return Err(format!(
            "sub-query too large (~{total_tokens_approx} tokens > {MAX_SUBCALL_TOTAL_TOKENS_APPROX}). Chunk the context before calling llm_query."
        ));
    }
    if let Some(oversized) = messages
        .iter()
        .map(|msg| msg.content.len())
        .max()
        .filter(|len| *len > MAX_SUBCALL_MESSAGE_CHARS)
    {
        return Err(format!(
            "single sub-query message too large ({oversized} chars > {MAX_SUBCALL_MESSAGE_CHARS}). Chunk the context before calling llm_query."
        ));
    }
    if let Some(oversized_tokens) = messages
        .iter()
        .map(|msg| estimate_tokens(msg.content.len()))
        .max()
        .filter(|tokens| *tokens > MAX_SUBCALL_MESSAGE_TOKENS_APPROX)
    {
        return Err(format!(
            "single sub-query message too large (~{oversized_tokens} tokens > {MAX_SUBCALL_MESSAGE_TOKENS_APPROX}). Chunk the context before calling llm_query."
        ));
    }
    Ok(())
}

fn estimate_tokens(char_count: usize) -> usize {
    char_count.div_ceil(4)
}

const INIT_SEGMENTS: &[(&str, &str)] = &[
    (
        "builtins_ref",
        r#"__rlm_builtins = __builtins__
if isinstance(__rlm_builtins, dict):
    def __rlm_get_builtin(name):
        return __rlm_builtins.get(name)
else:
    def __rlm_get_builtin(name):
        return getattr(__rlm_builtins, name, None)
"#,
    ),
    (
        "builtin_refs",
        "__rlm_exec_builtin = __rlm_get_builtin('exec')\n__rlm_eval_builtin = __rlm_get_builtin('eval')\n__rlm_globals_builtin = __rlm_get_builtin('globals')\n",
    ),
    (
        "safe_list",
        r#"__rlm_safe_builtin_names = [
    "print", "len", "str", "int", "float", "list", "dict", "set", "tuple", "bool",
    "type", "isinstance", "enumerate", "zip", "map", "filter", "sorted", "min", "max",
    "sum", "abs", "round", "chr", "ord", "hex", "bin", "oct", "repr", "ascii", "format",
    "__import__", "open", "any", "all", "hasattr", "getattr", "setattr", "delattr", "dir",
    "vars", "range", "reversed", "slice", "iter", "next", "pow", "divmod", "complex",
    "bytes", "bytearray", "memoryview", "hash", "id", "callable", "issubclass", "super",
    "property", "staticmethod", "classmethod", "object", "BaseException", "ArithmeticError",
    "LookupError", "EnvironmentError", "AssertionError", "NotImplementedError", "UnicodeError",
    "Warning", "UserWarning", "DeprecationWarning", "PendingDeprecationWarning", "SyntaxWarning",
    "RuntimeWarning", "FutureWarning", "ImportWarning", "UnicodeWarning", "BytesWarning",
    "ResourceWarning", "Exception", "ValueError", "TypeError", "KeyError", "IndexError",
    "AttributeError", "FileNotFoundError", "OSError", "IOError", "RuntimeError", "NameError",
    "ImportError", "StopIteration", "GeneratorExit", "SystemExit", "KeyboardInterrupt",
]"#,
    ),
    (
        "safe_builtins",
        "__rlm_safe_builtins = {}\nfor __rlm_name in __rlm_safe_builtin_names:\n    __rlm_value = __rlm_get_builtin(__rlm_name)\n    if __rlm_value is not None:\n        __rlm_safe_builtins[__rlm_name] = __rlm_value\n",
    ),
    (
        "safe_blocklist",
        "for __rlm_name in [\"input\", \"eval\", \"exec\", \"compile\", \"globals\", \"locals\"]:\n    __rlm_safe_builtins[__rlm_name] = None\n",
    ),
    (
        "safe_imports",
        r#"__rlm_allowed_modules = {
    "json", "math", "statistics", "random", "re", "itertools", "functools",
    "collections", "datetime", "decimal", "fractions", "io", "sys", "time"
}
__rlm_import_builtin = __rlm_get_builtin('__import__')
def __rlm_safe_import(name, globals=None, locals=None, fromlist=(), level=0, _import=__rlm_import_builtin):
    root = name.split('.')[0]
    if root not in __rlm_allowed_modules:
        raise ImportError(f"Import of '{root}' is blocked")
    return _import(name, globals, locals, fromlist, level)
"#,
    ),
    (
        "safe_open",
        r#"__rlm_open_builtin = __rlm_get_builtin('open')
def __rlm_safe_open(path, *args, _import=__rlm_import_builtin, _open=__rlm_open_builtin, _root=__rlm_temp_dir, **kwargs):
    __rlm_os = _import('os')
    __rlm_root = __rlm_os.path.abspath(_root)
    __rlm_path = str(path)
    if not __rlm_os.path.isabs(__rlm_path):
        __rlm_path = __rlm_os.path.join(__rlm_root, __rlm_path)
    __rlm_path = __rlm_os.path.abspath(__rlm_path)
    if not (__rlm_path == __rlm_root or __rlm_path.startswith(__rlm_root + __rlm_os.sep)):
        raise PermissionError("open restricted to temp dir")
    return _open(__rlm_path, *args, **kwargs)
"#,
    ),
    (
        "safe_cleanup",
        "del __rlm_import_builtin\ndel __rlm_open_builtin\n",
    ),
    (
        "safe_overrides",
        "__rlm_safe_builtins['__import__'] = __rlm_safe_import\n__rlm_safe_builtins['open'] = __rlm_safe_open\n",
    ),
    ("builtins_assign", "__builtins__ = __rlm_safe_builtins\n"),
    ("locals_init", "__rlm_locals = {}\n"),
    (
        "reserved_keys_init",
        "completion_context = None\ncontext_history = []\nsession_history = []\n",
    ),
    (
        "llm_query",
        r#"__rlm_json = __rlm_get_builtin('__import__')('json')
__rlm_sys = __rlm_get_builtin('__import__')('sys')

def __rlm_without_trace(fn, *args):
    __rlm_gettrace = getattr(__rlm_sys, 'gettrace', None)
    __rlm_settrace = getattr(__rlm_sys, 'settrace', None)
    prev_trace = None
    if __rlm_settrace is not None:
        prev_trace = __rlm_gettrace() if __rlm_gettrace is not None else None
        __rlm_settrace(None)
    try:
        return fn(*args)
    finally:
        if __rlm_settrace is not None:
            __rlm_settrace(prev_trace)

def llm_query(prompt, model=None, tools=None, tool_handler=None):
    if tools is not None and tool_handler is None:
        raise ValueError("llm_query requires a tool_handler when tools are supplied")
    if isinstance(prompt, list):
        messages = prompt
    else:
        messages = [{"role": "user", "content": str(prompt)}]
    if tools is None:
        payload = __rlm_json.dumps({"messages": messages, "model": model}, default=str)
        result = __rlm_json.loads(__rlm_without_trace(__rlm_llm_call, payload))
        if result.get("error"):
            return f"Error making LLM query: {result['error']}"
        return result.get("text", "")

    conversation = list(messages)
    for _ in range(__RLM_MAX_TOOL_ITERATIONS):
        payload = __rlm_json.dumps({"messages": conversation, "model": model}, default=str)
        result = __rlm_json.loads(__rlm_without_trace(__rlm_llm_call, payload))
        if result.get("error"):
            return f"Error making LLM query: {result['error']}"
        text = result.get("text", "")
        tool_call = None
        if text.startswith("TOOL_CALL:"):
            try:
                tool_call = __rlm_json.loads(text[len("TOOL_CALL:"):].strip())
            except Exception:
                tool_call = None
        if tool_call is None:
            return text
        name = tool_call.get("name")
        arguments = tool_call.get("arguments", {})
        tool_result = tool_handler(name, arguments)
        conversation.append({"role": "assistant", "content": text})
        conversation.append({"role": "user", "content": f"Tool '{name}' result: {tool_result}"})
    raise RuntimeError(f"tool call loop exceeded {__RLM_MAX_TOOL_ITERATIONS} iterations")

def llm_query_batched(prompts, model=None):
    items = []
    for prompt in prompts:
        if isinstance(prompt, list):
            messages = prompt
        else:
            messages = [{"role": "user", "content": str(prompt)}]
        items.append({"messages": messages, "model": model})
    payload = __rlm_json.dumps(items, default=str)
    results = __rlm_json.loads(__rlm_without_trace(__rlm_llm_call_batch, payload))
    return [
        (f"Error making LLM query: {item['error']}" if item.get("error") else item.get("text", ""))
        for item in results
    ]
"#,
    ),
    (
        "rlm_query",
        r#"def rlm_query(query, context=None):
    if isinstance(query, list) and context is None:
        items = query
        unwrap_single = False
    else:
        items = [query]
        unwrap_single = True
    __rlm_json = __rlm_get_builtin('__import__')('json')
    __rlm_globals = __rlm_globals_builtin()
    payload_items = []
    for item in items:
        if isinstance(item, dict):
            q = item.get("query")
            ctx = item.get("context")
        elif isinstance(item, (list, tuple)) and len(item) == 2:
            q, ctx = item
        else:
            q = item
            ctx = context
        if ctx is None:
            ctx = context
        if ctx is None:
            ctx = __rlm_globals.get("completion_context")
        payload_items.append({"query": str(q), "context": ctx})
    payload = __rlm_json.dumps(payload_items, default=str)
    response = __rlm_rlm_query(payload)
    try:
        parsed = __rlm_json.loads(response)
    except Exception:
        return response
    if unwrap_single and isinstance(parsed, list) and len(parsed) == 1:
        return parsed[0]
    return parsed
"#,
    ),
    (
        "final_var",
        r#"def FINAL_VAR(name):
    name = name.strip().strip('"').strip("'").strip('\n').strip('\r')
    if name in __rlm_locals:
        return __rlm_locals[name]
    return f"Error: Variable '{name}' not found in REPL environment"
"#,
    ),
    (
        "max_tool_iterations",
        "__RLM_MAX_TOOL_ITERATIONS = 5\n",
    ),
    (
        "rlm_exec",
        r#"def __rlm_exec(code):
    __rlm_globals = __rlm_globals_builtin()
    lines = code.split('\n')
    import_lines = []
    other_lines = []
    for line in lines:
        if line.startswith(('import ', 'from ')) and not line.startswith('#'):
            import_lines.append(line)
        else:
            other_lines.append(line)

    if import_lines:
        import_code = '\n'.join(import_lines)
        __rlm_exec_builtin(import_code, __rlm_globals, __rlm_globals)

    if other_lines:
        other_code = '\n'.join(other_lines)
        combined_namespace = {**__rlm_globals, **__rlm_locals}
        non_comment_lines = [line for line in other_lines if line and not line.startswith('#')]

        if non_comment_lines:
            last_line = non_comment_lines[-1]
            is_expression = (
                not last_line.startswith(('import ', 'from ', 'def ', 'class ', 'if ', 'for ', 'while ', 'try:', 'with ', 'return ', 'yield ', 'break', 'continue', 'pass')) and
                '=' not in last_line.split('#')[0] and
                not last_line.endswith(':') and
                not last_line.startswith('print(')
            )

            if is_expression:
                try:
                    if len(non_comment_lines) > 1:
                        last_line_start = -1
                        for i, line in enumerate(other_lines):
                            if line == last_line:
                                last_line_start = i
                                break
                        if last_line_start > 0:
                            statements_code = '\n'.join(other_lines[:last_line_start])
                            __rlm_exec_builtin(statements_code, combined_namespace, combined_namespace)

                    result = __rlm_eval_builtin(last_line, combined_namespace, combined_namespace)
                    if result is not None:
                        print(repr(result))
                        __rlm_locals['_value'] = repr(result)
                except Exception:
                    __rlm_exec_builtin(other_code, combined_namespace, combined_namespace)
            else:
                __rlm_exec_builtin(other_code, combined_namespace, combined_namespace)
        else:
            __rlm_exec_builtin(other_code, combined_namespace, combined_namespace)

        for key, value in combined_namespace.items():
            if key not in __rlm_globals:
                __rlm_locals[key] = value
"#,
    ),
];
