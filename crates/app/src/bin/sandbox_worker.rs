use std::env;
use std::io::{self, BufRead, Write};

use rlm_runtime_gateway::protocol::{SandboxRunRequest, SandboxRunResult, WorkerRequest, WorkerResponse};
use rlm_runtime_gateway::{
    DEFAULT_MAX_ITERATIONS, DEFAULT_RECURSIVE_MAX_DEPTH, default_min_timeout, default_root_timeout,
    default_step,
};
use rlm_runtime_core::controller::{BrokerControllerConfig, DEFAULT_MAX_ECHO_CHARS};
use rlm_runtime_core::parsing::context_from_value;
use rlm_runtime_core::prompts::DEFAULT_QUERY;
use rlm_runtime_core::session::Session;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = worker_config_from_env()?;
    let mut session = Session::new_via_broker(config);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                let _ = emit(
                    &mut stdout,
                    &WorkerResponse::Error {
                        message: format!("stdin read failed: {err}"),
                    },
                );
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                let _ = emit(
                    &mut stdout,
                    &WorkerResponse::Error {
                        message: format!("invalid request: {err}"),
                    },
                );
                continue;
            }
        };
        match request {
            WorkerRequest::Ping => emit(&mut stdout, &WorkerResponse::Pong)?,
            WorkerRequest::Shutdown => {
                emit(&mut stdout, &WorkerResponse::Ack)?;
                break;
            }
            WorkerRequest::Run(request) => match run_request(&runtime, &mut session, request) {
                Ok(result) => emit(&mut stdout, &WorkerResponse::RunResult(result))?,
                Err(err) => emit(&mut stdout, &WorkerResponse::Error { message: err })?,
            },
        }
    }
    Ok(())
}

fn run_request(
    runtime: &tokio::runtime::Runtime,
    session: &mut Session,
    request: SandboxRunRequest,
) -> Result<SandboxRunResult, String> {
    let query = if request.query.is_empty() {
        DEFAULT_QUERY.to_owned()
    } else {
        request.query
    };

    if request.initialize {
        let context = context_from_value(request.context);
        if let Some(code) = request.code {
            runtime
                .block_on(session.prime(context, &query))
                .map_err(|err| err.to_string())?;
            let result = runtime
                .block_on(session.execute_code(&code))
                .map_err(|err| err.to_string())?;
            return Ok(SandboxRunResult {
                response: None,
                stdout: Some(result.stdout),
                stderr: Some(result.stderr),
            });
        }
        let response = runtime
            .block_on(session.turn(context, &query))
            .map_err(|err| err.to_string())?;
        return Ok(SandboxRunResult {
            response: Some(response),
            stdout: None,
            stderr: None,
        });
    }

    if let Some(code) = request.code {
        let result = runtime
            .block_on(session.execute_code(&code))
            .map_err(|err| err.to_string())?;
        return Ok(SandboxRunResult {
            response: None,
            stdout: Some(result.stdout),
            stderr: Some(result.stderr),
        });
    }

    let response = runtime
        .block_on(session.continue_turn(&query))
        .map_err(|err| err.to_string())?;
    Ok(SandboxRunResult {
        response: Some(response),
        stdout: None,
        stderr: None,
    })
}

/// The worker holds no provider credentials; it only needs the broker's
/// address to route every LM call back through the gateway process.
fn worker_config_from_env() -> Result<BrokerControllerConfig, String> {
    let broker_url = env::var("RLM_BROKER_URL")
        .map_err(|_| "RLM_BROKER_URL is required for sandbox worker".to_owned())?;
    Ok(BrokerControllerConfig {
        broker_url,
        other_depths: 1,
        max_iterations: DEFAULT_MAX_ITERATIONS,
        recursive_max_depth: DEFAULT_RECURSIVE_MAX_DEPTH,
        root_timeout: default_root_timeout(),
        min_timeout: default_min_timeout(),
        step: default_step(),
        max_echo_chars: DEFAULT_MAX_ECHO_CHARS,
    })
}

fn emit(stdout: &mut impl Write, response: &WorkerResponse) -> Result<(), String> {
    let payload = serde_json::to_string(response).map_err(|err| err.to_string())?;
    stdout
        .write_all(payload.as_bytes())
        .map_err(|err| format!("stdout write failed: {err}"))?;
    stdout
        .write_all(b"\n")
        .map_err(|err| format!("stdout write failed: {err}"))?;
    stdout
        .flush()
        .map_err(|err| format!("stdout flush failed: {err}"))
}
