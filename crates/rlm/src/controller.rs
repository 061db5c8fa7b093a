//! The Iteration Controller: drives the root-model / REPL loop up to
//! `max_iterations`, executes at most one code block per turn, recognizes
//! terminal markers, and forces a best-effort final answer if the cap is hit.
//! Also implements `RecursiveRunner` so `rlm_query` inside a REPL can spawn a
//! depth-bounded child controller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{ControllerError, EnvironmentError};
use crate::handler::{BrokerLmClient, CoreHandler, DepthRouter, StreamServer};
use crate::llm::{HttpLmClient, LlmClient, LlmError, Message, UsageSummary};
use crate::parsing::{
    ContextData, ContextInput, FinalAnswerKind, FinishReason, add_execution_result_to_messages,
    convert_context_for_repl, find_code_blocks, find_final_answer, format_repl_echo,
};
use crate::prompts::{
    DEFAULT_QUERY, REPL_SYSTEM_PROMPT, build_system_prompt, extra_code_blocks_warning,
    next_action_prompt,
};
use crate::repl::{RecursiveRunner, ReplHandle, ReplResult};

/// Consecutive root-model call failures tolerated before a completion gives up.
const MAX_CONSECUTIVE_LLM_FAILURES: usize = 3;

/// Caps the rendered REPL echo appended to the transcript each turn.
pub const DEFAULT_MAX_ECHO_CHARS: usize = 6_000;

#[derive(Clone)]
pub struct ControllerConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub other_models: Vec<String>,
    pub max_iterations: usize,
    pub recursive_max_depth: usize,
    pub root_timeout: Duration,
    pub min_timeout: Duration,
    pub step: Duration,
    pub max_echo_chars: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            other_models: Vec::new(),
            max_iterations: 10,
            recursive_max_depth: 3,
            root_timeout: Duration::from_secs(120),
            min_timeout: Duration::from_secs(20),
            step: Duration::from_secs(20),
            max_echo_chars: DEFAULT_MAX_ECHO_CHARS,
        }
    }
}

fn make_client(
    model: &str,
    api_key: Option<String>,
    base_url: String,
) -> Result<Arc<dyn LlmClient>, LlmError> {
    let api_key = api_key.ok_or(LlmError::MissingApiKey)?;
    let client = HttpLmClient::new(api_key, base_url, model.to_owned())?;
    Ok(Arc::new(client))
}

/// Mirrors `ControllerConfig` for a `Controller` that runs outside the
/// process holding provider credentials: every depth's backend talks to the
/// broker over HTTP instead of building its own `HttpLmClient`.
#[derive(Clone)]
pub struct BrokerControllerConfig {
    pub broker_url: String,
    pub other_depths: usize,
    pub max_iterations: usize,
    pub recursive_max_depth: usize,
    pub root_timeout: Duration,
    pub min_timeout: Duration,
    pub step: Duration,
    pub max_echo_chars: usize,
}

fn build_broker_depth_router(config: &BrokerControllerConfig) -> DepthRouter {
    let root: Arc<dyn LlmClient> = Arc::new(BrokerLmClient::new(config.broker_url.clone(), 0));
    let other_backends = (1..=config.other_depths)
        .map(|depth| Arc::new(BrokerLmClient::new(config.broker_url.clone(), depth)) as Arc<dyn LlmClient>)
        .collect();
    DepthRouter::new(
        root,
        other_backends,
        config.root_timeout,
        config.min_timeout,
        config.step,
    )
}

pub fn build_depth_router(config: &ControllerConfig) -> Result<DepthRouter, LlmError> {
    let root = make_client(&config.model, config.api_key.clone(), config.base_url.clone())?;
    let mut other_backends = Vec::with_capacity(config.other_models.len());
    for model in &config.other_models {
        other_backends.push(make_client(model, config.api_key.clone(), config.base_url.clone())?);
    }
    Ok(DepthRouter::new(
        root,
        other_backends,
        config.root_timeout,
        config.min_timeout,
        config.step,
    ))
}

/// Drives one completion (a full root-model / REPL loop) at a given recursion depth.
pub struct Controller {
    depth_router: Arc<DepthRouter>,
    depth: usize,
    recursive_max_depth: usize,
    max_iterations: usize,
    max_echo_chars: usize,
    messages: Vec<Message>,
    repl_env: Option<ReplHandle>,
    handler_task: Option<JoinHandle<()>>,
    query: Option<String>,
    last_context: Option<ContextData>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        let depth_router = build_depth_router(&config)?;
        Ok(Self::from_parts(
            Arc::new(depth_router),
            0,
            config.recursive_max_depth,
            config.max_iterations,
            config.max_echo_chars,
        ))
    }

    /// Builds a controller whose backends never hold provider credentials,
    /// for use inside the sandboxed worker: every call is routed through the
    /// HTTP broker running in the (trusted) gateway process.
    pub fn new_via_broker(config: BrokerControllerConfig) -> Self {
        let depth_router = build_broker_depth_router(&config);
        Self::from_parts(
            Arc::new(depth_router),
            0,
            config.recursive_max_depth,
            config.max_iterations,
            config.max_echo_chars,
        )
    }

    /// Test-only constructor for driving the iteration loop against a
    /// `MockLmClient` without touching the network or spinning up a broker.
    #[cfg(any(test, feature = "test-util"))]
    pub fn new_with_backend(
        backend: Arc<dyn LlmClient>,
        recursive_max_depth: usize,
        max_iterations: usize,
        max_echo_chars: usize,
    ) -> Self {
        let depth_router = DepthRouter::new(
            backend,
            Vec::new(),
            Duration::from_secs(120),
            Duration::from_secs(20),
            Duration::from_secs(20),
        );
        Self::from_parts(
            Arc::new(depth_router),
            0,
            recursive_max_depth,
            max_iterations,
            max_echo_chars,
        )
    }

    fn from_parts(
        depth_router: Arc<DepthRouter>,
        depth: usize,
        recursive_max_depth: usize,
        max_iterations: usize,
        max_echo_chars: usize,
    ) -> Self {
        Self {
            depth_router,
            depth,
            recursive_max_depth,
            max_iterations,
            max_echo_chars,
            messages: Vec::new(),
            repl_env: None,
            handler_task: None,
            query: None,
            last_context: None,
        }
    }

    /// Mirrors the turn just finished into `session_history`/`session_context_i`
    /// before the caller starts the next turn. A no-op on the very first turn.
    pub async fn archive_current_turn(&mut self) -> Result<(), ControllerError> {
        let repl_env = self.repl_env.as_ref().ok_or(ControllerError::EnvironmentNotReady)?;
        if let Some(context) = self.last_context.take() {
            repl_env
                .add_session_context(context)
                .await
                .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?;
        }
        let turn_messages = std::mem::take(&mut self.messages);
        if !turn_messages.is_empty() {
            repl_env
                .add_history(turn_messages)
                .await
                .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?;
        }
        Ok(())
    }

    /// `child_depth = parent depth + 1`; `child.max_iterations = max(1, parent / 2)`.
    fn spawn_child(&self) -> Self {
        let child_depth = self.depth + 1;
        let child_max_iterations = (self.max_iterations / 2).max(1);
        Self::from_parts(
            self.depth_router.clone(),
            child_depth,
            self.recursive_max_depth,
            child_max_iterations,
            self.max_echo_chars,
        )
    }

    /// Merges usage across every backend this router can dispatch to, not
    /// just the one at `self.depth` -- a completion that recursed touches
    /// backends at every depth it visited.
    pub fn usage_summary(&self) -> UsageSummary {
        let mut summary = UsageSummary::default();
        for backend in self.depth_router.all_backends() {
            summary.merge(&backend.get_usage_summary());
        }
        summary
    }

    pub async fn setup_context(
        &mut self,
        context: impl Into<ContextInput>,
        query: Option<&str>,
    ) -> Result<Vec<Message>, ControllerError> {
        let query = query.unwrap_or(DEFAULT_QUERY).to_owned();
        self.query = Some(query.clone());
        info!(depth = self.depth, %query, "starting completion");

        self.reset_messages_to_system_prompt();

        let context_data = convert_context_for_repl(context.into());
        if self.repl_env.is_none() {
            let core_handler = Arc::new(CoreHandler::new(self.depth_router.clone(), self.recursive_max_depth));
            let (addr, task) = StreamServer::new(core_handler)
                .bind("127.0.0.1:0")
                .await
                .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?;
            self.handler_task = Some(task);
            let recursive_runner: Option<Arc<dyn RecursiveRunner>> =
                if self.depth < self.recursive_max_depth {
                    Some(Arc::new(self.spawn_child()) as Arc<dyn RecursiveRunner>)
                } else {
                    None
                };
            let recursive_call_timeout = self.depth_router.time_at_depth(self.depth + 1);
            self.repl_env = Some(
                ReplHandle::new(
                    addr.to_string(),
                    recursive_runner,
                    self.recursive_max_depth.saturating_sub(self.depth),
                    self.depth,
                    recursive_call_timeout,
                )
                .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?,
            );
            self.repl_env
                .as_ref()
                .expect("just set")
                .setup()
                .await
                .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?;
        }
        self.repl_env
            .as_ref()
            .ok_or(ControllerError::EnvironmentNotReady)?
            .set_completion_context(context_data.clone())
            .await
            .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?;
        self.last_context = Some(context_data);

        Ok(self.messages.clone())
    }

    #[instrument(skip(self, context), fields(depth = self.depth))]
    pub async fn completion(
        &mut self,
        context: impl Into<ContextInput>,
        query: Option<&str>,
    ) -> Result<String, ControllerError> {
        self.setup_context(context, query).await?;
        let query = self.query.clone().unwrap_or_else(|| DEFAULT_QUERY.to_owned());
        self.run_completion_loop(&query).await
    }

    /// Runs another query against the environment's current `completion_context`
    /// without replacing it, for follow-up turns that don't introduce new context.
    pub async fn completion_with_existing_context(
        &mut self,
        query: Option<&str>,
    ) -> Result<String, ControllerError> {
        if self.repl_env.is_none() {
            return Err(ControllerError::EnvironmentNotReady);
        }
        let query = query.unwrap_or(DEFAULT_QUERY).to_owned();
        self.query = Some(query.clone());
        info!(depth = self.depth, %query, "continuing completion with existing context");
        self.reset_messages_to_system_prompt();
        self.run_completion_loop(&query).await
    }

    async fn run_completion_loop(&mut self, query: &str) -> Result<String, ControllerError> {
        let repl_env = self
            .repl_env
            .as_ref()
            .cloned()
            .ok_or(ControllerError::EnvironmentNotReady)?;
        let llm = self.depth_router.backend_for_depth(self.depth);
        let mut consecutive_failures = 0usize;

        for iteration in 0..self.max_iterations {
            self.messages.push(next_action_prompt(query, iteration, false));

            let response = match llm.completion(&self.messages, None).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    response
                }
                Err(err) => {
                    self.messages.pop();
                    consecutive_failures += 1;
                    warn!(iteration, %err, consecutive_failures, "root model call failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_LLM_FAILURES {
                        return Err(ControllerError::HandlerFailureBudgetExceeded(
                            consecutive_failures,
                        ));
                    }
                    continue;
                }
            };
            self.messages.pop();
            self.messages.push(Message::assistant(response.clone()));

            if let Some((kind, content)) = find_final_answer(&response) {
                let final_answer = self.resolve_final_answer(kind, content, &repl_env).await?;
                info!(depth = self.depth, iteration, "final answer produced");
                return Ok(final_answer);
            }

            let (code, extra_blocks) = find_code_blocks(&response);
            if let Some(code) = code {
                let (echo, finish_reason) = match repl_env.execute(code.clone()).await {
                    Ok(result) => {
                        let finish_reason = if result.error.is_some() {
                            FinishReason::ErrorUser
                        } else {
                            FinishReason::Ok
                        };
                        (format_repl_echo(&result, finish_reason), finish_reason)
                    }
                    Err(err) => {
                        // The RPC to the REPL worker itself failed (channel closed,
                        // interpreter thread gone) -- distinct from, and more severe
                        // than, an exception raised by the executed code.
                        let fake = ReplResult {
                            stdout: String::new(),
                            stderr: err.to_string(),
                            locals: Vec::new(),
                            locals_map: Vec::new(),
                            execution_time: 0.0,
                            value: None,
                            error: Some(EnvironmentError::WorkerGone),
                        };
                        (format_repl_echo(&fake, FinishReason::ErrorFatal), FinishReason::ErrorFatal)
                    }
                };
                let _ = finish_reason;
                let mut echo = echo;
                if extra_blocks > 0 {
                    echo.push('\n');
                    echo.push_str(&extra_code_blocks_warning(extra_blocks));
                }
                add_execution_result_to_messages(&mut self.messages, &code, &echo, self.max_echo_chars);
            }
        }

        warn!(depth = self.depth, "no final answer found within max_iterations, forcing one");
        self.messages.push(next_action_prompt(query, self.max_iterations, true));
        let final_answer = llm
            .completion(&self.messages, None)
            .await
            .map_err(ControllerError::Llm)?;
        Ok(final_answer)
    }

    async fn resolve_final_answer(
        &self,
        kind: FinalAnswerKind,
        content: String,
        repl_env: &ReplHandle,
    ) -> Result<String, ControllerError> {
        match kind {
            FinalAnswerKind::Final => Ok(content),
            FinalAnswerKind::FinalVar => {
                let var_name = content.trim().trim_matches(['"', '\'']).to_owned();
                match repl_env
                    .get_variable(var_name.clone())
                    .await
                    .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))?
                {
                    Some(value) => Ok(value),
                    None => Err(ControllerError::Environment(EnvironmentError::Execution(format!(
                        "FINAL_VAR referenced unknown variable '{var_name}'"
                    )))),
                }
            }
        }
    }

    pub async fn execute_code(&self, code: &str) -> Result<ReplResult, ControllerError> {
        let repl_env = self.repl_env.as_ref().ok_or(ControllerError::EnvironmentNotReady)?;
        repl_env
            .execute(code.to_owned())
            .await
            .map_err(|err| ControllerError::FatalEnvironment(err.to_string()))
    }

    pub async fn reset(&mut self) {
        if let Some(env) = self.repl_env.take() {
            let _ = env.cleanup().await;
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        self.messages.clear();
        self.query = None;
    }

    fn reset_messages_to_system_prompt(&mut self) {
        if let Some(first) = self.messages.first()
            && first.role == "system"
            && first.content == REPL_SYSTEM_PROMPT
        {
            self.messages.truncate(1);
            return;
        }
        self.messages = build_system_prompt();
    }
}

#[async_trait]
impl RecursiveRunner for Controller {
    async fn completion(&self, query: String, context: ContextInput) -> anyhow::Result<String> {
        let mut child = self.spawn_child();
        child
            .completion(context, Some(&query))
            .await
            .map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLmClient;

    #[tokio::test]
    async fn marker_wins_even_with_code_block() {
        let backend: Arc<dyn LlmClient> = Arc::new(MockLmClient::new(vec![
            "```repl\nx = 1\n```\nFINAL(42)".to_owned(),
        ]));
        let mut controller = Controller::new_with_backend(backend, 0, 5, DEFAULT_MAX_ECHO_CHARS);
        let answer = controller
            .completion("", Some("what is the answer?"))
            .await
            .expect("completion succeeds");
        assert_eq!(answer, "42");
    }

    #[tokio::test]
    async fn iteration_cap_forces_final_answer() {
        let backend: Arc<dyn LlmClient> = Arc::new(MockLmClient::new(vec![
            "still thinking, no marker yet".to_owned(),
            "still thinking, no marker yet".to_owned(),
            "the forced final answer".to_owned(),
        ]));
        let mut controller = Controller::new_with_backend(backend, 0, 2, DEFAULT_MAX_ECHO_CHARS);
        let answer = controller
            .completion("", Some("what is the answer?"))
            .await
            .expect("completion succeeds");
        assert_eq!(answer, "the forced final answer");
    }

    #[tokio::test]
    async fn usage_summary_merges_every_depth() {
        let root = Arc::new(MockLmClient::new(vec!["root reply".to_owned()]));
        let child = Arc::new(MockLmClient::new(vec!["child reply".to_owned()]));
        root.completion(&[], None).await.expect("root call succeeds");
        child.completion(&[], None).await.expect("child call succeeds");

        let router = DepthRouter::new(
            root.clone(),
            vec![child.clone()],
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        let controller = Controller::from_parts(Arc::new(router), 0, 3, 5, DEFAULT_MAX_ECHO_CHARS);

        let summary = controller.usage_summary();
        let total_calls: u64 = summary.model_usage.values().map(|usage| usage.total_calls).sum();
        assert_eq!(total_calls, 2, "usage from both root and child backend must be merged");
    }
}
