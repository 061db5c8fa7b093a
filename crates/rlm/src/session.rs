//! Multi-turn facade over a `Controller`: keeps an external `message_history`
//! (the user-visible chat transcript) while archiving each turn's REPL
//! transcript and context into the environment's `session_history` /
//! `session_context_i` reserved keys before the next turn starts.

use crate::controller::{BrokerControllerConfig, Controller, ControllerConfig};
use crate::error::ControllerError;
use crate::llm::Message;
use crate::parsing::ContextInput;
use crate::repl::ReplResult;

pub struct Session {
    controller: Controller,
    message_history: Vec<Message>,
    turns_completed: usize,
}

impl Session {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        Ok(Self {
            controller: Controller::new(config)?,
            message_history: Vec::new(),
            turns_completed: 0,
        })
    }

    /// Builds a session backed by a broker-routed controller, for the
    /// sandboxed worker: no `ControllerConfig`/credentials involved.
    pub fn new_via_broker(config: BrokerControllerConfig) -> Self {
        Self {
            controller: Controller::new_via_broker(config),
            message_history: Vec::new(),
            turns_completed: 0,
        }
    }

    pub fn message_history(&self) -> &[Message] {
        &self.message_history
    }

    /// Runs one turn against new context, with every prior turn's
    /// context/transcript still in scope via `session_context_i`/`session_history`.
    pub async fn turn(
        &mut self,
        context: impl Into<ContextInput>,
        query: &str,
    ) -> Result<String, ControllerError> {
        if self.turns_completed > 0 {
            self.controller.archive_current_turn().await?;
        }
        let answer = self.controller.completion(context, Some(query)).await?;
        self.record_turn(query, &answer);
        Ok(answer)
    }

    /// Runs a follow-up query against the same `completion_context` as the
    /// previous turn (no new context introduced).
    pub async fn continue_turn(&mut self, query: &str) -> Result<String, ControllerError> {
        if self.turns_completed > 0 {
            self.controller.archive_current_turn().await?;
        }
        let answer = self.controller.completion_with_existing_context(Some(query)).await?;
        self.record_turn(query, &answer);
        Ok(answer)
    }

    /// Initializes (or re-points) the environment's `completion_context`
    /// without running the root-model loop, for callers that drive the REPL
    /// with their own code rather than `turn`'s iteration loop.
    pub async fn prime(
        &mut self,
        context: impl Into<ContextInput>,
        query: &str,
    ) -> Result<(), ControllerError> {
        if self.turns_completed > 0 {
            self.controller.archive_current_turn().await?;
        }
        self.controller.setup_context(context, Some(query)).await?;
        Ok(())
    }

    /// Runs one block of code directly in the environment, bypassing the
    /// root-model loop. Used by out-of-process drivers that already decided
    /// what to execute.
    pub async fn execute_code(&self, code: &str) -> Result<ReplResult, ControllerError> {
        self.controller.execute_code(code).await
    }

    fn record_turn(&mut self, query: &str, answer: &str) {
        self.turns_completed += 1;
        self.message_history.push(Message::user(query));
        self.message_history.push(Message::assistant(answer.to_owned()));
    }

    pub async fn reset(&mut self) {
        self.controller.reset().await;
        self.message_history.clear();
        self.turns_completed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_has_empty_history() {
        let config = ControllerConfig {
            api_key: Some("test-key".to_owned()),
            ..ControllerConfig::default()
        };
        let session = Session::new(config).expect("controller builds without network calls");
        assert!(session.message_history().is_empty());
    }
}
