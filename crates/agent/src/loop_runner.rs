//! The conversation loop.

use std::sync::Arc;

use cadence_config::{AppConfig, CompactionStrategy};
use cadence_core::event::{DomainEvent, EventBus};
use cadence_core::message::{ACTION_TOOL_CALLS, Conversation, Message, MessageToolCall};
use cadence_core::observer::StreamObserver;
use cadence_core::permission::PermissionGate;
use cadence_core::provider::Provider;
use cadence_core::tool::{ToolCallRequest, ToolRegistry};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compactor::{Compaction, CompactorSettings, HistoryCompactor};
use crate::executor::{ExecutorSettings, ToolExecutor, permission_gate_from_config};
use crate::parser::{clean_response, format_tool_call, format_tool_result, parse_tool_calls};
use crate::prompt::{DEFAULT_SYSTEM_PROMPT, build_system_prompt};
use crate::stream_collector::{ChatCompletionResult, CollectorSettings, StreamCollector};

/// Returned when a turn runs out of iterations.
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I've reached the maximum iteration limit. Please provide further guidance.";

/// Returned when the model could not produce a response.
pub const GENERATION_FAILED_MESSAGE: &str =
    "I encountered an issue generating a response. Please try again.";

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No turn has run yet
    Idle,
    AwaitingModel,
    DispatchingTools,
    Final,
    MaxIterationsReached,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::MaxIterationsReached | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub parallel_tool_calls: bool,
    /// Base system prompt; the tool catalogue is appended per request
    pub system_prompt: String,
    pub compaction: CompactionStrategy,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            parallel_tool_calls: config.agent.parallel_tool_calls,
            system_prompt: config
                .agent
                .system_prompt_override
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            compaction: config.compaction.strategy,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Drives one conversation: model calls, tool dispatch and compaction.
///
/// The loop is the only writer of its conversation history. Each call to
/// [`AgentLoop::turn`] handles one user message and always produces text
/// for the user.
pub struct AgentLoop {
    collector: StreamCollector,
    executor: ToolExecutor,
    compactor: HistoryCompactor,
    conversation: Conversation,
    settings: LoopSettings,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    state: LoopState,
    iterations: u32,
}

impl AgentLoop {
    /// Build a loop from configuration. Permissions come from the
    /// `[permissions]` section and progress goes nowhere until an observer
    /// is attached.
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, config: &AppConfig) -> Self {
        let collector = StreamCollector::new(provider.clone(), CollectorSettings::from_config(config));
        let executor = ToolExecutor::new(tools, ExecutorSettings::from_config(config))
            .with_permission_gate(permission_gate_from_config(&config.permissions));
        let compactor = HistoryCompactor::new(provider, CompactorSettings::from_config(config));

        Self::from_parts(collector, executor, compactor, LoopSettings::from_config(config))
    }

    /// Assemble a loop from already configured components.
    pub fn from_parts(
        collector: StreamCollector,
        executor: ToolExecutor,
        compactor: HistoryCompactor,
        settings: LoopSettings,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        Self {
            collector,
            executor: executor.with_event_bus(event_bus.clone()),
            compactor,
            conversation: Conversation::new(),
            settings,
            event_bus,
            cancel: CancellationToken::new(),
            state: LoopState::Idle,
            iterations: 0,
        }
    }

    /// Send live text and progress lines to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.collector = self.collector.with_observer(observer.clone());
        self.executor = self.executor.with_observer(observer.clone());
        self.compactor = self.compactor.with_observer(observer);
        self
    }

    pub fn with_permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.executor = self.executor.with_permission_gate(gate);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.executor = self.executor.with_event_bus(event_bus.clone());
        self.event_bus = event_bus;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.settings.max_iterations = max;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.settings.system_prompt = prompt.into();
        self
    }

    /// Continue an existing conversation.
    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn history(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Model calls made by the most recent turn.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Token that interrupts the current turn.
    ///
    /// A cancelled token is replaced when its turn ends, so fetch a fresh
    /// one for each turn.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle one user message and return the text to show the user.
    pub async fn turn(&mut self, user_text: &str) -> String {
        info!(
            conversation_id = %self.conversation.id,
            messages = self.conversation.len(),
            "Starting turn"
        );
        self.event_bus.publish(DomainEvent::TurnStarted {
            conversation_id: self.conversation.id.to_string(),
            content_preview: user_text.chars().take(100).collect(),
            timestamp: Utc::now(),
        });

        // Summaries run before the new message is appended so it is never
        // folded into one.
        let outcome = match self.settings.compaction {
            CompactionStrategy::Summarize => {
                self.compactor
                    .auto_compact_if_needed(self.conversation.messages())
                    .await
            }
            CompactionStrategy::Structural => {
                self.compactor.structural_if_needed(self.conversation.messages())
            }
            CompactionStrategy::Off => Compaction::Skipped,
        };
        self.apply_compaction(outcome);

        self.conversation.push(Message::user(user_text));
        let reply = self.run_iterations().await;

        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        reply
    }

    /// Summarize the history right away, regardless of its size.
    ///
    /// Returns whether the history was replaced.
    pub async fn compact_now(&mut self) -> bool {
        let outcome = self.compactor.compact(self.conversation.messages()).await;
        self.apply_compaction(outcome)
    }

    async fn run_iterations(&mut self) -> String {
        let tools = self.executor.definitions();
        let system_prompt = build_system_prompt(&self.settings.system_prompt, &tools);
        self.iterations = 0;
        self.state = LoopState::AwaitingModel;

        while self.iterations < self.settings.max_iterations {
            self.iterations += 1;

            if self.iterations > 1 {
                let messages = self.conversation.messages();
                let outcome = match self.settings.compaction {
                    CompactionStrategy::Structural => self.compactor.structural_if_needed(messages),
                    CompactionStrategy::Summarize if self.compactor.should_compact(messages) => {
                        self.compactor.structural_if_needed(messages)
                    }
                    _ => Compaction::Skipped,
                };
                self.apply_compaction(outcome);
            }

            debug!(
                conversation_id = %self.conversation.id,
                iteration = self.iterations,
                "Agent loop iteration"
            );

            let mut messages = Vec::with_capacity(self.conversation.len() + 1);
            messages.push(Message::system(system_prompt.clone()));
            messages.extend_from_slice(self.conversation.messages());

            let response = match self.collector.collect(messages, &tools, &self.cancel).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        conversation_id = %self.conversation.id,
                        iteration = self.iterations,
                        error = %e,
                        "Model response failed"
                    );
                    self.event_bus.publish(DomainEvent::ErrorOccurred {
                        context: "model_response".into(),
                        error_message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    self.state = LoopState::Failed;
                    return GENERATION_FAILED_MESSAGE.to_string();
                }
            };

            let calls = match &response.tool_calls {
                Some(calls) if !calls.is_empty() => calls.clone(),
                _ => parse_tool_calls(response.text()).calls,
            };

            self.event_bus.publish(DomainEvent::ResponseGenerated {
                conversation_id: self.conversation.id.to_string(),
                model: self.collector.model().to_string(),
                tokens_used: response.usage.map_or(0, |u| u.total_tokens),
                tool_calls: calls.len(),
                timestamp: Utc::now(),
            });

            if calls.is_empty() {
                let text = clean_response(response.text());
                self.conversation.push(Message::assistant(text.clone()));
                self.state = LoopState::Final;
                return text;
            }

            self.state = LoopState::DispatchingTools;
            debug!(tool_count = calls.len(), "Executing tool calls");
            self.conversation.push(tool_call_message(&response, &calls));

            let results = self.dispatch(&calls).await;
            let body = calls
                .iter()
                .zip(&results)
                .map(|(call, result)| format_tool_result(&call.name, result))
                .collect::<Vec<_>>()
                .join("\n");
            self.conversation.push(Message::tool_result(body));
            self.state = LoopState::AwaitingModel;
        }

        warn!(
            conversation_id = %self.conversation.id,
            iterations = self.iterations,
            "Max tool iterations reached"
        );
        self.event_bus.publish(DomainEvent::IterationLimitReached {
            conversation_id: self.conversation.id.to_string(),
            iterations: self.iterations,
            timestamp: Utc::now(),
        });
        self.state = LoopState::MaxIterationsReached;
        MAX_ITERATIONS_MESSAGE.to_string()
    }

    async fn dispatch(&self, calls: &[ToolCallRequest]) -> Vec<String> {
        if self.settings.parallel_tool_calls && calls.len() > 1 {
            return self.executor.execute_parallel(calls, &self.cancel).await;
        }
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(
                self.executor
                    .execute_with_permission(&call.name, &call.arguments, &self.cancel)
                    .await,
            );
        }
        results
    }

    fn apply_compaction(&mut self, outcome: Compaction) -> bool {
        let Compaction::Replaced { messages, summarized } = outcome else {
            return false;
        };
        let before = self.conversation.len();
        self.conversation.replace_messages(messages);
        info!(
            conversation_id = %self.conversation.id,
            before,
            after = self.conversation.len(),
            summarized,
            "Applied history compaction"
        );
        self.event_bus.publish(DomainEvent::HistoryCompacted {
            conversation_id: self.conversation.id.to_string(),
            messages_before: before,
            messages_after: self.conversation.len(),
            summarized,
            timestamp: Utc::now(),
        });
        true
    }
}

/// The assistant message that records a batch of calls. Structured calls
/// are attached as such; an empty text is replaced by the calls in wire
/// format.
fn tool_call_message(response: &ChatCompletionResult, calls: &[ToolCallRequest]) -> Message {
    let content = if response.text().trim().is_empty() {
        calls
            .iter()
            .map(|call| format_tool_call(&call.name, &call.arguments))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        response.text().to_string()
    };

    let message = Message::assistant(content).with_action(ACTION_TOOL_CALLS);
    if !response.has_tool_calls() {
        return message;
    }
    message.with_tool_calls(
        calls
            .iter()
            .map(|call| MessageToolCall {
                id: call.id.clone().unwrap_or_else(|| format!("call_{}", call.index)),
                name: call.name.clone(),
                arguments: serde_json::Value::Object(call.arguments.clone()).to_string(),
            })
            .collect(),
    )
}
