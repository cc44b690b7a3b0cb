//! Permission-checked tool execution with retry, result formatting and
//! parallel dispatch.
//!
//! Every entry point returns a string ready to be fed back to the model:
//! a formatted payload, `"Error: ..."`, or the fixed denial text. Nothing
//! here returns an error to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_config::{AppConfig, DefaultDecision, PermissionsConfig};
use cadence_core::event::{DomainEvent, EventBus};
use cadence_core::observer::{self, StreamObserver};
use cadence_core::permission::{AllowAll, CachingGate, PermissionDecision, PermissionGate, PolicyGate};
use cadence_core::provider::ToolDefinition;
use cadence_core::tool::{ToolCallRequest, ToolParams, ToolRegistry, ToolResult};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{PoolSettings, WorkerPool};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Attempts after the first
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
    /// Longest string value kept in a result, in characters
    pub max_result_chars: usize,
    pub pool: PoolSettings,
}

impl ExecutorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.tools.max_retries,
            retry_delay: Duration::from_millis(config.tools.retry_delay_ms),
            max_result_chars: config.tools.max_result_chars,
            pool: PoolSettings::from_config(config),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Build the permission gate described by the `[permissions]` section.
///
/// Allow-listed tools are remembered after their first check.
pub fn permission_gate_from_config(config: &PermissionsConfig) -> Arc<dyn PermissionGate> {
    let fallback = match config.default {
        DefaultDecision::Allow => PermissionDecision::AllowOnce,
        DefaultDecision::Deny => PermissionDecision::Deny,
    };
    let policy = PolicyGate::new(config.allow.clone(), config.deny.clone(), fallback);
    Arc::new(CachingGate::new(Arc::new(policy)))
}

const CANCELLED: &str = "tool call cancelled";

/// Everything one call needs. Cloned into each pool job.
#[derive(Clone)]
struct CallRunner {
    registry: Arc<ToolRegistry>,
    gate: Arc<dyn PermissionGate>,
    observer: Arc<dyn StreamObserver>,
    event_bus: Option<Arc<EventBus>>,
    settings: ExecutorSettings,
}

impl CallRunner {
    async fn run(&self, name: &str, params: ToolParams, cancel: &CancellationToken) -> String {
        if cancel.is_cancelled() {
            debug!(tool = name, "Skipping tool call after cancellation");
            return format!("Error: {CANCELLED}");
        }
        if !self.gate.check_permission(name, &params).await {
            info!(tool = name, "Tool call denied");
            self.observer.emit(&format!("🚫 {name} denied\n"));
            return format!("Tool call denied by user: {name}");
        }

        self.observer.emit(&format!("🔧 Running {name}...\n"));
        let start = Instant::now();
        let result = self.execute_with_retry(name, params, cancel).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: name.to_string(),
                success: result.success,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        if result.success {
            debug!(tool = name, duration_ms, "Tool succeeded");
            self.observer.emit(&format!("✓ {name}\n"));
            format_payload(&result.data, self.settings.max_result_chars)
        } else {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            warn!(tool = name, duration_ms, error = %error, "Tool failed");
            self.observer.emit(&format!("✗ {name}: {error}\n"));
            format!("Error: {error}")
        }
    }

    async fn execute_with_retry(
        &self,
        name: &str,
        params: ToolParams,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let mut attempt: u32 = 0;
        loop {
            let result = self.registry.execute(name, params.clone()).await;
            if result.success || attempt >= self.settings.max_retries {
                return result;
            }
            attempt += 1;
            warn!(
                tool = name,
                attempt,
                error = result.error.as_deref().unwrap_or_default(),
                "Tool failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(tool = name, attempt, "Retry abandoned after cancellation");
                    return ToolResult::failure(CANCELLED);
                }
                _ = tokio::time::sleep(self.settings.retry_delay * attempt) => {}
            }
        }
    }
}

/// Runs tool calls on behalf of the conversation loop.
///
/// Calls are not bounded in time: a tool that never returns stalls the
/// turn. Tools that can hang must enforce their own timeout.
pub struct ToolExecutor {
    runner: CallRunner,
    pool: WorkerPool,
}

impl ToolExecutor {
    /// An executor that allows every call and reports progress nowhere.
    pub fn new(registry: Arc<ToolRegistry>, settings: ExecutorSettings) -> Self {
        Self {
            runner: CallRunner {
                registry,
                gate: Arc::new(AllowAll),
                observer: observer::noop(),
                event_bus: None,
                settings,
            },
            pool: WorkerPool::new(settings.pool),
        }
    }

    pub fn with_permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.runner.gate = gate;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.runner.observer = observer;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.runner.event_bus = Some(event_bus);
        self
    }

    /// Definitions of every registered tool, for the model request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.runner.registry.definitions()
    }

    /// Check permission, execute with retry and format the outcome.
    ///
    /// A denied call never reaches the registry and returns
    /// `"Tool call denied by user: <name>"`. Once `cancel` fires no new
    /// attempt starts and the call reports an error.
    pub async fn execute_with_permission(
        &self,
        name: &str,
        params: &ToolParams,
        cancel: &CancellationToken,
    ) -> String {
        self.runner.run(name, params.clone(), cancel).await
    }

    /// Run every call on the worker pool. The output has one entry per
    /// call, in input order, regardless of completion order.
    pub async fn execute_parallel(
        &self,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> Vec<String> {
        if calls.is_empty() {
            return Vec::new();
        }
        self.runner
            .observer
            .emit(&format!("⚡ Running {} tools in parallel...\n", calls.len()));

        let handles: Vec<_> = calls
            .iter()
            .map(|call| {
                let runner = self.runner.clone();
                let name = call.name.clone();
                let params = call.arguments.clone();
                let cancel = cancel.clone();
                self.pool.submit(async move { runner.run(&name, params, &cancel).await })
            })
            .collect();

        let mut results = Vec::with_capacity(calls.len());
        for (call, handle) in calls.iter().zip(handles) {
            let formatted = match handle.join().await {
                Ok(formatted) => formatted,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool task did not complete");
                    format!("Error executing tool: {e}")
                }
            };
            results.push(formatted);
        }

        self.runner
            .observer
            .emit(&format!("✓ Completed {} tools\n", calls.len()));
        results
    }
}

/// Render a successful payload, truncating long strings.
///
/// Object payloads keep their structure and only their string values are
/// truncated. A string payload is truncated as a whole.
pub fn format_payload(data: &Value, max_chars: usize) -> String {
    match data {
        Value::Object(map) => {
            let truncated = map
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => Value::String(truncate_chars(s, max_chars)),
                        other => other.clone(),
                    };
                    (key.clone(), value)
                })
                .collect();
            Value::Object(truncated).to_string()
        }
        Value::String(s) => truncate_chars(s, max_chars),
        other => other.to_string(),
    }
}

/// Keep the first `max_chars` characters and note the original length.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}... (truncated, {total} chars total)")
}
