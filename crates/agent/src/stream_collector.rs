//! Turns a provider's chunk stream into one complete response.
//!
//! Text deltas are forwarded to the stream observer as they arrive and
//! tool-call fragments are merged by slot index. A whole attempt is bounded
//! by a timeout; failed attempts are retried with a linear backoff that an
//! interrupt can cut short.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_config::AppConfig;
use cadence_core::error::ProviderError;
use cadence_core::message::Message;
use cadence_core::observer::{self, StreamObserver};
use cadence_core::provider::{Provider, ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition, Usage};
use cadence_core::tool::{ToolCallRequest, ToolParams};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::TOOL_CALL_OPEN;

/// Request and retry settings for the collector.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Upper bound for one complete streamed response
    pub timeout: Duration,
    /// Attempts after the first
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
}

impl CollectorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.name.clone(),
            temperature: config.model.temperature,
            max_tokens: config.model.max_tokens,
            timeout: Duration::from_secs(config.stream.timeout_secs),
            max_retries: config.stream.max_retries,
            retry_delay: Duration::from_millis(config.stream.retry_delay_ms),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The reassembled result of one streamed model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatCompletionResult {
    /// Concatenated text deltas, absent when the model sent none
    pub text: Option<String>,
    /// Materialized structured calls, ordered by slot index
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ChatCompletionResult {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// A tool call still being assembled from stream fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialToolCall {
    pub index: u32,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Fold one fragment into the call at its slot.
///
/// The first fragment for a slot supplies id, type and name. Later
/// fragments append to the argument text and fill in an id or name that
/// was not known yet.
pub fn merge_delta(existing: Option<&PartialToolCall>, delta: &ToolCallDelta) -> PartialToolCall {
    let fragment = delta.arguments.as_deref().unwrap_or_default();
    match existing {
        None => PartialToolCall {
            index: delta.index,
            id: delta.id.clone(),
            kind: delta.kind.clone(),
            name: delta.name.clone().unwrap_or_default(),
            arguments: fragment.to_string(),
        },
        Some(current) => {
            let mut merged = current.clone();
            merged.arguments.push_str(fragment);
            if merged.id.is_none() {
                merged.id = delta.id.clone();
            }
            if merged.kind.is_none() {
                merged.kind = delta.kind.clone();
            }
            if merged.name.is_empty() {
                if let Some(name) = &delta.name {
                    merged.name = name.clone();
                }
            }
            merged
        }
    }
}

impl PartialToolCall {
    /// Decode the accumulated argument text. Invalid JSON yields empty
    /// parameters.
    fn materialize(self) -> ToolCallRequest {
        let arguments = if self.arguments.trim().is_empty() {
            ToolParams::new()
        } else {
            match serde_json::from_str::<ToolParams>(&self.arguments) {
                Ok(params) => params,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        index = self.index,
                        error = %e,
                        "Tool call arguments are not a JSON object, using empty parameters"
                    );
                    ToolParams::new()
                }
            }
        };
        ToolCallRequest {
            index: self.index,
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Accumulates chunks of a single attempt.
#[derive(Debug, Default)]
struct ResponseAccumulator {
    text: String,
    calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ResponseAccumulator {
    fn apply(&mut self, chunk: StreamChunk) {
        if let Some(content) = chunk.content {
            self.text.push_str(&content);
        }
        for delta in &chunk.tool_calls {
            let merged = merge_delta(self.calls.get(&delta.index), delta);
            self.calls.insert(delta.index, merged);
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn finish(self) -> ChatCompletionResult {
        let calls: Vec<ToolCallRequest> = self
            .calls
            .into_values()
            .filter(|call| {
                if call.name.is_empty() {
                    warn!(index = call.index, "Dropping streamed tool call without a name");
                }
                !call.name.is_empty()
            })
            .map(PartialToolCall::materialize)
            .collect();

        ChatCompletionResult {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls: (!calls.is_empty()).then_some(calls),
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

/// Keeps tagged tool-call markup off the live display.
///
/// Text before the first `<tool_call>` passes through. Anything that may be
/// the start of the tag is held back until it is ruled out, and everything
/// from the tag onward is suppressed.
#[derive(Debug, Default)]
struct MarkupFilter {
    pending: String,
    suppressed: bool,
}

impl MarkupFilter {
    fn push(&mut self, delta: &str) -> Option<String> {
        if self.suppressed {
            return None;
        }
        self.pending.push_str(delta);

        if let Some(pos) = self.pending.find(TOOL_CALL_OPEN) {
            self.suppressed = true;
            let visible: String = self.pending.drain(..pos).collect();
            self.pending.clear();
            return (!visible.is_empty()).then_some(visible);
        }

        let held = partial_tag_suffix(&self.pending);
        let split = self.pending.len() - held;
        let visible: String = self.pending.drain(..split).collect();
        (!visible.is_empty()).then_some(visible)
    }

    fn flush(&mut self) -> Option<String> {
        if self.suppressed || self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// opening tag. The tag is ASCII so the split point is a char boundary.
fn partial_tag_suffix(text: &str) -> usize {
    (1..TOOL_CALL_OPEN.len())
        .rev()
        .find(|&n| text.ends_with(&TOOL_CALL_OPEN[..n]))
        .unwrap_or(0)
}

/// Streams one model call to completion.
pub struct StreamCollector {
    provider: Arc<dyn Provider>,
    observer: Arc<dyn StreamObserver>,
    settings: CollectorSettings,
}

impl StreamCollector {
    pub fn new(provider: Arc<dyn Provider>, settings: CollectorSettings) -> Self {
        Self {
            provider,
            observer: observer::noop(),
            settings,
        }
    }

    /// Send live text to this observer.
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Request a streamed completion and wait for the whole response.
    ///
    /// Retryable failures are attempted again up to `max_retries` times.
    /// Cancelling `cancel` ends the call immediately with
    /// [`ProviderError::Cancelled`], including during a backoff wait.
    pub async fn collect(
        &self,
        messages: Vec<Message>,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionResult, ProviderError> {
        let request = self.build_request(messages, tools);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let error = match self.collect_once(request.clone(), cancel).await {
                Ok(result) => {
                    debug!(
                        attempt,
                        text_len = result.text().len(),
                        tool_calls = result.tool_calls.as_ref().map_or(0, Vec::len),
                        "Stream collected"
                    );
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= self.settings.max_retries {
                warn!(attempts = attempt + 1, error = %error, "Model request failed, giving up");
                return Err(error);
            }

            attempt += 1;
            warn!(
                attempt,
                max_retries = self.settings.max_retries,
                error = %error,
                "Model request failed, retrying"
            );
            self.observer.emit(&format!(
                "\n⚠️ Model request failed ({error}), retrying ({attempt}/{})...\n",
                self.settings.max_retries
            ));

            let backoff = self.settings.retry_delay * attempt;
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn build_request(&self, messages: Vec<Message>, tools: &[ToolDefinition]) -> ProviderRequest {
        let mut request = ProviderRequest::new(self.settings.model.clone(), messages);
        request.temperature = self.settings.temperature;
        request.max_tokens = self.settings.max_tokens;
        request.tools = tools.to_vec();
        request.stream = true;
        request
    }

    /// One attempt. A timeout or a failed chunk discards everything
    /// received so far; dropping the receiver stops the producer.
    async fn collect_once(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionResult, ProviderError> {
        let exchange = async {
            let mut receiver = self.provider.stream(request).await?;
            let mut accumulator = ResponseAccumulator::default();
            let mut filter = MarkupFilter::default();

            while let Some(item) = receiver.recv().await {
                let chunk = item?;
                if let Some(visible) = chunk.content.as_deref().and_then(|text| filter.push(text)) {
                    self.observer.emit(&visible);
                }
                let done = chunk.done;
                accumulator.apply(chunk);
                if done {
                    break;
                }
            }

            if let Some(rest) = filter.flush() {
                self.observer.emit(&rest);
            }
            Ok(accumulator.finish())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            outcome = tokio::time::timeout(self.settings.timeout, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "no complete response within {}s",
                    self.settings.timeout.as_secs()
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingObserver, Script, ScriptedProvider};
    use serde_json::Value;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            kind: id.map(|_| "function".to_string()),
            name: name.map(String::from),
            arguments: Some(args.to_string()),
        }
    }

    fn collector(provider: Arc<ScriptedProvider>, observer: Arc<RecordingObserver>) -> StreamCollector {
        StreamCollector::new(provider, CollectorSettings::default()).with_observer(observer)
    }

    #[test]
    fn merge_creates_then_appends() {
        let first = merge_delta(None, &delta(0, Some("call_1"), Some("read_file"), "{\"pa"));
        assert_eq!(first.name, "read_file");
        assert_eq!(first.id.as_deref(), Some("call_1"));

        let second = merge_delta(Some(&first), &delta(0, None, None, "th\":\"a.rs\"}"));
        assert_eq!(second.arguments, "{\"path\":\"a.rs\"}");
        assert_eq!(second.name, "read_file");
        assert_eq!(second.id.as_deref(), Some("call_1"));
        // The input snapshot is untouched
        assert_eq!(first.arguments, "{\"pa");
    }

    #[test]
    fn merge_backfills_late_id() {
        let first = merge_delta(None, &delta(2, None, Some("grep"), ""));
        let second = merge_delta(Some(&first), &delta(2, Some("call_9"), None, "{}"));
        assert_eq!(second.id.as_deref(), Some("call_9"));
        assert_eq!(second.index, 2);
    }

    #[test]
    fn invalid_arguments_materialize_as_empty() {
        let call = PartialToolCall {
            index: 0,
            name: "shell".into(),
            arguments: "{not json".into(),
            ..Default::default()
        };
        assert!(call.materialize().arguments.is_empty());
    }

    #[test]
    fn markup_filter_passes_plain_text() {
        let mut filter = MarkupFilter::default();
        assert_eq!(filter.push("Hello ").as_deref(), Some("Hello "));
        assert_eq!(filter.push("world").as_deref(), Some("world"));
        assert_eq!(filter.flush(), None);
    }

    #[test]
    fn markup_filter_holds_possible_tag_start() {
        let mut filter = MarkupFilter::default();
        assert_eq!(filter.push("a <to").as_deref(), Some("a "));
        assert_eq!(filter.push("day").as_deref(), Some("<today"));
    }

    #[test]
    fn markup_filter_suppresses_tag_split_across_deltas() {
        let mut filter = MarkupFilter::default();
        assert_eq!(filter.push("Checking.<tool").as_deref(), Some("Checking."));
        assert_eq!(filter.push("_call><name>x</name>"), None);
        assert_eq!(filter.push("</tool_call> more"), None);
        assert_eq!(filter.flush(), None);
    }

    #[test]
    fn markup_filter_flushes_held_text_at_end() {
        let mut filter = MarkupFilter::default();
        assert_eq!(filter.push("x <"), Some("x ".to_string()));
        assert_eq!(filter.flush().as_deref(), Some("<"));
    }

    #[tokio::test]
    async fn text_deltas_are_concatenated_and_forwarded_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Chunks(vec![
            StreamChunk::text("Hel"),
            StreamChunk::text("lo"),
            StreamChunk::finished("stop", None),
        ])]));
        let observer = Arc::new(RecordingObserver::default());
        let result = collector(provider, observer.clone())
            .collect(vec![Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.text.as_deref(), Some("Hello"));
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert!(result.tool_calls.is_none());
        assert_eq!(observer.fragments(), vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn tool_call_fragments_merge_by_index() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Chunks(vec![
            StreamChunk::tool_calls(vec![
                delta(1, Some("b"), Some("grep"), "{\"pattern\":"),
                delta(0, Some("a"), Some("read_file"), ""),
            ]),
            StreamChunk::tool_calls(vec![delta(0, None, None, "{\"path\":\"x\"}")]),
            StreamChunk::tool_calls(vec![delta(1, None, None, "\"fn\"}")]),
            StreamChunk::finished("tool_calls", None),
        ])]));
        let observer = Arc::new(RecordingObserver::default());
        let result = collector(provider, observer)
            .collect(vec![Message::user("go")], &[], &CancellationToken::new())
            .await
            .unwrap();

        let calls = result.tool_calls.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], Value::String("x".into()));
        assert_eq!(calls[1].name, "grep");
        assert_eq!(calls[1].id.as_deref(), Some("b"));
        assert_eq!(calls[1].arguments["pattern"], Value::String("fn".into()));
        assert!(result.text.is_none());
    }

    #[tokio::test]
    async fn tagged_calls_are_hidden_from_the_observer() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Chunks(vec![
            StreamChunk::text("Let me check.<tool_"),
            StreamChunk::text("call><name>ls</name></tool_call>"),
            StreamChunk::finished("stop", None),
        ])]));
        let observer = Arc::new(RecordingObserver::default());
        let result = collector(provider, observer.clone())
            .collect(vec![Message::user("go")], &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.text().contains("<tool_call>"));
        assert_eq!(observer.transcript(), "Let me check.");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_after_retries() {
        let provider = Arc::new(ScriptedProvider::repeating(Script::Hang));
        let observer = Arc::new(RecordingObserver::default());
        let started = tokio::time::Instant::now();
        let err = collector(provider.clone(), observer.clone())
            .collect(vec![Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Timeout(_)));
        assert_eq!(provider.calls(), 3);
        // Three 300s attempts plus 1s and 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(903));
        assert_eq!(
            observer.fragments().iter().filter(|f| f.contains("retrying")).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_retried_and_partial_output_discarded() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Chunks(vec![StreamChunk::text("partial")]).then_fail(),
            Script::Text("complete".into()),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let result = collector(provider.clone(), observer)
            .collect(vec![Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.text.as_deref(), Some("complete"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Fail(
            ProviderError::NotConfigured("no key".into()),
        )]));
        let observer = Arc::new(RecordingObserver::default());
        let err = collector(provider.clone(), observer)
            .collect(vec![Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let provider = Arc::new(ScriptedProvider::repeating(Script::Fail(
            ProviderError::Network("connection reset".into()),
        )));
        let observer = Arc::new(RecordingObserver::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = collector(provider.clone(), observer)
            .collect(vec![Message::user("hi")], &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(provider.calls(), 1);
    }
}
