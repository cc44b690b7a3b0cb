//! Shared test helpers: a scripted streaming provider, instrumented tools
//! and a recording observer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::error::{ProviderError, ToolError};
use cadence_core::message::Message;
use cadence_core::observer::StreamObserver;
use cadence_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use cadence_core::tool::{Tool, ToolParams, ToolResult};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::parser::format_tool_call;

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum Script {
    /// Plain text streamed as one delta
    Text(String),
    /// Exact chunks, then the stream closes
    Chunks(Vec<StreamChunk>),
    /// Chunks followed by a mid-stream failure
    ChunksThenError(Vec<StreamChunk>, ProviderError),
    /// The request itself fails
    Fail(ProviderError),
    /// The stream stays open without producing anything
    Hang,
}

impl Script {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn then_fail(self) -> Self {
        match self {
            Self::Chunks(chunks) => Self::ChunksThenError(
                chunks,
                ProviderError::StreamInterrupted("connection dropped".into()),
            ),
            other => other,
        }
    }
}

/// Render one tagged call for scripted text.
pub fn tagged_call(name: &str, params: &[(&str, Value)]) -> String {
    let params: ToolParams = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    format_tool_call(name, &params)
}

/// A provider that replays scripts in order, or one script forever.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    repeat: Option<Script>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(script: Script) -> Self {
        Self {
            repeat: Some(script),
            ..Self::new(vec![])
        }
    }

    /// Number of `complete` plus `stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_script(&self, request: ProviderRequest) -> Script {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.scripts.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(script), _) => script,
            (None, Some(script)) => script.clone(),
            (None, None) => panic!("ScriptedProvider: no more scripts (call #{})", self.calls()),
        }
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let text = match self.next_script(request) {
            Script::Text(text) => text,
            Script::Chunks(chunks) => chunks.into_iter().filter_map(|c| c.content).collect(),
            Script::ChunksThenError(_, e) | Script::Fail(e) => return Err(e),
            Script::Hang => std::future::pending().await,
        };
        Ok(ProviderResponse {
            message: Message::assistant(text),
            usage: Some(usage()),
            model: "scripted-model".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let items: Vec<Result<StreamChunk, ProviderError>> = match self.next_script(request) {
            Script::Text(text) => vec![
                Ok(StreamChunk::text(text)),
                Ok(StreamChunk::finished("stop", Some(usage()))),
            ],
            Script::Chunks(chunks) => chunks.into_iter().map(Ok).collect(),
            Script::ChunksThenError(chunks, e) => {
                chunks.into_iter().map(Ok).chain(std::iter::once(Err(e))).collect()
            }
            Script::Fail(e) => return Err(e),
            Script::Hang => {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move { tx.closed().await });
                return Ok(rx);
            }
        };

        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).expect("channel sized for every item");
        }
        Ok(rx)
    }
}

/// Remembers every emitted fragment.
#[derive(Default)]
pub struct RecordingObserver {
    fragments: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn fragments(&self) -> Vec<String> {
        self.fragments.lock().unwrap().clone()
    }

    pub fn transcript(&self) -> String {
        self.fragments().concat()
    }
}

impl StreamObserver for RecordingObserver {
    fn emit(&self, fragment: &str) {
        self.fragments.lock().unwrap().push(fragment.to_string());
    }
}

/// Fails its first `failures` invocations, then returns `"done"`.
pub struct FlakyTool {
    name: String,
    failures: u32,
    invocations: AtomicU32,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            failures,
            invocations: AtomicU32::new(0),
        }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fails a fixed number of times before succeeding"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: ToolParams) -> Result<ToolResult, ToolError> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Ok(ToolResult::failure(format!("attempt {n} failed")))
        } else {
            Ok(ToolResult::ok("done"))
        }
    }
}

/// Sleeps, then returns `"<name> done"`.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Waits before answering"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: ToolParams) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolResult::ok(format!("{} done", self.name)))
    }
}

/// Panics when executed.
pub struct PanicTool {
    name: String,
}

impl PanicTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always panics"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: ToolParams) -> Result<ToolResult, ToolError> {
        panic!("{} exploded", self.name)
    }
}
