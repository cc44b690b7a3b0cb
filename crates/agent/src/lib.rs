//! The Cadence execution core.
//!
//! One user turn runs as a loop:
//!
//! 1. **Compact** the history if it is close to the context window
//! 2. **Stream** a model response, showing text as it arrives
//! 3. **If tool calls** (structured, or tagged in the text): check
//!    permissions, execute them (in parallel when there are several),
//!    append the results and go back to step 2
//! 4. **If text only**: append it and return it to the user
//!
//! The loop stops after a configured number of model calls and always ends
//! with text for the user, even when the model fails.

pub mod compactor;
pub mod executor;
pub mod loop_runner;
pub mod parser;
pub mod pool;
pub mod prompt;
pub mod stream_collector;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use compactor::{Compaction, CompactorSettings, HistoryCompactor, estimate_tokens, structural_compact};
pub use executor::{ExecutorSettings, ToolExecutor, permission_gate_from_config};
pub use loop_runner::{
    AgentLoop, GENERATION_FAILED_MESSAGE, LoopSettings, LoopState, MAX_ITERATIONS_MESSAGE,
};
pub use parser::{ParsedResponse, clean_response, format_tool_call, format_tool_result, parse_tool_calls};
pub use pool::{PoolSettings, TaskFailure, TaskHandle, WorkerPool};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, build_system_prompt};
pub use stream_collector::{
    ChatCompletionResult, CollectorSettings, PartialToolCall, StreamCollector, merge_delta,
};
