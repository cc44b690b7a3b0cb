//! System prompt construction.
//!
//! The prompt is rebuilt for every model request and never stored in the
//! conversation, so compaction can never drop it.

use cadence_core::provider::ToolDefinition;

/// Built-in instructions, including the tagged tool-call protocol.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Cadence, an AI coding assistant working in the user's project.

Work step by step. When you need information or want to change something, \
call a tool. You may call several tools in one reply; independent calls run \
in parallel.

If your interface supports structured tool calls, use them. Otherwise write \
each call in this exact format:

<tool_call>
<name>TOOL_NAME</name>
<parameters>
<PARAM_NAME>VALUE</PARAM_NAME>
</parameters>
</tool_call>

Results come back as:

<tool_result><name>TOOL_NAME</name><result>RESULT</result></tool_result>

Any text before your first tool call is shown to the user while the tools \
run. When the task is done, reply with plain text and no tool calls.";

/// Base instructions followed by the tool catalogue.
pub fn build_system_prompt(base: &str, tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return base.to_string();
    }

    let mut prompt = String::from(base);
    prompt.push_str("\n\n## Available tools\n");
    for tool in tools {
        prompt.push_str(&format!("\n### {}\n{}\n", tool.name, tool.description));
        if has_properties(&tool.parameters) {
            prompt.push_str(&format!("Parameters: {}\n", tool.parameters));
        }
    }
    prompt
}

fn has_properties(schema: &serde_json::Value) -> bool {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .is_some_and(|p| !p.is_empty())
}
