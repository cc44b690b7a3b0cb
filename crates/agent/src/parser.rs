//! Tagged tool-call protocol.
//!
//! Models that do not emit structured tool-call deltas describe calls in
//! their text:
//!
//! ```text
//! <tool_call><name>read_file</name><parameters><path>src/main.rs</path></parameters></tool_call>
//! ```
//!
//! and receive results as:
//!
//! ```text
//! <tool_result><name>read_file</name><result>...</result></tool_result>
//! ```
//!
//! Parameter values are coerced: `true`/`false` (any case) become booleans,
//! integers become numbers, everything else stays a string. A block that
//! does not match the grammar is dropped without an error.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use cadence_core::tool::{ToolCallRequest, ToolParams};

/// Opening tag of a tool call block.
pub const TOOL_CALL_OPEN: &str = "<tool_call>";

static TOOL_CALL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<tool_call>\s*<name>\s*([^<]*?)\s*</name>\s*(?:<parameters>(.*?)</parameters>\s*)?</tool_call>",
    )
    .expect("tool call pattern is valid")
});

static PARAM_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z_][A-Za-z0-9_.\-]*)>").expect("parameter pattern is valid")
});

static ANY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>.*?</tool_call>|<tool_result>.*?</tool_result>")
        .expect("block pattern is valid")
});

static UNTERMINATED_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>.*$").expect("unterminated pattern is valid"));

static STRAY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?(?:tool_call|tool_result)>").expect("stray tag pattern is valid")
});

/// Model text split into visible commentary and requested calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Text before the first tool call block (the whole text if none)
    pub commentary: String,

    /// Calls in order of first appearance
    pub calls: Vec<ToolCallRequest>,
}

impl ParsedResponse {
    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }
}

/// Parse every well-formed `<tool_call>` block in `text`.
pub fn parse_tool_calls(text: &str) -> ParsedResponse {
    let commentary = match text.find(TOOL_CALL_OPEN) {
        Some(pos) => text[..pos].trim().to_string(),
        None => text.trim().to_string(),
    };

    let calls: Vec<ToolCallRequest> = TOOL_CALL_BLOCK
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().trim();
            if name.is_empty() {
                return None;
            }
            let params = caps.get(2).map(|m| parse_parameters(m.as_str())).unwrap_or_default();
            Some((name.to_string(), params))
        })
        .enumerate()
        .map(|(i, (name, params))| ToolCallRequest::new(i as u32, name, params))
        .collect();

    let opened = text.matches(TOOL_CALL_OPEN).count();
    if opened > calls.len() {
        debug!(
            opened,
            parsed = calls.len(),
            "Dropped malformed tool call blocks"
        );
    }

    ParsedResponse { commentary, calls }
}

/// Parse `<key>value</key>` pairs. Unclosed pairs are skipped.
fn parse_parameters(block: &str) -> ToolParams {
    let mut params = ToolParams::new();
    let mut cursor = 0;

    while let Some(caps) = PARAM_OPEN.captures(&block[cursor..]) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let value_start = cursor + whole.end();
        let closing = format!("</{}>", key.as_str());
        match block[value_start..].find(&closing) {
            Some(rel) => {
                let raw = &block[value_start..value_start + rel];
                params.insert(key.as_str().to_string(), coerce_value(raw));
                cursor = value_start + rel + closing.len();
            }
            None => {
                cursor = value_start;
            }
        }
    }

    params
}

/// Coerce a raw parameter string into a typed JSON value.
pub fn coerce_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    Value::String(trimmed.to_string())
}

/// Remove protocol markup from a final answer.
///
/// Text without any protocol tag is returned verbatim.
pub fn clean_response(text: &str) -> String {
    if !STRAY_TAG.is_match(text) {
        return text.to_string();
    }
    let without_blocks = ANY_BLOCK.replace_all(text, "");
    let without_tail = UNTERMINATED_CALL.replace_all(&without_blocks, "");
    STRAY_TAG.replace_all(&without_tail, "").trim().to_string()
}

/// Render a call in the wire format.
pub fn format_tool_call(name: &str, params: &ToolParams) -> String {
    let mut out = format!("<tool_call><name>{name}</name><parameters>");
    for (key, value) in params {
        out.push_str(&format!("<{key}>{}</{key}>", render_value(value)));
    }
    out.push_str("</parameters></tool_call>");
    out
}

/// Render a formatted result in the wire format.
pub fn format_tool_result(name: &str, result: &str) -> String {
    format!("<tool_result><name>{name}</name><result>{result}</result></tool_result>")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_call_with_typed_parameters() {
        let text = "<tool_call><name>read_file</name><parameters>\
                    <path>src/main.rs</path><offset>40</offset><follow>TRUE</follow>\
                    </parameters></tool_call>";
        let parsed = parse_tool_calls(text);
        assert_eq!(parsed.calls.len(), 1);

        let call = &parsed.calls[0];
        assert_eq!(call.name, "read_file");
        assert_eq!(call.index, 0);
        assert_eq!(call.arguments["path"], Value::String("src/main.rs".into()));
        assert_eq!(call.arguments["offset"], Value::from(40));
        assert_eq!(call.arguments["follow"], Value::Bool(true));
    }

    #[test]
    fn calls_come_back_in_textual_order() {
        let text = "Let me look.\n\
            <tool_call><name>list_dir</name><parameters><path>.</path></parameters></tool_call>\n\
            <tool_call><name>grep</name><parameters><pattern>fn main</pattern></parameters></tool_call>";
        let parsed = parse_tool_calls(text);
        let names: Vec<&str> = parsed.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["list_dir", "grep"]);
        assert_eq!(parsed.calls[1].index, 1);
        assert_eq!(parsed.commentary, "Let me look.");
    }

    #[test]
    fn non_integer_numbers_stay_strings() {
        assert_eq!(coerce_value("3.14"), Value::String("3.14".into()));
        assert_eq!(coerce_value(" -12 "), Value::from(-12));
        assert_eq!(coerce_value("False"), Value::Bool(false));
        assert_eq!(coerce_value("yes"), Value::String("yes".into()));
    }

    #[test]
    fn whitespace_between_tags_is_tolerated() {
        let text = "<tool_call>\n  <name> shell </name>\n  <parameters>\n    <command>ls -la</command>\n  </parameters>\n</tool_call>";
        let parsed = parse_tool_calls(text);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "shell");
        assert_eq!(parsed.calls[0].arguments["command"], Value::String("ls -la".into()));
    }

    #[test]
    fn call_without_parameters_block_is_accepted() {
        let parsed = parse_tool_calls("<tool_call><name>git_status</name></tool_call>");
        assert_eq!(parsed.calls.len(), 1);
        assert!(parsed.calls[0].arguments.is_empty());
    }

    #[test]
    fn unclosed_block_is_dropped() {
        let text = "<tool_call><name>read_file</name><parameters><path>a</path></parameters>";
        let parsed = parse_tool_calls(text);
        assert!(parsed.calls.is_empty());
    }

    #[test]
    fn malformed_block_does_not_hide_valid_ones() {
        let text = "<tool_call><parameters></parameters></tool_call>\
                    <tool_call><name>ok</name><parameters><a>1</a></parameters></tool_call>";
        let parsed = parse_tool_calls(text);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "ok");
        assert_eq!(parsed.calls[0].index, 0);
    }

    #[test]
    fn unclosed_parameter_is_skipped() {
        let params = parse_parameters("<path>a.rs<mode>read</mode>");
        assert_eq!(params.len(), 1);
        assert_eq!(params["mode"], Value::String("read".into()));
    }

    #[test]
    fn plain_text_has_no_calls() {
        let parsed = parse_tool_calls("All done. The tests pass.");
        assert!(!parsed.has_calls());
        assert_eq!(parsed.commentary, "All done. The tests pass.");
    }

    #[test]
    fn clean_response_without_tags_is_verbatim() {
        let text = "  Keep my spacing\nand <b>html</b>  ";
        assert_eq!(clean_response(text), text);
    }

    #[test]
    fn clean_response_strips_blocks_and_stray_tags() {
        let text = "Done.<tool_result><name>x</name><result>y</result></tool_result> </tool_call>";
        assert_eq!(clean_response(text), "Done.");
    }

    #[test]
    fn clean_response_strips_unterminated_call() {
        let text = "Here you go.\n<tool_call><name>read_file</name><param";
        assert_eq!(clean_response(text), "Here you go.");
    }

    #[test]
    fn formatted_call_parses_back() {
        let mut params = ToolParams::new();
        params.insert("path".into(), Value::String("lib.rs".into()));
        params.insert("limit".into(), Value::from(20));
        let wire = format_tool_call("read_file", &params);

        let parsed = parse_tool_calls(&wire);
        assert_eq!(parsed.calls[0].arguments, params);
    }

    #[test]
    fn tool_result_wire_format() {
        assert_eq!(
            format_tool_result("grep", "3 matches"),
            "<tool_result><name>grep</name><result>3 matches</result></tool_result>"
        );
    }
}
