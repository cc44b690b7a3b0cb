//! `cadence parse`: Run the tool-call parser over a saved model response.

use std::io::Read;
use std::path::PathBuf;

use cadence_agent::{clean_response, parse_tool_calls};
use serde_json::{Value, json};

pub async fn run(file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let text = match &file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    tracing::debug!(chars = text.len(), "Parsing response");

    println!("{}", serde_json::to_string_pretty(&render(&text))?);
    Ok(())
}

fn render(text: &str) -> Value {
    let parsed = parse_tool_calls(text);
    json!({
        "commentary": parsed.commentary,
        "calls": parsed.calls,
        "cleaned": clean_response(text),
    })
}
