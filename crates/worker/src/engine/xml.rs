//! XML tool-call dialect parser.
//!
//! Some models emit tool calls as an XML block instead of native
//! function-call objects:
//!
//! ```text
//! <function_calls>
//!   <invoke name="search">
//!     <parameter name="query">rust streams</parameter>
//!     <parameter name="limit">5</parameter>
//!   </invoke>
//! </function_calls>
//! ```
//!
//! Parameter values are coerced aggressively: JSON for `{`/`[` prefixes,
//! booleans for `true`/`false`, numbers when they parse, strings
//! otherwise. Call ids are `xml_tool_index{i}_{assistant_message_id}`.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use fd_domain::message::ToolCall;

fn function_calls_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<function_calls>(.*?)</function_calls>").expect("static pattern")
    })
}

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<invoke\s+name=["']([^"']+)["']>(.*?)</invoke>"#)
            .expect("static pattern")
    })
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<parameter\s+name=["']([^"']+)["']>(.*?)</parameter>"#)
            .expect("static pattern")
    })
}

/// Coerce a raw parameter value into a typed JSON value.
fn parse_parameter_value(raw: &str) -> Value {
    let value = raw.trim();

    if value.starts_with('{') || value.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(value) {
            return v;
        }
    }

    match value.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if value.contains('.') {
        if let Ok(f) = value.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    } else if let Ok(i) = value.parse::<i64>() {
        return Value::Number(i.into());
    }

    Value::String(value.to_owned())
}

/// Parse every tool call in `content`, assigning deterministic ids from
/// the assistant message id. The same input always yields the same
/// `(name, parameters)` tuples.
pub fn parse_xml_tool_calls(content: &str, assistant_message_id: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for block in function_calls_re().captures_iter(content) {
        let inner = &block[1];
        for invoke in invoke_re().captures_iter(inner) {
            let name = invoke[1].to_owned();
            let body = &invoke[2];

            let mut parameters = serde_json::Map::new();
            for param in parameter_re().captures_iter(body) {
                parameters.insert(param[1].to_owned(), parse_parameter_value(&param[2]));
            }

            let index = calls.len();
            calls.push(ToolCall {
                call_id: format!("xml_tool_index{index}_{assistant_message_id}"),
                tool_name: name,
                arguments: Value::Object(parameters),
            });
        }
    }

    calls
}

/// Whether the content contains a complete XML tool-call block.
pub fn contains_xml_tool_calls(content: &str) -> bool {
    function_calls_re().is_match(content)
}

/// Remove XML tool-call blocks, leaving only natural text.
pub fn strip_xml_tool_calls(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    function_calls_re()
        .replace_all(content, "")
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"Let me search for that.
<function_calls>
<invoke name="search">
<parameter name="query">rust streams</parameter>
<parameter name="limit">5</parameter>
</invoke>
</function_calls>"#;

    #[test]
    fn parses_single_invoke() {
        let calls = parse_xml_tool_calls(SINGLE, "msg1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "search");
        assert_eq!(calls[0].call_id, "xml_tool_index0_msg1");
        assert_eq!(calls[0].arguments["query"], "rust streams");
        assert_eq!(calls[0].arguments["limit"], 5);
    }

    #[test]
    fn parses_multiple_invokes_with_sequential_ids() {
        let content = r#"<function_calls>
<invoke name="read"><parameter name="path">/a</parameter></invoke>
<invoke name="write"><parameter name="path">/b</parameter></invoke>
</function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "xml_tool_index0_m");
        assert_eq!(calls[1].call_id, "xml_tool_index1_m");
        assert_eq!(calls[1].tool_name, "write");
    }

    #[test]
    fn indices_continue_across_blocks() {
        let content = r#"<function_calls><invoke name="a"></invoke></function_calls>
middle text
<function_calls><invoke name="b"></invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "a");
        assert_eq!(calls[1].call_id, "xml_tool_index1_m");
    }

    #[test]
    fn json_object_and_array_values() {
        let content = r#"<function_calls><invoke name="t">
<parameter name="obj">{"a": 1, "b": [2, 3]}</parameter>
<parameter name="arr">[1, 2, 3]</parameter>
</invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls[0].arguments["obj"]["b"][1], 3);
        assert_eq!(calls[0].arguments["arr"][0], 1);
    }

    #[test]
    fn malformed_json_stays_a_string() {
        let content = r#"<function_calls><invoke name="t">
<parameter name="broken">{not json}</parameter>
</invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls[0].arguments["broken"], "{not json}");
    }

    #[test]
    fn boolean_and_numeric_coercion() {
        let content = r#"<function_calls><invoke name="t">
<parameter name="yes">true</parameter>
<parameter name="no">False</parameter>
<parameter name="int">42</parameter>
<parameter name="neg">-7</parameter>
<parameter name="float">3.25</parameter>
<parameter name="text">hello world</parameter>
</invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        let args = &calls[0].arguments;
        assert_eq!(args["yes"], true);
        assert_eq!(args["no"], false);
        assert_eq!(args["int"], 42);
        assert_eq!(args["neg"], -7);
        assert_eq!(args["float"], 3.25);
        assert_eq!(args["text"], "hello world");
    }

    #[test]
    fn single_quoted_attributes() {
        let content = r#"<function_calls><invoke name='tool'>
<parameter name='key'>value</parameter>
</invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls[0].tool_name, "tool");
        assert_eq!(calls[0].arguments["key"], "value");
    }

    #[test]
    fn case_insensitive_tags() {
        let content = r#"<FUNCTION_CALLS><INVOKE name="t">
<PARAMETER name="k">v</PARAMETER>
</INVOKE></FUNCTION_CALLS>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["k"], "v");
    }

    #[test]
    fn no_block_parses_to_nothing() {
        assert!(parse_xml_tool_calls("just some prose", "m").is_empty());
        assert!(!contains_xml_tool_calls("just some prose"));
        // Unclosed block is incomplete, not a call.
        assert!(parse_xml_tool_calls("<function_calls><invoke name=\"x\">", "m").is_empty());
    }

    #[test]
    fn invoke_without_parameters_yields_empty_object() {
        let content = r#"<function_calls><invoke name="ping"></invoke></function_calls>"#;
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn deterministic_parse() {
        let a = parse_xml_tool_calls(SINGLE, "m");
        let b = parse_xml_tool_calls(SINGLE, "m");
        assert_eq!(a, b);
    }

    #[test]
    fn strip_removes_blocks_keeps_prose() {
        let stripped = strip_xml_tool_calls(SINGLE);
        assert_eq!(stripped, "Let me search for that.");
        assert_eq!(strip_xml_tool_calls(""), "");
        assert_eq!(strip_xml_tool_calls("no xml here"), "no xml here");
    }

    #[test]
    fn multiline_parameter_values_survive() {
        let content = "<function_calls><invoke name=\"write\">\n<parameter name=\"body\">line one\nline two</parameter>\n</invoke></function_calls>";
        let calls = parse_xml_tool_calls(content, "m");
        assert_eq!(calls[0].arguments["body"], "line one\nline two");
    }
}
