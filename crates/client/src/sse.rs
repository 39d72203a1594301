//! SSE frame parsing and tool-call accumulation.
//!
//! The response body is a sequence of `data: <json>` lines terminated by
//! `data: [DONE]`. Frames carry incremental text deltas, tool-call
//! fragments (arguments arrive as string pieces that concatenate per call
//! index), completed tool calls for the non-streaming fallback, and a
//! finish reason. Malformed frames are logged and skipped — they must
//! never abort the stream.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{trace, warn};
use voxrelay_core::message::ToolInvocation;

/// Parser output, one level below the public stream events.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParserEvent {
    /// Incremental text.
    Content(String),
    /// A fully accumulated, validated tool invocation.
    ToolCall(ToolInvocation),
    /// Terminal `[DONE]` marker seen.
    Finished,
}

/// Accumulates one tool call's fragments across frames, keyed by index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    /// Validate the accumulated argument text and build the invocation.
    ///
    /// Arguments must parse as a single balanced JSON object; anything
    /// else discards the call with a warning.
    fn finalize(self) -> Option<ToolInvocation> {
        match serde_json::from_str::<serde_json::Value>(&self.arguments) {
            Ok(value) if value.is_object() => Some(ToolInvocation {
                name: self.name,
                arguments: value,
            }),
            Ok(_) => {
                warn!(tool = %self.name, "Tool call arguments are not a JSON object, discarding");
                None
            }
            Err(e) => {
                warn!(tool = %self.name, error = %e, "Malformed tool call arguments, discarding");
                None
            }
        }
    }
}

/// Incremental parser for one completion response body.
///
/// Feed it network chunks as they arrive; complete lines are processed,
/// partial lines wait in the buffer for the next chunk.
#[derive(Default)]
pub(crate) struct StreamParser {
    line_buffer: String,
    accumulators: BTreeMap<u32, ToolCallAccumulator>,
    tools_emitted: bool,
    finished: bool,
}

impl StreamParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Consume one network chunk, returning events for every complete frame.
    ///
    /// Once the terminal marker has been seen, later chunks are ignored.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) -> Vec<ParserEvent> {
        if self.finished {
            return Vec::new();
        }
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(line_end) = self.line_buffer.find('\n') {
            let line = self.line_buffer[..line_end]
                .trim_end_matches('\r')
                .to_string();
            self.line_buffer.drain(..=line_end);
            self.handle_line(&line, &mut events);
            if self.finished {
                break;
            }
        }
        events
    }

    /// The stream ended. Process any final unterminated line.
    pub(crate) fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.handle_line(line.trim_end_matches('\r'), &mut events);
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ParserEvent>) {
        // Non-data lines (blank separators, SSE comments) carry nothing.
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.finished = true;
            events.push(ParserEvent::Finished);
            return;
        }

        let frame: Frame = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(data, error = %e, "Skipping unparseable frame");
                return;
            }
        };

        let Some(choice) = frame.choices.into_iter().next() else {
            return;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    events.push(ParserEvent::Content(content));
                }
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let acc = self.accumulators.entry(tc.index).or_default();
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        acc.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        acc.arguments.push_str(&arguments);
                    }
                }
            }
        }

        // Non-streaming fallback: a complete message in a single frame.
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.is_empty() {
                    events.push(ParserEvent::Content(content));
                }
            }
            // Keys continue past any delta indices so emission order stays
            // delta calls first, then completed calls in frame order.
            let mut next_key = self
                .accumulators
                .last_key_value()
                .map_or(0, |(k, _)| k.saturating_add(1));
            for tc in message.tool_calls.unwrap_or_default() {
                self.accumulators.insert(
                    next_key,
                    ToolCallAccumulator {
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    },
                );
                next_key = next_key.saturating_add(1);
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            self.emit_tool_calls(events);
        }
    }

    /// Drain accumulators into validated invocations, at most once.
    fn emit_tool_calls(&mut self, events: &mut Vec<ParserEvent>) {
        if self.tools_emitted {
            return;
        }
        self.tools_emitted = true;
        for (_, acc) in std::mem::take(&mut self.accumulators) {
            if let Some(invocation) = acc.finalize() {
                events.push(ParserEvent::ToolCall(invocation));
            }
        }
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    choices: Vec<FrameChoice>,
}

#[derive(Debug, Deserialize)]
struct FrameChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    message: Option<FrameMessage>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct FrameMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletedToolCall>>,
}

/// A tool call delta — arrives incrementally across frames.
#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletedToolCall {
    function: CompletedFunction,
}

#[derive(Debug, Deserialize)]
struct CompletedFunction {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_line(json: &str) -> String {
        format!("data: {json}\n")
    }

    #[test]
    fn content_deltas_come_through() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#)
                .as_bytes(),
        );
        assert_eq!(events, vec![ParserEvent::Content("Hello".into())]);
    }

    #[test]
    fn partial_lines_accumulate_across_chunks() {
        let mut parser = StreamParser::new();
        let line = frame_line(r#"{"choices":[{"delta":{"content":"split"}}]}"#);
        let (a, b) = line.split_at(20);

        assert!(parser.push_bytes(a.as_bytes()).is_empty());
        let events = parser.push_bytes(b.as_bytes());
        assert_eq!(events, vec![ParserEvent::Content("split".into())]);
    }

    #[test]
    fn done_marker_finishes_the_stream() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(b"data: [DONE]\n");
        assert_eq!(events, vec![ParserEvent::Finished]);
        // Frames after [DONE] are ignored.
        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{"content":"late"}}]}"#).as_bytes(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(b": keep-alive comment\n\nevent: ping\n");
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_frames_never_abort() {
        let mut parser = StreamParser::new();
        let mut input = String::from("data: {not json}\n");
        input.push_str(&frame_line(r#"{"choices":[{"delta":{"content":"ok"}}]}"#));
        let events = parser.push_bytes(input.as_bytes());
        assert_eq!(events, vec![ParserEvent::Content("ok".into())]);
    }

    #[test]
    fn tool_call_accumulates_across_frames() {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        events.extend(parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"set_timer","arguments":"{\"minutes\""}}]}}]}"#,
            )
            .as_bytes(),
        ));
        events.extend(parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":": 5}"}}]}}]}"#,
            )
            .as_bytes(),
        ));
        assert!(events.is_empty());

        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).as_bytes(),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            ParserEvent::ToolCall(tc) => {
                assert_eq!(tc.name, "set_timer");
                assert_eq!(tc.arguments["minutes"], 5);
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn invalid_tool_arguments_are_discarded() {
        let mut parser = StreamParser::new();
        parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"broken","arguments":"{invalid json"}}]}}]}"#,
            )
            .as_bytes(),
        );
        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).as_bytes(),
        );
        assert!(events.is_empty(), "malformed call must be dropped silently");
    }

    #[test]
    fn non_object_tool_arguments_are_discarded() {
        let mut parser = StreamParser::new();
        parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"odd","arguments":"[1,2,3]"}}]}}]}"#,
            )
            .as_bytes(),
        );
        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).as_bytes(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn parallel_tool_calls_keep_their_indices() {
        let mut parser = StreamParser::new();
        parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"first","arguments":"{}"}},{"index":1,"function":{"name":"second","arguments":"{}"}}]}}]}"#,
            )
            .as_bytes(),
        );
        let events = parser.push_bytes(
            frame_line(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).as_bytes(),
        );
        let names: Vec<_> = events
            .iter()
            .map(|e| match e {
                ParserEvent::ToolCall(tc) => tc.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn non_streaming_message_fallback() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(
            frame_line(
                r#"{"choices":[{"message":{"content":"full reply"},"finish_reason":"stop"}]}"#,
            )
            .as_bytes(),
        );
        assert_eq!(events, vec![ParserEvent::Content("full reply".into())]);
    }

    #[test]
    fn completed_tool_calls_in_message() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(
            frame_line(
                r#"{"choices":[{"message":{"tool_calls":[{"function":{"name":"lookup","arguments":"{\"q\":\"x\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            )
            .as_bytes(),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            ParserEvent::ToolCall(tc) => assert_eq!(tc.name, "lookup"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn completed_tool_calls_keep_frame_order() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(
            frame_line(
                r#"{"choices":[{"message":{"tool_calls":[{"function":{"name":"first","arguments":"{}"}},{"function":{"name":"second","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
            )
            .as_bytes(),
        );
        let names: Vec<_> = events
            .iter()
            .map(|e| match e {
                ParserEvent::ToolCall(tc) => tc.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn delta_calls_emit_before_completed_calls() {
        let mut parser = StreamParser::new();
        parser.push_bytes(
            frame_line(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"streamed","arguments":"{}"}}]}}]}"#,
            )
            .as_bytes(),
        );
        let events = parser.push_bytes(
            frame_line(
                r#"{"choices":[{"message":{"tool_calls":[{"function":{"name":"whole","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
            )
            .as_bytes(),
        );
        let names: Vec<_> = events
            .iter()
            .map(|e| match e {
                ParserEvent::ToolCall(tc) => tc.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["streamed", "whole"]);
    }

    #[test]
    fn finish_on_unterminated_trailing_line() {
        let mut parser = StreamParser::new();
        // Final frame arrives without a trailing newline before EOF.
        parser.push_bytes(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        let events = parser.finish();
        assert_eq!(events, vec![ParserEvent::Content("tail".into())]);
    }

    #[test]
    fn crlf_lines_are_handled() {
        let mut parser = StreamParser::new();
        let events = parser.push_bytes(
            format!(
                "data: {}\r\n",
                r#"{"choices":[{"delta":{"content":"crlf"}}]}"#
            )
            .as_bytes(),
        );
        assert_eq!(events, vec![ParserEvent::Content("crlf".into())]);
    }
}
