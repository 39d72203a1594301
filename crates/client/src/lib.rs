//! Streaming completion client.
//!
//! Opens one HTTP request per response attempt against an OpenAI-compatible
//! `/chat/completions` endpoint, parses the SSE event stream frame by frame
//! (with partial-line accumulation across network chunks), accumulates
//! multi-frame tool-call invocations, retries transient failures with
//! linear backoff, and — for voice — segments output into sentence/clause
//! units so playback can start before the response finishes.

mod client;
mod segment;
mod sse;

pub use client::{CompletionClient, OutputMode, StreamEvent, StreamRequest};
pub use segment::SentenceSegmenter;
