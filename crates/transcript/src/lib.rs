//! Transcript completeness filter.
//!
//! Speech-to-text output sometimes arrives split mid-sentence. This crate
//! classifies fragments as complete or incomplete using ordered regex rule
//! tables, buffers suspected-incomplete fragments, and merges continuations
//! that arrive within a short window before releasing them downstream.

mod filter;
mod rules;

pub use filter::{CompletedUtterance, TranscriptFilter};
pub use rules::{looks_continuation, looks_incomplete};
