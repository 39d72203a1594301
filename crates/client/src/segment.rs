//! Sentence/clause segmentation for low-latency voice playback.
//!
//! Buffers incremental text and releases it only at safe speech
//! boundaries: sentence terminators always, clause separators only when
//! the clause is long enough and does not end on a grammatically dangling
//! word. No other early cutoffs exist.

/// Sentence terminators — always eligible split points.
const SENTENCE_ENDS: &[char] = &['.', '!', '?'];

/// Clause separators — eligible only for sufficiently complete clauses.
const CLAUSE_ENDS: &[char] = &[',', ';', ':'];

/// Words a spoken clause must not end on: question words, articles,
/// copulas, prepositions, conjunctions, and bare pronouns.
const DANGLING_ENDINGS: &[&str] = &[
    "what", "who", "where", "when", "why", "how", "which",
    "a", "an", "the",
    "is", "are", "was", "were", "am", "be", "been",
    "to", "of", "in", "on", "at", "with", "for", "from",
    "and", "but", "or", "so", "because",
    "i", "you", "he", "she", "it", "we", "they",
];

/// Streaming text segmenter.
///
/// Push incremental deltas and collect the sentence-sized units they
/// complete; call [`finish`] at end of stream for the remainder.
///
/// [`finish`]: SentenceSegmenter::finish
pub struct SentenceSegmenter {
    buffer: String,
    min_words_clause: usize,
}

impl SentenceSegmenter {
    pub fn new(min_words_clause: usize) -> Self {
        Self {
            buffer: String::new(),
            min_words_clause,
        }
    }

    /// Append a delta and drain every segment it completes.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut segments = Vec::new();
        loop {
            match self.find_boundary() {
                Some(end) => {
                    let segment: String = self.buffer.drain(..end).collect();
                    let segment = segment.trim().to_string();
                    // Drop leading whitespace left behind the split point.
                    let trimmed_len = self.buffer.len() - self.buffer.trim_start().len();
                    self.buffer.drain(..trimmed_len);
                    if !segment.is_empty() {
                        segments.push(segment);
                    }
                }
                None => break,
            }
        }
        segments
    }

    /// End of stream: hand back whatever is buffered, if speakable.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (speakable(rest)).then(|| rest.to_string())
    }

    /// Byte offset one past the first eligible boundary, if any.
    fn find_boundary(&self) -> Option<usize> {
        for (idx, ch) in self.buffer.char_indices() {
            let end = idx + ch.len_utf8();
            if SENTENCE_ENDS.contains(&ch) {
                // A sentence must contain something worth speaking —
                // never emit a bare emoji or punctuation run.
                if speakable(&self.buffer[..end]) {
                    return Some(end);
                }
            } else if CLAUSE_ENDS.contains(&ch) && self.clause_ready(&self.buffer[..idx]) {
                return Some(end);
            }
        }
        None
    }

    /// A clause may be spoken early only if it is long enough and does
    /// not end mid-thought.
    fn clause_ready(&self, clause: &str) -> bool {
        let words: Vec<&str> = clause.split_whitespace().collect();
        if words.len() < self.min_words_clause {
            return false;
        }
        let Some(last) = words.last() else {
            return false;
        };
        let last = last
            .trim_end_matches(|c: char| !c.is_alphanumeric() && c != '\'')
            .to_lowercase();
        if last.ends_with('\'') || last.contains('\'') {
            return false; // Contractions dangle ("I'm", "it's", "we'll")
        }
        !DANGLING_ENDINGS.contains(&last.as_str())
    }
}

/// At least one non-punctuation, non-emoji character.
fn speakable(text: &str) -> bool {
    text.chars().any(|c| c.is_alphanumeric())
}
