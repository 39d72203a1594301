//! Length-limited message splitting.

/// Where a separator leaves the chunk boundary: `end` is the byte index
/// the chunk stops at, `resume` is where the remainder starts.
struct Cut {
    end: usize,
    resume: usize,
}

/// Separator groups in priority order. Within a group the rightmost
/// occurrence wins; a lower-priority group is only consulted when no
/// higher-priority separator lands between the minimum-chunk floor and
/// the limit.
const SEPARATOR_GROUPS: &[&[&str]] = &[
    &["\n\n"],
    &["\n# ", "\n## ", "\n### "],
    &["\n- ", "\n* "],
    &["\n"],
    &[". ", "! ", "? "],
    &[", ", "; ", ": "],
    &[" "],
];

/// Placeholder markers for masked code fences, from the Unicode private
/// use area so they cannot collide with model output. Placeholders are
/// padded with the fill char to the masked block's length, so split
/// positions computed on the masked text stay valid after restoration.
const FENCE_OPEN: char = '\u{E000}';
const FENCE_CLOSE: char = '\u{E001}';
const FENCE_FILL: char = '\u{E002}';

/// Split `text` into chunks of at most `limit` bytes.
///
/// Break points are chosen by separator priority (paragraph break,
/// headings, list items, line break, sentence end, clause, word), always
/// the rightmost occurrence at or before the limit and past a 40% minimum
/// chunk floor. Fenced code blocks are masked before splitting so they
/// never break mid-block; a restored chunk that still exceeds the limit
/// (a code block bigger than a whole message) is force-split on newline,
/// then space, then hard cut.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let (masked, fences) = mask_fences(text);
    let mut chunks = Vec::new();
    let mut rest = masked.as_str();

    while rest.len() > limit {
        let cut = find_cut(rest, limit);
        chunks.push(rest[..cut.end].trim_end().to_string());
        rest = rest[cut.resume..].trim_start_matches(' ');
    }
    if !rest.trim().is_empty() {
        chunks.push(rest.trim_end().to_string());
    }

    chunks
        .into_iter()
        .map(|c| restore_fences(&c, &fences))
        .flat_map(|c| {
            if c.len() > limit {
                force_split(&c, limit)
            } else {
                vec![c]
            }
        })
        .filter(|c| !c.is_empty())
        .collect()
}

fn find_cut(rest: &str, limit: usize) -> Cut {
    let floor = limit * 2 / 5;
    // Window the search so a separator's cut never lands past the limit.
    let window = &rest[..char_floor(rest, limit + 1)];

    for group in SEPARATOR_GROUPS {
        let mut best: Option<Cut> = None;
        for sep in *group {
            if let Some(pos) = window.rfind(sep) {
                let cut = cut_for(sep, pos);
                if cut.end > limit || cut.end < floor {
                    continue;
                }
                if best.as_ref().is_none_or(|b| cut.end > b.end) {
                    best = Some(cut);
                }
            }
        }
        if let Some(cut) = best {
            return cut;
        }
    }

    let end = char_floor(rest, limit);
    Cut { end, resume: end }
}

fn cut_for(sep: &str, pos: usize) -> Cut {
    match sep {
        // Paragraph break: drop the blank line entirely.
        "\n\n" => Cut {
            end: pos,
            resume: pos + 2,
        },
        // Sentence terminator: punctuation stays with the chunk.
        ". " | "! " | "? " | ", " | "; " | ": " => Cut {
            end: pos + 1,
            resume: pos + 2,
        },
        // Bare space: drop it.
        " " => Cut {
            end: pos,
            resume: pos + 1,
        },
        // Line-anchored markers keep the marker with the next chunk.
        _ => Cut {
            end: pos,
            resume: pos + 1,
        },
    }
}

/// Largest byte index ≤ `at` that is a char boundary.
fn char_floor(s: &str, at: usize) -> usize {
    let mut i = at.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Replace each fenced code block with an opaque single-token placeholder.
fn mask_fences(text: &str) -> (String, Vec<String>) {
    let mut fences = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        let after_open = &rest[start + 3..];
        let Some(close) = after_open.find("```") else {
            break; // unterminated fence, leave as-is
        };
        let end = start + 3 + close + 3;
        let block = &rest[start..end];
        out.push_str(&rest[..start]);
        let mut placeholder = String::new();
        placeholder.push(FENCE_OPEN);
        placeholder.push_str(&fences.len().to_string());
        placeholder.push(FENCE_CLOSE);
        while placeholder.len() < block.len() {
            placeholder.push(FENCE_FILL);
        }
        out.push_str(&placeholder);
        fences.push(block.to_string());
        rest = &rest[end..];
    }
    out.push_str(rest);
    (out, fences)
}

fn restore_fences(chunk: &str, fences: &[String]) -> String {
    if fences.is_empty() {
        return chunk.to_string();
    }
    let mut out = String::with_capacity(chunk.len());
    let mut rest = chunk;
    while let Some(start) = rest.find(FENCE_OPEN) {
        let Some(close) = rest[start..].find(FENCE_CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);
        let index: usize = rest[start + FENCE_OPEN.len_utf8()..start + close]
            .parse()
            .unwrap_or(usize::MAX);
        if let Some(block) = fences.get(index) {
            out.push_str(block);
        }
        rest = &rest[start + close + FENCE_CLOSE.len_utf8()..];
    }
    out.push_str(rest);
    // Drop padding and any marker severed by a hard cut.
    out.retain(|c| !matches!(c, FENCE_OPEN | FENCE_CLOSE | FENCE_FILL));
    out
}

/// Last-resort splitting for a chunk that cannot fit: newline, then
/// space, then a hard cut at the limit.
fn force_split(chunk: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = chunk;
    while rest.len() > limit {
        let window = &rest[..char_floor(rest, limit + 1)];
        let (end, resume) = if let Some(pos) = window.rfind('\n').filter(|&p| p > 0) {
            (pos, pos + 1)
        } else if let Some(pos) = window.rfind(' ').filter(|&p| p > 0) {
            (pos, pos + 1)
        } else {
            let end = char_floor(rest, limit);
            (end, end)
        };
        parts.push(rest[..end].trim_end().to_string());
        rest = &rest[resume..];
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}
