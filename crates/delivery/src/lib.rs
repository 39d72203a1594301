//! Incremental delivery scheduling.
//!
//! Streamed completion text is rendered into a single host message by
//! repeated edits. The host enforces an (undocumented) edit-rate ceiling,
//! so edits are paced by [`EditThrottle`]: a short burst budget per rolling
//! window, falling back to a sustained cadence once spent. Rendering is
//! debounced — new text replaces a latest-pending slot instead of piling
//! up timers — and finalization splits overlong output into ordered parts
//! without cutting fenced code blocks in half.

mod renderer;
mod split;
mod throttle;

pub use renderer::ResponseRenderer;
pub use split::split_message;
pub use throttle::EditThrottle;
