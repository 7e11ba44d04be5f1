//! Outbound UI boundary: what the chat core tells the client to draw.
//!
//! The gateway implements this by turning each call into a WebSocket event for the sockets
//! that opened the session. Calls are fire-and-forget; a surface with no listeners drops them.

pub trait ChatSurface: Send + Sync {
    /// Append a fragment to the assistant message currently being generated.
    fn render_increment(&self, session_id: &str, fragment: &str);

    /// Replace the in-progress assistant message with its final text.
    fn render_final(&self, session_id: &str, full_text: &str, truncated: bool);

    /// Show an error for the session (generation failed, daemon down, bad settings...).
    fn render_error(&self, session_id: &str, message: &str);

    /// Download progress for a model pull started from this session.
    fn render_progress(&self, session_id: &str, model: &str, done: u64, total: u64);

    /// Informational message (command output, confirmations, warnings). Markdown.
    fn render_notice(&self, session_id: &str, content: &str);
}
