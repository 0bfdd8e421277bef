//! Plain-text streaming support for coding sub-agent output.

use regex::Regex;
use std::sync::LazyLock;

/// CSI escape sequences emitted by interactive CLIs (colors, cursor moves).
static ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("hardcoded CSI regex"));

/// Strip ANSI CSI sequences so streamed chunks are plain text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_CSI.replace_all(text, "").into_owned()
}

/// Accumulates streamed characters and releases them in chunks.
///
/// A chunk is released whenever the buffered size meets `chunk_size`;
/// whatever remains at end of stream is released by [`ChunkBuffer::flush`].
pub struct ChunkBuffer {
    buf: String,
    chunk_size: usize,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buf: String::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Append text; returns a chunk if the buffer reached the threshold.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buf.push_str(text);
        if self.buf.len() >= self.chunk_size {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Release whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_cursor_sequences() {
        let colored = "\x1b[1;32mok\x1b[0m done\x1b[2K";
        assert_eq!(strip_ansi(colored), "ok done");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }

    #[test]
    fn releases_chunk_at_threshold() {
        let mut buffer = ChunkBuffer::new(10);
        assert_eq!(buffer.push("12345"), None);
        assert_eq!(buffer.push("67890"), Some("1234567890".to_string()));
        assert_eq!(buffer.push("tail"), None);
        assert_eq!(buffer.flush(), Some("tail".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn oversized_push_releases_everything_buffered() {
        let mut buffer = ChunkBuffer::new(4);
        let chunk = buffer.push("a much longer line\n").unwrap();
        assert_eq!(chunk, "a much longer line\n");
        assert_eq!(buffer.flush(), None);
    }
}
