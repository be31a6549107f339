#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationDirection {
    Head,
    Tail,
}

pub struct TruncationResult {
    pub content: String,
    pub was_truncated: bool,
    pub original_bytes: usize,
}

/// Caps `content` at `max_bytes`, keeping either the head or the tail and
/// marking the cut with a truncation message. Never accumulates unbounded
/// output — this is applied as bytes are read from the child, not after
/// the fact on a fully-buffered string.
pub fn truncate_output(content: &str, max_bytes: usize, direction: TruncationDirection) -> TruncationResult {
    let original_bytes = content.len();
    if original_bytes <= max_bytes {
        return TruncationResult {
            content: content.to_string(),
            was_truncated: false,
            original_bytes,
        };
    }

    let kept = match direction {
        TruncationDirection::Head => take_valid_prefix(content, max_bytes),
        TruncationDirection::Tail => take_valid_suffix(content, max_bytes),
    };
    let marker = format!(
        "\n[... truncated {} of {} bytes ...]\n",
        original_bytes - kept.len(),
        original_bytes
    );
    let combined = match direction {
        TruncationDirection::Head => format!("{kept}{marker}"),
        TruncationDirection::Tail => format!("{marker}{kept}"),
    };
    TruncationResult {
        content: combined,
        was_truncated: true,
        original_bytes,
    }
}

fn take_valid_prefix(content: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(content.len());
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn take_valid_suffix(content: &str, max_bytes: usize) -> &str {
    let len = content.len();
    let mut start = len.saturating_sub(max_bytes);
    while start < len && !content.is_char_boundary(start) {
        start += 1;
    }
    &content[start..]
}

/// A single-stream bounded capture buffer: appends bytes up to a cap, then
/// stops accumulating while still counting bytes seen so the final
/// truncation message is accurate.
#[derive(Clone)]
pub struct OutputCapture {
    buffer: Vec<u8>,
    cap: usize,
    total_bytes_seen: usize,
}

impl OutputCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
            total_bytes_seen: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes_seen += chunk.len();
        if self.buffer.len() >= self.cap {
            return;
        }
        let remaining = self.cap - self.buffer.len();
        let take = remaining.min(chunk.len());
        self.buffer.extend_from_slice(&chunk[..take]);
    }

    pub fn finish(self) -> TruncationResult {
        let content = String::from_utf8_lossy(&self.buffer).into_owned();
        if self.total_bytes_seen <= self.cap {
            TruncationResult {
                content,
                was_truncated: false,
                original_bytes: self.total_bytes_seen,
            }
        } else {
            let marker = format!(
                "\n[... truncated {} of {} bytes ...]\n",
                self.total_bytes_seen - self.buffer.len(),
                self.total_bytes_seen
            );
            TruncationResult {
                content: format!("{content}{marker}"),
                was_truncated: true,
                original_bytes: self.total_bytes_seen,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_is_not_truncated() {
        let result = truncate_output("hello", 100, TruncationDirection::Head);
        assert!(!result.was_truncated);
        assert_eq!(result.content, "hello");
    }

    #[test]
    fn over_cap_head_keeps_prefix_and_marks_truncation() {
        let long = "a".repeat(1000);
        let result = truncate_output(&long, 10, TruncationDirection::Head);
        assert!(result.was_truncated);
        assert!(result.content.starts_with("aaaaaaaaaa"));
        assert!(result.content.contains("truncated"));
    }

    #[test]
    fn capture_accumulates_up_to_cap_then_stops() {
        let mut capture = OutputCapture::new(5);
        capture.push(b"hello world, this is long");
        let result = capture.finish();
        assert!(result.was_truncated);
        assert!(result.content.starts_with("hello"));
        assert_eq!(result.original_bytes, 26);
    }

    #[test]
    fn capture_under_cap_reports_no_truncation() {
        let mut capture = OutputCapture::new(100);
        capture.push(b"short");
        let result = capture.finish();
        assert!(!result.was_truncated);
        assert_eq!(result.content, "short");
    }
}
