/// Captured console output of one session.
///
/// Raw bytes are append-only. The decoded text is always re-derived from the
/// complete raw buffer, so a multi-byte character split across two reads shows
/// up as U+FFFD until its tail arrives and then decodes correctly.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    raw: Vec<u8>,
    text: String,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk and redecode everything captured so far.
    pub fn extend(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.raw.extend_from_slice(chunk);
        self.text = String::from_utf8_lossy(&self.raw).into_owned();
    }

    /// Decoded text of everything captured.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Total raw bytes captured.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Current decoded text split on line boundaries. Recomputed on every call.
    pub fn lines(&self) -> Vec<&str> {
        self.text.lines().collect()
    }

    /// How many leading entries of `lines()` are terminated by a newline.
    /// A trailing partial line may still grow and is not counted.
    pub fn complete_lines(&self) -> usize {
        let total = self.text.lines().count();
        if self.text.is_empty() || self.text.ends_with('\n') {
            total
        } else {
            total - 1
        }
    }
}
