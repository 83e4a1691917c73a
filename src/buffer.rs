//! Accumulator for engine bytes that have not been decoded yet.

/// Characters of already-decoded text kept in front of newly arrived text
pub const TAIL_ECHO_LEN: usize = 30;

/// Bytes received from the engine but not yet turned into events.
///
/// Besides the pending text this carries the small amount of state the
/// decoder needs between chunks: the tail echo used to skip rescans while a
/// tag is incomplete, and the startup banner seen before the first prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuffer {
    text: String,
    /// Trailing bytes of an incomplete UTF-8 sequence
    partial: Vec<u8>,
    tail_echo: String,
    /// Close marker known to be absent from `text` as of the last decode
    pending_close: Option<String>,
    awaiting_first_prompt: bool,
    banner: String,
}

impl Default for RawBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RawBuffer {
    /// Buffer for a freshly started engine; the first prompt is still expected
    pub fn new() -> Self {
        Self {
            text: String::new(),
            partial: Vec::new(),
            tail_echo: String::new(),
            pending_close: None,
            awaiting_first_prompt: true,
            banner: String::new(),
        }
    }

    /// Buffer for an engine that has already shown its first prompt
    pub fn after_startup() -> Self {
        Self {
            awaiting_first_prompt: false,
            ..Self::new()
        }
    }

    /// Append raw socket bytes, holding back an incomplete UTF-8 sequence
    pub fn push_bytes(&mut self, data: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(data);

        let mut decoded = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&bytes[start..]) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&bytes[start..valid_end]));
                    match e.error_len() {
                        None => {
                            self.partial = bytes[valid_end..].to_vec();
                            break;
                        }
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                    }
                }
            }
        }

        self.push_str(&decoded);
    }

    pub fn push_str(&mut self, data: &str) {
        self.text.push_str(data);
        self.tail_echo.push_str(data);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.partial.is_empty()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// The last decoded characters followed by everything pushed since
    pub fn tail_echo(&self) -> &str {
        &self.tail_echo
    }

    pub fn awaiting_first_prompt(&self) -> bool {
        self.awaiting_first_prompt
    }

    pub(crate) fn banner(&self) -> &str {
        &self.banner
    }

    pub(crate) fn append_banner(&mut self, text: &str) {
        if self.awaiting_first_prompt {
            self.banner.push_str(text);
        }
    }

    pub(crate) fn mark_started(&mut self) {
        self.awaiting_first_prompt = false;
        self.banner.clear();
    }

    /// Drop the first `len` bytes of pending text
    pub(crate) fn consume(&mut self, len: usize) {
        self.text.drain(..len);
        self.pending_close = None;
    }

    /// Remember that `close` does not occur anywhere in the pending text
    pub(crate) fn mark_pending(&mut self, close: &str) {
        self.pending_close = Some(close.to_string());
    }

    /// Cheap pre-check before scanning for `close`.
    ///
    /// Returns false only when the previous decode already scanned the whole
    /// text without finding `close` and the tail echo (which covers every
    /// position a new occurrence could straddle) does not contain it either.
    pub(crate) fn close_may_be_present(&self, close: &str) -> bool {
        match &self.pending_close {
            Some(pending) if pending == close && close.chars().count() <= TAIL_ECHO_LEN + 1 => {
                self.tail_echo.contains(close)
            }
            _ => true,
        }
    }

    /// Reset the echo to the last [`TAIL_ECHO_LEN`] characters of the text
    pub(crate) fn refresh_tail_echo(&mut self) {
        let start = self
            .text
            .char_indices()
            .rev()
            .nth(TAIL_ECHO_LEN - 1)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.tail_echo = self.text[start..].to_string();
    }
}
