/// Server-sent events decoding
///
/// Implements the line interpretation rules of the HTML event-stream format:
/// `event`, `data` (multi-line, joined by `\n`), `id` (persists across events,
/// ignored when it contains NUL) and `retry`. Lines starting with `:` are comments
/// and a blank line dispatches the buffered event.

/// One dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: String,
    pub retry: Option<u64>,
}

/// Stateful line decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: String,
    data: Vec<String>,
    last_event_id: String,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator); returns an event on dispatch
    pub fn decode(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_empty()
                && self.data.is_empty()
                && self.last_event_id.is_empty()
                && self.retry.is_none()
            {
                return None;
            }

            let event = SseEvent {
                event: std::mem::take(&mut self.event),
                data: std::mem::take(&mut self.data).join("\n"),
                // last event id is not reset between events
                id: self.last_event_id.clone(),
                retry: self.retry.take(),
            };
            return Some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = value.to_string();
                }
            }
            "retry" => {
                if let Ok(retry) = value.parse() {
                    self.retry = Some(retry);
                }
            }
            _ => {}
        }

        None
    }
}

/// Splits a chunked byte stream into lines
///
/// Accepts `\n`, `\r\n` and bare `\r` terminators. Incomplete trailing bytes are
/// kept until the next chunk or [`LineBuffer::finish`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(byte);
                }
            }
        }
        lines
    }

    /// Flush whatever is left once the byte stream ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
