//! Incremental SSE `data:` line decoding for upstream responses
//!
//! Upstream bodies arrive in arbitrary chunks, so a line (or a multi-byte
//! character) may be split across two chunks. The decoder buffers raw bytes
//! and only hands out complete lines.

/// Payload yielded by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every `data:` payload it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = Self::parse_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<SseLine> {
        let raw = std::mem::take(&mut self.buffer);
        Self::parse_line(&raw)
    }

    fn parse_line(raw: &[u8]) -> Option<SseLine> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?;

        if data == "[DONE]" {
            Some(SseLine::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseLine::Data(data.to_string()))
        }
    }
}
