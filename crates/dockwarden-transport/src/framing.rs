//! Wire framing helpers.
//!
//! The engine event feed is JSON lines that may arrive split across
//! arbitrary chunk boundaries. Log and exec output of non-TTY containers is
//! multiplexed with an 8-byte header per frame: `[stream, 0, 0, 0, size(u32 BE)]`.

/// Accumulates byte chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Append a chunk and return every line it completes.
    ///
    /// Blank lines are skipped and a trailing `\r` is removed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes held back waiting for a line terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Which output stream a multiplexed frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard input (echoed back by some engines).
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One demultiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Source stream.
    pub stream: StreamKind,
    /// Frame payload.
    pub data: Vec<u8>,
}

const HEADER_LEN: usize = 8;

/// Split multiplexed output into frames.
///
/// Returns `None` if the bytes are not a well-formed sequence of frames
/// (TTY containers produce raw output with no headers).
#[must_use]
pub fn demux(bytes: &[u8]) -> Option<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN || rest[1..4] != [0, 0, 0] {
            return None;
        }
        let stream = StreamKind::from_byte(rest[0])?;
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let body = rest.get(HEADER_LEN..HEADER_LEN + size)?;
        frames.push(Frame {
            stream,
            data: body.to_vec(),
        });
        rest = &rest[HEADER_LEN + size..];
    }
    Some(frames)
}

/// Split output into `(stdout, stderr)`, treating unframed input as stdout.
#[must_use]
pub fn split_output(bytes: &[u8]) -> (String, String) {
    match demux(bytes) {
        Some(frames) => {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            for frame in frames {
                match frame.stream {
                    StreamKind::Stderr => stderr.extend_from_slice(&frame.data),
                    StreamKind::Stdout | StreamKind::Stdin => stdout.extend_from_slice(&frame.data),
                }
            }
            (
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )
        }
        None => (String::from_utf8_lossy(bytes).into_owned(), String::new()),
    }
}

/// Flatten output into a single string, keeping frame order.
#[must_use]
pub fn merge_output(bytes: &[u8]) -> String {
    match demux(bytes) {
        Some(frames) => {
            let merged: Vec<u8> = frames.into_iter().flat_map(|f| f.data).collect();
            String::from_utf8_lossy(&merged).into_owned()
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn line_buffer_joins_split_records() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(br#"{"Type":"cont"#).is_empty());
        assert_eq!(buf.pending(), 13);
        let lines = buf.push(b"ainer\"}\n{\"a\":1}\r\n\n{\"b\"");
        assert_eq!(lines, vec![r#"{"Type":"container"}"#, r#"{"a":1}"#]);
        assert_eq!(buf.push(b":2}\n"), vec![r#"{"b":2}"#]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn line_buffer_clear_drops_partial() {
        let mut buf = LineBuffer::new();
        buf.push(b"partial");
        buf.clear();
        assert_eq!(buf.push(b"next\n"), vec!["next"]);
    }

    #[test]
    fn demux_splits_streams() {
        let mut bytes = frame(1, b"hello ");
        bytes.extend(frame(2, b"oops\n"));
        bytes.extend(frame(1, b"world\n"));

        let frames = demux(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].stream, StreamKind::Stderr);

        let (out, err) = split_output(&bytes);
        assert_eq!(out, "hello world\n");
        assert_eq!(err, "oops\n");
        assert_eq!(merge_output(&bytes), "hello oops\nworld\n");
    }

    #[test]
    fn unframed_output_is_raw() {
        assert!(demux(b"plain tty output\n").is_none());
        assert_eq!(split_output(b"plain\n"), ("plain\n".to_string(), String::new()));
    }

    #[test]
    fn truncated_frame_falls_back_to_raw() {
        let mut bytes = frame(1, b"complete");
        bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 50, b'x']);
        assert!(demux(&bytes).is_none());
        assert_eq!(merge_output(&bytes).len(), bytes.len());
    }

    #[test]
    fn empty_input_is_empty_frames() {
        assert_eq!(demux(b""), Some(Vec::new()));
        assert_eq!(merge_output(b""), "");
    }
}
