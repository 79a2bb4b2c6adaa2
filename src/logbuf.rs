use std::io;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Append-only in-memory log shared between the background listener thread and
/// the foreground console. Passed explicitly by handle, not held in a global.
///
/// One writer, one reader: entries are whole lines appended under a mutex, so
/// a `snapshot` never observes a partially written entry.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(line.into());
    }

    /// All lines in append order.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.clone()
    }

    pub fn len(&self) -> usize {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines appended since position `from` (a previous `len`), with the new
    /// length for the next poll.
    pub fn tail_from(&self, from: usize) -> (Vec<String>, usize) {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let tail = lines.get(from..).unwrap_or_default().to_vec();
        (tail, lines.len())
    }

    pub fn clear(&self) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.clear();
    }
}

/// Per-event writer handed out by the `MakeWriter` impl. Bytes accumulate
/// until a newline (or drop) so each formatted tracing event lands in the
/// buffer as one atomic line.
pub struct LogBufferWriter {
    buffer: LogBuffer,
    pending: Vec<u8>,
}

impl LogBufferWriter {
    fn push_complete_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.buffer.append(text);
        }
    }
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.push_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogBufferWriter {
    fn drop(&mut self) {
        self.push_complete_lines();
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.append(text);
        }
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::thread;

    #[test]
    fn snapshot_preserves_append_order() {
        let buffer = LogBuffer::new();
        for i in 0..100 {
            buffer.append(format!("entry {i}"));
        }
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 100);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("entry {i}"));
        }
    }

    #[test]
    fn tail_from_returns_only_new_lines() {
        let buffer = LogBuffer::new();
        buffer.append("a");
        buffer.append("b");
        let (tail, cursor) = buffer.tail_from(0);
        assert_eq!(tail, vec!["a".to_string(), "b".to_string()]);
        buffer.append("c");
        let (tail, cursor) = buffer.tail_from(cursor);
        assert_eq!(tail, vec!["c".to_string()]);
        let (tail, _) = buffer.tail_from(cursor);
        assert!(tail.is_empty());
    }

    #[test]
    fn concurrent_appends_never_corrupt_entries() {
        let buffer = LogBuffer::new();
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    buffer.append(format!("writer {i}"));
                }
            })
        };
        // Reader takes snapshots while the writer is appending.
        for _ in 0..50 {
            for line in buffer.snapshot() {
                assert!(line.starts_with("writer "));
            }
        }
        writer.join().unwrap();

        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 500);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("writer {i}"));
        }
    }

    #[test]
    fn make_writer_appends_whole_lines() {
        let buffer = LogBuffer::new();
        {
            let mut writer = buffer.make_writer();
            writer.write_all(b"first half ").unwrap();
            writer.write_all(b"second half\n").unwrap();
        }
        {
            let mut writer = buffer.make_writer();
            writer.write_all(b"no trailing newline").unwrap();
        }
        assert_eq!(
            buffer.snapshot(),
            vec![
                "first half second half".to_string(),
                "no trailing newline".to_string()
            ]
        );
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buffer = LogBuffer::new();
        buffer.append("stale");
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
