//! Buffered, flushable log sink.
//!
//! `Logs` installs `tracing_subscriber` once, with file, line, and target
//! annotations, writing into a shared in-memory buffer instead of straight to
//! stdout so an explicit `flush()` has something real to drain — e.g. right
//! before the supervisor reports a terminal error, so the last lines
//! describing why are guaranteed to have left the buffer before the process
//! might exit.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owns the buffer every log line is written into. [`Self::flush`] drains it
/// to stdout synchronously — no background worker, no approximation.
pub struct Logs {
    buffer: SharedBuffer,
}

impl Logs {
    /// Installs the global subscriber. Should be called once, near process
    /// start, before any supervisor is constructed.
    pub fn init() -> Self {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_writer(move || writer.clone()),
            )
            .init();

        Logs { buffer }
    }

    /// Blocks until every line buffered since the last flush has been
    /// written out to stdout.
    pub fn flush(&self) {
        let mut pending = self.buffer.0.lock().unwrap();
        if pending.is_empty() {
            return;
        }
        let mut stdout = io::stdout();
        let _ = stdout.write_all(&pending);
        let _ = stdout.flush();
        pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_drains_the_buffer() {
        let mut buffer = SharedBuffer::default();
        buffer.write_all(b"a log line\n").unwrap();
        assert!(!buffer.0.lock().unwrap().is_empty());

        let logs = Logs {
            buffer: buffer.clone(),
        };
        logs.flush();

        assert!(buffer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn flushing_an_empty_buffer_is_a_no_op() {
        let logs = Logs {
            buffer: SharedBuffer::default(),
        };
        logs.flush();
    }
}
