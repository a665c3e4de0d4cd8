//! The framed text channel between the engine and its external UI process.
//!
//! Frames are newline-delimited lines, CRLF-free. Writes serialize on the
//! pipe mutex; reads come off a reader thread feeding a channel the idle
//! pump drains one batch at a time. Floats always format with a `.` decimal
//! point, independent of process locale.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Sentinel for "no value" in both directions.
pub const NULL_SENTINEL: &str = "(null)";

/// UI visibility as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    None,
    Show,
    Hide,
    Crashed,
}

pub struct UiPipe {
    writer: Mutex<Box<dyn Write + Send>>,
    lines: Receiver<String>,
    state: Mutex<UiState>,
    child: Mutex<Option<Child>>,
}

impl UiPipe {
    /// Wraps an existing reader/writer pair (child stdio in production,
    /// in-memory pipes in tests).
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name(String::from("stagewire-uipipe-reader"))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                            if tx.send(trimmed).is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!("ui pipe reader finished");
            })
            .expect("failed to spawn ui pipe reader");
        Self {
            writer: Mutex::new(Box::new(writer)),
            lines: rx,
            state: Mutex::new(UiState::None),
            child: Mutex::new(None),
        }
    }

    /// Launches the external UI helper with its stdio as the pipe.
    pub fn spawn_helper(binary: &std::path::Path, args: &[String]) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn UI helper {binary:?}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("UI helper stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("UI helper stdin not captured"))?;
        let pipe = Self::new(stdout, stdin);
        *pipe.child.lock() = Some(child);
        Ok(pipe)
    }

    pub fn state(&self) -> UiState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: UiState) {
        *self.state.lock() = state;
    }

    /// True when the helper process died underneath us.
    pub fn helper_crashed(&self) -> bool {
        let mut child = self.child.lock();
        match child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(_))) | Some(Err(_)) => true,
            _ => false,
        }
    }

    /// Takes the pipe write lock for one multi-line frame.
    pub fn writer(&self) -> UiWriter<'_> {
        UiWriter {
            guard: self.writer.lock(),
            ok: true,
        }
    }

    /// One queued inbound line, if any. Non-blocking.
    pub fn try_recv_line(&self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    /// A follow-up argument line of the command currently being parsed.
    pub fn recv_line(&self, timeout: Duration) -> Option<String> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Drop for UiPipe {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Write half of the pipe, held for the duration of one frame.
pub struct UiWriter<'a> {
    guard: MutexGuard<'a, Box<dyn Write + Send>>,
    ok: bool,
}

impl UiWriter<'_> {
    /// Writes a raw message that must already be newline-terminated.
    pub fn write_message(&mut self, message: &str) -> &mut Self {
        debug_assert!(message.ends_with('\n'), "pipe messages are lines");
        if self.ok && self.guard.write_all(message.as_bytes()).is_err() {
            self.ok = false;
        }
        self
    }

    /// Writes one value line, fixing embedded newlines and escaping the
    /// empty string to the null sentinel.
    pub fn write_and_fix_message(&mut self, message: &str) -> &mut Self {
        if message.is_empty() {
            return self.write_message(&format!("{NULL_SENTINEL}\n"));
        }
        let fixed: String = message
            .chars()
            .map(|c| if c == '\n' { '\r' } else { c })
            .collect();
        self.write_message(&format!("{fixed}\n"))
    }

    pub fn write_empty_message(&mut self) -> &mut Self {
        self.write_message("\n")
    }

    pub fn write_uint(&mut self, value: u32) -> &mut Self {
        self.write_message(&format!("{value}\n"))
    }

    pub fn write_int(&mut self, value: i64) -> &mut Self {
        self.write_message(&format!("{value}\n"))
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_message(if value { "true\n" } else { "false\n" })
    }

    pub fn write_float(&mut self, value: f32) -> &mut Self {
        self.write_message(&format!("{}\n", fmt_float(value as f64)))
    }

    pub fn write_double(&mut self, value: f64) -> &mut Self {
        self.write_message(&format!("{}\n", fmt_float(value)))
    }

    /// Flushes the frame. Returns false if any write in the frame failed.
    pub fn flush_messages(&mut self) -> bool {
        if self.guard.flush().is_err() {
            self.ok = false;
        }
        let ok = self.ok;
        if !ok {
            warn!("ui pipe write failed");
        }
        self.ok = true;
        ok
    }
}

/// Six-decimal fixed formatting with a guaranteed `.` separator.
pub fn fmt_float(value: f64) -> String {
    format!("{value:.6}")
}

/// Parses a typed value line coming back from the UI.
pub fn parse_opt_str(line: &str) -> Option<String> {
    if line == NULL_SENTINEL {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_messages_escape_newlines_and_empties() {
        let (reader, writer) = os_pipe_pair();
        let pipe = UiPipe::new(reader, writer);
        pipe.writer()
            .write_and_fix_message("two\nlines")
            .write_and_fix_message("")
            .flush_messages();
        // The pipe loops back to our own reader thread.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pipe.try_recv_line().unwrap(), "two\rlines");
        assert_eq!(pipe.try_recv_line().unwrap(), NULL_SENTINEL);
    }

    #[test]
    fn float_formatting_is_locale_stable() {
        assert_eq!(fmt_float(0.5), "0.500000");
        assert_eq!(fmt_float(-1.25), "-1.250000");
    }

    #[test]
    fn null_sentinel_parses_to_none() {
        assert_eq!(parse_opt_str("(null)"), None);
        assert_eq!(parse_opt_str("x"), Some(String::from("x")));
    }

    /// Loop-back pair: what the test writes through the pipe's writer half
    /// arrives on its reader half.
    fn os_pipe_pair() -> (impl std::io::Read + Send, impl Write + Send) {
        use std::io::{Read, Write};
        use std::sync::mpsc;

        struct TxWriter(mpsc::Sender<Vec<u8>>);
        impl Write for TxWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                let _ = self.0.send(buf.to_vec());
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        struct RxReader {
            rx: mpsc::Receiver<Vec<u8>>,
            pending: Vec<u8>,
        }
        impl Read for RxReader {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pending.is_empty() {
                    match self.rx.recv() {
                        Ok(data) => self.pending = data,
                        Err(_) => return Ok(0),
                    }
                }
                let take = buf.len().min(self.pending.len());
                buf[..take].copy_from_slice(&self.pending[..take]);
                self.pending.drain(..take);
                Ok(take)
            }
        }

        let (tx, rx) = mpsc::channel();
        (
            RxReader {
                rx,
                pending: Vec::new(),
            },
            TxWriter(tx),
        )
    }
}
