//! Line-by-line draining of a controlled process's output streams.
use std::{
    fmt,
    io::{BufRead, BufReader, ErrorKind, Read},
    sync::Arc,
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::command::ProcessTag;

/// Receives drained lines. Called from the drain worker's own thread, in order.
pub trait OutputSink: Send + Sync {
    /// One line read from the process's standard output, without the terminator.
    fn report_output(&self, line: &str);

    /// One line read from the process's standard error, without the terminator.
    fn report_error(&self, line: &str);
}

/// Which standard stream a drain worker reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads `reader` line by line until end-of-stream or a read error, forwarding
/// every line to `sink`. Returns the number of lines forwarded.
///
/// A line ends at `\n`, `\r` or `\r\n`, so carriage-return progress output
/// arrives as separate lines. The reader is consumed, so it is released on
/// every exit path.
pub fn drain_lines<R: Read>(reader: R, kind: StreamKind, sink: &dyn OutputSink) -> usize {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut after_cr = false;
    let mut forwarded = 0;

    let forward = |line: &[u8]| {
        // Output is opaque; undecodable bytes must not end the drain.
        let line = String::from_utf8_lossy(line);
        match kind {
            StreamKind::Stdout => sink.report_output(&line),
            StreamKind::Stderr => sink.report_error(&line),
        }
    };

    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => {
                if !line.is_empty() {
                    forward(&line);
                    forwarded += 1;
                }
                debug!("{kind} reached end of stream after {forwarded} lines");
                break;
            }
            Ok(chunk) => chunk,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("Failed to read process {kind}: {err}");
                break;
            }
        };

        for &byte in chunk {
            match byte {
                b'\n' if after_cr => after_cr = false,
                b'\n' | b'\r' => {
                    after_cr = byte == b'\r';
                    forward(&line);
                    forwarded += 1;
                    line.clear();
                }
                _ => {
                    after_cr = false;
                    line.push(byte);
                }
            }
        }
        let consumed = chunk.len();
        reader.consume(consumed);
    }

    forwarded
}

/// Starts a dedicated worker thread draining `reader` into `sink`.
///
/// Workers are never restarted: once the stream closes or errors the thread
/// exits and the join handle yields the number of lines forwarded.
pub fn spawn_drain<R>(
    tag: &ProcessTag,
    kind: StreamKind,
    reader: R,
    sink: Arc<dyn OutputSink>,
) -> std::io::Result<JoinHandle<usize>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{tag}-{kind}-drain"))
        .spawn(move || drain_lines(reader, kind, sink.as_ref()))
}

/// Forwards drained lines to `tracing`, stdout at info and stderr at warn.
#[derive(Debug, Clone)]
pub struct TracingSink {
    tag: ProcessTag,
}

impl TracingSink {
    pub fn new(tag: ProcessTag) -> Self {
        Self { tag }
    }
}

impl OutputSink for TracingSink {
    fn report_output(&self, line: &str) {
        info!("[{}] {line}", self.tag);
    }

    fn report_error(&self, line: &str) {
        warn!("[{}] {line}", self.tag);
    }
}
