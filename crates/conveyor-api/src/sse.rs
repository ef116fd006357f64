use std::time::Duration;

use conveyor_types::PingEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One decoded message from the push stream.
///
/// The optional endpoint override rides alongside the event so the
/// connection manager can apply it without the coordinator caring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: PingEvent,
    pub endpoint: Option<String>,
}

impl StreamFrame {
    pub fn event(event: PingEvent) -> Self {
        Self {
            event,
            endpoint: None,
        }
    }
}

/// Incremental parser for the SSE line protocol.
///
/// Feeds arbitrary byte slices (chunk boundaries may fall anywhere,
/// including inside a UTF-8 sequence) and yields the `data` payload of
/// each completed event. `event:`/`id:`/`retry:` fields and comment lines
/// are ignored; multi-line data is joined with newlines per the protocol.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    data: String,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    let mut payload = std::mem::take(&mut self.data);
                    payload.pop();
                    payloads.push(payload);
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push_str(value.strip_prefix(' ').unwrap_or(value));
                self.data.push('\n');
            }
            // comments and other fields fall through
        }
        payloads
    }
}

/// A live push-stream connection handing out [`StreamFrame`]s.
///
/// `next` returning `None` means the server closed the stream; the caller
/// decides whether to reconnect. `close` releases the background receive
/// task: it signals cancellation, waits up to a second for the task to
/// notice, then aborts it so shutdown never blocks on a stuck read.
#[derive(Debug)]
pub struct PingStreamConn {
    frames: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PingStreamConn {
    pub(crate) fn spawned(
        frames: mpsc::Receiver<StreamFrame>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            frames,
            cancel,
            task: Some(task),
        }
    }

    /// A connection fed by hand. Useful for doubles in tests.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                frames: rx,
                cancel: CancellationToken::new(),
                task: None,
            },
        )
    }

    /// The next frame, or `None` once the server has closed the stream.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    /// Tear the connection down without leaking the receive task.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

impl Drop for PingStreamConn {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
