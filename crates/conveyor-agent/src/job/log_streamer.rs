use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conveyor_api::{ControlPlane, RetryPolicy, with_retries};
use conveyor_types::{ChunkBuffer, Job, LogChunk};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const QUEUE_DEPTH: usize = 16;
const UPLOAD_WORKERS: usize = 3;
/// Overall budget for one chunk, retries included.
const CHUNK_DEADLINE: Duration = Duration::from_secs(120);

/// Ordered, bounded, concurrent shipping of a job's output.
///
/// Chunks are cut on the producer side (so sequences and offsets are
/// assigned in stream order) and uploaded by a small worker pool. Uploads
/// may complete out of order on the wire; each chunk carries its own
/// sequence and offset, so nothing reorders. A chunk that exhausts its
/// retries is counted and abandoned rather than blocking later chunks.
pub struct LogStreamer {
    buffer: ChunkBuffer,
    queue: mpsc::Sender<LogChunk>,
    workers: JoinSet<()>,
    failed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl LogStreamer {
    pub fn start(api: Arc<dyn ControlPlane>, job: Job) -> Self {
        Self::with_options(api, job, UPLOAD_WORKERS, QUEUE_DEPTH)
    }

    pub fn with_options(
        api: Arc<dyn ControlPlane>,
        job: Job,
        workers: usize,
        queue_depth: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel::<LogChunk>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let failed = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let buffer = ChunkBuffer::new(job.chunks_max_size_bytes);

        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let api = api.clone();
            let job = job.clone();
            let rx = rx.clone();
            let failed = failed.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                loop {
                    let chunk = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(chunk) = chunk else { break };
                    let sequence = chunk.sequence;
                    let upload = with_retries(
                        "log chunk upload",
                        RetryPolicy::chunk_upload(),
                        &cancel,
                        |_| api.upload_chunk(&job, &chunk),
                    );
                    match tokio::time::timeout(CHUNK_DEADLINE, upload).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            warn!(%err, sequence, "log chunk abandoned");
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            warn!(sequence, "log chunk abandoned after deadline");
                        }
                    }
                }
            });
        }

        Self {
            buffer,
            queue,
            workers: set,
            failed,
            cancel,
        }
    }

    /// Append raw output bytes, queueing any chunks they complete.
    ///
    /// Blocks while the work queue is full; that pressure propagates back
    /// through the output pipe to the subprocess.
    pub async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        for chunk in self.buffer.append(bytes)? {
            self.enqueue(chunk).await;
        }
        Ok(())
    }

    /// Flush the tail, drain outstanding uploads up to the deadline, and
    /// report how many chunks were lost.
    pub async fn stop(self, deadline: Duration) -> u64 {
        let Self {
            mut buffer,
            queue,
            mut workers,
            failed,
            cancel,
        } = self;

        match buffer.flush() {
            Ok(Some(chunk)) => {
                if queue.send(chunk).await.is_err() {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(None) => {}
            Err(err) => {
                failed.fetch_add(1, Ordering::SeqCst);
                warn!(%err, "failed to seal trailing log chunk");
            }
        }
        drop(queue);

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("log uploads still outstanding at deadline, abandoning them");
            cancel.cancel();
            workers.abort_all();
        }
        failed.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, chunk: LogChunk) {
        if self.queue.send(chunk).await.is_err() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
