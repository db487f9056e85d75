/// Output drains: one background task per subject stream.
///
/// Each drain reads its stream until end-of-stream (or a read error) and
/// hands every chunk to a channel whose receiving end is owned by the
/// `Drain` handle. Nothing is shared between the task and the caller, and
/// whatever arrived before a failed or timed-out join is still returned.
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 8 * 1024;

/// Handle to a running drain task.
pub struct Drain {
    name: &'static str,
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Captured text of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOutput {
    pub text: String,
    /// False if the drain had not reached end-of-stream when joined.
    pub complete: bool,
}

/// Start draining `stream` on a tokio task.
pub fn spawn_drain<R>(name: &'static str, mut stream: R) -> Drain
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, chunks) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!(stream = name, bytes = total, "drain reached end of stream");
                    break;
                }
                Ok(n) => {
                    total += n;
                    // Receiver gone means the caller gave up on this stream.
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(
                        stream = name,
                        bytes = total,
                        error = %e,
                        "drain stopped on read error"
                    );
                    break;
                }
            }
        }
        // `stream` is dropped here, releasing the pipe.
    });
    Drain { name, chunks, task }
}

impl Drain {
    /// Wait up to `timeout` for the drain to finish and collect its output.
    ///
    /// On timeout the task is aborted and the output gathered so far is
    /// returned with `complete = false`.
    pub async fn join(self, timeout: Duration) -> DrainOutput {
        let Drain {
            name,
            mut chunks,
            mut task,
        } = self;

        let complete = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(stream = name, error = %e, "drain task failed");
                false
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    stream = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "drain did not finish in time, returning partial output"
                );
                false
            }
        };

        let mut bytes = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            bytes.extend_from_slice(&chunk);
        }

        DrainOutput {
            // Decoded once at the end so a multi-byte character split across
            // chunks is not mangled.
            text: String::from_utf8_lossy(&bytes).into_owned(),
            complete,
        }
    }
}
