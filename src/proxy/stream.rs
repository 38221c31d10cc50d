//! Periodic client flushing while a response body is relayed.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::server::ResponseWriter;

/// How often buffered body bytes are pushed to the client.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// A background task that flushes one client connection on a fixed
/// interval, scoped to the lifetime of one streamed response.
///
/// Call [`stop`](Self::stop) once the body copy finishes. Dropping the
/// handle without stopping it cancels the task as well.
pub struct PeriodicFlush {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PeriodicFlush {
    pub fn start(writer: ResponseWriter, every: Duration) -> Self {
        let (cancel, mut cancelled) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    _ = ticker.tick() => {
                        if let Err(e) = writer.flush().await {
                            debug!(error = %e, "periodic flush failed, stopping");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            cancel: Some(cancel),
            task: Some(task),
        }
    }

    /// Signals the task to stop and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PeriodicFlush {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, ResponseHead, StatusCode};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn body_reaches_client_before_the_response_finishes() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let writer = ResponseWriter::new(Box::new(server), Duration::from_secs(1));
        writer.prepare(true, 1).await;
        let head = ResponseHead::new(StatusCode::OK, Headers::new());
        writer.send_head(&head, false).await.unwrap();

        let flusher = PeriodicFlush::start(writer.clone(), FLUSH_INTERVAL);
        writer.write_body(b"partial").await.unwrap();

        let mut buf = vec![0; 1024];
        let mut seen = String::new();
        while !seen.contains("partial") {
            let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
                .await
                .expect("flush should deliver buffered bytes")
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        flusher.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_the_task() {
        let (_client, server) = tokio::io::duplex(1024);
        let writer = ResponseWriter::new(Box::new(server), Duration::from_secs(1));
        let flusher = PeriodicFlush::start(writer, Duration::from_millis(1));
        tokio::time::timeout(Duration::from_secs(1), flusher.stop())
            .await
            .expect("stop should return promptly");
    }
}
