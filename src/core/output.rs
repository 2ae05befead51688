use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};

/// How long to wait for a pipe to close once its writers are gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Collects at most `cap` bytes of a stream while draining all of it, so a
/// chatty program never blocks on a full pipe.
pub struct CappedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl CappedOutput {
    pub fn spawn<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    let n = match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let Ok(mut buf) = buf.lock() else { break };
                    let room = cap.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            })
        });

        Self { buf, task }
    }

    /// Waits for the stream to end and returns what was kept, decoded
    /// lossily.
    pub async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!("Output pipe still open after the program finished");
                task.abort();
            }
        }
        let bytes = match self.buf.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
