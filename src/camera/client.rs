use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CameraConfig;
use crate::error::FrameError;

use super::scanner::{FrameScanner, ScannerStats};
use super::{Frame, FrameValidation};

/// One open HTTP connection to the camera, scanned for frames.
pub struct CameraStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    scanner: FrameScanner,
    read_timeout: Duration,
}

impl CameraStream {
    /// Issue the streaming GET. Fails if the endpoint cannot be reached or
    /// does not answer within `read_timeout`.
    pub async fn open(
        client: &reqwest::Client,
        url: &str,
        read_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, FrameError> {
        let response = tokio::time::timeout(read_timeout, client.get(url).send())
            .await
            .map_err(|_| FrameError::stream_open(url, format!("no response within {read_timeout:?}")))?
            .map_err(|e| FrameError::stream_open(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FrameError::stream_open(url, format!("HTTP {status}")));
        }

        Ok(Self {
            body: response.bytes_stream().boxed(),
            scanner: FrameScanner::new(max_frame_bytes),
            read_timeout,
        })
    }

    /// Frames found and bytes thrown away on this connection so far.
    pub fn stats(&self) -> ScannerStats {
        self.scanner.stats()
    }

    /// Read until the next complete frame. Any error means this connection
    /// is finished.
    pub async fn next_frame(&mut self) -> Result<Bytes, FrameError> {
        loop {
            if let Some(frame) = self.scanner.next_frame() {
                return Ok(frame);
            }
            match tokio::time::timeout(self.read_timeout, self.body.next()).await {
                Err(_) => {
                    return Err(FrameError::StreamRead(format!(
                        "no data within {:?}",
                        self.read_timeout
                    )));
                }
                Ok(None) => return Err(FrameError::StreamRead("stream ended".into())),
                Ok(Some(Err(e))) => return Err(FrameError::StreamRead(e.to_string())),
                Ok(Some(Ok(chunk))) => self.scanner.push(&chunk),
            }
        }
    }
}

/// Pull side of the extractor. Holds at most the configured number of
/// frames; when the consumer falls behind, the oldest frames are dropped.
pub struct FrameReceiver {
    rx: broadcast::Receiver<Frame>,
    cancel: CancellationToken,
    dropped: u64,
}

impl FrameReceiver {
    /// Wait for the next frame. `None` once the extractor has stopped.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                r = self.rx.recv() => r,
            };
            match received {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(n)) => self.note_dropped(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant for consumers outside the async runtime. Must not
    /// be called from within an async context.
    pub fn next_frame_blocking(&mut self) -> Option<Frame> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.blocking_recv() {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(n)) => self.note_dropped(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll; `None` when nothing is ready.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(TryRecvError::Lagged(n)) => self.note_dropped(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Frames this receiver lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_dropped(&mut self, n: u64) {
        self.dropped += n;
        debug!("Consumer behind, dropped {} stale frame(s)", n);
    }
}

/// Keeps a camera stream open in the background, reconnecting forever
/// until stopped, and hands out complete frames.
pub struct FrameExtractor {
    receiver: FrameReceiver,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl FrameExtractor {
    /// Start the read loop on its own task. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(config: CameraConfig) -> Result<Self, FrameError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.read_timeout)
            .build()
            .map_err(|e| FrameError::stream_open(&config.url, format!("build client failed: {e}")))?;

        let (tx, rx) = broadcast::channel(config.queue_depth.max(1));
        let cancel = CancellationToken::new();
        let worker = ExtractorWorker {
            client,
            config,
            frames: tx,
            cancel: cancel.clone(),
        };

        Ok(Self {
            receiver: FrameReceiver {
                rx,
                cancel: cancel.clone(),
                dropped: 0,
            },
            cancel,
            worker: Some(tokio::spawn(worker.run())),
        })
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.receiver.next_frame().await
    }

    /// Another independent consumer of the same frames.
    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.receiver.rx.resubscribe(),
            cancel: self.cancel.clone(),
            dropped: 0,
        }
    }

    pub fn receiver(&mut self) -> &mut FrameReceiver {
        &mut self.receiver
    }

    /// Abandon any in-flight read, close the connection and wait for the
    /// worker to exit. No reconnect happens afterwards.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Frame extractor worker ended abnormally: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for FrameExtractor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ExtractorWorker {
    client: reqwest::Client,
    config: CameraConfig,
    frames: broadcast::Sender<Frame>,
    cancel: CancellationToken,
}

impl ExtractorWorker {
    async fn run(self) {
        let mut sequence = 0u64;

        loop {
            info!("Opening camera stream {}", self.config.url);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.run_session(&mut sequence) => {
                    if let Err(e) = res {
                        warn!(
                            "Camera stream {}: {}. Reopening in {:?}",
                            self.config.url, e, self.config.retry_delay
                        );
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        info!("Camera stream {} stopped", self.config.url);
    }

    /// One connection's lifetime. Only ever returns with the error that
    /// ended it; the scanner buffer goes away with the connection.
    async fn run_session(&self, sequence: &mut u64) -> Result<(), FrameError> {
        let mut stream = CameraStream::open(
            &self.client,
            &self.config.url,
            self.config.read_timeout,
            self.config.max_frame_bytes,
        )
        .await?;
        info!("Camera stream {} open", self.config.url);

        loop {
            let data = match stream.next_frame().await {
                Ok(data) => data,
                Err(e) => {
                    let stats = stream.stats();
                    info!(
                        "Camera stream {} closing after {} frames ({} oversized, {} bytes discarded)",
                        self.config.url, stats.frames, stats.oversized, stats.discarded_bytes
                    );
                    return Err(e);
                }
            };
            *sequence += 1;

            match validate(self.config.validation, *sequence, data.clone()).await {
                Ok(dimensions) => {
                    let frame = Frame {
                        sequence: *sequence,
                        data,
                        dimensions,
                    };
                    // No receivers is fine; frames are not retained.
                    let _ = self.frames.send(frame);
                }
                Err(e) => warn!("Skipping frame: {}", e),
            }
        }
    }
}

async fn validate(
    mode: FrameValidation,
    sequence: u64,
    data: Bytes,
) -> Result<Option<(u32, u32)>, FrameError> {
    match mode {
        FrameValidation::Decode => {
            tokio::task::spawn_blocking(move || mode.check(sequence, &data))
                .await
                .map_err(|e| FrameError::FrameDecode {
                    sequence,
                    reason: format!("decode task failed: {e}"),
                })?
        }
        _ => mode.check(sequence, &data),
    }
}
