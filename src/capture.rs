//! Microphone capture pipeline
//!
//! Pulls raw PCM from a [`CaptureSource`], re-frames it to a fixed frame size
//! for low latency, and forwards each frame to the transport as realtime
//! input. Frames that arrive while the session is muted or disconnected are
//! dropped, not queued. Device errors during capture are reported to the
//! session over an error channel instead of dying silently.

use crate::pcm;
use crate::protocol::ClientMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default frame size: 1600 samples = 100ms at 16 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 1600;

/// Error type for capture operations
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("no capture device available")]
    NoDevice,

    #[error("capture device error: {0}")]
    Device(String),
}

/// A source of raw microphone samples (16 kHz mono signed 16-bit).
#[async_trait]
pub trait CaptureSource: Send + 'static {
    /// Acquire the device. May be denied by the platform.
    async fn open(&mut self) -> Result<(), CaptureError>;

    /// The next batch of raw samples, in capture order. `None` once the
    /// device is closed or exhausted.
    async fn next_samples(&mut self) -> Option<Result<Vec<i16>, CaptureError>>;
}

/// Flags shared between the session and the capture pipeline, consulted per
/// frame before forwarding.
#[derive(Debug, Default)]
pub struct SessionFlags {
    pub muted: AtomicBool,
    pub connected: AtomicBool,
}

impl SessionFlags {
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Running capture pipeline; stop it explicitly or drop it.
pub struct CapturePipeline {
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Open the source and start forwarding frames. Fails up front if the
    /// device cannot be acquired (e.g. permission denied), which halts the
    /// session's connect.
    pub async fn start(
        mut source: impl CaptureSource,
        flags: Arc<SessionFlags>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        error_tx: mpsc::Sender<CaptureError>,
        frame_samples: usize,
    ) -> Result<Self, CaptureError> {
        source.open().await?;
        info!("microphone capture started ({} samples/frame)", frame_samples);

        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_task = stopped.clone();
        let task = tokio::spawn(async move {
            let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);
            while !stopped_task.load(Ordering::Relaxed) {
                match source.next_samples().await {
                    None => break,
                    Some(Err(e)) => {
                        warn!("capture device error: {}", e);
                        let _ = error_tx.send(e).await;
                        break;
                    }
                    Some(Ok(samples)) => {
                        pending.extend_from_slice(&samples);
                        while pending.len() >= frame_samples {
                            let frame: Vec<i16> = pending.drain(..frame_samples).collect();
                            if !flags.is_connected() || flags.is_muted() {
                                // Live audio while muted is discarded, never
                                // buffered for later.
                                continue;
                            }
                            let wire = pcm::encode_pcm16(&frame);
                            let msg = ClientMessage::realtime_audio(wire);
                            if outbound.send(msg).is_err() {
                                debug!("transport closed, stopping capture forwarding");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            stopped,
            task: Some(task),
        })
    }

    /// Release the device and stop forwarding. Safe to call when already
    /// stopped.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A source that produces silence at the capture cadence. Stands in for a
/// real microphone when none is available (demo binaries, servers).
pub struct SilenceSource {
    batch: usize,
    interval: Duration,
}

impl SilenceSource {
    pub fn new() -> Self {
        Self {
            batch: DEFAULT_FRAME_SAMPLES,
            interval: Duration::from_millis(100),
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for SilenceSource {
    async fn open(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn next_samples(&mut self) -> Option<Result<Vec<i16>, CaptureError>> {
        tokio::time::sleep(self.interval).await;
        Some(Ok(vec![0i16; self.batch]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    enum Step {
        Samples(Vec<i16>),
        Fail(CaptureError),
    }

    struct ScriptedSource {
        deny_open: bool,
        steps: VecDeque<Step>,
    }

    impl ScriptedSource {
        fn batches(batches: Vec<Vec<i16>>) -> Self {
            Self {
                deny_open: false,
                steps: batches.into_iter().map(Step::Samples).collect(),
            }
        }
    }

    #[async_trait]
    impl CaptureSource for ScriptedSource {
        async fn open(&mut self) -> Result<(), CaptureError> {
            if self.deny_open {
                Err(CaptureError::PermissionDenied("scripted".into()))
            } else {
                Ok(())
            }
        }

        async fn next_samples(&mut self) -> Option<Result<Vec<i16>, CaptureError>> {
            match self.steps.pop_front()? {
                Step::Samples(s) => Some(Ok(s)),
                Step::Fail(e) => Some(Err(e)),
            }
        }
    }

    fn connected_flags() -> Arc<SessionFlags> {
        let flags = Arc::new(SessionFlags::default());
        flags.connected.store(true, Ordering::Relaxed);
        flags
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_denied_device_halts_start() {
        let source = ScriptedSource {
            deny_open: true,
            steps: VecDeque::new(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let (err_tx, _err_rx) = mpsc::channel(4);
        let result =
            CapturePipeline::start(source, connected_flags(), tx, err_tx, DEFAULT_FRAME_SAMPLES).await;
        assert!(matches!(result, Err(CaptureError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_reframes_to_fixed_frame_size() {
        // 700-sample batches re-framed to 500-sample frames: 2100 in, 4 out.
        let source = ScriptedSource::batches(vec![vec![1i16; 700], vec![2; 700], vec![3; 700]]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (err_tx, _err_rx) = mpsc::channel(4);
        let mut pipeline = CapturePipeline::start(source, connected_flags(), tx, err_tx, 500)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 4);
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_muted_frames_are_dropped_not_queued() {
        let source = ScriptedSource::batches(vec![vec![1i16; 1600], vec![2; 1600]]);
        let flags = connected_flags();
        flags.muted.store(true, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (err_tx, _err_rx) = mpsc::channel(4);
        let mut pipeline =
            CapturePipeline::start(source, flags, tx, err_tx, DEFAULT_FRAME_SAMPLES)
                .await
                .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).await.is_empty(), "muted audio must be discarded");
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_device_error_reaches_the_session() {
        let mut source = ScriptedSource::batches(vec![vec![1i16; 1600]]);
        source.steps.push_back(Step::Fail(CaptureError::Device("stream died".into())));

        let (tx, _rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let _pipeline =
            CapturePipeline::start(source, connected_flags(), tx, err_tx, DEFAULT_FRAME_SAMPLES)
                .await
                .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, CaptureError::Device(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let source = ScriptedSource::batches(vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (err_tx, _err_rx) = mpsc::channel(4);
        let mut pipeline =
            CapturePipeline::start(source, connected_flags(), tx, err_tx, DEFAULT_FRAME_SAMPLES)
                .await
                .unwrap();
        pipeline.stop();
        pipeline.stop();
    }
}
