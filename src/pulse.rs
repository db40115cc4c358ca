//! PulseAudio capture backend (feature `pulse`)
//!
//! Records 16-bit little-endian PCM at 16 kHz mono from the default source
//! (or a named device) on a dedicated thread, feeding the capture pipeline's
//! sample channel. The device handle never leaves that thread.

use crate::capture::{CaptureError, CaptureSource};
use async_trait::async_trait;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// ~100ms of 16 kHz mono S16LE per read.
const READ_BYTES: usize = 3200;

/// Microphone source backed by PulseAudio's simple API.
pub struct PulseSource {
    app_name: String,
    device: Option<String>,
    rx: Option<mpsc::Receiver<Vec<i16>>>,
    stopped: Arc<AtomicBool>,
}

impl PulseSource {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            device: None,
            rx: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_device(app_name: &str, device: &str) -> Self {
        Self {
            device: Some(device.to_string()),
            ..Self::new(app_name)
        }
    }
}

fn open_error(e: libpulse_binding::error::PAErr) -> CaptureError {
    let msg = e.to_string();
    if msg.contains("Access denied") {
        CaptureError::PermissionDenied(msg)
    } else {
        CaptureError::Device(msg)
    }
}

#[async_trait]
impl CaptureSource for PulseSource {
    async fn open(&mut self) -> Result<(), CaptureError> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: 16_000,
        };
        let app_name = self.app_name.clone();
        let device = self.device.clone();
        let stopped = self.stopped.clone();

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (tx, rx) = mpsc::channel::<Vec<i16>>(32);

        std::thread::spawn(move || {
            #[allow(unused_mut)]
            let mut simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "record",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(open_error(e)));
                    return;
                }
            };

            info!("pulseaudio capture thread started");
            let mut buffer = [0u8; READ_BYTES];
            while !stopped.load(Ordering::Relaxed) {
                if let Err(e) = simple.read(&mut buffer) {
                    error!("pulseaudio read failed: {}", e);
                    break;
                }
                let samples: Vec<i16> = buffer
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                if tx.blocking_send(samples).is_err() {
                    break;
                }
            }
            info!("pulseaudio capture thread stopped");
        });

        ready_rx
            .await
            .map_err(|_| CaptureError::Device("capture thread died during open".to_string()))??;
        self.rx = Some(rx);
        Ok(())
    }

    async fn next_samples(&mut self) -> Option<Result<Vec<i16>, CaptureError>> {
        let rx = self.rx.as_mut()?;
        rx.recv().await.map(Ok)
    }
}

impl Drop for PulseSource {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
