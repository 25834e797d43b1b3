//! Process-wide owner of the live voice session.
//!
//! The HTTP layer shares one [`LiveHub`]. It keeps at most one session,
//! builds its collaborators from the current configuration at connect time,
//! and exposes the session's monitor so status reads never wait on a
//! connect or disconnect in progress.

use crate::audio::capture::{CaptureDevice, NoCapture, WavFileCapture};
use crate::audio::output::{ClockOutputFactory, OutputFactory};
use crate::config::AppConfig;
use crate::live::error::LiveResult;
use crate::live::session::{LiveDeps, LiveSession, LiveSettings, SessionMonitor, SessionStatus};
use crate::live::transport::GeminiLiveConnector;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

impl LiveSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let live = &config.live;
        let instruction = live.system_instruction.trim();
        Self {
            model: config.models.live.clone(),
            system_instruction: (!instruction.is_empty()).then(|| instruction.to_string()),
            transcribe_input: live.transcribe_input,
            input_sample_rate: live.input_sample_rate,
            output_sample_rate: live.output_sample_rate,
            frame_size: live.frame_size,
            outbound_queue_capacity: live.outbound_queue_capacity,
            max_reorder_pending: live.max_reorder_pending,
            connect_timeout: live.connect_timeout(),
        }
    }
}

fn capture_from_config(config: &AppConfig) -> Arc<dyn CaptureDevice> {
    let live = &config.live;
    match live.capture.as_str() {
        "wav" => match live.capture_path() {
            Some(path) => Arc::new(WavFileCapture::new(path, live.loop_capture)),
            None => Arc::new(NoCapture),
        },
        #[cfg(feature = "device")]
        "device" => Arc::new(crate::audio::device::DeviceCapture),
        #[cfg(not(feature = "device"))]
        "device" => {
            warn!("Built without the `device` feature; microphone capture is unavailable");
            Arc::new(NoCapture)
        }
        _ => Arc::new(NoCapture),
    }
}

fn output_from_config(config: &AppConfig) -> Arc<dyn OutputFactory> {
    let clock = || ClockOutputFactory {
        record_path: config.live.record_path(),
    };
    match config.live.output.as_str() {
        #[cfg(feature = "device")]
        "device" => Arc::new(crate::audio::device::DeviceOutputFactory),
        #[cfg(not(feature = "device"))]
        "device" => {
            warn!("Built without the `device` feature; using the headless clock output");
            Arc::new(clock())
        }
        _ => Arc::new(clock()),
    }
}

impl LiveDeps {
    /// Collaborators for a real session, as configured.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connector: Arc::new(GeminiLiveConnector::new(
                config.gemini.live_url.clone(),
                config.gemini.api_key.clone(),
                config.live.outbound_queue_capacity,
            )),
            capture: capture_from_config(config),
            output: output_from_config(config),
        }
    }
}

/// Holds the one live session of this process.
pub struct LiveHub {
    session: Mutex<Option<LiveSession>>,
    monitor: SessionMonitor,
    /// Cancels the handshake in progress; `disconnect` fires it without
    /// waiting for the session lock
    dialing: std::sync::Mutex<Option<Arc<Notify>>>,
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveHub {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            monitor: SessionMonitor::new(),
            dialing: std::sync::Mutex::new(None),
        }
    }

    fn dialing(&self) -> std::sync::MutexGuard<'_, Option<Arc<Notify>>> {
        self.dialing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    pub fn status(&self) -> SessionStatus {
        self.monitor.snapshot()
    }

    /// Open a session unless one is already open.
    ///
    /// A session that closed on its own is torn down before the new one dials.
    pub async fn connect(&self, deps: LiveDeps, settings: &LiveSettings) -> LiveResult<SessionStatus> {
        let mut current = self.session.lock().await;
        if current.as_ref().is_some_and(LiveSession::is_active) {
            return Ok(self.monitor.snapshot());
        }

        if let Some(mut previous) = current.take() {
            previous.disconnect().await;
        }

        let cancel = Arc::new(Notify::new());
        *self.dialing() = Some(Arc::clone(&cancel));

        let mut session = LiveSession::new(deps, self.monitor.clone());
        let connected = session
            .connect(settings, async move { cancel.notified().await })
            .await;
        self.dialing().take();
        connected?;

        *current = Some(session);
        Ok(self.monitor.snapshot())
    }

    /// Close the session if there is one. Always succeeds, and a handshake
    /// still in progress is abandoned rather than waited out.
    pub async fn disconnect(&self) -> SessionStatus {
        if let Some(cancel) = self.dialing().take() {
            debug!("Cancelling live session handshake");
            // Stores a permit if the handshake has not started waiting yet
            cancel.notify_one();
        }

        if let Some(session) = self.session.lock().await.as_mut() {
            session.disconnect().await;
        }
        self.monitor.snapshot()
    }
}
