//! # Capture Pipeline
//!
//! Turns a live input stream into outbound Encoded Packets for the session.
//!
//! ## Data Flow:
//! ```text
//! CaptureDevice::open ──► CaptureStream (Vec<f32> frames)
//!                              │
//!                              ▼
//!            CapturePipeline: encode_frame → base64 → EncodedPacket
//!                              │
//!                              ▼
//!          bounded mpsc::Sender<EncodedPacket> (awaits when full)
//! ```
//!
//! ## Sources:
//! - [`NoCapture`]: always denies access
//! - [`WavFileCapture`]: streams a WAV file in real time, optionally looping
//! - `DeviceCapture` (feature `device`): the default microphone via cpal

use crate::audio::codec;
use crate::live::error::{LiveError, LiveResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// What the session asks of the input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    /// Requested sample rate (16kHz for the realtime voice service)
    pub sample_rate: u32,

    /// Samples per emitted frame
    pub frame_size: usize,
}

/// MIME descriptor for raw PCM16 at `sample_rate`.
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// One captured frame, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub sequence: u64,
    pub mime_type: String,
    /// Base64 of PCM16LE samples
    pub data: String,
}

impl EncodedPacket {
    pub fn from_frame(sequence: u64, sample_rate: u32, samples: &[f32]) -> Self {
        Self {
            sequence,
            mime_type: pcm_mime(sample_rate),
            data: codec::encode_base64_pcm(samples),
        }
    }
}

/// Aborts a background task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Mono frames from an open input.
///
/// Whatever keeps the input alive travels with the stream as `guard`, so
/// dropping the stream tears the input down.
pub struct CaptureStream {
    frames: mpsc::Receiver<Vec<f32>>,
    _guard: Option<Box<dyn Send>>,
}

impl CaptureStream {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self { frames, _guard: None }
    }

    pub fn with_guard(frames: mpsc::Receiver<Vec<f32>>, guard: Box<dyn Send>) -> Self {
        Self {
            frames,
            _guard: Some(guard),
        }
    }

    /// Next frame, or `None` once the input has ended.
    pub async fn recv(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }

    /// Drop every frame already queued and return how many there were.
    ///
    /// Inputs start producing as soon as they open; the session calls this
    /// once the channel is up so audio from the handshake is never sent.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.frames.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Something that can be opened as a microphone.
pub trait CaptureDevice: Send + Sync {
    /// Open the input. Failure to get access is a `Permission` error.
    fn open(&self, spec: &CaptureSpec) -> LiveResult<CaptureStream>;

    /// Short label for logs and status output.
    fn describe(&self) -> String;
}

/// Capture source with no input available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl CaptureDevice for NoCapture {
    fn open(&self, _spec: &CaptureSpec) -> LiveResult<CaptureStream> {
        Err(LiveError::Permission("no capture device is configured".to_string()))
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Streams the samples of a WAV file as if they came from a microphone.
#[derive(Debug, Clone)]
pub struct WavFileCapture {
    pub path: PathBuf,
    pub looped: bool,
}

impl WavFileCapture {
    pub fn new(path: impl Into<PathBuf>, looped: bool) -> Self {
        Self {
            path: path.into(),
            looped,
        }
    }

    /// Load the file as mono f32 samples at its native rate.
    fn load(&self) -> LiveResult<(u32, Vec<f32>)> {
        let denied = |reason: String| {
            LiveError::Permission(format!("cannot capture from {}: {}", self.path.display(), reason))
        };

        let mut file = std::fs::File::open(&self.path).map_err(|e| denied(e.to_string()))?;
        let (header, data) = wav::read(&mut file).map_err(|e| denied(e.to_string()))?;

        let interleaved: Vec<f32> = match data {
            wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
            wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / codec::PCM16_SCALE).collect(),
            wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
            wav::BitDepth::ThirtyTwoFloat(samples) => samples,
            _ => return Err(denied("file contains no audio".to_string())),
        };

        let channels = header.channel_count.max(1) as usize;
        let mono: Vec<f32> = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        if mono.is_empty() {
            return Err(denied("file contains no audio".to_string()));
        }
        Ok((header.sampling_rate, mono))
    }
}

impl CaptureDevice for WavFileCapture {
    fn open(&self, spec: &CaptureSpec) -> LiveResult<CaptureStream> {
        let (rate, samples) = self.load()?;
        if rate != spec.sample_rate {
            return Err(LiveError::Permission(format!(
                "{} is {}Hz but capture needs {}Hz",
                self.path.display(),
                rate,
                spec.sample_rate
            )));
        }

        let frame_size = spec.frame_size.max(1);
        let period = Duration::from_secs_f64(frame_size as f64 / rate as f64);
        let looped = self.looped;
        let (tx, rx) = mpsc::channel(4);

        info!(
            "Capturing from {} ({:.1}s, looped: {})",
            self.path.display(),
            samples.len() as f64 / rate as f64,
            looped
        );

        // Paced like a microphone: a frame nobody is ready for is lost, and a
        // late tick never makes up for the ones it missed
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                for frame in samples.chunks(frame_size) {
                    ticker.tick().await;
                    match tx.try_send(frame.to_vec()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("Capture queue full; dropping a frame"),
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
                if !looped {
                    debug!("Capture file exhausted");
                    return;
                }
            }
        });

        Ok(CaptureStream::with_guard(rx, Box::new(AbortOnDrop(task))))
    }

    fn describe(&self) -> String {
        format!("wav:{}", self.path.display())
    }
}

/// Background task encoding captured frames onto the outbound queue.
pub struct CapturePipeline {
    task: Option<JoinHandle<u64>>,
}

impl CapturePipeline {
    /// Start encoding `stream` into `outbound`.
    ///
    /// The task ends when the input ends, when the receiving side of
    /// `outbound` closes, or on `stop()`. A full queue suspends capture until
    /// the session catches up.
    pub fn spawn(mut stream: CaptureStream, sample_rate: u32, outbound: mpsc::Sender<EncodedPacket>) -> Self {
        let task = tokio::spawn(async move {
            let mut sequence = 0u64;
            while let Some(frame) = stream.recv().await {
                if frame.is_empty() {
                    continue;
                }
                let packet = EncodedPacket::from_frame(sequence, sample_rate, &frame);
                if outbound.send(packet).await.is_err() {
                    debug!("Outbound queue closed; stopping capture");
                    break;
                }
                sequence += 1;
            }
            sequence
        });

        Self { task: Some(task) }
    }

    /// Stop capturing. Aborting the task drops the stream and its input.
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Wait for the pipeline to end on its own and return how many packets it sent.
    #[cfg(test)]
    pub async fn join(mut self) -> u64 {
        let Some(task) = self.task.take() else {
            return 0;
        };
        match task.await {
            Ok(sent) => sent,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::warn!("Capture pipeline failed: {}", e);
                }
                0
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Capture device that replays fixed frames and counts opens.
    ///
    /// `stale` frames are already queued when `open` returns, as if recorded
    /// while the session was still dialing; `frames` then repeat every 10ms.
    /// `open_delay` blocks the opening thread, like a slow audio driver.
    #[derive(Default)]
    pub(crate) struct ScriptedCapture {
        pub frames: Vec<Vec<f32>>,
        pub stale: Vec<Vec<f32>>,
        pub open_delay: Duration,
        pub opened: Arc<AtomicUsize>,
    }

    impl CaptureDevice for ScriptedCapture {
        fn open(&self, _spec: &CaptureSpec) -> LiveResult<CaptureStream> {
            std::thread::sleep(self.open_delay);
            self.opened.fetch_add(1, Ordering::SeqCst);

            let (tx, rx) = mpsc::channel(self.stale.len() + self.frames.len() + 1);
            for frame in &self.stale {
                let _ = tx.try_send(frame.clone());
            }
            let frames = self.frames.clone();
            let task = tokio::spawn(async move {
                if frames.is_empty() {
                    // Keep the input open for the lifetime of the stream
                    tx.closed().await;
                    return;
                }
                // Live input: the same frames again and again until the stream drops
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    for frame in &frames {
                        if tx.send(frame.clone()).await.is_err() {
                            return;
                        }
                    }
                }
            });
            Ok(CaptureStream::with_guard(rx, Box::new(AbortOnDrop(task))))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn write_wav(path: &std::path::Path, rate: u32, samples: Vec<i16>) {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, rate, 16);
        let mut file = std::fs::File::create(path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file).unwrap();
    }

    #[test]
    fn test_no_capture_is_permission_denied() {
        let spec = CaptureSpec {
            sample_rate: 16_000,
            frame_size: 4096,
        };
        assert!(matches!(NoCapture.open(&spec), Err(LiveError::Permission(_))));
    }

    #[tokio::test]
    async fn test_pipeline_encodes_frames_in_order() {
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        frame_tx.send(vec![0.5, -0.5]).await.unwrap();
        frame_tx.send(Vec::new()).await.unwrap();
        frame_tx.send(vec![0.25]).await.unwrap();
        drop(frame_tx);

        let pipeline = CapturePipeline::spawn(CaptureStream::new(frame_rx), 16_000, out_tx);
        assert_eq!(pipeline.join().await, 2);

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.mime_type, "audio/pcm;rate=16000");

        let decoded = codec::decode_base64_pcm(&first.data, 16_000, 1).unwrap();
        assert_eq!(decoded.channel(0), &[0.5, -0.5]);
    }

    #[tokio::test]
    async fn test_pipeline_stops_when_outbound_closes() {
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(1);
        drop(out_rx);

        frame_tx.send(vec![0.1]).await.unwrap();
        let pipeline = CapturePipeline::spawn(CaptureStream::new(frame_rx), 16_000, out_tx);
        assert_eq!(pipeline.join().await, 0);
    }

    #[tokio::test]
    async fn test_wav_capture_emits_paced_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, 16_000, vec![8192; 3_200]);

        let capture = WavFileCapture::new(&path, false);
        let spec = CaptureSpec {
            sample_rate: 16_000,
            frame_size: 1_600,
        };
        let mut stream = capture.open(&spec).unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.len(), 1_600);
        assert_eq!(first[0], 0.25);
        assert_eq!(stream.recv().await.unwrap().len(), 1_600);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_discard_pending_empties_the_queue() {
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let mut stream = CaptureStream::new(frame_rx);
        frame_tx.send(vec![0.1]).await.unwrap();
        frame_tx.send(vec![0.2]).await.unwrap();

        assert_eq!(stream.discard_pending(), 2);
        assert_eq!(stream.discard_pending(), 0);

        frame_tx.send(vec![0.3]).await.unwrap();
        assert_eq!(stream.recv().await, Some(vec![0.3]));
    }

    #[tokio::test]
    async fn test_wav_capture_keeps_real_time_pace_after_a_stall() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, 16_000, vec![8192; 16_000]);

        let spec = CaptureSpec {
            sample_rate: 16_000,
            frame_size: 1_600,
        };
        let mut stream = WavFileCapture::new(&path, false).open(&spec).unwrap();

        // Nobody reads for a while, then the backlog is thrown away
        tokio::time::sleep(Duration::from_millis(450)).await;
        stream.discard_pending();

        // Frames keep coming one per 100ms instead of catching up in a burst
        stream.recv().await.unwrap();
        let started = std::time::Instant::now();
        stream.recv().await.unwrap();
        stream.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(180), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_wav_capture_rejects_wrong_rate_or_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, 44_100, vec![0; 100]);

        let spec = CaptureSpec {
            sample_rate: 16_000,
            frame_size: 1_600,
        };
        assert!(matches!(
            WavFileCapture::new(&path, false).open(&spec),
            Err(LiveError::Permission(_))
        ));
        assert!(matches!(
            WavFileCapture::new(dir.path().join("missing.wav"), false).open(&spec),
            Err(LiveError::Permission(_))
        ));
    }
}
