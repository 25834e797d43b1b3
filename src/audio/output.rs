//! # Audio Outputs
//!
//! The playback scheduler never talks to a sound card directly. It drives an
//! [`AudioOutput`], which provides three capabilities:
//!
//! 1. **A clock**: `current_time()` in seconds on the output timeline
//! 2. **Start/stop**: begin a buffer at an absolute time, or cut it short
//! 3. **Completion notifications**: the id of every buffer that finishes
//!    naturally is posted on a [`CompletionSender`]
//!
//! ## Implementations:
//! - [`VirtualOutput`]: manually advanced clock, used for tests and simulations
//! - [`ClockOutput`]: wall-clock timing for headless hosts, optionally rendering
//!   what was played into a WAV file
//! - `DeviceOutput` (feature `device`): a real speaker via cpal

use crate::audio::buffer::AudioBuffer;
use crate::audio::codec;
use crate::live::error::LiveResult;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle of one scheduled playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Where outputs report buffers that finished playing on their own.
pub type CompletionSender = mpsc::UnboundedSender<SourceId>;

/// Receiving end of [`CompletionSender`], owned by the session driver.
pub type CompletionReceiver = mpsc::UnboundedReceiver<SourceId>;

/// Platform playback capability used by the scheduler.
pub trait AudioOutput: Send {
    /// Current time on the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Start playing `buffer` at absolute output time `when`.
    fn start(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64);

    /// Stop a buffer immediately. Unknown or finished ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the output. Called once when the session tears down.
    fn close(&mut self) {}
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn start(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64) {
        (**self).start(id, buffer, when)
    }

    fn stop(&mut self, id: SourceId) {
        (**self).stop(id)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Opens an output for a session.
///
/// ## Thread Safety:
/// Factories are shared between HTTP workers (`Arc<dyn OutputFactory>`), so
/// they must be `Send + Sync`; the outputs they create only need `Send`.
pub trait OutputFactory: Send + Sync {
    fn open(&self, sample_rate: u32, completions: CompletionSender) -> LiveResult<Box<dyn AudioOutput>>;
}

/// Mono rendering of everything that was audible on a [`ClockOutput`].
///
/// Buffers are mixed in at their start offset; a stop removes the part of the
/// buffer that would have played after the stop time. No resampling is done:
/// buffers are assumed to share the recorder's sample rate.
#[derive(Debug)]
pub struct TimelineRecorder {
    path: PathBuf,
    sample_rate: u32,
    samples: Vec<f32>,
    placed: HashMap<SourceId, (usize, Arc<AudioBuffer>)>,
}

impl TimelineRecorder {
    pub fn new(path: PathBuf, sample_rate: u32) -> Self {
        Self {
            path,
            sample_rate,
            samples: Vec::new(),
            placed: HashMap::new(),
        }
    }

    fn frame_at(&self, time: f64) -> usize {
        (time.max(0.0) * self.sample_rate as f64).round() as usize
    }

    pub fn place(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64, now: f64) {
        if buffer.sample_rate() != self.sample_rate {
            warn!(
                "Recording {}Hz buffer on a {}Hz timeline without resampling",
                buffer.sample_rate(),
                self.sample_rate
            );
        }

        // Forget placements that can no longer be cut
        let now_frame = self.frame_at(now);
        self.placed
            .retain(|_, (offset, placed)| *offset + placed.frame_count() > now_frame);

        let offset = self.frame_at(when);
        let end = offset + buffer.frame_count();
        if self.samples.len() < end {
            self.samples.resize(end, 0.0);
        }
        for frame in 0..buffer.frame_count() {
            self.samples[offset + frame] += buffer.mono_sample(frame);
        }
        self.placed.insert(id, (offset, buffer));
    }

    pub fn cut(&mut self, id: SourceId, at: f64) {
        let Some((offset, buffer)) = self.placed.remove(&id) else {
            return;
        };
        let from = self.frame_at(at).max(offset);
        let end = offset + buffer.frame_count();
        for frame in from..end.min(self.samples.len()) {
            self.samples[frame] -= buffer.mono_sample(frame - offset);
        }
    }

    /// Duration of the rendered timeline, in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Write the timeline as a 16-bit mono WAV file.
    pub fn write(&self) -> Result<()> {
        let mut file = std::fs::File::create(&self.path)
            .with_context(|| format!("creating recording {}", self.path.display()))?;
        codec::write_wav(&self.samples, self.sample_rate, 1, &mut file)
            .with_context(|| format!("writing recording {}", self.path.display()))?;
        Ok(())
    }
}

/// Headless output timed by the tokio clock.
///
/// Nothing reaches a speaker; each started buffer arms a timer that reports
/// completion when the buffer would have ended.
pub struct ClockOutput {
    origin: tokio::time::Instant,
    completions: CompletionSender,
    timers: HashMap<SourceId, JoinHandle<()>>,
    recorder: Option<TimelineRecorder>,
}

impl ClockOutput {
    pub fn new(completions: CompletionSender) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            completions,
            timers: HashMap::new(),
            recorder: None,
        }
    }

    /// Render played audio into `path` when the output closes.
    pub fn with_recording(mut self, path: PathBuf, sample_rate: u32) -> Self {
        self.recorder = Some(TimelineRecorder::new(path, sample_rate));
        self
    }
}

impl AudioOutput for ClockOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64) {
        let now = self.current_time();
        let remaining = (when + buffer.duration_seconds() - now).max(0.0);

        self.timers.retain(|_, timer| !timer.is_finished());

        let completions = self.completions.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
            let _ = completions.send(id);
        });
        self.timers.insert(id, timer);

        if let Some(recorder) = &mut self.recorder {
            recorder.place(id, buffer, when, now);
        }
    }

    fn stop(&mut self, id: SourceId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
        let now = self.current_time();
        if let Some(recorder) = &mut self.recorder {
            recorder.cut(id, now);
        }
    }

    fn close(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(recorder) = self.recorder.take() {
            match recorder.write() {
                Ok(()) => info!(
                    "Wrote {:.1}s of session audio to {}",
                    recorder.duration_seconds(),
                    recorder.path.display()
                ),
                Err(e) => warn!("Failed to write session recording: {:#}", e),
            }
        }
    }
}

/// Builds [`ClockOutput`]s, with optional recording.
#[derive(Debug, Clone, Default)]
pub struct ClockOutputFactory {
    pub record_path: Option<PathBuf>,
}

impl OutputFactory for ClockOutputFactory {
    fn open(&self, sample_rate: u32, completions: CompletionSender) -> LiveResult<Box<dyn AudioOutput>> {
        let output = ClockOutput::new(completions);
        let output = match &self.record_path {
            Some(path) => {
                debug!("Session playback will be recorded to {}", path.display());
                output.with_recording(path.clone(), sample_rate)
            }
            None => output,
        };
        Ok(Box::new(output))
    }
}

#[cfg(test)]
pub use virtual_clock::VirtualOutput;

/// Manually advanced output for tests and simulations.
#[cfg(test)]
mod virtual_clock {
    use super::{AudioOutput, CompletionSender, OutputFactory, SourceId};
    use crate::audio::buffer::AudioBuffer;
    use crate::live::error::LiveResult;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record of one `start()` call on a [`VirtualOutput`].
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct StartRecord {
        pub id: SourceId,
        pub start_time: f64,
        pub duration: f64,
    }

    #[derive(Debug, Default)]
    struct VirtualState {
        now: f64,
        playing: BTreeMap<SourceId, (f64, f64)>,
        started: Vec<StartRecord>,
        stopped: Vec<SourceId>,
        notifier: Option<CompletionSender>,
    }

    /// Output with a clock that only moves when told to.
    ///
    /// Clones share the same state, so a test can keep one clone to inspect while
    /// the scheduler owns another.
    #[derive(Debug, Clone, Default)]
    pub struct VirtualOutput {
        state: Arc<Mutex<VirtualState>>,
    }

    impl VirtualOutput {
        pub fn new() -> Self {
            Self::default()
        }

        /// Also post finished ids to `completions` when the clock advances.
        pub fn set_notifier(&self, completions: CompletionSender) {
            lock(&self.state).notifier = Some(completions);
        }

        /// Jump the clock to an absolute time (never backwards).
        pub fn set_time(&self, time: f64) -> Vec<SourceId> {
            let mut state = lock(&self.state);
            if time > state.now {
                state.now = time;
            }
            Self::collect_finished(&mut state)
        }

        /// Move the clock forward and return the ids that finished in between.
        pub fn advance(&self, seconds: f64) -> Vec<SourceId> {
            let target = lock(&self.state).now + seconds.max(0.0);
            self.set_time(target)
        }

        fn collect_finished(state: &mut VirtualState) -> Vec<SourceId> {
            let now = state.now;
            let finished: Vec<SourceId> = state
                .playing
                .iter()
                .filter(|(_, span)| span.1 <= now + 1e-9)
                .map(|(&id, _)| id)
                .collect();

            for id in &finished {
                state.playing.remove(id);
                if let Some(tx) = &state.notifier {
                    let _ = tx.send(*id);
                }
            }
            finished
        }

        pub fn now(&self) -> f64 {
            lock(&self.state).now
        }

        /// Every start, in call order.
        pub fn started(&self) -> Vec<StartRecord> {
            lock(&self.state).started.clone()
        }

        /// Every stop of a playing buffer, in call order.
        pub fn stopped(&self) -> Vec<SourceId> {
            lock(&self.state).stopped.clone()
        }

        /// Buffers started and neither finished nor stopped.
        pub fn playing_count(&self) -> usize {
            lock(&self.state).playing.len()
        }
    }

    impl AudioOutput for VirtualOutput {
        fn current_time(&self) -> f64 {
            self.now()
        }

        fn start(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64) {
            let duration = buffer.duration_seconds();
            let mut state = lock(&self.state);
            state.started.push(StartRecord {
                id,
                start_time: when,
                duration,
            });
            state.playing.insert(id, (when, when + duration));
        }

        fn stop(&mut self, id: SourceId) {
            let mut state = lock(&self.state);
            if state.playing.remove(&id).is_some() {
                state.stopped.push(id);
            }
        }
    }

    impl OutputFactory for VirtualOutput {
        fn open(&self, _sample_rate: u32, completions: CompletionSender) -> LiveResult<Box<dyn AudioOutput>> {
            self.set_notifier(completions);
            Ok(Box::new(self.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, value: f32) -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::mono(1_000, vec![value; frames]))
    }

    #[test]
    fn test_virtual_output_reports_finished_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = VirtualOutput::new();
        output.set_notifier(tx);

        output.start(SourceId(1), tone(100, 0.1), 0.0);
        output.start(SourceId(2), tone(100, 0.1), 0.1);

        assert_eq!(output.advance(0.05), Vec::<SourceId>::new());
        assert_eq!(output.advance(0.05), vec![SourceId(1)]);
        assert_eq!(rx.try_recv().unwrap(), SourceId(1));
        assert_eq!(output.playing_count(), 1);
    }

    #[test]
    fn test_stopped_buffers_never_complete() {
        let mut output = VirtualOutput::new();
        output.start(SourceId(7), tone(100, 0.1), 0.0);
        output.stop(SourceId(7));
        output.stop(SourceId(7));

        assert!(output.advance(1.0).is_empty());
        assert_eq!(output.stopped(), vec![SourceId(7)]);
    }

    #[test]
    fn test_recorder_cuts_stopped_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = TimelineRecorder::new(dir.path().join("out.wav"), 1_000);

        recorder.place(SourceId(1), tone(100, 0.5), 0.0, 0.0);
        recorder.place(SourceId(2), tone(100, 0.25), 0.05, 0.0);
        recorder.cut(SourceId(2), 0.08);

        assert!((recorder.duration_seconds() - 0.15).abs() < 1e-9);
        assert_eq!(recorder.samples[60], 0.75);
        assert_eq!(recorder.samples[90], 0.5);
        assert_eq!(recorder.samples[120], 0.0);

        recorder.write().unwrap();
        assert!(dir.path().join("out.wav").exists());
    }

    #[tokio::test]
    async fn test_clock_output_fires_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = ClockOutput::new(tx);
        let when = output.current_time();
        output.start(SourceId(3), tone(10, 0.0), when);

        let finished = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(finished, Some(SourceId(3)));
    }
}
