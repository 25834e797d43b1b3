//! # Playable Audio Buffers
//!
//! A decoded chunk of audio ready to be handed to an output. Samples are kept
//! per channel (planar) as 32-bit floats in [-1.0, 1.0], the same layout the
//! output mixers consume.
//!
//! ## Key Features:
//! - **Planar storage**: one `Vec<f32>` per channel, all of equal length
//! - **Duration math**: `frame_count / sample_rate`, in seconds on the output clock
//! - **Cheap sharing**: outputs receive `Arc<AudioBuffer>` so the scheduler never copies samples

/// Decoded audio, one plane of samples per channel.
///
/// ## Invariants:
/// - `sample_rate > 0`
/// - every channel plane has the same number of frames
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples per second of every channel
    sample_rate: u32,

    /// Planar sample data (`channels[c][frame]`)
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from planar channel data.
    ///
    /// ## Frame alignment:
    /// If the planes disagree in length they are truncated to the shortest one,
    /// so `frame_count()` is always well defined.
    pub fn new(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for plane in &mut channels {
            plane.truncate(frames);
        }

        Self {
            sample_rate,
            channels,
        }
    }

    /// Build a single-channel buffer.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    /// A mono buffer of silence lasting `duration_seconds`.
    pub fn silence(sample_rate: u32, duration_seconds: f64) -> Self {
        let frames = (duration_seconds * sample_rate as f64).round() as usize;
        Self::mono(sample_rate, vec![0.0; frames])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Returns true when there is nothing to play.
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Playback duration in seconds.
    ///
    /// ## Calculation:
    /// Duration = frame_count / sample_rate
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Samples of one channel, or an empty slice if the channel doesn't exist.
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sample for `frame`, averaged across channels.
    ///
    /// Used by mono outputs and recorders that fold multi-channel audio down.
    pub fn mono_sample(&self, frame: usize) -> f32 {
        if self.channels.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .map(|plane| plane.get(frame).copied().unwrap_or(0.0))
            .sum();
        sum / self.channels.len() as f32
    }

    /// Interleave the planes back into `[c0, c1, c0, c1, ...]` order.
    pub fn interleaved(&self) -> Vec<f32> {
        let channels = self.channel_count();
        let mut out = Vec::with_capacity(self.frame_count() * channels);
        for frame in 0..self.frame_count() {
            for plane in &self.channels {
                out.push(plane[frame]);
            }
        }
        out
    }
}
