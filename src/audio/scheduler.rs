//! # Playback Scheduler
//!
//! Queues decoded audio chunks back-to-back on a single output timeline.
//!
//! ## Scheduling Rule:
//! `start = max(cursor, output clock)`, then `cursor = start + duration`.
//! Chunks that arrive early play gaplessly after their predecessor; a chunk
//! that arrives after the timeline ran dry starts immediately instead of at
//! the stale cursor.
//!
//! ## Interruption:
//! `on_interrupt()` stops every active source, clears the set and resets the
//! cursor to zero in one call. It is the only operation that moves the
//! cursor backward.
//!
//! ## Ownership:
//! The scheduler is a plain `&mut self` struct with no internal locking. The
//! live session keeps it inside its driver task, so scheduling, interruption
//! and completion handling are serialized by construction.

use crate::audio::buffer::AudioBuffer;
use crate::audio::output::{AudioOutput, SourceId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of a successful `schedule()` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Gapless sequencer over an [`AudioOutput`].
pub struct PlaybackScheduler<O: AudioOutput = Box<dyn AudioOutput>> {
    output: O,

    /// Next free start time on the output clock
    next_start_time: f64,

    /// Started and not yet finished or stopped
    active: HashSet<SourceId>,

    next_id: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 1,
        }
    }

    /// Start `buffer` right after everything already queued, or now if the
    /// queue has run dry. Returns `None` for an empty buffer.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Option<ScheduledPlayback> {
        if buffer.is_empty() {
            trace!("Ignoring zero-length buffer");
            return None;
        }

        let now = self.output.current_time();
        let start_time = self.next_start_time.max(now);
        let duration = buffer.duration_seconds();

        let id = SourceId(self.next_id);
        self.next_id += 1;

        self.output.start(id, Arc::new(buffer), start_time);
        self.active.insert(id);
        self.next_start_time = start_time + duration;

        trace!(
            source = %id,
            start = start_time,
            duration,
            "Scheduled buffer"
        );

        Some(ScheduledPlayback {
            id,
            start_time,
            duration,
        })
    }

    /// Stop all active sources, clear the set and reset the cursor.
    ///
    /// Returns how many sources were stopped.
    pub fn on_interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.output.stop(id);
        }
        self.next_start_time = 0.0;

        if stopped > 0 {
            debug!(stopped, "Playback interrupted");
        }
        stopped
    }

    /// Forget a source the output reported as finished.
    pub fn on_buffer_finished(&mut self, id: SourceId) -> bool {
        self.active.remove(&id)
    }

    /// Current playback cursor, in output-clock seconds.
    #[cfg(test)]
    pub fn cursor(&self) -> f64 {
        self.next_start_time
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }

    #[cfg(test)]
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Release the underlying output.
    pub fn close(&mut self) {
        self.output.close();
    }
}
