//! # Local Audio Devices
//!
//! Microphone capture and speaker playback through cpal.
//!
//! cpal streams are not `Send` on every platform, so each stream is built,
//! started and kept alive on its own OS thread. The async side only holds a
//! stop handle; dropping it ends the thread, which drops the stream.
//!
//! Opening waits for that thread to report the stream playing, so `open`
//! blocks. Sessions call it from the blocking pool.

use crate::audio::buffer::AudioBuffer;
use crate::audio::capture::{CaptureDevice, CaptureSpec, CaptureStream};
use crate::audio::output::{AudioOutput, CompletionSender, OutputFactory, SourceId};
use crate::live::error::{LiveError, LiveResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::BTreeMap;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Keeps a device thread (and its stream) alive until dropped.
struct StreamGuard {
    _stop: std_mpsc::Sender<()>,
}

/// Run `build` on a dedicated thread and park there until the guard drops.
fn spawn_stream_thread<F>(name: &str, build: F) -> LiveResult<StreamGuard>
where
    F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Returns once the guard's sender is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| LiveError::Permission(format!("cannot start audio thread: {}", e)))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamGuard { _stop: stop_tx }),
        Ok(Err(e)) => Err(LiveError::Permission(e)),
        Err(_) => Err(LiveError::Permission("audio thread exited during setup".to_string())),
    }
}

fn stream_config(sample_rate: u32) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// The host's default input device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCapture;

impl CaptureDevice for DeviceCapture {
    fn open(&self, spec: &CaptureSpec) -> LiveResult<CaptureStream> {
        let (tx, rx) = mpsc::channel::<Vec<f32>>(8);
        let spec = *spec;

        let guard = spawn_stream_thread("live-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| "no input device available".to_string())?;
            info!(
                "Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let frame_size = spec.frame_size.max(1);
            let mut pending = Vec::with_capacity(frame_size);
            device
                .build_input_stream(
                    &stream_config(spec.sample_rate),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            pending.push(sample);
                            if pending.len() >= frame_size {
                                let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_size));
                                if tx.try_send(frame).is_err() {
                                    warn!("Capture queue full; dropping a frame");
                                }
                            }
                        }
                    },
                    |err| warn!("Input stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        Ok(CaptureStream::with_guard(rx, Box::new(guard)))
    }

    fn describe(&self) -> String {
        "device".to_string()
    }
}

struct Voice {
    start_frame: u64,
    buffer: Arc<AudioBuffer>,
}

/// Shared between the output callback and the scheduler side.
struct Mixer {
    frames_rendered: u64,
    voices: BTreeMap<SourceId, Voice>,
    completions: CompletionSender,
}

impl Mixer {
    fn render(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for (offset, frame) in data.chunks_mut(channels).enumerate() {
            let position = self.frames_rendered + offset as u64;
            let mut mixed = 0.0f32;
            for voice in self.voices.values() {
                if position >= voice.start_frame {
                    let index = (position - voice.start_frame) as usize;
                    if index < voice.buffer.frame_count() {
                        mixed += voice.buffer.mono_sample(index);
                    }
                }
            }
            let mixed = mixed.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = mixed;
            }
        }
        self.frames_rendered += (data.len() / channels) as u64;

        let rendered = self.frames_rendered;
        let finished: Vec<SourceId> = self
            .voices
            .iter()
            .filter(|(_, voice)| voice.start_frame + voice.buffer.frame_count() as u64 <= rendered)
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.voices.remove(&id);
            let _ = self.completions.send(id);
        }
    }
}

/// The host's default output device, mixing scheduled buffers by frame offset.
pub struct DeviceOutput {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    guard: Option<StreamGuard>,
}

impl DeviceOutput {
    pub fn open(sample_rate: u32, completions: CompletionSender) -> LiveResult<Self> {
        let mixer = Arc::new(Mutex::new(Mixer {
            frames_rendered: 0,
            voices: BTreeMap::new(),
            completions,
        }));

        let callback_mixer = Arc::clone(&mixer);
        let guard = spawn_stream_thread("live-playback", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| "no output device available".to_string())?;
            info!(
                "Using output device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let config = stream_config(sample_rate);
            let channels = config.channels as usize;
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback_mixer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .render(data, channels);
                    },
                    |err| warn!("Output stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        Ok(Self {
            sample_rate,
            mixer,
            guard: Some(guard),
        })
    }

    fn mixer(&self) -> std::sync::MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for DeviceOutput {
    fn current_time(&self) -> f64 {
        self.mixer().frames_rendered as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, when: f64) {
        let start_frame = (when.max(0.0) * self.sample_rate as f64).round() as u64;
        self.mixer().voices.insert(id, Voice { start_frame, buffer });
    }

    fn stop(&mut self, id: SourceId) {
        self.mixer().voices.remove(&id);
    }

    fn close(&mut self) {
        self.mixer().voices.clear();
        self.guard.take();
    }
}

/// Opens [`DeviceOutput`]s for sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOutputFactory;

impl OutputFactory for DeviceOutputFactory {
    fn open(&self, sample_rate: u32, completions: CompletionSender) -> LiveResult<Box<dyn AudioOutput>> {
        Ok(Box::new(DeviceOutput::open(sample_rate, completions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_sums_voices_and_reports_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer {
            frames_rendered: 0,
            voices: BTreeMap::new(),
            completions: tx,
        };
        mixer.voices.insert(
            SourceId(1),
            Voice {
                start_frame: 0,
                buffer: Arc::new(AudioBuffer::mono(100, vec![0.25; 4])),
            },
        );
        mixer.voices.insert(
            SourceId(2),
            Voice {
                start_frame: 2,
                buffer: Arc::new(AudioBuffer::mono(100, vec![0.5; 4])),
            },
        );

        let mut data = vec![0.0; 8];
        mixer.render(&mut data, 2);
        assert_eq!(data, vec![0.25, 0.25, 0.25, 0.25, 0.75, 0.75, 0.75, 0.75]);

        let mut data = vec![0.0; 2];
        mixer.render(&mut data, 1);
        assert_eq!(data, vec![0.5, 0.5]);
        assert_eq!(rx.try_recv().unwrap(), SourceId(1));
        assert_eq!(rx.try_recv().unwrap(), SourceId(2));
    }
}
