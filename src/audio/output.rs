//! Playback output: a frame-counting mixer driven by a CPAL output stream
//!
//! The mixer's rendered-frame counter is the playback clock. Buffers are placed
//! at absolute frame positions on that clock, so back-to-back scheduling is
//! sample accurate regardless of callback size.

use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioError, PlaybackOutput};

#[derive(Debug)]
struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Debug)]
struct MixerState {
    rendered: u64,
    voices: Vec<Voice>,
    closed: bool,
}

/// Shared mixer. Cheap to clone; all clones see the same clock.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    ended: mpsc::UnboundedSender<u64>,
}

impl Mixer {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                rendered: 0,
                voices: Vec::new(),
                closed: false,
            })),
            sample_rate: sample_rate.max(1),
            ended,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        // A panic inside the audio callback must not take playback down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render `out.len() / channels` frames, advancing the clock.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.iter_mut().for_each(|s| *s = 0.0);

        let mut state = self.lock();
        if state.closed {
            return;
        }

        let window_start = state.rendered;
        let window_end = window_start + frames as u64;

        for voice in &state.voices {
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame().min(window_end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let offset = (frame - window_start) as usize * channels;
                for ch in 0..channels {
                    out[offset + ch] += sample;
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        state.rendered = window_end;

        let ended = &self.ended;
        state.voices.retain(|voice| {
            if voice.end_frame() <= window_end {
                let _ = ended.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

impl PlaybackOutput for Mixer {
    fn now(&self) -> f64 {
        self.lock().rendered as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&self, id: u64, samples: Vec<f32>, at: f64) -> Result<(), AudioError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AudioError::Closed);
        }
        let start_frame = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        state.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        Ok(())
    }

    fn stop(&self, id: u64) {
        self.lock().voices.retain(|voice| voice.id != id);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.voices.clear();
    }
}

/// Default output device feeding from a [`Mixer`] on a dedicated thread.
pub struct CpalSpeaker {
    mixer: Mixer,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSpeaker {
    pub fn open(ended: mpsc::UnboundedSender<u64>) -> Result<Self, AudioError> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Mixer, AudioError>>();

        let thread = std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || {
                let (stream, mixer) = match build_output(ended) {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start output stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(mixer));

                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Playback thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let mixer = match ready_rx.recv() {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "Playback thread exited during setup".to_string(),
                ));
            }
        };

        log::info!("Playback stream started ({} Hz)", mixer.sample_rate);

        Ok(Self {
            mixer,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl PlaybackOutput for CpalSpeaker {
    fn now(&self) -> f64 {
        self.mixer.now()
    }

    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn start(&self, id: u64, samples: Vec<f32>, at: f64) -> Result<(), AudioError> {
        self.mixer.start(id, samples, at)
    }

    fn stop(&self, id: u64) {
        self.mixer.stop(id);
    }

    fn is_closed(&self) -> bool {
        self.mixer.is_closed()
    }

    fn close(&self) {
        self.mixer.close();
        if let Some(tx) = self.stop_tx.lock().ok().and_then(|mut g| g.take()) {
            let _ = tx.send(());
        }
        // Bounded like the capture thread: it only drops its stream after the stop signal.
        if let Some(thread) = self.thread.lock().ok().and_then(|mut g| g.take()) {
            if thread.join().is_err() {
                log::warn!("Playback thread panicked");
            }
            log::info!("Playback stream closed");
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output(ended: mpsc::UnboundedSender<u64>) -> Result<(Stream, Mixer), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let mixer = Mixer::new(config.sample_rate.0, ended);

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, mixer.clone()),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, mixer.clone()),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, mixer.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, mixer))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Mixer,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
