//! Microphone capture using CPAL
//!
//! The CPAL stream lives on a dedicated thread because `cpal::Stream` is not
//! `Send`. The handle only holds a stop channel, so it can move freely between
//! tasks and is dropped like any other value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::pcm::{mix_to_mono, resample_linear, FrameAssembler};
use super::{AudioError, MicrophoneStream};

/// Handle to the running microphone stream.
pub struct CpalMicrophone {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    frames_captured: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalMicrophone {
    /// Open the default input device and start delivering `frame_size`
    /// mono frames at `sample_rate` into `frames`.
    pub fn open(
        sample_rate: u32,
        frame_size: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Self, AudioError> {
        let frames_captured = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

        let counter = frames_captured.clone();
        let thread = std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let stream = match build_input(sample_rate, frame_size, frames, counter) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start input stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until the handle is closed or dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "Capture thread exited during setup".to_string(),
                ));
            }
        }

        log::info!("Microphone stream started ({} Hz frames of {})", sample_rate, frame_size);

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            frames_captured,
            sample_rate,
        })
    }
}

impl MicrophoneStream for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn captured_secs(&self) -> f64 {
        self.frames_captured.load(Ordering::Relaxed) as f64 / self.sample_rate.max(1) as f64
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        // Bounded: after the stop signal the thread only drops its stream.
        // Joining keeps the device free before the next attempt acquires it.
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Capture thread panicked");
            }
            log::info!("Microphone stream closed");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input(
    target_rate: u32,
    frame_size: usize,
    frames: mpsc::Sender<Vec<f32>>,
    counter: Arc<AtomicU64>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|e| map_config_error(e.to_string()))?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let capture = InputFramer {
        device_rate: config.sample_rate.0,
        channels: config.channels as usize,
        target_rate,
        assembler: FrameAssembler::new(frame_size),
        frames,
        counter,
        dropped: 0,
    };

    match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, capture),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, capture),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, capture),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut framer: InputFramer,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                framer.push(&floats);
            },
            err_fn,
            None,
        )
        .map_err(|e| map_config_error(e.to_string()))
}

/// Converts device callbacks into fixed-size mono frames at the capture rate.
struct InputFramer {
    device_rate: u32,
    channels: usize,
    target_rate: u32,
    assembler: FrameAssembler,
    frames: mpsc::Sender<Vec<f32>>,
    counter: Arc<AtomicU64>,
    dropped: u64,
}

impl InputFramer {
    fn push(&mut self, interleaved: &[f32]) {
        let mono = mix_to_mono(interleaved, self.channels);
        let resampled = resample_linear(&mono, self.device_rate, self.target_rate);

        for frame in self.assembler.push(&resampled) {
            self.counter.fetch_add(frame.len() as u64, Ordering::Relaxed);
            // Never block the audio thread: drop when the pipeline lags.
            if self.frames.try_send(frame).is_err() {
                self.dropped += 1;
                if self.dropped % 50 == 1 {
                    log::debug!("Capture: {} frames dropped (queue full or closed)", self.dropped);
                }
            }
        }
    }
}

fn map_config_error(message: String) -> AudioError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        AudioError::PermissionDenied(message)
    } else {
        AudioError::StreamCreationFailed(message)
    }
}
