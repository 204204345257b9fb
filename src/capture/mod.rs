//! Audio capture
//!
//! Wraps physical and virtual capture devices behind the `MediaSource`
//! trait. The local channel uses the default microphone via cpal on a
//! dedicated thread; the remote channel is supplied by a platform display
//! capture integration and validated in `surface`.

mod resampler;
pub mod surface;
mod types;

pub use surface::{validate_remote_source, CaptureSurface, ControllerSupport, FocusBehavior};
pub use types::{AcquisitionError, AudioChunk, CaptureHandle};

use crate::message::Channel;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use resampler::{chunk_size, process_samples};
use rubato::{SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// One acquired capture device feeding a channel.
///
/// Every implementation must release its underlying resources on `stop`,
/// and `stop` must be idempotent: the lifecycle manager calls it on every
/// exit path, including error paths.
pub trait MediaSource: Send {
    /// Which conversation channel this source feeds
    fn channel(&self) -> Channel;

    /// The selected capture surface, if this is a display capture
    fn surface(&self) -> Option<CaptureSurface>;

    /// Whether an audio track was granted
    fn has_audio(&self) -> bool;

    /// Begin capturing; chunks arrive on the returned receiver
    fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>, AcquisitionError>;

    /// Stop capturing and release all tracks (idempotent)
    fn stop(&mut self);

    /// Negotiate the optional platform surface controller
    fn take_controller(&mut self) -> ControllerSupport;
}

/// Microphone source for the local channel
pub struct MicSource {
    target_sample_rate: u32,
    chunk_duration_ms: u64,
    handle: Option<CaptureHandle>,
}

impl MicSource {
    pub fn new(target_sample_rate: u32, chunk_duration_ms: u64) -> Self {
        Self {
            target_sample_rate,
            chunk_duration_ms,
            handle: None,
        }
    }
}

impl MediaSource for MicSource {
    fn channel(&self) -> Channel {
        Channel::Local
    }

    fn surface(&self) -> Option<CaptureSurface> {
        None
    }

    fn has_audio(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>, AcquisitionError> {
        let (handle, rx) = start_capture(self.target_sample_rate, self.chunk_duration_ms)?;
        self.handle = Some(handle);
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
    }

    fn take_controller(&mut self) -> ControllerSupport {
        ControllerSupport::Unsupported
    }
}

/// Start microphone capture on a dedicated thread.
///
/// Audio is resampled to the target rate in mono PCM and chunked into the
/// configured time slice. The stream must be built on the thread that runs
/// it, so device and stream setup errors come back over a handshake channel
/// and are returned to the caller here; the capture thread only survives a
/// successful setup.
pub(crate) fn start_capture(
    target_sample_rate: u32,
    chunk_duration_ms: u64,
) -> Result<(CaptureHandle, mpsc::Receiver<AudioChunk>), AcquisitionError> {
    let is_capturing = Arc::new(AtomicBool::new(true));
    let is_capturing_clone = is_capturing.clone();

    let (chunk_tx, chunk_rx) = mpsc::channel(600);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let thread_handle = thread::spawn(move || {
        run_capture(
            is_capturing_clone,
            chunk_tx,
            target_sample_rate,
            chunk_duration_ms,
            ready_tx,
        );
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = thread_handle.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread_handle.join();
            return Err(AcquisitionError::ConfigError(
                "capture thread exited during setup".to_string(),
            ));
        }
    }

    let handle = CaptureHandle {
        is_capturing,
        thread_handle: Some(thread_handle),
    };

    Ok((handle, chunk_rx))
}

/// Run microphone capture on the current thread (blocking).
///
/// Reports setup success or failure exactly once on `ready_tx` before
/// entering the capture loop.
fn run_capture(
    is_capturing: Arc<AtomicBool>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    target_sample_rate: u32,
    chunk_duration_ms: u64,
    ready_tx: std::sync::mpsc::Sender<Result<(), AcquisitionError>>,
) {
    let stream = match open_input_stream(&is_capturing, chunk_tx, target_sample_rate, chunk_duration_ms)
    {
        Ok(stream) => stream,
        Err(e) => {
            error!("Audio capture setup failed: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!("Audio stream failed to start: {}", e);
        let _ = ready_tx.send(Err(e.into()));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    info!("Audio capture started");

    while is_capturing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
}

/// Select the input device and build the capture stream
fn open_input_stream(
    is_capturing: &Arc<AtomicBool>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    target_sample_rate: u32,
    chunk_duration_ms: u64,
) -> Result<cpal::Stream, AcquisitionError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AcquisitionError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    let supported_configs = device
        .supported_input_configs()
        .map_err(|e| AcquisitionError::ConfigError(e.to_string()))?;

    // Prefer a config that supports the target rate, fall back to any
    let mut best_config = None;
    let mut found_target_rate = false;

    for config in supported_configs {
        if config.channels() > 0 {
            if config.min_sample_rate().0 <= target_sample_rate
                && config.max_sample_rate().0 >= target_sample_rate
            {
                best_config = Some(config.with_sample_rate(cpal::SampleRate(target_sample_rate)));
                found_target_rate = true;
                break;
            } else if best_config.is_none() {
                best_config = Some(config.with_max_sample_rate());
            }
        }
    }

    let supported_config = best_config.ok_or(AcquisitionError::NoSupportedConfig)?;

    if !found_target_rate {
        warn!(
            "{}Hz not supported, using {}Hz instead",
            target_sample_rate,
            supported_config.sample_rate().0
        );
    }

    let config: cpal::StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!("Audio config: {} channels, {} Hz", channels, sample_rate);

    let output_chunk_size = chunk_size(target_sample_rate, chunk_duration_ms);

    // Create a resampler when the device rate differs from the target
    let (resampler, input_chunk_size): (Option<Arc<Mutex<SincFixedIn<f32>>>>, usize) =
        if sample_rate != target_sample_rate {
            info!(
                "Creating resampler: {} Hz -> {} Hz",
                sample_rate, target_sample_rate
            );
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let input_frames = (output_chunk_size as f64 * sample_rate as f64
                / target_sample_rate as f64)
                .ceil() as usize;
            match SincFixedIn::<f32>::new(
                target_sample_rate as f64 / sample_rate as f64,
                2.0,
                params,
                input_frames,
                1, // mono
            ) {
                Ok(resampler) => (Some(Arc::new(Mutex::new(resampler))), input_frames),
                Err(e) => {
                    error!("Failed to create resampler: {}", e);
                    (None, output_chunk_size)
                }
            }
        } else {
            (None, output_chunk_size)
        };

    let output_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(output_chunk_size * 2)));
    let input_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(input_chunk_size * 2)));

    let err_callback = |err| {
        error!("Audio stream error: {}", err);
    };

    let stream = match device.default_input_config()?.sample_format() {
        SampleFormat::I16 => {
            let is_capturing_stream = is_capturing.clone();
            let input_buffer = input_buffer.clone();
            let output_buffer = output_buffer.clone();
            let chunk_tx = chunk_tx.clone();
            let resampler = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !is_capturing_stream.load(Ordering::SeqCst) {
                        return;
                    }
                    process_samples(
                        data,
                        channels,
                        &input_buffer,
                        input_chunk_size,
                        &output_buffer,
                        &chunk_tx,
                        &resampler,
                        target_sample_rate,
                        output_chunk_size,
                    );
                },
                err_callback,
                None,
            )?
        }
        SampleFormat::F32 => {
            let is_capturing_stream = is_capturing.clone();
            let input_buffer = input_buffer.clone();
            let output_buffer = output_buffer.clone();
            let chunk_tx = chunk_tx.clone();
            let resampler = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !is_capturing_stream.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    process_samples(
                        &samples,
                        channels,
                        &input_buffer,
                        input_chunk_size,
                        &output_buffer,
                        &chunk_tx,
                        &resampler,
                        target_sample_rate,
                        output_chunk_size,
                    );
                },
                err_callback,
                None,
            )?
        }
        sample_format => {
            return Err(AcquisitionError::UnsupportedFormat(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_setup_result_reaches_caller() {
        // Setup happens on the capture thread, but its outcome is awaited
        // here: either a live handle or the device error, never a silent Ok
        // on a machine with no usable input.
        match start_capture(16000, 100) {
            Ok((handle, _rx)) => {
                assert!(handle.is_capturing());
                drop(handle);
            }
            Err(e) => {
                println!("No usable audio input, error surfaced to caller: {}", e);
            }
        }
    }

    #[test]
    fn test_mic_source_reports_local_channel() {
        let source = MicSource::new(16000, 100);
        assert_eq!(source.channel(), Channel::Local);
        assert!(source.surface().is_none());
        assert!(source.has_audio());
    }

    #[test]
    fn test_mic_stop_without_start_is_noop() {
        let mut source = MicSource::new(16000, 100);
        source.stop();
        source.stop();
    }
}
