//! Audio resampling and sample processing
//!
//! Converts device samples to mono, resamples to the provider rate when the
//! device cannot deliver it natively, and slices the result into fixed
//! time-slice chunks for the socket send task.

use super::types::AudioChunk;
use rubato::{Resampler, SincFixedIn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Number of samples in one outgoing chunk for the given rate and slice
pub(crate) fn chunk_size(sample_rate: u32, chunk_duration_ms: u64) -> usize {
    (sample_rate as u64 * chunk_duration_ms / 1000) as usize
}

/// Process incoming device samples: mono conversion, optional resampling,
/// buffering, and chunked delivery.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_samples(
    data: &[i16],
    channels: usize,
    input_buffer: &Arc<Mutex<Vec<i16>>>,
    input_chunk_size: usize,
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioChunk>,
    resampler: &Option<Arc<Mutex<SincFixedIn<f32>>>>,
    target_sample_rate: u32,
    output_chunk_size: usize,
) {
    // Convert to mono by averaging channels
    let mono_samples: Vec<i16> = if channels > 1 {
        data.chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    } else {
        data.to_vec()
    };

    if let Some(resampler_arc) = resampler {
        if let Ok(mut input_buf) = input_buffer.lock() {
            input_buf.extend(&mono_samples);

            while input_buf.len() >= input_chunk_size {
                let input_chunk: Vec<i16> = input_buf.drain(..input_chunk_size).collect();
                let input_f32: Vec<f32> =
                    input_chunk.iter().map(|&s| s as f32 / 32768.0).collect();

                if let Ok(mut resampler) = resampler_arc.lock() {
                    match resampler.process(&[input_f32], None) {
                        Ok(resampled) => {
                            let output_i16: Vec<i16> = resampled[0]
                                .iter()
                                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                                .collect();
                            if let Ok(mut output_buf) = output_buffer.lock() {
                                output_buf.extend(&output_i16);
                            }
                        }
                        Err(e) => {
                            error!("Resampling error: {}", e);
                        }
                    }
                }
            }
        }
    } else if let Ok(mut output_buf) = output_buffer.lock() {
        output_buf.extend(&mono_samples);
    }

    send_chunks(output_buffer, sender, target_sample_rate, output_chunk_size);
}

/// Send complete chunks from the output buffer.
///
/// Uses `try_send` so the audio callback never blocks; if the socket side is
/// not keeping up (or the connection is down), chunks are dropped here.
fn send_chunks(
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioChunk>,
    target_sample_rate: u32,
    output_chunk_size: usize,
) {
    if let Ok(mut output_buf) = output_buffer.lock() {
        while output_buf.len() >= output_chunk_size {
            let chunk: Vec<i16> = output_buf.drain(..output_chunk_size).collect();
            let audio_chunk = AudioChunk {
                samples: chunk,
                sample_rate: target_sample_rate,
            };
            match sender.try_send(audio_chunk) {
                Ok(_) => {}
                Err(e) => {
                    warn!("Audio buffer full - chunk dropped: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_time_slice_of_rate() {
        assert_eq!(chunk_size(16000, 100), 1600);
        assert_eq!(chunk_size(44100, 100), 4410);
        assert_eq!(chunk_size(16000, 50), 800);
    }

    #[test]
    fn test_stereo_is_averaged_to_mono() {
        let (tx, mut rx) = mpsc::channel(4);
        let input_buffer = Arc::new(Mutex::new(Vec::new()));
        let output_buffer = Arc::new(Mutex::new(Vec::new()));

        // Two stereo frames: (100, 200) and (-50, 50)
        process_samples(
            &[100, 200, -50, 50],
            2,
            &input_buffer,
            4,
            &output_buffer,
            &tx,
            &None,
            16000,
            2,
        );

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.samples, vec![150, 0]);
        assert_eq!(chunk.sample_rate, 16000);
    }

    #[test]
    fn test_incomplete_chunk_stays_buffered() {
        let (tx, mut rx) = mpsc::channel(4);
        let input_buffer = Arc::new(Mutex::new(Vec::new()));
        let output_buffer = Arc::new(Mutex::new(Vec::new()));

        process_samples(
            &[1, 2, 3],
            1,
            &input_buffer,
            8,
            &output_buffer,
            &tx,
            &None,
            16000,
            8,
        );

        assert!(rx.try_recv().is_err());
        assert_eq!(output_buffer.lock().unwrap().len(), 3);
    }
}
