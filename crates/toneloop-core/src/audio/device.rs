//! Hardware stream adapter over cpal
//!
//! Bridges cpal's callback model to the blocking [`CaptureSource`] /
//! [`PlaybackSink`] traits the loop threads expect. Each direction gets a
//! lock-free SPSC ring: the playback sink decodes PCM bytes to f32 samples
//! and pushes them for the output callback to drain; the input callback
//! pushes captured f32 samples for the capture source to pop and re-encode.
//!
//! Fatal stream errors reported by cpal's error callback travel to the
//! blocking side over a bounded channel, so a dead device surfaces as a
//! failed read or write instead of a silent stall.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, TryRecvError};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::controller::LoopConfig;
use super::format::{decode_sample, encode_magnitude};
use super::io::{CaptureSource, PlaybackSink, StreamError};

/// Samples buffered per direction between callback and blocking side
const BRIDGE_SAMPLES: usize = 32768;

/// Poll interval while a blocking call waits on the callback side
const BRIDGE_POLL: Duration = Duration::from_millis(1);

/// Owns the live cpal streams for the duration of a run.
///
/// Dropping this stops both streams; pending reads and writes then fail
/// with [`StreamError::Closed`].
pub struct StreamPair {
    _output: Stream,
    _input: Stream,
}

/// Open playback and capture streams and return the blocking endpoints.
///
/// Devices are picked by name from the default host, or the host defaults
/// when no name is given. Stream parameters come from the loop config; the
/// negotiation details stay inside this adapter.
pub fn open_duplex(
    config: &LoopConfig,
    playback_device: Option<&str>,
    capture_device: Option<&str>,
) -> Result<(StreamPair, DeviceSink, DeviceSource)> {
    let host = cpal::default_host();
    let output = select_device(
        playback_device,
        host.default_output_device(),
        host.output_devices().context("enumerating output devices")?,
    )?;
    let input = select_device(
        capture_device,
        host.default_input_device(),
        host.input_devices().context("enumerating input devices")?,
    )?;
    tracing::info!(
        output = %output.name().unwrap_or_else(|_| "unknown".into()),
        input = %input.name().unwrap_or_else(|_| "unknown".into()),
        sample_rate = config.sample_rate,
        channels = config.channels,
        "opening duplex streams"
    );

    let stream_config = StreamConfig {
        channels: config.channels as u16,
        sample_rate: config.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let playback_ring = HeapRb::<f32>::new(BRIDGE_SAMPLES);
    let (playback_producer, mut playback_consumer) = playback_ring.split();
    let (playback_error_tx, playback_error_rx) = crossbeam_channel::bounded::<String>(4);
    let output_stream = output
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let popped = playback_consumer.pop_slice(data);
                // Starved callback plays silence rather than stale samples
                data[popped..].fill(0.0);
            },
            move |err| {
                tracing::error!(error = %err, "output stream error");
                let _ = playback_error_tx.try_send(err.to_string());
            },
            None,
        )
        .context("building output stream")?;

    let capture_ring = HeapRb::<f32>::new(BRIDGE_SAMPLES);
    let (mut capture_producer, capture_consumer) = capture_ring.split();
    let (capture_error_tx, capture_error_rx) = crossbeam_channel::bounded::<String>(4);
    let input_stream = input
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let pushed = capture_producer.push_slice(data);
                if pushed < data.len() {
                    tracing::trace!(
                        dropped = data.len() - pushed,
                        "capture bridge full, dropping samples"
                    );
                }
            },
            move |err| {
                tracing::error!(error = %err, "input stream error");
                let _ = capture_error_tx.try_send(err.to_string());
            },
            None,
        )
        .context("building input stream")?;

    output_stream.play().context("starting output stream")?;
    input_stream.play().context("starting input stream")?;

    let sink = DeviceSink {
        producer: playback_producer,
        errors: playback_error_rx,
        format: config.format,
    };
    let source = DeviceSource {
        consumer: capture_consumer,
        errors: capture_error_rx,
        format: config.format,
    };
    Ok((
        StreamPair {
            _output: output_stream,
            _input: input_stream,
        },
        sink,
        source,
    ))
}

fn select_device(
    name: Option<&str>,
    default: Option<Device>,
    mut candidates: impl Iterator<Item = Device>,
) -> Result<Device> {
    match name {
        None => default.ok_or_else(|| anyhow!("no default audio device available")),
        Some(wanted) => candidates
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| anyhow!("audio device not found: {}", wanted)),
    }
}

/// Drain any pending callback error into a [`StreamError`]
fn poll_errors(errors: &Receiver<String>) -> Result<(), StreamError> {
    match errors.try_recv() {
        Ok(message) => Err(StreamError::Fatal(message)),
        Err(TryRecvError::Disconnected) => Err(StreamError::Closed),
        Err(TryRecvError::Empty) => Ok(()),
    }
}

/// Blocking playback endpoint backed by the output callback
pub struct DeviceSink {
    producer: HeapProd<f32>,
    errors: Receiver<String>,
    format: super::format::SampleFormat,
}

impl PlaybackSink for DeviceSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let width = self.format.bytes_per_sample();
        let mut offset = 0;
        while offset < buf.len() {
            poll_errors(&self.errors)?;
            if self.producer.vacant_len() == 0 {
                std::thread::sleep(BRIDGE_POLL);
                continue;
            }
            let sample = decode_sample(self.format, &buf[offset..offset + width]) as f32;
            if self.producer.try_push(sample).is_ok() {
                offset += width;
            }
        }
        Ok(buf.len())
    }
}

/// Blocking capture endpoint backed by the input callback
pub struct DeviceSource {
    consumer: HeapCons<f32>,
    errors: Receiver<String>,
    format: super::format::SampleFormat,
}

impl CaptureSource for DeviceSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let width = self.format.bytes_per_sample();
        let mut offset = 0;
        while offset < buf.len() {
            poll_errors(&self.errors)?;
            let Some(sample) = self.consumer.try_pop() else {
                std::thread::sleep(BRIDGE_POLL);
                continue;
            };
            encode_magnitude(
                self.format,
                f64::from(sample),
                &mut buf[offset..offset + width],
            );
            offset += width;
        }
        Ok(buf.len())
    }
}
