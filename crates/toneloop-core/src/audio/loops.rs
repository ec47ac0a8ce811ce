//! Capture and playback loop threads
//!
//! Each loop is a dedicated thread bound to one stream direction, driven by
//! a shared [`LoopState`] checked at every iteration boundary. Shutdown is
//! cooperative: the controller sets the state to `Terminated` and joins the
//! thread, which observes the flag within one cell I/O cycle.
//!
//! Transient stream errors (underrun/overrun) are retried through a bounded
//! prepare-and-retry path; anything else ends the loop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::format::SampleFormat;
use super::io::{CaptureSource, PlaybackSink, StreamError};
use super::ring::RingBuffer;
use super::tone::MultiToneGenerator;

/// Re-prepare attempts before a transient error is treated as fatal
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Lifecycle of a capture or playback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, not yet allowed to run
    Created,
    /// Running until told otherwise
    Ready,
    /// Asked to stop by the controller
    Terminated,
    /// Ran to completion on its own
    Complete,
}

/// Shared, atomically updated [`LoopState`]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: LoopState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> LoopState {
        match self.0.load(Ordering::Acquire) {
            0 => LoopState::Created,
            1 => LoopState::Ready,
            2 => LoopState::Terminated,
            _ => LoopState::Complete,
        }
    }

    pub fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Write a full chunk, re-preparing the stream on transient errors
fn write_with_recovery(
    sink: &mut dyn PlaybackSink,
    chunk: &[u8],
) -> Result<(), StreamError> {
    let mut attempts = 0;
    loop {
        match sink.write(chunk) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() && attempts < MAX_RECOVERY_ATTEMPTS => {
                attempts += 1;
                tracing::warn!(error = %e, attempts, "transient playback error, re-preparing");
                sink.prepare()?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fill `cell` completely, re-preparing the stream on transient errors
fn read_with_recovery(
    source: &mut dyn CaptureSource,
    cell: &mut [u8],
) -> Result<(), StreamError> {
    let mut filled = 0;
    let mut attempts = 0;
    while filled < cell.len() {
        match source.read(&mut cell[filled..]) {
            Ok(0) => return Err(StreamError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.is_transient() && attempts < MAX_RECOVERY_ATTEMPTS => {
                attempts += 1;
                tracing::warn!(error = %e, attempts, "transient capture error, re-preparing");
                source.prepare()?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Playback thread: feeds a sink from the tone generator or from a ring
pub struct PlaybackLoop {
    state: Arc<StateCell>,
    chunk_frames: usize,
    frame_bytes: usize,
}

impl PlaybackLoop {
    pub fn new(chunk_frames: usize, frame_bytes: usize) -> Self {
        Self {
            state: Arc::new(StateCell::new(LoopState::Created)),
            chunk_frames,
            frame_bytes,
        }
    }

    /// Shared state handle for controlling the loop
    pub fn state(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    /// Spawn the tone-playback thread.
    ///
    /// Pulls frames from the generator and blocking-writes one chunk per
    /// iteration. When the generator runs out of frames between retargets,
    /// silence is written so the stream stays fed and frame-aligned.
    pub fn spawn_tones(
        &self,
        mut sink: Box<dyn PlaybackSink>,
        generator: Arc<MultiToneGenerator>,
        format: SampleFormat,
        channels: usize,
        active_channels: BTreeSet<usize>,
    ) -> JoinHandle<Result<(), StreamError>> {
        let state = Arc::clone(&self.state);
        let chunk_bytes = self.chunk_frames * self.frame_bytes;
        std::thread::Builder::new()
            .name("playback-loop".into())
            .spawn(move || {
                tracing::info!("playback loop started");
                sink.prepare()?;
                let mut chunk = vec![0u8; chunk_bytes];
                while state.get() == LoopState::Ready {
                    let frames =
                        generator.get_frames(format, channels, &active_channels, &mut chunk);
                    let written = frames * format.frame_bytes(channels);
                    chunk[written..].fill(0);
                    if let Err(e) = write_with_recovery(sink.as_mut(), &chunk) {
                        tracing::error!(error = %e, "playback loop stopping on stream error");
                        state.set(LoopState::Terminated);
                        return Err(e);
                    }
                }
                if state.get() != LoopState::Terminated {
                    state.set(LoopState::Complete);
                }
                tracing::info!("playback loop stopped");
                Ok(())
            })
            .expect("failed to spawn playback thread")
    }

    /// Spawn the cell-replay thread.
    ///
    /// Waits until at least half the ring is pre-filled as a cushion against
    /// starvation, then drains read-ready cells into the sink.
    pub fn spawn_cells(
        &self,
        mut sink: Box<dyn PlaybackSink>,
        ring: Arc<RingBuffer<u8>>,
    ) -> JoinHandle<Result<(), StreamError>> {
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("playback-loop".into())
            .spawn(move || {
                tracing::info!("cell playback loop started");
                sink.prepare()?;
                let cushion = ring.cell_count() / 2;
                while state.get() == LoopState::Ready && ring.pending() < cushion {
                    std::thread::sleep(Duration::from_millis(1));
                }
                while state.get() == LoopState::Ready {
                    let Some(cell) = ring.lock_cell_to_read_timeout(Duration::from_millis(100))
                    else {
                        continue;
                    };
                    if let Err(e) = write_with_recovery(sink.as_mut(), &cell) {
                        tracing::error!(error = %e, "cell playback stopping on stream error");
                        state.set(LoopState::Terminated);
                        return Err(e);
                    }
                }
                if state.get() != LoopState::Terminated {
                    state.set(LoopState::Complete);
                }
                tracing::info!("cell playback loop stopped");
                Ok(())
            })
            .expect("failed to spawn playback thread")
    }
}

/// Capture thread: blocking-reads one cell per iteration into the ring
pub struct CaptureLoop {
    state: Arc<StateCell>,
}

impl CaptureLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StateCell::new(LoopState::Created)),
        }
    }

    /// Shared state handle for controlling the loop
    pub fn state(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub fn spawn(
        &self,
        mut source: Box<dyn CaptureSource>,
        ring: Arc<RingBuffer<u8>>,
    ) -> JoinHandle<Result<(), StreamError>> {
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || {
                tracing::info!("capture loop started");
                source.prepare()?;
                while state.get() == LoopState::Ready {
                    let mut cell = ring.lock_cell_to_write();
                    if let Err(e) = read_with_recovery(source.as_mut(), &mut cell) {
                        tracing::error!(error = %e, "capture loop stopping on stream error");
                        drop(cell);
                        state.set(LoopState::Terminated);
                        return Err(e);
                    }
                }
                if state.get() != LoopState::Terminated {
                    state.set(LoopState::Complete);
                }
                tracing::info!("capture loop stopped");
                Ok(())
            })
            .expect("failed to spawn capture thread")
    }
}

impl Default for CaptureLoop {
    fn default() -> Self {
        Self::new()
    }
}
