//! Gapless playback scheduling for inbound agent audio
//!
//! Every decoded chunk is placed on the playback clock at
//! `max(cursor, now)`, and the cursor advances by the chunk's duration. Chunks
//! therefore play back-to-back: never overlapping, and never leaving a gap
//! unless the stream itself stalled.
//!
//! Barge-in (`interrupt`) force-stops everything outstanding and snaps the
//! cursor back to the clock, so the next chunk starts immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::audio::pcm::{decode_pcm16, resample_linear};
use crate::audio::PlaybackOutput;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error("Audio payload is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("Audio payload has odd byte length {0}")]
    OddByteLength(usize),
    #[error("Playback output already released")]
    OutputReleased,
    #[error("Failed to schedule chunk: {0}")]
    ScheduleFailed(String),
}

/// Placement of one chunk on the playback clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules decoded chunks back-to-back and tracks the outstanding set.
pub struct PlaybackScheduler {
    /// Rate of the PCM the remote side sends.
    source_rate: u32,
    output: Option<Arc<dyn PlaybackOutput>>,
    cursor: f64,
    outstanding: BTreeMap<u64, ScheduledChunk>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(source_rate: u32) -> Self {
        Self {
            source_rate,
            output: None,
            cursor: 0.0,
            outstanding: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Bind to the playback clock of a freshly acquired output.
    pub fn attach(&mut self, output: Arc<dyn PlaybackOutput>) {
        self.release();
        self.cursor = output.now();
        self.output = Some(output);
    }

    /// Stop everything and forget the output. The caller owns closing it.
    pub fn release(&mut self) {
        self.stop_all();
        self.output = None;
        self.cursor = 0.0;
    }

    /// Decode one base64 PCM16 payload and schedule it.
    ///
    /// Rejected without decoding if the output was released.
    pub fn enqueue(&mut self, payload: &str) -> Result<ScheduledChunk, PlaybackError> {
        let output = match &self.output {
            Some(output) if !output.is_closed() => output.clone(),
            _ => return Err(PlaybackError::OutputReleased),
        };

        let decoded = decode_pcm16(payload)?;
        let native_rate = output.sample_rate();
        let samples = resample_linear(&decoded, self.source_rate, native_rate);
        let duration = samples.len() as f64 / native_rate.max(1) as f64;

        let start = self.cursor.max(output.now());
        let id = self.next_id;
        self.next_id += 1;

        output
            .start(id, samples, start)
            .map_err(|e| PlaybackError::ScheduleFailed(e.to_string()))?;

        let chunk = ScheduledChunk {
            id,
            start,
            duration,
        };
        self.cursor = chunk.end();
        self.outstanding.insert(id, chunk);

        log::debug!(
            "Playback: chunk {} at {:.3}s for {:.3}s ({} outstanding)",
            id,
            start,
            duration,
            self.outstanding.len()
        );

        Ok(chunk)
    }

    /// A chunk finished playing on its own. Returns true if it was outstanding.
    pub fn on_ended(&mut self, id: u64) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    /// Barge-in: stop every outstanding chunk and reset the cursor to now.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.cursor = self.output.as_ref().map(|o| o.now()).unwrap_or(0.0);
        if stopped > 0 {
            log::info!("Playback interrupted, {} chunks stopped", stopped);
        }
        stopped
    }

    fn stop_all(&mut self) -> usize {
        let count = self.outstanding.len();
        if let Some(output) = &self.output {
            for id in self.outstanding.keys() {
                output.stop(*id);
            }
        }
        self.outstanding.clear();
        count
    }

    /// True while any chunk is outstanding.
    pub fn is_speaking(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_attached(&self) -> bool {
        self.output.is_some()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualOutput;
    use super::*;
    use crate::audio::pcm::encode_pcm16;

    /// `ms` milliseconds of silence at 24 kHz.
    fn payload(ms: usize) -> String {
        encode_pcm16(&vec![0i16; 24 * ms])
    }

    fn attached() -> (PlaybackScheduler, Arc<ManualOutput>) {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(24000);
        scheduler.attach(output.clone());
        (scheduler, output)
    }

    #[test]
    fn test_chunks_are_back_to_back() {
        let (mut scheduler, _output) = attached();

        let a = scheduler.enqueue(&payload(100)).unwrap();
        let b = scheduler.enqueue(&payload(50)).unwrap();
        let c = scheduler.enqueue(&payload(200)).unwrap();

        assert_eq!(a.start, 0.0);
        assert!((b.start - a.end()).abs() < 1e-9);
        assert!((c.start - b.end()).abs() < 1e-9);
        assert!((scheduler.cursor() - 0.35).abs() < 1e-9);
        assert!(scheduler.is_speaking());
    }

    #[test]
    fn test_start_never_precedes_clock() {
        let (mut scheduler, output) = attached();
        scheduler.enqueue(&payload(100)).unwrap();

        // The clock runs past the cursor (stream stalled).
        output.advance(0.5);
        let late = scheduler.enqueue(&payload(100)).unwrap();
        assert!((late.start - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_start_times_non_decreasing_without_overlap() {
        let (mut scheduler, output) = attached();
        let mut previous: Option<ScheduledChunk> = None;

        for (i, ms) in [40usize, 10, 80, 20, 60, 5].iter().enumerate() {
            if i % 2 == 1 {
                output.advance(0.03);
            }
            let chunk = scheduler.enqueue(&payload(*ms)).unwrap();
            assert!(chunk.start >= output.now());
            if let Some(prev) = previous {
                assert!(chunk.start >= prev.start);
                assert!(chunk.start >= prev.end() - 1e-9);
            }
            previous = Some(chunk);
        }
    }

    #[test]
    fn test_interrupt_stops_all_outstanding() {
        let (mut scheduler, output) = attached();
        let ids: Vec<u64> = (0..3)
            .map(|_| scheduler.enqueue(&payload(100)).unwrap().id)
            .collect();
        output.advance(0.05);

        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.outstanding(), 0);
        assert!(!scheduler.is_speaking());
        assert!((scheduler.cursor() - 0.05).abs() < 1e-9);

        let stopped = &output.inner.lock().unwrap().stopped;
        assert!(ids.iter().all(|id| stopped.contains(id)));
    }

    #[test]
    fn test_natural_end_clears_speaking() {
        let (mut scheduler, _output) = attached();
        let a = scheduler.enqueue(&payload(10)).unwrap();
        let b = scheduler.enqueue(&payload(10)).unwrap();

        assert!(scheduler.on_ended(a.id));
        assert!(scheduler.is_speaking());
        assert!(scheduler.on_ended(b.id));
        assert!(!scheduler.is_speaking());
        assert!(!scheduler.on_ended(b.id));
    }

    #[test]
    fn test_rejects_after_release_without_decoding() {
        let (mut scheduler, output) = attached();
        scheduler.release();
        // Garbage payload: rejected before decode is attempted.
        assert_eq!(
            scheduler.enqueue("%%%"),
            Err(PlaybackError::OutputReleased)
        );

        let mut scheduler = PlaybackScheduler::new(24000);
        scheduler.attach(output.clone());
        output.close();
        assert_eq!(
            scheduler.enqueue("%%%"),
            Err(PlaybackError::OutputReleased)
        );
    }

    #[test]
    fn test_decode_fault_drops_only_that_chunk() {
        let (mut scheduler, _output) = attached();
        scheduler.enqueue(&payload(10)).unwrap();
        assert!(scheduler.enqueue("%%%").is_err());
        assert_eq!(scheduler.outstanding(), 1);
        assert!(scheduler.enqueue(&payload(10)).is_ok());
    }
}
