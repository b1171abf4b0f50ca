//! Time-aligned acquisition loop.
//!
//! Two clocks are involved:
//! - video time: the position inside a recorded stream, advanced by exactly one
//!   interval per sample
//! - wall time: when the sample is actually taken, paced so that sample `n`
//!   starts no earlier than `start + n * interval`
//!
//! A cycle that overruns its slot is not compensated for. The next sample
//! starts as soon as the previous one finishes and still reads the next video
//! position, so video time never skips ahead to catch up with wall time.

use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::formatter::PayloadFormatter;
use crate::frame::CapturedFrame;
use crate::ingest::{stream_duration, FrameSource, NextFrame};
use crate::metadata::{Metadata, MetadataEnricher};
use crate::sensor::ObservationSource;
use crate::transport::{PublishOutcome, TelemetrySink};
use crate::unix_now;

/// Tolerance for comparing accumulated video positions with stream length.
const TIME_EPSILON: f64 = 1e-9;

/// Longest single wait; far deadlines are slept in slices of this size.
const MAX_WAIT_SECS: f64 = 3600.0;

/// Cooperative cancellation shared between the driver and the loop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`. Returns true if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Wall-clock abstraction so pacing can be tested without sleeping.
pub trait Clock: Send + Sync {
    /// Unix seconds.
    fn now(&self) -> f64;

    /// Sleep until `deadline` (unix seconds). Returns false if `stop` fired first.
    fn sleep_until(&self, deadline: f64, stop: &StopSignal) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        unix_now()
    }

    fn sleep_until(&self, deadline: f64, stop: &StopSignal) -> bool {
        loop {
            if stop.is_stopped() {
                return false;
            }
            let remaining = deadline - self.now();
            if remaining <= 0.0 {
                return true;
            }
            if stop.wait_timeout(Duration::from_secs_f64(remaining.min(MAX_WAIT_SECS))) {
                return false;
            }
        }
    }
}

/// One scheduled sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// 1-based sample number.
    pub index: u64,
    /// Target position in the stream, seconds.
    pub video_time: f64,
    /// Earliest wall time at which the sample may start.
    pub deadline: f64,
}

/// Progress through the schedule.
#[derive(Clone, Debug)]
pub struct ScheduleState {
    pub start_wall_time: f64,
    /// Samples issued so far.
    pub sample_index: u64,
    pub interval_seconds: f64,
    /// `None` for live sources, which have no end.
    pub stream_duration_seconds: Option<f64>,
}

impl ScheduleState {
    pub fn new(start_wall_time: f64, interval_seconds: f64, duration: Option<f64>) -> Self {
        Self {
            start_wall_time,
            sample_index: 0,
            interval_seconds,
            stream_duration_seconds: duration,
        }
    }

    /// Issue the next sample, or `None` once its video time passes the end.
    pub fn advance(&mut self) -> Option<Sample> {
        let index = self.sample_index + 1;
        let offset = index as f64 * self.interval_seconds;
        if let Some(duration) = self.stream_duration_seconds {
            if offset > duration + TIME_EPSILON {
                return None;
            }
        }
        self.sample_index = index;
        Some(Sample {
            index,
            video_time: offset,
            deadline: self.start_wall_time + offset,
        })
    }
}

/// Downstream stages a cycle feeds.
pub struct Pipeline<'a> {
    pub observations: &'a dyn ObservationSource,
    pub enricher: &'a MetadataEnricher,
    pub formatter: &'a PayloadFormatter,
    pub sink: &'a dyn TelemetrySink,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Samples attempted.
    pub cycles: u64,
    /// Payloads handed to the sink and accepted.
    pub submitted: u64,
    /// Payloads the sink refused or dropped.
    pub dropped: u64,
    /// Cycles skipped before a payload existed (no frame, no reading, encode error).
    pub skipped: u64,
    pub stopped: bool,
    pub last_video_time: Option<f64>,
    /// Frames the source decoded over the run.
    pub frames_read: u64,
}

/// Seek to `target_seconds` and decode that frame.
///
/// Returns `None` past the end of the stream, for live sources, or when the
/// seek or decode fails. Never errors.
pub fn capture_at(source: &mut dyn FrameSource, target_seconds: f64) -> Option<CapturedFrame> {
    let total = source.total_frames()?;
    let duration = stream_duration(source);
    if total == 0
        || !target_seconds.is_finite()
        || target_seconds < 0.0
        || target_seconds > duration + TIME_EPSILON
    {
        return None;
    }

    let index = ((target_seconds * source.fps() + TIME_EPSILON).floor() as u64).min(total - 1);
    if let Err(e) = source.seek_to_index(index) {
        log::warn!("seek to {:.3}s (frame {}) failed: {:#}", target_seconds, index, e);
        return None;
    }
    match source.read_next() {
        Ok(NextFrame::Frame(frame)) => Some(frame.with_video_timestamp(target_seconds)),
        Ok(NextFrame::EndOfStream) => None,
        Err(e) => {
            log::warn!("decode at {:.3}s (frame {}) failed: {:#}", target_seconds, index, e);
            None
        }
    }
}

pub struct AcquisitionScheduler {
    interval: f64,
    clock: Arc<dyn Clock>,
}

impl AcquisitionScheduler {
    pub fn new(interval_seconds: f64) -> Result<Self> {
        Self::with_clock(interval_seconds, Arc::new(SystemClock))
    }

    pub fn with_clock(interval_seconds: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        if !interval_seconds.is_finite() || interval_seconds <= 0.0 {
            return Err(anyhow!(
                "acquisition interval must be a positive number of seconds, got {}",
                interval_seconds
            ));
        }
        Ok(Self {
            interval: interval_seconds,
            clock,
        })
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Drive `source` through the pipeline until the stream ends, `stop`
    /// fires, or the observation reader runs out of credentials.
    ///
    /// The source is closed on every exit path.
    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        pipeline: &Pipeline<'_>,
        stop: &StopSignal,
    ) -> Result<RunSummary> {
        let mut result = self.run_inner(source, pipeline, stop);
        let stats = source.stats();
        source.close();
        if let Ok(summary) = &mut result {
            summary.frames_read = stats.frames_captured;
            log::info!(
                "acquisition finished: cycles={} submitted={} dropped={} skipped={} stopped={} frames_read={} source={}",
                summary.cycles,
                summary.submitted,
                summary.dropped,
                summary.skipped,
                summary.stopped,
                summary.frames_read,
                stats.source
            );
        }
        result
    }

    fn run_inner(
        &self,
        source: &mut dyn FrameSource,
        pipeline: &Pipeline<'_>,
        stop: &StopSignal,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let live = source.total_frames().is_none();
        let duration = if live {
            None
        } else {
            let duration = stream_duration(source);
            if duration <= 0.0 {
                log::warn!(
                    "stream {} has no usable duration; nothing to capture",
                    source.describe()
                );
                return Ok(summary);
            }
            Some(duration)
        };

        let mut schedule = ScheduleState::new(self.clock.now(), self.interval, duration);
        log::info!(
            "acquisition started: source={} interval={}s duration={}",
            source.describe(),
            self.interval,
            duration
                .map(|d| format!("{:.3}s", d))
                .unwrap_or_else(|| "live".to_string())
        );

        loop {
            if stop.is_stopped() {
                summary.stopped = true;
                break;
            }
            let Some(sample) = schedule.advance() else {
                log::info!("end of stream reached after {} samples", schedule.sample_index);
                break;
            };
            if !self.clock.sleep_until(sample.deadline, stop) {
                summary.stopped = true;
                break;
            }
            let lag = self.clock.now() - sample.deadline;
            if lag > self.interval {
                log::debug!("sample {} started {:.3}s late", sample.index, lag);
            }

            summary.cycles += 1;
            let frame = if live {
                match source.read_next() {
                    Ok(NextFrame::Frame(frame)) => Some(frame),
                    Ok(NextFrame::EndOfStream) => {
                        log::info!("live source {} ended", source.describe());
                        break;
                    }
                    Err(e) => {
                        log::warn!("sample {}: read failed: {:#}", sample.index, e);
                        None
                    }
                }
            } else {
                capture_at(source, sample.video_time)
            };
            let Some(frame) = frame else {
                log::warn!("sample {}: no frame, skipping", sample.index);
                summary.skipped += 1;
                continue;
            };
            if frame.video_timestamp_sec.is_some() {
                summary.last_video_time = frame.video_timestamp_sec;
            }

            match self.cycle(sample, frame, pipeline)? {
                Some(PublishOutcome::Queued) => summary.submitted += 1,
                Some(_) => summary.dropped += 1,
                None => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    /// Observation, enrichment, formatting and hand-off for one frame.
    /// `Ok(None)` marks a skipped cycle; `Err` only for exhausted credentials.
    fn cycle(
        &self,
        sample: Sample,
        frame: CapturedFrame,
        pipeline: &Pipeline<'_>,
    ) -> Result<Option<PublishOutcome>> {
        let observation = match pipeline.observations.read() {
            Ok(observation) => observation,
            Err(e) if e.is_fatal() => {
                return Err(e).context("observation reader cannot authenticate");
            }
            Err(e) => {
                log::warn!("sample {}: observation unavailable: {}", sample.index, e);
                return Ok(None);
            }
        };

        let metadata = pipeline.enricher.enrich(&frame, Metadata::new());
        let payload = match pipeline.formatter.format(&frame, observation, metadata) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("sample {}: formatting failed: {:#}", sample.index, e);
                return Ok(None);
            }
        };
        drop(frame);

        let outcome = pipeline.sink.submit(payload);
        log::debug!("sample {} at {:.3}s: {:?}", sample.index, sample.video_time, outcome);
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FileConfig, FileSource};
    use std::time::Instant;

    fn stub(fps: f64, frames: u64) -> FileSource {
        let mut source = FileSource::new(FileConfig {
            path: "stub://clip".to_string(),
            fps,
            frames,
            width: 4,
            height: 4,
        })
        .expect("stub");
        source.open().expect("open");
        source
    }

    #[test]
    fn non_positive_intervals_are_rejected() {
        assert!(AcquisitionScheduler::new(0.0).is_err());
        assert!(AcquisitionScheduler::new(-1.0).is_err());
        assert!(AcquisitionScheduler::new(f64::NAN).is_err());
        assert!(AcquisitionScheduler::new(0.25).is_ok());
    }

    #[test]
    fn schedule_ends_after_duration() {
        let mut state = ScheduleState::new(100.0, 0.5, Some(2.0));
        let samples: Vec<Sample> = std::iter::from_fn(|| state.advance()).collect();
        let times: Vec<f64> = samples.iter().map(|s| s.video_time).collect();
        assert_eq!(times, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(samples[0].index, 1);
        assert_eq!(samples[3].deadline, 102.0);
    }

    #[test]
    fn accumulated_intervals_reach_the_last_frame() {
        let mut state = ScheduleState::new(0.0, 0.1, Some(0.3));
        assert_eq!(std::iter::from_fn(|| state.advance()).count(), 3);
    }

    #[test]
    fn capture_at_maps_time_to_frame_index() {
        let mut source = stub(10.0, 20);
        let frame = capture_at(&mut source, 0.75).expect("frame");
        assert_eq!(frame.index, 7);
        assert_eq!(frame.video_timestamp_sec, Some(0.75));

        // End of stream clamps to the last frame.
        let last = capture_at(&mut source, 2.0).expect("last frame");
        assert_eq!(last.index, 19);
    }

    #[test]
    fn capture_beyond_duration_is_none() {
        let mut source = stub(10.0, 20);
        assert!(capture_at(&mut source, 2.01).is_none());
        assert!(capture_at(&mut source, -0.1).is_none());
    }

    #[test]
    fn capture_on_live_source_is_none() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://live".to_string(),
            ..FileConfig::default()
        })
        .expect("live");
        source.open().expect("open");
        assert!(capture_at(&mut source, 0.0).is_none());
    }

    #[test]
    fn stop_signal_interrupts_system_sleep() {
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.stop();
        });
        let started = Instant::now();
        let completed = SystemClock.sleep_until(unix_now() + 10.0, &stop);
        handle.join().unwrap();
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stop.is_stopped());
    }

    #[test]
    fn far_deadlines_wait_in_bounded_slices() {
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let sleeper = std::thread::spawn({
            let stop = stop.clone();
            move || SystemClock.sleep_until(unix_now() + 1e20, &stop)
        });
        std::thread::sleep(Duration::from_millis(20));
        trigger.stop();
        let completed = sleeper.join().expect("sleep must not panic");
        assert!(!completed);
    }

    #[test]
    fn past_deadlines_do_not_sleep() {
        let stop = StopSignal::new();
        assert!(SystemClock.sleep_until(unix_now() - 1.0, &stop));
    }
}
