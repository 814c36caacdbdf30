//! Progress reporting: the per-job sink, the bounded queue that decouples it
//! from the pipeline, rate limiting, and parsing of the encoder's progress feed.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::job::{JobId, JobOutcome, JobState};

/// Receiver of one job's progress and terminal outcome.
///
/// Calls arrive from a dedicated forwarding task, so a slow sink only backs up
/// that job's bounded queue; it never stalls a transfer or the encoder.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, job: JobId, stage: JobState, fraction: f64);
    fn on_finished(&self, job: JobId, outcome: &JobOutcome);
}

/// Sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _job: JobId, _stage: JobState, _fraction: f64) {}
    fn on_finished(&self, _job: JobId, _outcome: &JobOutcome) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub job: JobId,
    pub stage: JobState,
    pub fraction: f64,
}

/// Producer side of a job's progress queue.
///
/// Fractions are clamped so that within one stage they never go backwards.
/// Intermediate updates are dropped when the queue is full; stage completion
/// always gets through.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job: JobId,
    tx: mpsc::Sender<ProgressUpdate>,
    last: Arc<Mutex<Option<(JobState, f64)>>>,
}

impl ProgressReporter {
    /// Create a reporter and the task forwarding its updates to `sink`.
    ///
    /// The task ends once every clone of the reporter is dropped, after
    /// delivering whatever is still queued.
    pub fn spawn(job: JobId, sink: Arc<dyn ProgressSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(capacity.max(1));
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                sink.on_progress(update.job, update.stage, update.fraction);
            }
        });

        let reporter = Self {
            job,
            tx,
            last: Arc::new(Mutex::new(None)),
        };
        (reporter, forwarder)
    }

    fn advance(last: &mut Option<(JobState, f64)>, stage: JobState, fraction: f64) -> f64 {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        let value = match *last {
            Some((prev_stage, prev)) if prev_stage == stage => prev.max(fraction),
            _ => fraction,
        };
        *last = Some((stage, value));
        value
    }

    /// Best-effort update; returns the fraction actually recorded
    pub fn report(&self, stage: JobState, fraction: f64) -> f64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let value = Self::advance(&mut last, stage, fraction);
        let update = ProgressUpdate {
            job: self.job,
            stage,
            fraction: value,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(update) {
            debug!("Job {}: progress queue full, dropping {:?} {:.3}", self.job, stage, value);
        }
        value
    }

    /// Mark `stage` complete; waits for queue space so this update is never lost
    pub async fn complete(&self, stage: JobState) -> f64 {
        let permit = match self.tx.reserve().await {
            Ok(permit) => permit,
            // forwarder gone, nothing left to deliver to
            Err(_) => return 1.0,
        };
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let value = Self::advance(&mut last, stage, 1.0);
        permit.send(ProgressUpdate {
            job: self.job,
            stage,
            fraction: value,
        });
        value
    }
}

/// Time-based debounce for progress callbacks
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// True at most once per interval; the first call always passes
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Incremental parser for ffmpeg's diagnostic stream.
///
/// Understands the `Duration:` banner line, `-progress` key/value output
/// (`out_time_us`, `out_time_ms`, `out_time`, `progress=end`) and classic
/// `time=HH:MM:SS.xx` stats lines. Anything else is ignored.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_secs: Option<f64>,
    last: f64,
}

impl ProgressParser {
    pub fn new(total: Option<Duration>) -> Self {
        Self {
            total_secs: total.map(|d| d.as_secs_f64()).filter(|t| *t > 0.0),
            last: 0.0,
        }
    }

    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    /// Feed one line; returns a new fraction when progress moved forward
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("Duration:") {
            if self.total_secs.is_none() {
                let stamp = rest.split(',').next().unwrap_or("").trim();
                self.total_secs = parse_timestamp(stamp).filter(|t| *t > 0.0);
            }
            return None;
        }

        if line == "progress=end" {
            return self.advance_to(1.0);
        }

        let elapsed = match line.split_once('=') {
            // ffmpeg reports out_time_ms in microseconds as well
            Some(("out_time_us" | "out_time_ms", value)) => value
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|us| *us >= 0)
                .map(|us| us as f64 / 1_000_000.0),
            Some(("out_time", value)) => parse_timestamp(value.trim()),
            _ => line
                .split_whitespace()
                .find_map(|token| token.strip_prefix("time="))
                .and_then(parse_timestamp),
        }?;

        let total = self.total_secs?;
        self.advance_to(elapsed / total)
    }

    fn advance_to(&mut self, fraction: f64) -> Option<f64> {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.last {
            self.last = fraction;
            Some(fraction)
        } else {
            None
        }
    }
}

/// Parse `HH:MM:SS(.frac)` into seconds; negative or malformed stamps yield `None`
pub fn parse_timestamp(stamp: &str) -> Option<f64> {
    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}
