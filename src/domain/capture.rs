//! Timed capture sequences ("take N exposures, one every D seconds").

use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturePlan {
    pub takes: u32,
    pub interval: Duration,
}

impl CapturePlan {
    pub fn new(takes: u32, interval: Duration) -> Self {
        Self { takes, interval }
    }

    /// Negative or non-finite intervals collapse to zero.
    pub fn from_secs(takes: u32, interval_secs: f64) -> Self {
        let interval = Duration::try_from_secs_f64(interval_secs).unwrap_or(Duration::ZERO);
        Self::new(takes, interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProgress {
    pub completed: u32,
    pub total: u32,
}

impl CaptureProgress {
    /// "Stop (3/10)"
    pub fn label(&self) -> String {
        format!("Stop ({}/{})", self.completed, self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed { takes: u32 },
    Cancelled { completed: u32 },
}

/// Iteration state for a capture plan. The loop driving it owns the I/O;
/// this only tracks how far along it is and waits out intervals.
#[derive(Debug)]
pub struct CaptureSequence {
    plan: CapturePlan,
    completed: u32,
    cancel: CancellationToken,
}

impl CaptureSequence {
    pub fn new(plan: CapturePlan, cancel: CancellationToken) -> Self {
        Self {
            plan,
            completed: 0,
            cancel,
        }
    }

    /// Whether another take should be issued. Checked at every iteration boundary.
    pub fn should_continue(&self) -> bool {
        !self.cancel.is_cancelled() && self.completed < self.plan.takes
    }

    pub fn record_take(&mut self) -> CaptureProgress {
        self.completed += 1;
        self.progress()
    }

    pub fn progress(&self) -> CaptureProgress {
        CaptureProgress {
            completed: self.completed,
            total: self.plan.takes,
        }
    }

    /// Sleep until the next take is due. Returns false if cancelled while waiting.
    pub async fn wait_interval(&self) -> bool {
        if self.completed >= self.plan.takes {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.plan.interval) => true,
        }
    }

    pub fn outcome(&self) -> CaptureOutcome {
        if self.completed >= self.plan.takes {
            CaptureOutcome::Completed {
                takes: self.completed,
            }
        } else {
            CaptureOutcome::Cancelled {
                completed: self.completed,
            }
        }
    }
}
