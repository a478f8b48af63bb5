use crate::domain::models::whole_seconds_between;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ElapsedReading {
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub display: String,
    pub status: TimerStatus,
}

/// Elapsed time derived from a persisted start instant.
///
/// Nothing is counted locally: every reading is `now - started_at`, so a clock armed
/// after a reload or a device sleep reports the same value as one that never stopped.
/// Pausing only freezes the display refresh; the start instant is never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElapsedClock {
    started_at: Option<DateTime<Utc>>,
    paused: bool,
}

impl ElapsedClock {
    pub fn armed_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            paused: false,
        }
    }

    pub fn arm(&mut self, started_at: DateTime<Utc>) {
        self.started_at = Some(started_at);
        self.paused = false;
    }

    pub fn disarm(&mut self) {
        self.started_at = None;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        if self.started_at.is_some() {
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn is_armed(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn status(&self) -> Option<TimerStatus> {
        self.started_at.map(|_| {
            if self.paused {
                TimerStatus::Paused
            } else {
                TimerStatus::Running
            }
        })
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        self.started_at
            .map(|started_at| whole_seconds_between(started_at, now).unsigned_abs())
    }

    pub fn reading(&self, now: DateTime<Utc>) -> Option<ElapsedReading> {
        let started_at = self.started_at?;
        let status = self.status()?;
        let elapsed_seconds = whole_seconds_between(started_at, now).unsigned_abs();
        Some(ElapsedReading {
            started_at,
            elapsed_seconds,
            display: format_elapsed(elapsed_seconds),
            status,
        })
    }
}

/// `Nh Mmin` from one hour up, `M:SS` below. Always rounds down.
pub fn format_elapsed(elapsed_seconds: u64) -> String {
    let hours = elapsed_seconds / 3600;
    let minutes = (elapsed_seconds % 3600) / 60;
    let seconds = elapsed_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}min")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Publishes a fresh [`ElapsedReading`] on a fixed cadence until stopped.
///
/// The first reading goes out immediately. `publish` returning `false` ends the task,
/// and dropping the ticker aborts it.
#[derive(Debug)]
pub struct ElapsedTicker {
    handle: JoinHandle<()>,
}

impl ElapsedTicker {
    /// Returns `None` outside a tokio runtime; readings stay available on demand.
    pub fn spawn<F>(
        clock: ElapsedClock,
        now_provider: NowProvider,
        cadence: Duration,
        publish: F,
    ) -> Option<Self>
    where
        F: Fn(Option<ElapsedReading>) -> bool + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !publish(clock.reading((now_provider)())) {
                    break;
                }
            }
        });
        Some(Self { handle })
    }
}

impl Drop for ElapsedTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
