use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Idle,
    Absolute,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Idle => "idle",
            TimeoutKind::Absolute => "absolute",
        }
    }
}

/// Idle and absolute deadlines for the in-flight sync. Deadlines are plain
/// instants; the owner sleeps until [`SyncTimers::next_deadline`] and then
/// asks [`SyncTimers::expired`].
#[derive(Debug, Clone, Default)]
pub struct SyncTimers {
    idle: Option<Instant>,
    absolute: Option<Instant>,
}

impl SyncTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_absolute(&mut self, now: Instant, after: Duration) {
        self.absolute = Some(now + after);
    }

    pub fn arm_idle(&mut self, now: Instant, after: Duration) {
        self.idle = Some(now + after);
    }

    pub fn disarm_idle(&mut self) {
        self.idle = None;
    }

    pub fn cancel(&mut self) {
        self.idle = None;
        self.absolute = None;
    }

    pub fn is_armed(&self) -> bool {
        self.idle.is_some() || self.absolute.is_some()
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.idle, self.absolute) {
            (Some(idle), Some(absolute)) => Some(idle.min(absolute)),
            (idle, absolute) => idle.or(absolute),
        }
    }

    /// The absolute deadline wins when both have passed.
    pub fn expired(&self, now: Instant) -> Option<TimeoutKind> {
        if self.absolute.is_some_and(|deadline| deadline <= now) {
            return Some(TimeoutKind::Absolute);
        }
        if self.idle.is_some_and(|deadline| deadline <= now) {
            return Some(TimeoutKind::Idle);
        }
        None
    }
}
