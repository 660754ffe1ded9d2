use tokio::time::{Duration, Instant};

/// Which timer the next beat comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPhase {
    /// One-shot jittered delay after Hello
    Initial,
    /// Fixed cadence after the first beat
    Recurring,
}

/// Two-phase heartbeat schedule for one socket.
///
/// The first beat fires `jitter * interval` after Hello, every later beat
/// `interval` after the previous one. Dropping the scheduler cancels both
/// phases at once.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    interval: Duration,
    phase: HeartbeatPhase,
    next_beat: Instant,

    /// Time the last beat (scheduled or requested) went out
    last_sent: Option<Instant>,

    /// Round trip of the last acknowledged beat
    latency: Option<Duration>,
}

impl HeartbeatScheduler {
    /// Start a schedule with a random jitter in `[0, 1)`
    pub fn new(interval: Duration) -> Self {
        Self::with_jitter(interval, rand::random::<f64>())
    }

    /// Start a schedule with an explicit jitter factor (clamped to `[0, 1]`)
    pub fn with_jitter(interval: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            interval,
            phase: HeartbeatPhase::Initial,
            next_beat: Instant::now() + interval.mul_f64(jitter),
            last_sent: None,
            latency: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn phase(&self) -> HeartbeatPhase {
        self.phase
    }

    /// Deadline of the next scheduled beat
    pub fn next_beat(&self) -> Instant {
        self.next_beat
    }

    /// Get time until the next scheduled beat
    pub fn time_until_next_beat(&self) -> Duration {
        self.next_beat.saturating_duration_since(Instant::now())
    }

    /// Record a scheduled beat and move to the recurring phase
    pub fn record_sent(&mut self) {
        let now = Instant::now();
        self.last_sent = Some(now);
        self.phase = HeartbeatPhase::Recurring;
        self.next_beat = now + self.interval;
    }

    /// Record a beat the server asked for; the cadence is unchanged
    pub fn record_requested(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// Skip the beat that just came due without sending (missed-ack path)
    pub fn skip(&mut self) {
        self.phase = HeartbeatPhase::Recurring;
        self.next_beat = Instant::now() + self.interval;
    }

    /// Record an acknowledgement, returning the measured round trip
    pub fn record_ack(&mut self) -> Option<Duration> {
        let rtt = self.last_sent.map(|sent| sent.elapsed());
        if rtt.is_some() {
            self.latency = rtt;
        }
        rtt
    }

    /// Round trip of the last acknowledged beat
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
