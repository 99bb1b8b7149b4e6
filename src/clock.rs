use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Poisson};

/// Monotonic time source anchored at run start.
///
/// All lifecycle timestamps are `f64` seconds since this anchor, so records
/// are comparable across workers without clock skew. The wall-clock anchor is
/// captured once so stage envelopes can be translated to unix time for
/// Prometheus query evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
    origin_unix: f64,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            origin_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Seconds elapsed since run start. Monotonic.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Translate a run-relative timestamp to unix seconds.
    pub fn to_unix(&self, t: f64) -> f64 {
        self.origin_unix + t
    }

    /// Sleep until the given run-relative deadline. Returns immediately if
    /// the deadline has already passed.
    pub async fn sleep_until(&self, t: f64) {
        let now = self.now();
        if t > now {
            tokio::time::sleep(std::time::Duration::from_secs_f64(t - now)).await;
        }
    }
}

/// A lazy sequence of run-relative dispatch deadlines for one stage.
///
/// Generators yield absolute (run-relative) times; the scheduler sleeps until
/// each deadline before taking the next descriptor. Constant and Poisson
/// schedules draw exponential inter-arrival gaps so arrivals keep the
/// micro-structure of real traffic instead of marching in lock-step.
pub enum Schedule {
    Constant(ConstantSchedule),
    Poisson(PoissonSchedule),
    Trace(TraceSchedule),
}

impl Iterator for Schedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        match self {
            Schedule::Constant(s) => s.next(),
            Schedule::Poisson(s) => s.next(),
            Schedule::Trace(s) => s.next(),
        }
    }
}

/// Exactly `floor(rate * duration)` arrivals over `[start, start + duration]`.
///
/// Inter-arrival gaps are drawn from Exp(rate) and then rescaled so their sum
/// equals the duration: the stage ends on time while individual gaps stay
/// exponentially distributed.
pub struct ConstantSchedule {
    times: std::vec::IntoIter<f64>,
}

impl ConstantSchedule {
    pub fn new(rate: f64, duration: f64, start: f64, rng: &mut StdRng) -> Self {
        let num_requests = (rate * duration) as usize;
        if num_requests == 0 {
            return Self {
                times: Vec::new().into_iter(),
            };
        }

        let exp = Exp::new(rate).expect("rate must be positive");
        let intervals: Vec<f64> = (0..num_requests).map(|_| exp.sample(rng)).collect();
        let total: f64 = intervals.iter().sum();
        let scale = duration / total;

        let mut times = Vec::with_capacity(num_requests);
        let mut next = start;
        for interval in intervals {
            next += interval * scale;
            times.push(next);
        }

        Self {
            times: times.into_iter(),
        }
    }
}

impl Iterator for ConstantSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        self.times.next()
    }
}

/// Poisson arrivals: at each one-second boundary draw `k ~ Poisson(rate)` and
/// spread the k arrivals over that second with the constant-rate procedure.
/// Unbounded; the scheduler cuts it off at the stage deadline.
pub struct PoissonSchedule {
    rate: f64,
    next_second: f64,
    pending: VecDeque<f64>,
    rng: StdRng,
}

impl PoissonSchedule {
    pub fn new(rate: f64, start: f64, rng: &mut StdRng) -> Self {
        Self {
            rate,
            next_second: start,
            pending: VecDeque::new(),
            rng: StdRng::from_seed(rng.gen()),
        }
    }
}

impl Iterator for PoissonSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        loop {
            if let Some(t) = self.pending.pop_front() {
                return Some(t);
            }

            let poisson = Poisson::new(self.rate).expect("rate must be positive");
            let count = poisson.sample(&mut self.rng) as u64;
            if count < 1 {
                self.next_second += 1.0;
                continue;
            }

            let second =
                ConstantSchedule::new(count as f64, 1.0, self.next_second, &mut self.rng);
            self.pending.extend(second);
            self.next_second += 1.0;
        }
    }
}

/// Replays inter-arrival offsets from a trace, normalized so the first
/// arrival lands at the stage start. Cycles indefinitely; each full pass is
/// shifted by the trace span so deadlines stay monotonic.
pub struct TraceSchedule {
    offsets: Vec<f64>,
    span: f64,
    start: f64,
    index: usize,
    cycle: u64,
}

impl TraceSchedule {
    pub fn new(timestamps: &[f64], start: f64) -> Self {
        let first = timestamps.first().copied().unwrap_or(0.0);
        let offsets: Vec<f64> = timestamps.iter().map(|t| t - first).collect();
        // Span of one full cycle: last offset plus the mean gap, so the
        // wrap-around gap looks like a typical one.
        let last = offsets.last().copied().unwrap_or(0.0);
        let mean_gap = if offsets.len() > 1 {
            last / (offsets.len() - 1) as f64
        } else {
            1.0
        };
        Self {
            offsets,
            span: last + mean_gap,
            start,
            index: 0,
            cycle: 0,
        }
    }
}

impl Iterator for TraceSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.offsets.is_empty() {
            return None;
        }
        let t = self.start + self.cycle as f64 * self.span + self.offsets[self.index];
        self.index += 1;
        if self.index >= self.offsets.len() {
            self.index = 0;
            self.cycle += 1;
        }
        Some(t)
    }
}
