//! Per-second rate computation between successive counter samples.
//!
//! A counter-based agent keeps one [`DeltaTracker`] alive across gathers.
//! The tracker stores the previous raw sample with its capture time and, on
//! the next update, turns every counter into `(current - previous) / Δt`
//! where `Δt` is the wall-clock time between the two captures.
//!
//! Counter wraparound is not corrected: a counter that goes backwards (for
//! example after a device reset) yields a negative rate.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Raw counter values of one entity (a core, a device, an interface).
pub type Counters = HashMap<String, f64>;

/// Decimal places kept for rates derived from tick counters (CPU jiffies).
pub const TICK_PRECISION: u32 = 1;

/// Decimal places kept for rates of bytes, packets and operations.
pub const COUNT_PRECISION: u32 = 0;

/// Whether a raw field is a monotonically increasing counter or an
/// instantaneous gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Counter,
    Gauge,
}

/// Rounds half away from negative infinity (`floor(x * 10^p + 0.5)`).
///
/// # Examples
///
/// ```
/// use oxprobe_collector::delta::round_half_up;
///
/// assert_eq!(round_half_up(2.25, 1), 2.3);
/// assert_eq!(round_half_up(2.5, 0), 3.0);
/// assert_eq!(round_half_up(-2.5, 0), -2.0);
/// ```
pub fn round_half_up(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale + 0.5).floor() / scale
}

/// Computes rounded per-second rates for every field present in both
/// samples. Returns an empty map unless `elapsed_secs` is positive.
pub fn rates(previous: &Counters, current: &Counters, elapsed_secs: f64, precision: u32) -> Counters {
    if !(elapsed_secs > 0.0) {
        return Counters::new();
    }
    current
        .iter()
        .filter_map(|(field, now)| {
            let before = previous.get(field)?;
            Some((
                field.clone(),
                round_half_up((now - before) / elapsed_secs, precision),
            ))
        })
        .collect()
}

/// Retains the previous sample of a set of entities and produces rates.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    precision: u32,
    previous: Option<(HashMap<String, Counters>, DateTime<Utc>)>,
}

impl DeltaTracker {
    pub fn new(precision: u32) -> Self {
        Self {
            precision,
            previous: None,
        }
    }

    /// True once a sample has been recorded.
    pub fn is_warm(&self) -> bool {
        self.previous.is_some()
    }

    /// Records `current` taken at `at` and returns rates against the prior
    /// sample. The first call returns an empty map. Entities missing from
    /// either sample are omitted.
    pub fn update(
        &mut self,
        current: HashMap<String, Counters>,
        at: DateTime<Utc>,
    ) -> HashMap<String, Counters> {
        let out = match &self.previous {
            Some((previous, then)) => {
                let elapsed = elapsed_secs(*then, at);
                current
                    .iter()
                    .filter_map(|(entity, counters)| {
                        let before = previous.get(entity)?;
                        Some((entity.clone(), rates(before, counters, elapsed, self.precision)))
                    })
                    .collect()
            }
            None => HashMap::new(),
        };
        self.previous = Some((current, at));
        out
    }

    /// Single-entity form of [`DeltaTracker::update`].
    pub fn update_one(&mut self, current: Counters, at: DateTime<Utc>) -> Option<Counters> {
        let mut all = HashMap::new();
        all.insert(String::new(), current);
        self.update(all, at).remove("")
    }
}

fn elapsed_secs(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let delta = now - then;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}
