//! Telemetry datasets.
//!
//! A dataset follows one register and folds each polled reading into its
//! current value:
//!
//! | Kind       | Current value                                   |
//! |------------|-------------------------------------------------|
//! | `Instant`  | the latest reading                              |
//! | `Average`  | running mean of readings since the last clear   |
//! | `Integral` | trapezoidal area since the last clear, in value·hours |
//!
//! Readings are multiplied by the dataset's `scale` before aggregation.

use std::time::Instant;

use serde::{Deserialize, Serialize};

const SECS_PER_HOUR: f64 = 3600.0;

/// Aggregation applied to the polled readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Instant,
    Average,
    Integral,
}

#[derive(Debug, Clone, PartialEq)]
enum Accumulator {
    Instant,
    Average { count: u64, sum: f64 },
    Integral { last: Option<(Instant, f64)>, sum: f64 },
}

impl Accumulator {
    fn for_kind(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Instant => Accumulator::Instant,
            DatasetKind::Average => Accumulator::Average { count: 0, sum: 0.0 },
            DatasetKind::Integral => Accumulator::Integral { last: None, sum: 0.0 },
        }
    }
}

/// A named telemetry aggregate fed from one register.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    kind: DatasetKind,
    register: u16,
    scale: f64,
    current: Option<f64>,
    acc: Accumulator,
}

impl Dataset {
    pub fn new(name: impl Into<String>, kind: DatasetKind, register: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            register,
            scale: 1.0,
            current: None,
            acc: Accumulator::for_kind(kind),
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn register(&self) -> u16 {
        self.register
    }

    /// Current value, or `None` before the first reading or after
    /// [`invalidate`](Self::invalidate).
    pub fn current(&self) -> Option<f64> {
        self.current
    }

    /// Folds one raw register reading taken at `at` into the aggregate.
    pub fn update(&mut self, raw: f64, at: Instant) {
        let value = raw * self.scale;
        self.current = Some(match &mut self.acc {
            Accumulator::Instant => value,
            Accumulator::Average { count, sum } => {
                *count += 1;
                *sum += value;
                *sum / *count as f64
            }
            Accumulator::Integral { last, sum } => {
                if let Some((t0, v0)) = *last {
                    let hours = at.saturating_duration_since(t0).as_secs_f64() / SECS_PER_HOUR;
                    *sum += (v0 + value) / 2.0 * hours;
                }
                *last = Some((at, value));
                *sum
            }
        });
    }

    /// Marks the current value unknown after the register source went
    /// silent.  An integral also forgets its last point so the outage is not
    /// integrated.
    pub fn invalidate(&mut self) {
        self.current = None;
        if let Accumulator::Integral { last, .. } = &mut self.acc {
            *last = None;
        }
    }

    /// Starts a new accumulation interval.
    ///
    /// Averages restart from zero readings.  Integrals restart from zero area
    /// but keep their last point, so the next reading integrates from it.
    pub fn clear(&mut self) {
        match &mut self.acc {
            Accumulator::Instant => {}
            Accumulator::Average { count, sum } => {
                *count = 0;
                *sum = 0.0;
                self.current = None;
            }
            Accumulator::Integral { last, sum } => {
                *sum = 0.0;
                self.current = last.map(|_| 0.0);
            }
        }
    }
}
