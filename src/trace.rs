//! Forward-pass timing trace.
//!
//! Provides observability into the model's forward phases for empirical
//! analysis. Disabled by default; enabling it costs one mutex lock per
//! recorded phase.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

/// The phases of one forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceStep {
    /// Source encoding
    Encode,
    /// Target re-encoding for the variational posterior
    TargetEncode,
    /// Decoder unrolling (teacher-forced or greedy)
    Decode,
    /// Extended-vocabulary output projection
    Project,
    /// Beam expansion and pruning
    BeamExpand,
    /// Loss masking and reduction
    Loss,
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single timing measurement.
#[derive(Debug, Clone)]
pub struct TraceMeasurement {
    pub step: TraceStep,
    pub duration: Duration,
}

/// Thread-safe collector for phase timings.
pub struct Tracer {
    measurements: Mutex<Vec<TraceMeasurement>>,
    enabled: Mutex<bool>,
}

impl Tracer {
    /// Create a new tracer, disabled by default.
    pub fn new() -> Self {
        Self {
            measurements: Mutex::new(Vec::new()),
            enabled: Mutex::new(false),
        }
    }

    /// Enable or disable recording.
    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner) = enabled;
    }

    /// Whether recording is currently enabled.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one measurement if enabled.
    pub fn record(&self, step: TraceStep, duration: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TraceMeasurement { step, duration });
    }

    /// Total recorded time per step.
    pub fn totals(&self) -> HashMap<TraceStep, Duration> {
        let measurements = self
            .measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut totals: HashMap<TraceStep, Duration> = HashMap::new();
        for m in measurements.iter() {
            *totals.entry(m.step).or_default() += m.duration;
        }
        totals
    }

    /// Number of recorded measurements.
    pub fn len(&self) -> usize {
        self.measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all recorded measurements.
    pub fn clear(&self) {
        self.measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: LazyLock<Tracer> = LazyLock::new(Tracer::new);

/// The process-wide tracer instance.
pub fn global() -> &'static Tracer {
    &GLOBAL
}
