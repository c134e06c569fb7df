//! Process-wide statistics registry
//!
//! Tracks peak resource usage (e.g. `mem.all` for arena memory) and timing
//! variables (accumulated seconds with a sample count). Device timing samples
//! are queued in `gpu::timing` and drained into variables here.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// A gauge that remembers the highest value it ever reached.
#[derive(Clone, Copy, Debug, Default)]
pub struct Peak {
    pub current: i64,
    pub peak: i64,
}

/// An accumulating timing/size variable.
#[derive(Clone, Copy, Debug, Default)]
pub struct Variable {
    pub count: u64,
    pub total: f64,
}

impl Variable {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

#[derive(Default)]
pub struct Registry {
    peaks: Mutex<HashMap<String, Peak>>,
    variables: Mutex<HashMap<String, Variable>>,
}

impl Registry {
    /// Adjust a peak gauge by `delta` (negative on release).
    pub fn peak_add(&self, name: &str, delta: i64) {
        let mut peaks = self.peaks.lock().unwrap();
        let entry = peaks.entry(name.to_string()).or_default();
        entry.current += delta;
        entry.peak = entry.peak.max(entry.current);
    }

    /// Current value of a peak gauge (zero if never touched).
    pub fn peak(&self, name: &str) -> Peak {
        self.peaks
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Add one sample to a timing variable.
    pub fn variable_add(&self, name: &str, value: f64) {
        let mut variables = self.variables.lock().unwrap();
        let entry = variables.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.total += value;
    }

    pub fn variable(&self, name: &str) -> Variable {
        self.variables
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of all variables, sorted by name, for the end-of-run report.
    pub fn variables_snapshot(&self) -> Vec<(String, Variable)> {
        let variables = self.variables.lock().unwrap();
        let mut out: Vec<_> = variables.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// The process-wide registry.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}
