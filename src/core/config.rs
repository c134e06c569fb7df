//! Reconstruction parameters

use std::path::PathBuf;

/// Parameters for one reconstruction run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Smoothing factor applied to splat radii on load.
    pub fit_smooth: f32,
    /// Spacing of grid cells in world units.
    pub fit_grid: f32,
    /// Fraction of total output vertices a connected component must reach to
    /// survive pruning, in [0, 1]. Zero admits everything.
    pub prune_threshold: f64,
    /// Output destination. None writes to stdout.
    pub output: Option<PathBuf>,
    /// Prefer a low-power adapter over a discrete one.
    pub low_power: bool,
    /// Suppress informational messages.
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fit_smooth: 4.0,
            fit_grid: 0.01,
            prune_threshold: 0.0,
            output: None,
            low_power: false,
            quiet: false,
        }
    }
}

impl Config {
    pub fn power_preference(&self) -> wgpu::PowerPreference {
        if self.low_power {
            wgpu::PowerPreference::LowPower
        } else {
            wgpu::PowerPreference::HighPerformance
        }
    }
}
