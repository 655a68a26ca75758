//! Motion-settled heuristic for positional moves.
//!
//! A move counts as finished once `|rpm|` stays below `epsilon_rpm` for
//! `quiet_samples` consecutive telemetry polls. A single loud sample re-arms the
//! counter, so one noisy zero crossing during the move is not mistaken for the end.

use crate::config::SettleConfig;

/// Debounced "speed is zero" detector.
#[derive(Debug, Clone)]
pub struct SettleDetector {
    epsilon_rpm: f64,
    required: u32,
    quiet: u32,
}

impl SettleDetector {
    /// Detector with an explicit threshold and sample count.
    pub fn new(epsilon_rpm: f64, required: u32) -> Self {
        Self {
            epsilon_rpm,
            required: required.max(1),
            quiet: 0,
        }
    }

    /// Detector from the `[settle]` section.
    pub fn from_config(config: &SettleConfig) -> Self {
        Self::new(config.epsilon_rpm, config.quiet_samples)
    }

    /// Feed one speed sample. Returns `true` once settled.
    pub fn observe(&mut self, rpm: f64) -> bool {
        if rpm.abs() < self.epsilon_rpm {
            self.quiet += 1;
        } else {
            self.quiet = 0;
        }
        self.quiet >= self.required
    }

    /// Consecutive quiet samples seen so far.
    pub fn quiet_count(&self) -> u32 {
        self.quiet
    }

    /// Forget previous samples.
    pub fn reset(&mut self) {
        self.quiet = 0;
    }
}

impl Default for SettleDetector {
    fn default() -> Self {
        Self::from_config(&SettleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_two_consecutive_quiet_samples() {
        let mut detector = SettleDetector::default();
        assert!(!detector.observe(5.0));
        assert!(!detector.observe(0.005));
        assert_eq!(detector.quiet_count(), 1);
        assert!(detector.observe(0.003));
    }

    #[test]
    fn loud_sample_rearms_counter() {
        let mut detector = SettleDetector::default();
        let results: Vec<bool> = [5.0, 0.005, 2.0, 0.004]
            .into_iter()
            .map(|rpm| detector.observe(rpm))
            .collect();
        assert_eq!(results, vec![false, false, false, false]);
        assert_eq!(detector.quiet_count(), 1);
    }

    #[test]
    fn negative_speeds_use_magnitude() {
        let mut detector = SettleDetector::new(0.01, 2);
        assert!(!detector.observe(-3.0));
        assert!(!detector.observe(-0.001));
        assert!(detector.observe(0.0));
    }
}
