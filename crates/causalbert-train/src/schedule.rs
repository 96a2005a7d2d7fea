//! Linear warmup-then-decay learning-rate schedule.

/// Learning-rate multiplier that rises linearly from 0 to 1 over the warmup
/// steps, then decays linearly to 0 at `total_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    warmup_steps: f64,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(total_steps: usize, warmup_fraction: f64) -> Self {
        Self {
            warmup_steps: total_steps as f64 * warmup_fraction,
            total_steps,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Multiplier applied to the base rate for the optimizer step `step`
    /// (0-based).
    pub fn multiplier(&self, step: usize) -> f64 {
        let step = step as f64;
        if step < self.warmup_steps {
            return step / self.warmup_steps.max(1.0);
        }
        let total = self.total_steps as f64;
        ((total - step) / (total - self.warmup_steps).max(1.0)).max(0.0)
    }

    pub fn learning_rate(&self, base: f64, step: usize) -> f64 {
        base * self.multiplier(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_decay() {
        let s = LinearSchedule::new(100, 0.1);
        assert_eq!(s.multiplier(0), 0.0);
        assert!((s.multiplier(5) - 0.5).abs() < 1e-12);
        assert!((s.multiplier(10) - 1.0).abs() < 1e-12);
        assert!((s.multiplier(55) - 0.5).abs() < 1e-12);
        assert_eq!(s.multiplier(100), 0.0);
        assert_eq!(s.multiplier(150), 0.0);
    }

    #[test]
    fn test_peak_is_one() {
        let s = LinearSchedule::new(40, 0.1);
        let peak = (0..40).map(|i| s.multiplier(i)).fold(0.0, f64::max);
        assert!((peak - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tiny_runs_stay_finite() {
        let s = LinearSchedule::new(2, 0.1);
        assert_eq!(s.multiplier(0), 0.0);
        let m = s.multiplier(1);
        assert!(m.is_finite() && m > 0.0 && m <= 1.0);

        let empty = LinearSchedule::new(0, 0.1);
        assert_eq!(empty.multiplier(0), 0.0);
        assert!((empty.learning_rate(2e-5, 0)).abs() < 1e-18);
    }

    #[test]
    fn test_no_warmup_starts_at_base_rate() {
        let s = LinearSchedule::new(10, 0.0);
        assert!((s.learning_rate(1e-3, 0) - 1e-3).abs() < 1e-15);
    }
}
