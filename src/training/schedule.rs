/// Linear warmup followed by step decay.
#[derive(Debug, Clone)]
pub struct WarmupStepLr {
    base_lr: f64,
    warmup_epochs: usize,
    milestones: Vec<usize>,
    gamma: f64,
}

impl WarmupStepLr {
    pub fn new(base_lr: f64, warmup_epochs: usize, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            warmup_epochs,
            milestones,
            gamma,
        }
    }

    /// A schedule that always returns `base_lr`.
    pub fn constant(base_lr: f64) -> Self {
        Self::new(base_lr, 0, Vec::new(), 1.0)
    }

    /// Learning rate for `epoch` (1-based).
    pub fn lr(&self, epoch: usize) -> f64 {
        if epoch <= self.warmup_epochs {
            return self.base_lr * epoch.max(1) as f64 / self.warmup_epochs as f64;
        }

        let passed = self.milestones.iter().filter(|&&m| epoch > m).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_reaches_base_lr() {
        let schedule = WarmupStepLr::new(0.01, 10, vec![40, 70], 0.1);
        assert!(close(schedule.lr(1), 0.001));
        assert!(close(schedule.lr(5), 0.005));
        assert!(close(schedule.lr(10), 0.01));
        assert!(close(schedule.lr(11), 0.01));
    }

    #[test]
    fn decays_after_each_milestone() {
        let schedule = WarmupStepLr::new(0.01, 10, vec![40, 70], 0.1);
        assert!(close(schedule.lr(40), 0.01));
        assert!(close(schedule.lr(41), 0.001));
        assert!(close(schedule.lr(71), 0.0001));
    }

    #[test]
    fn constant_schedule() {
        let schedule = WarmupStepLr::constant(3e-4);
        assert!(close(schedule.lr(1), 3e-4));
        assert!(close(schedule.lr(500), 3e-4));
    }
}
