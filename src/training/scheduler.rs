//! Learning Rate Scheduler Module
//!
//! Schedules are evaluated per optimizer step. Epoch-based variants derive the
//! epoch from the step and the number of steps per epoch.

use serde::{Deserialize, Serialize};

/// Learning rate schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LRScheduler {
    /// Constant learning rate (no scheduling)
    Constant { lr: f64 },

    /// Cosine decay over optimizer steps, floored at `alpha · initial_lr`
    CosineDecay {
        initial_lr: f64,
        decay_steps: usize,
        alpha: f64,
    },

    /// Step decay: reduce LR by factor at specified epochs
    StepDecay {
        initial_lr: f64,
        decay_factor: f64,
        step_epochs: Vec<usize>,
    },

    /// Exponential decay: lr = initial_lr * decay_rate^epoch
    Exponential { initial_lr: f64, decay_rate: f64 },
}

impl LRScheduler {
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    pub fn cosine_decay(initial_lr: f64, decay_steps: usize) -> Self {
        Self::CosineDecay {
            initial_lr,
            decay_steps,
            alpha: 0.0,
        }
    }

    /// Learning rate at a global optimizer step
    pub fn get_lr(&self, step: usize, steps_per_epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => *lr,

            Self::CosineDecay {
                initial_lr,
                decay_steps,
                alpha,
            } => {
                if *decay_steps == 0 {
                    return *initial_lr;
                }
                let progress = step.min(*decay_steps) as f64 / *decay_steps as f64;
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                initial_lr * ((1.0 - alpha) * cosine + alpha)
            }

            Self::StepDecay {
                initial_lr,
                decay_factor,
                step_epochs,
            } => {
                let epoch = step / steps_per_epoch.max(1);
                step_epochs
                    .iter()
                    .filter(|&&e| epoch >= e)
                    .fold(*initial_lr, |lr, _| lr * decay_factor)
            }

            Self::Exponential {
                initial_lr,
                decay_rate,
            } => {
                let epoch = step / steps_per_epoch.max(1);
                initial_lr * decay_rate.powi(epoch as i32)
            }
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Constant { lr } => format!("Constant LR: {:.2e}", lr),
            Self::CosineDecay {
                initial_lr,
                decay_steps,
                ..
            } => format!("Cosine decay: initial={:.2e}, steps={}", initial_lr, decay_steps),
            Self::StepDecay {
                initial_lr,
                decay_factor,
                step_epochs,
            } => format!(
                "Step decay: initial={:.2e}, factor={}, epochs={:?}",
                initial_lr, decay_factor, step_epochs
            ),
            Self::Exponential {
                initial_lr,
                decay_rate,
            } => format!("Exponential: initial={:.2e}, decay={:.4}", initial_lr, decay_rate),
        }
    }
}

impl Default for LRScheduler {
    fn default() -> Self {
        Self::constant(1e-3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LRScheduler::constant(1e-5);
        assert_eq!(scheduler.get_lr(0, 10), 1e-5);
        assert_eq!(scheduler.get_lr(500, 10), 1e-5);
    }

    #[test]
    fn test_cosine_decay_endpoints() {
        let scheduler = LRScheduler::cosine_decay(1e-3, 100);
        assert!((scheduler.get_lr(0, 10) - 1e-3).abs() < 1e-12);
        assert!((scheduler.get_lr(50, 10) - 5e-4).abs() < 1e-9);
        assert!(scheduler.get_lr(100, 10).abs() < 1e-12);
        // stays at the floor after decay_steps
        assert!(scheduler.get_lr(250, 10).abs() < 1e-12);
    }

    #[test]
    fn test_step_decay_uses_epochs() {
        let scheduler = LRScheduler::StepDecay {
            initial_lr: 0.1,
            decay_factor: 0.5,
            step_epochs: vec![2, 4],
        };
        assert_eq!(scheduler.get_lr(19, 10), 0.1);
        assert_eq!(scheduler.get_lr(20, 10), 0.05);
        assert_eq!(scheduler.get_lr(45, 10), 0.025);
    }

    #[test]
    fn test_exponential() {
        let scheduler = LRScheduler::Exponential {
            initial_lr: 1.0,
            decay_rate: 0.5,
        };
        assert_eq!(scheduler.get_lr(30, 10), 0.125);
    }
}
