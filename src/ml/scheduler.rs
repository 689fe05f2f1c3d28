//! Learning-rate schedule driven by validation results.
//!
//! `ReduceLrOnPlateau` halves the learning rate once the monitored
//! value (validation loss) has not improved for `patience` checks in
//! a row.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    lr:         f64,
    factor:     f64,
    patience:   usize,
    /// Relative improvement needed to count as better
    threshold:  f64,
    min_lr:     f64,
    best:       Option<f64>,
    bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    /// Mode "min", factor 0.5, patience 3.
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Record one validation value. Returns the new learning rate when
    /// it was reduced.
    pub fn step(&mut self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            self.bad_epochs += 1;
        } else {
            match self.best {
                Some(best) if value >= best * (1.0 - self.threshold) => self.bad_epochs += 1,
                _ => {
                    self.best = Some(value);
                    self.bad_epochs = 0;
                }
            }
        }

        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            let new_lr = (self.lr * self.factor).max(self.min_lr);
            if new_lr < self.lr {
                tracing::info!("Reducing learning rate: {:.6} => {:.6}", self.lr, new_lr);
                self.lr = new_lr;
                return Some(new_lr);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_keeps_lr() {
        let mut s = ReduceLrOnPlateau::new(1.0);
        for v in [5.0, 4.0, 3.0, 2.0, 1.0] {
            assert!(s.step(v).is_none());
        }
        assert_eq!(s.lr(), 1.0);
        assert_eq!(s.best(), Some(1.0));
    }

    #[test]
    fn test_plateau_halves_after_patience() {
        let mut s = ReduceLrOnPlateau::new(1.0);
        s.step(2.0);
        // Three bad checks are tolerated, the fourth reduces
        assert!(s.step(2.0).is_none());
        assert!(s.step(2.5).is_none());
        assert!(s.step(2.1).is_none());
        assert_eq!(s.step(2.0), Some(0.5));
        assert_eq!(s.lr(), 0.5);
    }

    #[test]
    fn test_non_finite_counts_as_bad() {
        let mut s = ReduceLrOnPlateau::new(1.0).with_patience(0);
        s.step(1.0);
        assert_eq!(s.step(f64::INFINITY), Some(0.5));
    }

    #[test]
    fn test_custom_factor() {
        let mut s = ReduceLrOnPlateau::new(2.0).with_factor(0.1).with_patience(0);
        s.step(1.0);
        let lr = s.step(1.0).unwrap();
        assert!((lr - 0.2).abs() < 1e-12);
    }
}
