// ===============================
// src/risk.rs (trailing drawdown kill switch)
// ===============================
use thiserror::Error;

use crate::domain::PnlSnapshot;
use crate::metrics::{PNL_CURRENT, PNL_DAILY, PNL_HIGH_WATER, PNL_REALIZED, PNL_UNREALIZED};

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("non-finite pnl update (daily={daily}, unrealized={unrealized}, realized={realized})")]
    NonFinite { daily: f64, unrealized: f64, realized: f64 },
}

/// Tracks the best profit seen so far; liquidation fires once we give back more
/// than the threshold from that mark.
#[derive(Debug, Clone, Default)]
pub struct RiskGovernor {
    last: PnlSnapshot,
    current_profit: f64,
    high_water_mark: f64,
}

impl RiskGovernor {
    pub fn new() -> Self { Self::default() }

    /// Apply a PnL update. Returns `true` when the high-water mark moved up.
    pub fn update(&mut self, snap: PnlSnapshot) -> Result<bool, RiskError> {
        if !(snap.daily.is_finite() && snap.unrealized.is_finite() && snap.realized.is_finite()) {
            return Err(RiskError::NonFinite {
                daily: snap.daily,
                unrealized: snap.unrealized,
                realized: snap.realized,
            });
        }

        self.last = snap;
        self.current_profit = snap.current_profit();
        let raised = self.current_profit > self.high_water_mark;
        if raised {
            self.high_water_mark = self.current_profit;
        }

        PNL_DAILY.set(snap.daily);
        PNL_UNREALIZED.set(snap.unrealized);
        PNL_REALIZED.set(snap.realized);
        PNL_CURRENT.set(self.current_profit);
        PNL_HIGH_WATER.set(self.high_water_mark);
        Ok(raised)
    }

    pub fn last(&self) -> PnlSnapshot { self.last }
    pub fn current_profit(&self) -> f64 { self.current_profit }
    pub fn high_water_mark(&self) -> f64 { self.high_water_mark }
    pub fn drawdown(&self) -> f64 { self.high_water_mark - self.current_profit }

    pub fn should_liquidate(&self, threshold: f64) -> bool {
        self.drawdown() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pnl(unrealized: f64, realized: f64) -> PnlSnapshot {
        PnlSnapshot { daily: unrealized + realized, unrealized, realized }
    }

    #[test]
    fn high_water_mark_never_decreases() {
        let mut risk = RiskGovernor::new();
        let mut prev = risk.high_water_mark();
        for (u, r) in [(100.0, 0.0), (50.0, 20.0), (300.0, 100.0), (-500.0, 0.0), (0.0, 399.0)] {
            risk.update(pnl(u, r)).unwrap();
            assert!(risk.high_water_mark() >= prev);
            prev = risk.high_water_mark();
        }
        assert_eq!(risk.high_water_mark(), 400.0);
        assert_eq!(risk.current_profit(), 399.0);
    }

    #[test]
    fn liquidates_strictly_above_threshold() {
        let mut risk = RiskGovernor::new();
        risk.update(pnl(800.0, 200.0)).unwrap();
        assert_eq!(risk.high_water_mark(), 1000.0);

        risk.update(pnl(600.0, 200.0)).unwrap();
        assert_eq!(risk.drawdown(), 200.0);
        assert!(!risk.should_liquidate(200.0));

        risk.update(pnl(550.0, 200.0)).unwrap();
        assert_eq!(risk.current_profit(), 750.0);
        assert!(risk.should_liquidate(200.0));
    }

    #[test]
    fn losses_from_flat_count_against_zero_mark() {
        let mut risk = RiskGovernor::new();
        risk.update(pnl(-150.0, -60.0)).unwrap();
        assert_eq!(risk.high_water_mark(), 0.0);
        assert!(risk.should_liquidate(200.0));
        assert!(!risk.should_liquidate(210.0));
    }

    #[test]
    fn non_finite_update_is_rejected_and_ignored() {
        let mut risk = RiskGovernor::new();
        risk.update(pnl(10.0, 0.0)).unwrap();
        assert!(risk.update(PnlSnapshot { daily: 0.0, unrealized: f64::NAN, realized: 0.0 }).is_err());
        assert_eq!(risk.current_profit(), 10.0);
    }
}
