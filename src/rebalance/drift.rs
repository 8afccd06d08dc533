use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::math;
use crate::error::ValidationError;

#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub enabled: bool,
    pub threshold_pct: f64,
    pub min_absolute_drift: f64,
    pub min_adjustment_interval: Duration,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_pct: 0.05,
            min_absolute_drift: 0.01,
            min_adjustment_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdjustmentAction {
    /// Add lots to the leg in that leg's own direction.
    Buy,
    /// Remove lots from the leg.
    Sell,
}

impl fmt::Display for AdjustmentAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdjustmentAction::Buy => write!(f, "BUY"),
            AdjustmentAction::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftState {
    Disabled,
    CoolingDown,
    Evaluating,
    AdjustmentReady,
}

/// Single-leg order that brings a setup back onto its current hedge ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeAdjustment {
    pub setup_id: String,
    pub symbol: String,
    pub action: AdjustmentAction,
    pub quantity: f64,
    pub reason: String,
    pub old_hedge_ratio: f64,
    pub new_hedge_ratio: f64,
    pub drift_pct: f64,
}

/// Outcome of the dual-threshold check, independent of any per-setup state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub leg: LegRole,
    pub action: AdjustmentAction,
    pub quantity: f64,
    pub drift: math::HedgeDrift,
}

/// Returns the corrective trade for the given leg sizes, or `None` when the
/// drift is below both thresholds or cannot be computed.
///
/// A secondary shortfall buys the missing secondary lots. An excess secondary
/// is never sold: the primary leg is bought up by `|drift| / hedge_ratio`
/// instead, keeping total exposure.
pub fn assess(
    primary_lots: f64,
    secondary_lots: f64,
    hedge_ratio: f64,
    config: &DriftConfig,
) -> Option<Correction> {
    if !hedge_ratio.is_finite() || hedge_ratio.abs() < f64::EPSILON {
        return None;
    }
    let desired = math::desired_secondary(primary_lots, hedge_ratio);
    let drift = math::drift(secondary_lots, desired).ok()?;
    let triggered =
        drift.pct >= config.threshold_pct || drift.magnitude() >= config.min_absolute_drift;
    if !triggered || drift.absolute == 0.0 {
        return None;
    }
    let (leg, quantity) = if drift.absolute > 0.0 {
        (LegRole::Secondary, drift.magnitude())
    } else {
        (LegRole::Primary, drift.magnitude() / hedge_ratio.abs())
    };
    Some(Correction {
        leg,
        action: AdjustmentAction::Buy,
        quantity,
        drift,
    })
}

#[derive(Debug, Clone)]
struct SetupTrack {
    primary_symbol: String,
    secondary_symbol: String,
    primary_lots: f64,
    secondary_lots: f64,
    entry_hedge_ratio: f64,
    current_hedge_ratio: f64,
    last_adjustment: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftStatistics {
    pub active: usize,
    pub total_adjustments: usize,
    pub avg_drift_pct: f64,
    pub enabled: bool,
    pub threshold: f64,
}

/// Per-setup drift tracking. Owned by the action executor; every mutation
/// mirrors a fill already persisted in the setup store.
pub struct HedgeDriftController {
    config: DriftConfig,
    tracks: HashMap<String, SetupTrack>,
    history: Vec<HedgeAdjustment>,
}

impl HedgeDriftController {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn register_setup(
        &mut self,
        setup_id: &str,
        primary_symbol: &str,
        secondary_symbol: &str,
        primary_lots: f64,
        secondary_lots: f64,
        hedge_ratio: f64,
    ) {
        log::debug!(
            "[HEDGE] tracking {}: primary={:.4} secondary={:.4} ratio={:.4}",
            setup_id,
            primary_lots,
            secondary_lots,
            hedge_ratio
        );
        self.tracks.insert(
            setup_id.to_string(),
            SetupTrack {
                primary_symbol: primary_symbol.to_string(),
                secondary_symbol: secondary_symbol.to_string(),
                primary_lots,
                secondary_lots,
                entry_hedge_ratio: hedge_ratio,
                current_hedge_ratio: hedge_ratio,
                last_adjustment: None,
            },
        );
    }

    /// Adds a pyramid leg's lots to the tracked totals.
    pub fn record_scale_in(
        &mut self,
        setup_id: &str,
        primary_lots: f64,
        secondary_lots: f64,
    ) -> Result<(), ValidationError> {
        let track = self
            .tracks
            .get_mut(setup_id)
            .ok_or_else(|| ValidationError::UnknownSetup(setup_id.to_string()))?;
        track.primary_lots += primary_lots;
        track.secondary_lots += secondary_lots;
        Ok(())
    }

    pub fn remove(&mut self, setup_id: &str) -> bool {
        self.tracks.remove(setup_id).is_some()
    }

    pub fn is_tracked(&self, setup_id: &str) -> bool {
        self.tracks.contains_key(setup_id)
    }

    pub fn lots(&self, setup_id: &str) -> Option<(f64, f64)> {
        self.tracks
            .get(setup_id)
            .map(|t| (t.primary_lots, t.secondary_lots))
    }

    pub fn entry_hedge_ratio(&self, setup_id: &str) -> Option<f64> {
        self.tracks.get(setup_id).map(|t| t.entry_hedge_ratio)
    }

    pub fn state(&self, setup_id: &str, hedge_ratio: f64) -> DriftState {
        self.state_at(setup_id, hedge_ratio, Instant::now())
    }

    pub fn state_at(&self, setup_id: &str, hedge_ratio: f64, now: Instant) -> DriftState {
        if !self.config.enabled {
            return DriftState::Disabled;
        }
        let Some(track) = self.tracks.get(setup_id) else {
            return DriftState::Disabled;
        };
        if self.cooling_down(track, now) {
            return DriftState::CoolingDown;
        }
        match assess(
            track.primary_lots,
            track.secondary_lots,
            hedge_ratio,
            &self.config,
        ) {
            Some(_) => DriftState::AdjustmentReady,
            None => DriftState::Evaluating,
        }
    }

    fn cooling_down(&self, track: &SetupTrack, now: Instant) -> bool {
        match track.last_adjustment {
            Some(at) => now.saturating_duration_since(at) < self.config.min_adjustment_interval,
            None => false,
        }
    }

    pub fn evaluate(&mut self, setup_id: &str, hedge_ratio: f64) -> Option<HedgeAdjustment> {
        self.evaluate_at(setup_id, hedge_ratio, Instant::now())
    }

    /// Issuing an adjustment starts the setup's cooldown, so a second call
    /// inside `min_adjustment_interval` returns `None`.
    pub fn evaluate_at(
        &mut self,
        setup_id: &str,
        hedge_ratio: f64,
        now: Instant,
    ) -> Option<HedgeAdjustment> {
        if !self.config.enabled {
            return None;
        }
        let track = self.tracks.get(setup_id)?;
        if self.cooling_down(track, now) {
            return None;
        }
        let correction = assess(
            track.primary_lots,
            track.secondary_lots,
            hedge_ratio,
            &self.config,
        )?;

        let symbol = match correction.leg {
            LegRole::Primary => track.primary_symbol.clone(),
            LegRole::Secondary => track.secondary_symbol.clone(),
        };
        let reason = match correction.leg {
            LegRole::Secondary => format!(
                "secondary short of target by {:.4} lots ({:.1}%)",
                correction.drift.magnitude(),
                correction.drift.pct * 100.0
            ),
            LegRole::Primary => format!(
                "secondary exceeds target by {:.4} lots ({:.1}%), scaling primary",
                correction.drift.magnitude(),
                correction.drift.pct * 100.0
            ),
        };
        let adjustment = HedgeAdjustment {
            setup_id: setup_id.to_string(),
            symbol,
            action: correction.action,
            quantity: correction.quantity,
            reason,
            old_hedge_ratio: track.current_hedge_ratio,
            new_hedge_ratio: hedge_ratio,
            drift_pct: correction.drift.pct,
        };

        if let Some(track) = self.tracks.get_mut(setup_id) {
            track.last_adjustment = Some(now);
        }
        log::info!(
            "[HEDGE] {} drift {:.2}% -> {} {:.4} {}",
            setup_id,
            adjustment.drift_pct * 100.0,
            adjustment.action,
            adjustment.quantity,
            adjustment.symbol
        );
        Some(adjustment)
    }

    /// Books an executed adjustment against the setup's tracked lots.
    pub fn apply(
        &mut self,
        adjustment: &HedgeAdjustment,
        executed_quantity: f64,
    ) -> Result<(), ValidationError> {
        self.apply_at(adjustment, executed_quantity, Instant::now())
    }

    pub fn apply_at(
        &mut self,
        adjustment: &HedgeAdjustment,
        executed_quantity: f64,
        now: Instant,
    ) -> Result<(), ValidationError> {
        let track = self
            .tracks
            .get_mut(&adjustment.setup_id)
            .ok_or_else(|| ValidationError::UnknownSetup(adjustment.setup_id.clone()))?;
        let signed = match adjustment.action {
            AdjustmentAction::Buy => executed_quantity,
            AdjustmentAction::Sell => -executed_quantity,
        };
        if adjustment.symbol == track.secondary_symbol {
            track.secondary_lots += signed;
        } else if adjustment.symbol == track.primary_symbol {
            track.primary_lots += signed;
        } else {
            return Err(ValidationError::UnknownSymbol(adjustment.symbol.clone()));
        }
        track.current_hedge_ratio = adjustment.new_hedge_ratio;
        track.last_adjustment = Some(now);
        self.history.push(adjustment.clone());
        Ok(())
    }

    pub fn history(&self) -> &[HedgeAdjustment] {
        &self.history
    }

    pub fn statistics(&self) -> DriftStatistics {
        let total = self.history.len();
        let avg = if total == 0 {
            0.0
        } else {
            self.history.iter().map(|a| a.drift_pct).sum::<f64>() / total as f64
        };
        DriftStatistics {
            active: self.tracks.len(),
            total_adjustments: total,
            avg_drift_pct: avg,
            enabled: self.config.enabled,
            threshold: self.config.threshold_pct,
        }
    }
}
