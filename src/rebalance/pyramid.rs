use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ValidationError;
use crate::setup::model::{LegLevel, Setup, Side};

const LEVEL_MATCH_TOLERANCE: f64 = 0.01;
const LADDER_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidLevel {
    pub zscore: f64,
    pub executed: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub primary_lots: f64,
    pub secondary_lots: f64,
}

impl PyramidLevel {
    fn pending(zscore: f64) -> Self {
        Self {
            zscore,
            executed: false,
            timestamp: None,
            primary_lots: 0.0,
            secondary_lots: 0.0,
        }
    }
}

/// Scale-in ladder for one setup.
///
/// Levels run from the entry z-score away from zero in `scale_interval` steps and
/// always end exactly at the stop level (`-max_zscore` for LONG, `+max_zscore`
/// for SHORT). Index 0 is the entry and is executed from the start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidLadder {
    side: Side,
    levels: Vec<PyramidLevel>,
    at_stop_edge: bool,
}

impl PyramidLadder {
    pub fn plan(
        entry_zscore: f64,
        side: Side,
        scale_interval: f64,
        max_zscore: f64,
    ) -> Result<Self, ValidationError> {
        if !entry_zscore.is_finite() {
            return Err(ValidationError::InvalidLadder(format!(
                "entry z-score {} is not finite",
                entry_zscore
            )));
        }
        if !scale_interval.is_finite() || scale_interval <= 0.0 {
            return Err(ValidationError::InvalidLadder(format!(
                "scale interval must be positive, got {}",
                scale_interval
            )));
        }
        if !max_zscore.is_finite() || max_zscore <= 0.0 {
            return Err(ValidationError::InvalidLadder(format!(
                "max z-score must be positive, got {}",
                max_zscore
            )));
        }

        let direction = match side {
            Side::Long => -1.0,
            Side::Short => 1.0,
        };
        let stop = direction * max_zscore;

        let mut entry = PyramidLevel::pending(entry_zscore);
        entry.executed = true;
        entry.timestamp = Some(Utc::now());
        let mut levels = vec![entry];

        // Levels within match tolerance of the stop collapse into the stop level.
        let stop_floor = max_zscore - LEVEL_MATCH_TOLERANCE - LADDER_EPS;
        let at_stop_edge = entry_zscore.abs() >= stop_floor;
        if !at_stop_edge {
            let mut k = 1.0;
            loop {
                let z = entry_zscore + direction * k * scale_interval;
                if z.abs() >= stop_floor {
                    break;
                }
                levels.push(PyramidLevel::pending(z));
                k += 1.0;
            }
        }
        levels.push(PyramidLevel::pending(stop));

        Ok(Self {
            side,
            levels,
            at_stop_edge,
        })
    }

    /// Rebuilds the ladder of a persisted setup: the entry level carries the
    /// initial leg, and each `pyramid_N` leg marks ladder index N executed.
    pub fn from_setup(
        setup: &Setup,
        scale_interval: f64,
        max_zscore: f64,
    ) -> Result<Self, ValidationError> {
        let mut ladder = Self::plan(setup.entry_zscore, setup.side, scale_interval, max_zscore)?;
        ladder.levels[0].timestamp = Some(setup.entry_time);
        let planned = ladder.levels.len();
        for leg in &setup.positions {
            match leg.level {
                LegLevel::Initial => {
                    ladder.levels[0].primary_lots = leg.primary_lots;
                    ladder.levels[0].secondary_lots = leg.secondary_lots;
                }
                LegLevel::Pyramid(n) => {
                    let level = ladder.levels.get_mut(n as usize).ok_or_else(|| {
                        ValidationError::InvalidLadder(format!(
                            "{} has pyramid_{} but the ladder only has {} levels",
                            setup.setup_id, n, planned
                        ))
                    })?;
                    level.executed = true;
                    level.timestamp = Some(leg.timestamp);
                    level.primary_lots = leg.primary_lots;
                    level.secondary_lots = leg.secondary_lots;
                }
                LegLevel::Adjustment(_) => {}
            }
        }
        Ok(ladder)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn at_stop_edge(&self) -> bool {
        self.at_stop_edge
    }

    /// Returns the first unexecuted level, and its index, if `zscore` has reached it.
    /// Later levels are never considered, even when the market gapped past them.
    pub fn check_trigger(&self, zscore: f64) -> Option<(usize, &PyramidLevel)> {
        if self.at_stop_edge || !zscore.is_finite() {
            return None;
        }
        let (idx, level) = self
            .levels
            .iter()
            .enumerate()
            .find(|(_, level)| !level.executed)?;
        let triggered = match self.side {
            Side::Long => zscore <= level.zscore,
            Side::Short => zscore >= level.zscore,
        };
        if triggered {
            Some((idx, level))
        } else {
            None
        }
    }

    /// Records a fill on the level matching `zscore` within ±0.01. Returns the
    /// index of the updated level.
    pub fn mark_executed(
        &mut self,
        zscore: f64,
        primary_lots: f64,
        secondary_lots: f64,
    ) -> Option<usize> {
        let idx = self
            .levels
            .iter()
            .position(|l| !l.executed && (l.zscore - zscore).abs() <= LEVEL_MATCH_TOLERANCE)
            .or_else(|| {
                self.levels
                    .iter()
                    .position(|l| (l.zscore - zscore).abs() <= LEVEL_MATCH_TOLERANCE)
            })?;
        let level = &mut self.levels[idx];
        level.executed = true;
        level.timestamp = Some(Utc::now());
        level.primary_lots = primary_lots;
        level.secondary_lots = secondary_lots;
        Some(idx)
    }

    pub fn executed_count(&self) -> usize {
        self.levels.iter().filter(|l| l.executed).count()
    }

    pub fn remaining(&self) -> usize {
        if self.at_stop_edge {
            0
        } else {
            self.levels.len() - self.executed_count()
        }
    }
}
