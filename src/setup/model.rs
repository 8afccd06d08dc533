use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Ok(Side::Long),
            "SHORT" => Ok(Side::Short),
            _ => Err(ValidationError::InvalidSide(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SetupStatus {
    Active,
    Closed,
    Partial,
}

impl SetupStatus {
    /// Active and partially closed setups both stay in the active index.
    pub fn is_open(&self) -> bool {
        !matches!(self, SetupStatus::Closed)
    }
}

impl fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SetupStatus::Active => "ACTIVE",
            SetupStatus::Closed => "CLOSED",
            SetupStatus::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}

/// Position of a leg within its setup, persisted as `initial`, `pyramid_N` or
/// `adjustment_N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LegLevel {
    Initial,
    Pyramid(u32),
    Adjustment(u32),
}

impl fmt::Display for LegLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LegLevel::Initial => write!(f, "initial"),
            LegLevel::Pyramid(n) => write!(f, "pyramid_{}", n),
            LegLevel::Adjustment(n) => write!(f, "adjustment_{}", n),
        }
    }
}

impl From<LegLevel> for String {
    fn from(level: LegLevel) -> Self {
        level.to_string()
    }
}

impl TryFrom<String> for LegLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "initial" {
            return Ok(LegLevel::Initial);
        }
        let parse = |rest: &str| {
            rest.parse::<u32>()
                .map_err(|_| format!("invalid leg level: {}", value))
        };
        if let Some(rest) = value.strip_prefix("pyramid_") {
            return parse(rest).map(LegLevel::Pyramid);
        }
        if let Some(rest) = value.strip_prefix("adjustment_") {
            return parse(rest).map(LegLevel::Adjustment);
        }
        Err(format!("invalid leg level: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub spread_id: String,
    pub short_id: String,
    /// Adjustment legs carry only the ticket of the leg they traded.
    pub primary_ticket: Option<u64>,
    pub secondary_ticket: Option<u64>,
    pub entry_zscore: f64,
    pub primary_lots: f64,
    pub secondary_lots: f64,
    pub level: LegLevel,
    pub timestamp: DateTime<Utc>,
}

impl Leg {
    pub fn tickets(&self) -> impl Iterator<Item = u64> {
        self.primary_ticket.into_iter().chain(self.secondary_ticket)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub setup_id: String,
    pub entry_time: DateTime<Utc>,
    pub entry_zscore: f64,
    pub exit_zscore: Option<f64>,
    pub side: Side,
    pub pair: String,
    pub entry_hedge_ratio: f64,
    pub positions: Vec<Leg>,
    pub status: SetupStatus,
    pub last_updated: DateTime<Utc>,
}

impl Setup {
    pub fn tickets(&self) -> Vec<u64> {
        self.positions.iter().flat_map(|leg| leg.tickets()).collect()
    }

    pub fn total_lots(&self) -> (f64, f64) {
        self.positions.iter().fold((0.0, 0.0), |(p, s), leg| {
            (p + leg.primary_lots, s + leg.secondary_lots)
        })
    }

    pub fn next_pyramid_index(&self) -> u32 {
        self.positions
            .iter()
            .filter_map(|leg| match leg.level {
                LegLevel::Pyramid(n) => Some(n),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn next_adjustment_index(&self) -> u32 {
        self.positions
            .iter()
            .filter(|leg| matches!(leg.level, LegLevel::Adjustment(_)))
            .count() as u32
            + 1
    }
}
