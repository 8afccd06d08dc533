use std::error::Error;
use std::fmt;

const ZERO_TARGET_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathError {
    DivideByZero,
}

impl fmt::Display for MathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MathError::DivideByZero => write!(f, "no drift computable: desired secondary is zero"),
        }
    }
}

impl Error for MathError {}

/// Signed drift of the secondary leg against its target.
///
/// `absolute` is `desired - actual`: positive when the secondary leg is short of
/// target, negative when it carries an excess.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HedgeDrift {
    pub desired: f64,
    pub absolute: f64,
    pub pct: f64,
}

impl HedgeDrift {
    pub fn magnitude(&self) -> f64 {
        self.absolute.abs()
    }
}

pub fn desired_secondary(primary_lots: f64, hedge_ratio: f64) -> f64 {
    primary_lots * hedge_ratio
}

pub fn drift(actual_secondary: f64, desired_secondary: f64) -> Result<HedgeDrift, MathError> {
    if !desired_secondary.is_finite() || desired_secondary.abs() < ZERO_TARGET_EPS {
        return Err(MathError::DivideByZero);
    }
    let absolute = desired_secondary - actual_secondary;
    Ok(HedgeDrift {
        desired: desired_secondary,
        absolute,
        pct: absolute.abs() / desired_secondary.abs(),
    })
}

/// Relative error of a realised lot ratio against the intended one.
pub fn ratio_error(actual_ratio: f64, intended_ratio: f64) -> Option<f64> {
    if intended_ratio.abs() < ZERO_TARGET_EPS || !actual_ratio.is_finite() {
        return None;
    }
    Some((actual_ratio - intended_ratio).abs() / intended_ratio.abs())
}
