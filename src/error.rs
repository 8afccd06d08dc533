use std::error::Error;
use std::fmt;

/// Input rejected at the call that detected it. Never coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    InvalidSide(String),
    NonPositiveLots { what: &'static str, value: f64 },
    LotsOutOfRange { what: &'static str, value: f64 },
    InvalidStep(f64),
    InvalidBounds { min_lot: f64, max_lot: f64 },
    UnknownSymbol(String),
    InvalidLadder(String),
    DuplicateTicket(u64),
    UnknownSetup(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::InvalidSide(s) => write!(f, "invalid side: {}", s),
            ValidationError::NonPositiveLots { what, value } => {
                write!(f, "{} must be positive and finite, got {}", what, value)
            }
            ValidationError::LotsOutOfRange { what, value } => {
                write!(f, "{} {} is outside the representable lot range", what, value)
            }
            ValidationError::InvalidStep(step) => write!(f, "invalid lot step: {}", step),
            ValidationError::InvalidBounds { min_lot, max_lot } => {
                write!(f, "invalid lot bounds: min={} max={}", min_lot, max_lot)
            }
            ValidationError::UnknownSymbol(s) => write!(f, "unknown symbol: {}", s),
            ValidationError::InvalidLadder(msg) => write!(f, "invalid pyramid ladder: {}", msg),
            ValidationError::DuplicateTicket(t) => {
                write!(f, "ticket {} already belongs to another leg", t)
            }
            ValidationError::UnknownSetup(id) => write!(f, "setup not found: {}", id),
        }
    }
}

impl Error for ValidationError {}

pub(crate) fn ensure_positive_lots(what: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ValidationError::NonPositiveLots { what, value })
    }
}
