use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{ensure_positive_lots, ValidationError};
use crate::ports::broker::InstrumentSpec;

// Broker lot steps never go below 1e-8; rounding the f64 input here strips
// binary representation noise before the step division.
const LOT_SCALE: u32 = 10;

fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(LOT_SCALE))
}

/// Rounds `raw_lots` to the nearest multiple of `step`, then clamps into
/// `[min_lot, max_lot]`.
///
/// The clamp bounds are first aligned to the step grid (min rounded up, max
/// rounded down, and never below one step), so the output is always a step
/// multiple and quantizing it again returns it unchanged.
pub fn quantize(raw_lots: f64, step: f64, min_lot: f64, max_lot: f64) -> Result<f64, ValidationError> {
    ensure_positive_lots("raw lots", raw_lots)?;
    if !step.is_finite() || step <= 0.0 {
        return Err(ValidationError::InvalidStep(step));
    }
    if !min_lot.is_finite() || !max_lot.is_finite() || min_lot < 0.0 || max_lot < min_lot {
        return Err(ValidationError::InvalidBounds { min_lot, max_lot });
    }
    let raw = to_decimal(raw_lots).ok_or(ValidationError::LotsOutOfRange {
        what: "raw lots",
        value: raw_lots,
    })?;
    let step_d = to_decimal(step).ok_or(ValidationError::InvalidStep(step))?;
    if step_d <= Decimal::ZERO {
        return Err(ValidationError::InvalidStep(step));
    }
    let min_d = to_decimal(min_lot).ok_or(ValidationError::InvalidBounds { min_lot, max_lot })?;
    let max_d = to_decimal(max_lot).ok_or(ValidationError::InvalidBounds { min_lot, max_lot })?;

    let quantized = quantize_decimal(raw, step_d, min_d, max_d)
        .ok_or(ValidationError::InvalidBounds { min_lot, max_lot })?;
    quantized
        .to_f64()
        .ok_or(ValidationError::InvalidBounds { min_lot, max_lot })
}

pub fn quantize_to_spec(raw_lots: f64, spec: &InstrumentSpec) -> Result<f64, ValidationError> {
    quantize(raw_lots, spec.lot_step, spec.min_lot, spec.max_lot)
}

/// Returns `None` when no step multiple lies inside the bounds.
pub(crate) fn quantize_decimal(
    raw: Decimal,
    step: Decimal,
    min_lot: Decimal,
    max_lot: Decimal,
) -> Option<Decimal> {
    if step <= Decimal::ZERO {
        return None;
    }
    let mut lo_multiples = (min_lot / step).ceil();
    if lo_multiples < Decimal::ONE {
        lo_multiples = Decimal::ONE;
    }
    let hi_multiples = (max_lot / step).floor();
    if hi_multiples < lo_multiples {
        return None;
    }

    let multiples = (raw / step)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .clamp(lo_multiples, hi_multiples);
    Some((multiples * step).normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_to_nearest_step() {
        assert_eq!(quantize(0.0149, 0.01, 0.01, 100.0).unwrap(), 0.01);
        assert_eq!(quantize(0.015, 0.01, 0.01, 100.0).unwrap(), 0.02);
        assert_eq!(quantize(0.1, 0.01, 0.01, 100.0).unwrap(), 0.1);
    }

    #[test]
    fn clamps_to_bounds() {
        assert_eq!(quantize(0.001, 0.01, 0.01, 100.0).unwrap(), 0.01);
        assert_eq!(quantize(250.0, 0.01, 0.01, 100.0).unwrap(), 100.0);
    }

    #[test]
    fn never_returns_below_one_step() {
        assert_eq!(quantize(0.0001, 0.01, 0.0, 10.0).unwrap(), 0.01);
    }

    #[test]
    fn is_idempotent() {
        let cases = [
            (0.0123, 0.01, 0.01, 50.0),
            (0.37, 0.1, 0.1, 5.0),
            (7.77, 0.5, 1.0, 5.0),
            (0.0049, 0.001, 0.002, 1.0),
            (0.01, 0.02, 0.01, 1.0),
        ];
        for (raw, step, min, max) in cases {
            let once = quantize(raw, step, min, max).unwrap();
            let twice = quantize(once, step, min, max).unwrap();
            assert_eq!(once, twice, "raw={} step={}", raw, step);
        }
    }

    #[test]
    fn is_monotonic() {
        let mut prev = 0.0;
        let mut raw = 0.001;
        while raw < 3.0 {
            let q = quantize(raw, 0.05, 0.1, 2.0).unwrap();
            assert!(q >= prev, "raw={} q={} prev={}", raw, q, prev);
            prev = q;
            raw += 0.0037;
        }
    }

    #[test]
    fn misaligned_bounds_snap_to_step_grid() {
        assert_eq!(
            quantize_decimal(dec!(0.001), dec!(0.02), dec!(0.01), dec!(1)),
            Some(dec!(0.02))
        );
        assert_eq!(
            quantize_decimal(dec!(5), dec!(0.3), dec!(0.3), dec!(1)),
            Some(dec!(0.9))
        );
        assert_eq!(quantize_decimal(dec!(1), dec!(0.5), dec!(0.6), dec!(0.9)), None);
    }

    #[test]
    fn rejects_invalid_input() {
        assert!(matches!(
            quantize(0.0, 0.01, 0.01, 1.0),
            Err(ValidationError::NonPositiveLots { .. })
        ));
        assert!(matches!(
            quantize(-1.0, 0.01, 0.01, 1.0),
            Err(ValidationError::NonPositiveLots { .. })
        ));
        assert_eq!(
            quantize(1.0, 0.0, 0.01, 1.0),
            Err(ValidationError::InvalidStep(0.0))
        );
        assert!(matches!(
            quantize(1.0, 0.01, 2.0, 1.0),
            Err(ValidationError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn huge_finite_lots_are_out_of_range() {
        assert_eq!(
            quantize(1e30, 0.01, 0.01, 100.0),
            Err(ValidationError::LotsOutOfRange {
                what: "raw lots",
                value: 1e30,
            })
        );
    }
}
