pub mod drift;
pub mod math;
pub mod pyramid;
pub mod quantize;

pub use drift::{AdjustmentAction, DriftConfig, HedgeAdjustment, HedgeDriftController};
pub use pyramid::{PyramidLadder, PyramidLevel};
pub use quantize::quantize;
