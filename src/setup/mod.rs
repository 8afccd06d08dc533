pub mod model;
pub mod store;

pub use model::{Leg, LegLevel, Setup, SetupStatus, Side};
pub use store::SetupStore;
