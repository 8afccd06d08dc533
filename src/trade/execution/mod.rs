pub mod broker_box;
pub mod coordinator;

pub use broker_box::BrokerBox;
pub use coordinator::{CloseAllReport, CoordinatorConfig, SpreadExecutionCoordinator, SpreadOutcome};
