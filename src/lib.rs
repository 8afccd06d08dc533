// src/lib.rs
pub mod ports {
    pub mod broker;
    pub mod market;
    #[cfg(test)]
    pub mod mock_broker;
    pub mod operator;
    pub mod replay_broker;
}
pub mod alert_notifier;
pub mod config;
pub mod email_client;
pub mod error;
pub mod pairtrade;
pub mod rebalance;
pub mod recovery;
pub mod setup;
pub mod trade;
