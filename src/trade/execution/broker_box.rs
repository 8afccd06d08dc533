use async_trait::async_trait;
use std::sync::Arc;

use crate::alert_notifier::notify_rate_limit;
use crate::config::PairTradeConfig;
use crate::ports::broker::{
    AccountSnapshot, Broker, BrokerError, InstrumentSpec, OpenPosition, OrderRequest, OrderResult,
    Quote,
};
use crate::ports::replay_broker::ReplayBroker;

fn is_rate_limited(text: &str) -> bool {
    text.contains("429") || text.contains("Too Many Requests") || text.contains("rate limit")
}

/// Broker handle used by the engine. Forwards every call and raises an
/// operator alert when the broker starts throttling.
pub struct BrokerBox {
    pub inner: Arc<dyn Broker>,
    replay: Option<Arc<ReplayBroker>>,
}

impl BrokerBox {
    pub fn new(inner: Arc<dyn Broker>) -> Self {
        Self {
            inner,
            replay: None,
        }
    }

    pub fn create(cfg: &PairTradeConfig) -> Result<Self, BrokerError> {
        match cfg.broker_name.as_str() {
            "replay" => {
                let replay = Arc::new(ReplayBroker::new(
                    &cfg.replay_file,
                    &cfg.instruments,
                    cfg.fill_probability,
                )?);
                Ok(BrokerBox {
                    inner: replay.clone(),
                    replay: Some(replay),
                })
            }
            other => Err(BrokerError::Other(format!("unsupported broker {}", other))),
        }
    }

    /// The replay source, when the box wraps one.
    pub fn replay(&self) -> Option<Arc<ReplayBroker>> {
        self.replay.clone()
    }

    fn report_rate_limit(&self, operation: &str, detail: &str, err_text: &str) {
        if is_rate_limited(err_text) {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, err_text);
        }
    }

    fn check_order(&self, operation: &str, detail: &str, result: &OrderResult) {
        if let Some(err) = result.error.as_deref() {
            self.report_rate_limit(operation, detail, err);
        }
    }
}

#[async_trait]
impl Broker for BrokerBox {
    async fn get_instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, BrokerError> {
        let result = self.inner.get_instrument_spec(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_instrument_spec", symbol, &err.to_string());
        }
        result
    }

    async fn get_price(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let result = self.inner.get_price(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_price", symbol, &err.to_string());
        }
        result
    }

    async fn place_order(&self, request: &OrderRequest) -> OrderResult {
        let result = self.inner.place_order(request).await;
        self.check_order(
            "place_order",
            &format!(
                "{} | side={} lots={}",
                request.symbol, request.side, request.lots
            ),
            &result,
        );
        result
    }

    async fn close_position(&self, ticket: u64, lots: Option<f64>) -> OrderResult {
        let result = self.inner.close_position(ticket, lots).await;
        self.check_order("close_position", &format!("ticket={}", ticket), &result);
        result
    }

    async fn get_open_positions(
        &self,
        symbol_filter: Option<&str>,
    ) -> Result<Vec<OpenPosition>, BrokerError> {
        let result = self.inner.get_open_positions(symbol_filter).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "get_open_positions",
                symbol_filter.unwrap_or("ALL"),
                &err.to_string(),
            );
        }
        result
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let result = self.inner.get_account_snapshot().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_account_snapshot", "account", &err.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::broker::OrderSide;
    use crate::ports::mock_broker::MockBroker;

    #[test]
    fn detects_throttling_messages() {
        assert!(is_rate_limited("HTTP 429"));
        assert!(is_rate_limited("Too Many Requests"));
        assert!(!is_rate_limited("requote"));
    }

    #[tokio::test]
    async fn forwards_calls_to_inner_broker() {
        let mock = Arc::new(MockBroker::new().with_instrument("A", 0.01, 0.01, 1.0));
        let boxed = BrokerBox::new(mock.clone());
        let result = boxed
            .place_order(&OrderRequest {
                symbol: "A".to_string(),
                side: OrderSide::Buy,
                lots: 0.01,
                price_hint: None,
                deviation: 20,
                tag: "ID:000000".to_string(),
            })
            .await;
        assert!(result.success);
        assert_eq!(mock.placed().len(), 1);
        assert!(boxed.replay().is_none());
    }

    #[test]
    fn unknown_broker_is_rejected() {
        let cfg = PairTradeConfig {
            broker_name: "mt5".to_string(),
            ..PairTradeConfig::default()
        };
        assert!(matches!(
            BrokerBox::create(&cfg),
            Err(BrokerError::Other(_))
        ));
    }
}
