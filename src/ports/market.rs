use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::broker::{Broker, BrokerError};
use super::replay_broker::ReplayBroker;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub primary_price: f64,
    pub secondary_price: f64,
    pub zscore: f64,
    /// Secondary lots per primary lot.
    pub hedge_ratio: f64,
    pub spread_mean: f64,
    pub spread_std: f64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MarketDataProvider: Send {
    /// `None` while the model is still warming up.
    async fn get_snapshot(&mut self) -> Result<Option<MarketSnapshot>, BrokerError>;

    /// True once a finite data source has nothing left to replay.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Log-price OLS spread over a rolling window of broker mid quotes.
pub struct RollingSpreadModel {
    broker: Arc<dyn Broker>,
    primary_symbol: String,
    secondary_symbol: String,
    primary_contract_size: f64,
    secondary_contract_size: f64,
    window: usize,
    min_samples: usize,
    primary_logs: VecDeque<f64>,
    secondary_logs: VecDeque<f64>,
    spreads: VecDeque<f64>,
    replay: Option<Arc<ReplayBroker>>,
    started: bool,
    exhausted: bool,
}

impl RollingSpreadModel {
    pub fn new(
        broker: Arc<dyn Broker>,
        primary: (&str, f64),
        secondary: (&str, f64),
        window: usize,
        min_samples: usize,
    ) -> Self {
        let window = window.max(2);
        Self {
            broker,
            primary_symbol: primary.0.to_string(),
            secondary_symbol: secondary.0.to_string(),
            primary_contract_size: primary.1,
            secondary_contract_size: secondary.1,
            window,
            min_samples: min_samples.clamp(2, window),
            primary_logs: VecDeque::with_capacity(window),
            secondary_logs: VecDeque::with_capacity(window),
            spreads: VecDeque::with_capacity(window),
            replay: None,
            started: false,
            exhausted: false,
        }
    }

    /// Steps the replay cursor once per snapshot after the first.
    pub fn with_replay(mut self, replay: Arc<ReplayBroker>) -> Self {
        self.replay = Some(replay);
        self
    }

    fn push(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
        if buf.len() == cap {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.replay
            .as_ref()
            .and_then(|r| r.current_timestamp_secs())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl MarketDataProvider for RollingSpreadModel {
    async fn get_snapshot(&mut self) -> Result<Option<MarketSnapshot>, BrokerError> {
        if let Some(replay) = &self.replay {
            if self.started && !replay.tick() {
                self.exhausted = true;
                return Ok(None);
            }
        }
        self.started = true;

        let primary = self.broker.get_price(&self.primary_symbol).await?.mid();
        let secondary = self.broker.get_price(&self.secondary_symbol).await?.mid();
        if primary <= 0.0 || secondary <= 0.0 {
            return Err(BrokerError::Unavailable(format!(
                "non-positive quote {}={} {}={}",
                self.primary_symbol, primary, self.secondary_symbol, secondary
            )));
        }

        Self::push(&mut self.primary_logs, primary.ln(), self.window);
        Self::push(&mut self.secondary_logs, secondary.ln(), self.window);
        if self.primary_logs.len() < self.min_samples {
            log::debug!(
                "[MARKET] warming up {}/{}",
                self.primary_logs.len(),
                self.min_samples
            );
            return Ok(None);
        }

        let beta = regression_beta(&self.secondary_logs, &self.primary_logs);
        let spread = primary.ln() - beta * secondary.ln();
        Self::push(&mut self.spreads, spread, self.window);
        if self.spreads.len() < self.min_samples {
            return Ok(None);
        }
        let Some((mean, std)) = mean_std(&self.spreads) else {
            return Ok(None);
        };
        if std < 1e-12 {
            return Ok(None);
        }

        let hedge_ratio = beta * (primary * self.primary_contract_size)
            / (secondary * self.secondary_contract_size);
        Ok(Some(MarketSnapshot {
            primary_price: primary,
            secondary_price: secondary,
            zscore: (spread - mean) / std,
            hedge_ratio,
            spread_mean: mean,
            spread_std: std,
            timestamp: self.timestamp(),
        }))
    }

    fn exhausted(&self) -> bool {
        self.exhausted
    }
}

/// OLS slope of `y` on `x`, clamped to [0.1, 10].
fn regression_beta(x: &VecDeque<f64>, y: &VecDeque<f64>) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 1.0;
    }
    let mean_x = x.iter().take(n).sum::<f64>() / n as f64;
    let mean_y = y.iter().take(n).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()).take(n) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
    }
    if var_x.abs() < 1e-9 {
        1.0
    } else {
        (cov / var_x).clamp(0.1, 10.0)
    }
}

fn mean_std(window: &VecDeque<f64>) -> Option<(f64, f64)> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().copied().sum::<f64>() / window.len() as f64;
    let var = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / window.len() as f64;
    Some((mean, var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock_broker::MockBroker;

    #[test]
    fn beta_recovers_linear_relation() {
        let x: VecDeque<f64> = (1..=20).map(|i| (i as f64) * 0.01).collect();
        let y: VecDeque<f64> = x.iter().map(|v| 2.0 * v + 0.3).collect();
        assert!((regression_beta(&x, &y) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn flat_series_falls_back_to_unit_beta() {
        let x: VecDeque<f64> = vec![1.0; 10].into();
        let y: VecDeque<f64> = vec![2.0; 10].into();
        assert_eq!(regression_beta(&x, &y), 1.0);
    }

    #[test]
    fn mean_std_of_window() {
        let w: VecDeque<f64> = vec![1.0, 3.0].into();
        assert_eq!(mean_std(&w), Some((2.0, 1.0)));
        assert_eq!(mean_std(&VecDeque::new()), None);
    }

    #[tokio::test]
    async fn warms_up_before_publishing() {
        let broker = Arc::new(
            MockBroker::new()
                .with_instrument("A", 0.01, 0.01, 10.0)
                .with_instrument("B", 0.01, 0.01, 10.0),
        );
        let mut model = RollingSpreadModel::new(broker.clone(), ("A", 1.0), ("B", 1.0), 50, 5);
        let mut published = None;
        for i in 0..12 {
            let a = 100.0 + (i as f64).sin() * 2.0;
            let b = 50.0 + (i as f64 * 0.7).cos();
            broker.set_price("A", a, a);
            broker.set_price("B", b, b);
            let snap = model.get_snapshot().await.unwrap();
            if i < 4 {
                assert!(snap.is_none());
            }
            published = snap.or(published);
        }
        let snap = published.expect("snapshot after warm-up");
        assert!(snap.zscore.is_finite());
        assert!(snap.hedge_ratio > 0.0);
        assert!(!model.exhausted());
    }
}
