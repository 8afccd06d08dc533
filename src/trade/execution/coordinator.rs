use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert_notifier::{notify_incomplete_close, notify_operator};
use crate::error::{ensure_positive_lots, ValidationError};
use crate::ports::broker::{Broker, BrokerError, OrderRequest, OrderResult, OrderSide};
use crate::rebalance::drift::{AdjustmentAction, HedgeAdjustment};
use crate::rebalance::math::ratio_error;
use crate::rebalance::quantize::quantize_to_spec;
use crate::setup::model::{Leg, LegLevel, Setup, SetupStatus, Side};
use crate::setup::store::SetupStore;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub primary_symbol: String,
    pub secondary_symbol: String,
    /// Uniform scale applied to both legs of every new spread. Fixed for the
    /// life of the coordinator.
    pub volume_multiplier: f64,
    pub deviation: u32,
    pub ratio_error_warn_pct: f64,
}

impl CoordinatorConfig {
    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.primary_symbol, self.secondary_symbol)
    }
}

/// Order sides of the two legs: a LONG spread buys the primary and sells the
/// secondary.
pub fn leg_sides(side: Side) -> (OrderSide, OrderSide) {
    match side {
        Side::Long => (OrderSide::Buy, OrderSide::Sell),
        Side::Short => (OrderSide::Sell, OrderSide::Buy),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilledSpread {
    pub spread_id: String,
    pub short_id: String,
    pub primary: OrderResult,
    pub secondary: OrderResult,
    pub primary_ticket: u64,
    pub secondary_ticket: u64,
    pub intended_ratio: f64,
    pub ratio_error: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SpreadOutcome {
    Filled(FilledSpread),
    /// Nothing was opened; the secondary was never sent.
    PrimaryFailed { primary: OrderResult },
    /// The primary is open without its hedge and is left for reconciliation.
    Partial {
        short_id: String,
        primary: OrderResult,
        secondary: OrderResult,
    },
}

impl SpreadOutcome {
    pub fn filled(&self) -> Option<&FilledSpread> {
        match self {
            SpreadOutcome::Filled(f) => Some(f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloseAllReport {
    pub closed: Vec<u64>,
    pub already_closed: Vec<u64>,
    pub failed: Vec<u64>,
}

impl CloseAllReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentFill {
    pub result: OrderResult,
    pub executed_lots: f64,
    pub setup: Option<Setup>,
}

fn filled_ticket(result: &OrderResult) -> Option<u64> {
    if result.success {
        result.ticket
    } else {
        None
    }
}

/// Places spread orders and turns the fills into persisted setups. The only
/// writer of the setup store.
pub struct SpreadExecutionCoordinator {
    broker: Arc<dyn Broker>,
    store: SetupStore,
    config: CoordinatorConfig,
}

impl SpreadExecutionCoordinator {
    pub fn new(broker: Arc<dyn Broker>, store: SetupStore, config: CoordinatorConfig) -> Self {
        Self {
            broker,
            store,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &SetupStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SetupStore {
        &mut self.store
    }

    async fn quantize_for(&self, symbol: &str, raw_lots: f64) -> Result<f64> {
        let spec = self
            .broker
            .get_instrument_spec(symbol)
            .await
            .map_err(|e| match e {
                BrokerError::InstrumentNotFound(s) => {
                    anyhow::Error::new(ValidationError::UnknownSymbol(s))
                }
                other => anyhow::Error::new(other),
            })?;
        Ok(quantize_to_spec(raw_lots, &spec)?)
    }

    async fn price_hint(&self, symbol: &str, side: OrderSide) -> Option<f64> {
        self.broker
            .get_price(symbol)
            .await
            .ok()
            .map(|q| q.for_side(side))
    }

    async fn send(&self, symbol: &str, side: OrderSide, lots: f64, tag: &str) -> OrderResult {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            lots,
            price_hint: self.price_hint(symbol, side).await,
            deviation: self.config.deviation,
            tag: tag.to_string(),
        };
        self.broker.place_order(&request).await
    }

    /// Opens both legs of a spread.
    ///
    /// The intended ratio comes from the raw sizes; the primary is quantized
    /// first and the secondary target is derived from the rounded primary
    /// before it is quantized itself. Validation failures are `Err`; broker
    /// rejections come back as `PrimaryFailed` or `Partial`.
    pub async fn open_spread(
        &self,
        primary_raw_lots: f64,
        secondary_raw_lots: f64,
        side: Side,
    ) -> Result<SpreadOutcome> {
        ensure_positive_lots("primary lots", primary_raw_lots)?;
        ensure_positive_lots("secondary lots", secondary_raw_lots)?;

        let primary_scaled = primary_raw_lots * self.config.volume_multiplier;
        let secondary_scaled = secondary_raw_lots * self.config.volume_multiplier;
        let intended_ratio = secondary_raw_lots / primary_raw_lots;

        let primary_lots = self
            .quantize_for(&self.config.primary_symbol, primary_scaled)
            .await?;
        let secondary_lots = self
            .quantize_for(&self.config.secondary_symbol, primary_lots * intended_ratio)
            .await?;
        log::debug!(
            "[EXEC] sizing raw={:.4}/{:.4} scaled={:.4}/{:.4} quantized={}/{} ratio={:.4}",
            primary_raw_lots,
            secondary_raw_lots,
            primary_scaled,
            secondary_scaled,
            primary_lots,
            secondary_lots,
            intended_ratio
        );

        // Correlation token until both tickets exist.
        let timestamp = Utc::now();
        let short_id = timestamp.format("%H%M%S").to_string();
        let tag = format!("ID:{}", short_id);
        let (primary_side, secondary_side) = leg_sides(side);

        let primary = self
            .send(&self.config.primary_symbol, primary_side, primary_lots, &tag)
            .await;
        let Some(primary_ticket) = filled_ticket(&primary) else {
            log::warn!(
                "[EXEC] {} primary {} {} {} rejected: {}",
                short_id,
                primary_side,
                primary_lots,
                self.config.primary_symbol,
                primary.error.as_deref().unwrap_or("no ticket")
            );
            return Ok(SpreadOutcome::PrimaryFailed { primary });
        };

        let secondary = self
            .send(
                &self.config.secondary_symbol,
                secondary_side,
                secondary_lots,
                &tag,
            )
            .await;
        let Some(secondary_ticket) = filled_ticket(&secondary) else {
            let detail = format!(
                "{} {} spread {}: primary ticket {} ({} {} {}) is open without its hedge; secondary {} {} {} failed: {}",
                self.config.pair_label(),
                side,
                short_id,
                primary_ticket,
                primary_side,
                primary.filled_lots,
                self.config.primary_symbol,
                secondary_side,
                secondary_lots,
                self.config.secondary_symbol,
                secondary.error.as_deref().unwrap_or("no ticket")
            );
            log::error!("[PARTIAL] {}", detail);
            notify_operator("partial spread", &detail);
            return Ok(SpreadOutcome::Partial {
                short_id,
                primary,
                secondary,
            });
        };

        let spread_id = format!("{}-{}", primary_ticket, secondary_ticket);
        let actual_ratio = if primary.filled_lots > 0.0 {
            secondary.filled_lots / primary.filled_lots
        } else {
            f64::NAN
        };
        let error = ratio_error(actual_ratio, intended_ratio);
        match error {
            Some(e) if e > self.config.ratio_error_warn_pct => log::warn!(
                "[EXEC] {} ratio error {:.2}% (intended {:.4}, actual {:.4})",
                spread_id,
                e * 100.0,
                intended_ratio,
                actual_ratio
            ),
            _ => log::info!(
                "[EXEC] {} filled {} {} {} / {} {} {}",
                spread_id,
                primary_side,
                primary.filled_lots,
                self.config.primary_symbol,
                secondary_side,
                secondary.filled_lots,
                self.config.secondary_symbol
            ),
        }

        Ok(SpreadOutcome::Filled(FilledSpread {
            spread_id,
            short_id,
            primary,
            secondary,
            primary_ticket,
            secondary_ticket,
            intended_ratio,
            ratio_error: error,
            timestamp,
        }))
    }

    fn leg_from(filled: &FilledSpread, zscore: f64, level: LegLevel) -> Leg {
        Leg {
            spread_id: filled.spread_id.clone(),
            short_id: filled.short_id.clone(),
            primary_ticket: Some(filled.primary_ticket),
            secondary_ticket: Some(filled.secondary_ticket),
            entry_zscore: zscore,
            primary_lots: filled.primary.filled_lots,
            secondary_lots: filled.secondary.filled_lots,
            level,
            timestamp: filled.timestamp,
        }
    }

    /// Opens a new setup. The setup exists only if both legs filled.
    pub async fn open_setup(
        &mut self,
        primary_raw_lots: f64,
        secondary_raw_lots: f64,
        side: Side,
        zscore: f64,
    ) -> Result<(SpreadOutcome, Option<Setup>)> {
        let outcome = self
            .open_spread(primary_raw_lots, secondary_raw_lots, side)
            .await?;
        let Some(filled) = outcome.filled() else {
            return Ok((outcome, None));
        };

        let setup = Setup {
            setup_id: format!("setup_{}", filled.spread_id),
            entry_time: filled.timestamp,
            entry_zscore: zscore,
            exit_zscore: None,
            side,
            pair: self.config.pair_label(),
            entry_hedge_ratio: filled.intended_ratio,
            positions: vec![Self::leg_from(filled, zscore, LegLevel::Initial)],
            status: SetupStatus::Active,
            last_updated: filled.timestamp,
        };
        self.store
            .write(&setup)
            .with_context(|| format!("failed to persist {}", setup.setup_id))?;
        log::info!(
            "[ENTRY] {} {} z={:.3} ratio={:.4}",
            setup.setup_id,
            side,
            zscore,
            setup.entry_hedge_ratio
        );
        Ok((outcome, Some(setup)))
    }

    /// Adds a scale-in leg for ladder level `level_index`.
    pub async fn add_pyramid_leg(
        &mut self,
        setup_id: &str,
        level_index: u32,
        primary_raw_lots: f64,
        secondary_raw_lots: f64,
        zscore: f64,
    ) -> Result<(SpreadOutcome, Option<Setup>)> {
        let side = self
            .store
            .get(setup_id)
            .map(|s| s.side)
            .ok_or_else(|| ValidationError::UnknownSetup(setup_id.to_string()))?;
        let outcome = self
            .open_spread(primary_raw_lots, secondary_raw_lots, side)
            .await?;
        let Some(filled) = outcome.filled() else {
            return Ok((outcome, None));
        };
        let leg = Self::leg_from(filled, zscore, LegLevel::Pyramid(level_index));
        let setup = self
            .store
            .add_leg(setup_id, leg)
            .with_context(|| format!("failed to persist pyramid leg of {}", setup_id))?;
        log::info!(
            "[PYRAMID] {} level {} z={:.3} legs={}",
            setup_id,
            level_index,
            zscore,
            setup.positions.len()
        );
        Ok((outcome, Some(setup)))
    }

    /// Places the single-leg order of a hedge adjustment and records it as an
    /// `adjustment_N` leg.
    pub async fn execute_adjustment(
        &mut self,
        adjustment: &HedgeAdjustment,
        zscore: f64,
    ) -> Result<AdjustmentFill> {
        let side = self
            .store
            .get(&adjustment.setup_id)
            .map(|s| s.side)
            .ok_or_else(|| ValidationError::UnknownSetup(adjustment.setup_id.clone()))?;
        ensure_positive_lots("adjustment lots", adjustment.quantity)?;

        let (primary_side, secondary_side) = leg_sides(side);
        let is_primary = if adjustment.symbol == self.config.primary_symbol {
            true
        } else if adjustment.symbol == self.config.secondary_symbol {
            false
        } else {
            return Err(ValidationError::UnknownSymbol(adjustment.symbol.clone()).into());
        };
        let leg_side = if is_primary {
            primary_side
        } else {
            secondary_side
        };
        let order_side = match adjustment.action {
            AdjustmentAction::Buy => leg_side,
            AdjustmentAction::Sell => leg_side.opposite(),
        };

        let lots = self
            .quantize_for(&adjustment.symbol, adjustment.quantity)
            .await?;
        let timestamp = Utc::now();
        let short_id = timestamp.format("%H%M%S").to_string();
        let result = self
            .send(
                &adjustment.symbol,
                order_side,
                lots,
                &format!("ID:{}", short_id),
            )
            .await;
        let Some(ticket) = filled_ticket(&result) else {
            log::warn!(
                "[HEDGE] {} adjustment {} {} {} rejected: {}",
                adjustment.setup_id,
                order_side,
                lots,
                adjustment.symbol,
                result.error.as_deref().unwrap_or("no ticket")
            );
            return Ok(AdjustmentFill {
                result,
                executed_lots: 0.0,
                setup: None,
            });
        };

        let index = self
            .store
            .get(&adjustment.setup_id)
            .map(|s| s.next_adjustment_index())
            .unwrap_or(1);
        let leg = Leg {
            spread_id: format!("adj-{}", ticket),
            short_id,
            primary_ticket: is_primary.then_some(ticket),
            secondary_ticket: (!is_primary).then_some(ticket),
            entry_zscore: zscore,
            primary_lots: if is_primary { result.filled_lots } else { 0.0 },
            secondary_lots: if is_primary { 0.0 } else { result.filled_lots },
            level: LegLevel::Adjustment(index),
            timestamp,
        };
        let setup = self
            .store
            .add_leg(&adjustment.setup_id, leg)
            .with_context(|| format!("failed to persist adjustment of {}", adjustment.setup_id))?;
        log::info!(
            "[HEDGE] {} adjusted {} {} {} (ticket {})",
            adjustment.setup_id,
            order_side,
            result.filled_lots,
            adjustment.symbol,
            ticket
        );
        Ok(AdjustmentFill {
            executed_lots: result.filled_lots,
            result,
            setup: Some(setup),
        })
    }

    /// Closes both legs independently; one failure does not stop the other.
    pub async fn close_spread(
        &self,
        primary_ticket: u64,
        secondary_ticket: u64,
    ) -> (OrderResult, OrderResult) {
        let primary = self.broker.close_position(primary_ticket, None).await;
        let secondary = self.broker.close_position(secondary_ticket, None).await;
        if !(primary.success && secondary.success) {
            log::warn!(
                "[EXIT] close {}-{} incomplete: primary={} secondary={}",
                primary_ticket,
                secondary_ticket,
                primary.error.as_deref().unwrap_or("ok"),
                secondary.error.as_deref().unwrap_or("ok")
            );
        }
        (primary, secondary)
    }

    /// Closes every live ticket of the setup. Tickets the broker no longer
    /// reports count as already closed.
    pub async fn close_all_legs_in_setup(&self, setup_id: &str) -> Result<CloseAllReport> {
        let setup = self
            .store
            .get(setup_id)
            .ok_or_else(|| ValidationError::UnknownSetup(setup_id.to_string()))?;
        let live: HashSet<u64> = self
            .broker
            .get_open_positions(None)
            .await
            .context("failed to list open positions")?
            .into_iter()
            .map(|p| p.ticket)
            .collect();

        let mut report = CloseAllReport::default();
        for ticket in setup.tickets() {
            if !live.contains(&ticket) {
                report.already_closed.push(ticket);
                continue;
            }
            let result = self.broker.close_position(ticket, None).await;
            if result.success {
                report.closed.push(ticket);
            } else {
                log::warn!(
                    "[EXIT] {} ticket {} close failed: {}",
                    setup_id,
                    ticket,
                    result.error.as_deref().unwrap_or("unknown")
                );
                report.failed.push(ticket);
            }
        }
        if !report.success() {
            log::error!(
                "[EXIT] {} partially closed, failed tickets {:?}",
                setup_id,
                report.failed
            );
        }
        Ok(report)
    }

    /// Closes all legs and records the outcome: CLOSED when every ticket is
    /// gone, PARTIAL (still active) otherwise.
    pub async fn close_setup(
        &mut self,
        setup_id: &str,
        exit_zscore: Option<f64>,
    ) -> Result<(CloseAllReport, Setup)> {
        let report = self.close_all_legs_in_setup(setup_id).await?;
        let setup = if report.success() {
            let setup = self.store.mark_closed(setup_id, exit_zscore)?;
            log::info!(
                "[EXIT] {} closed: {} tickets closed, {} already gone, exit z={}",
                setup_id,
                report.closed.len(),
                report.already_closed.len(),
                exit_zscore.map_or_else(|| "unknown".to_string(), |z| format!("{:.3}", z))
            );
            setup
        } else {
            notify_incomplete_close(
                setup_id,
                &format!("{} failed tickets {:?}", setup_id, report.failed),
            );
            self.store.mark_partial(setup_id)?
        };
        Ok((report, setup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock_broker::MockBroker;
    use tempfile::TempDir;

    fn config(multiplier: f64) -> CoordinatorConfig {
        CoordinatorConfig {
            primary_symbol: "XAUUSD".to_string(),
            secondary_symbol: "XAGUSD".to_string(),
            volume_multiplier: multiplier,
            deviation: 20,
            ratio_error_warn_pct: 0.05,
        }
    }

    fn coordinator(multiplier: f64) -> (SpreadExecutionCoordinator, Arc<MockBroker>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(
            MockBroker::new()
                .with_instrument("XAUUSD", 0.01, 0.01, 100.0)
                .with_instrument("XAGUSD", 0.01, 0.01, 100.0),
        );
        let store = SetupStore::open(dir.path()).unwrap();
        (
            SpreadExecutionCoordinator::new(broker.clone(), store, config(multiplier)),
            broker,
            dir,
        )
    }

    #[tokio::test]
    async fn ratio_survives_quantization() {
        let (coord, broker, _dir) = coordinator(1.0);
        let outcome = coord.open_spread(0.01, 0.1, Side::Long).await.unwrap();
        let filled = outcome.filled().expect("filled");
        assert!((filled.intended_ratio - 10.0).abs() < 1e-9);
        assert!(filled.ratio_error.unwrap() < 1e-9);

        let orders = broker.placed();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].symbol, "XAUUSD");
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].lots, 0.01);
        assert_eq!(orders[1].symbol, "XAGUSD");
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].lots, 0.1);
        assert_eq!(orders[0].tag, orders[1].tag);
        assert!(orders[0].tag.starts_with("ID:"));
        assert_eq!(
            filled.spread_id,
            format!("{}-{}", filled.primary_ticket, filled.secondary_ticket)
        );
    }

    #[tokio::test]
    async fn secondary_is_derived_from_rounded_primary() {
        let (coord, broker, _dir) = coordinator(1.0);
        // primary 0.014 rounds to 0.01, so the secondary target is 0.01 * 7 = 0.07,
        // not round(0.098) = 0.10
        coord.open_spread(0.014, 0.098, Side::Short).await.unwrap();
        let orders = broker.placed();
        assert_eq!(orders[0].lots, 0.01);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[1].lots, 0.07);
        assert_eq!(orders[1].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn multiplier_scales_both_legs() {
        let (coord, broker, _dir) = coordinator(3.0);
        coord.open_spread(0.01, 0.05, Side::Long).await.unwrap();
        let orders = broker.placed();
        assert_eq!(orders[0].lots, 0.03);
        assert_eq!(orders[1].lots, 0.15);
    }

    #[tokio::test]
    async fn primary_failure_never_sends_secondary() {
        let (mut coord, broker, _dir) = coordinator(1.0);
        broker.fail_orders_for("XAUUSD");
        let (outcome, setup) = coord.open_setup(0.01, 0.1, Side::Long, -2.0).await.unwrap();
        assert!(matches!(outcome, SpreadOutcome::PrimaryFailed { .. }));
        assert!(setup.is_none());
        assert_eq!(broker.placed().len(), 1);
        assert_eq!(coord.store().active_count(), 0);
    }

    #[tokio::test]
    async fn secondary_failure_is_partial_without_setup() {
        let (mut coord, broker, _dir) = coordinator(1.0);
        broker.fail_orders_for("XAGUSD");
        let (outcome, setup) = coord.open_setup(0.01, 0.1, Side::Long, -2.0).await.unwrap();
        match outcome {
            SpreadOutcome::Partial {
                primary, secondary, ..
            } => {
                assert!(primary.success);
                assert!(!secondary.success);
            }
            other => panic!("expected partial, got {:?}", other),
        }
        assert!(setup.is_none());
        assert_eq!(coord.store().active_count(), 0);
        assert_eq!(broker.open_tickets().len(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_lots_and_symbols() {
        let (coord, broker, _dir) = coordinator(1.0);
        assert!(coord.open_spread(0.0, 0.1, Side::Long).await.is_err());
        assert!(coord.open_spread(0.01, -0.1, Side::Long).await.is_err());
        assert!(broker.placed().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let lonely = Arc::new(MockBroker::new().with_instrument("XAUUSD", 0.01, 0.01, 1.0));
        let coord = SpreadExecutionCoordinator::new(
            lonely,
            SetupStore::open(dir.path()).unwrap(),
            config(1.0),
        );
        let err = coord.open_spread(0.01, 0.1, Side::Long).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::UnknownSymbol("XAGUSD".to_string()))
        );
    }

    #[tokio::test]
    async fn open_setup_persists_initial_leg() {
        let (mut coord, _broker, _dir) = coordinator(1.0);
        let (_, setup) = coord.open_setup(0.01, 0.1, Side::Long, -2.1).await.unwrap();
        let setup = setup.unwrap();
        assert!(setup.setup_id.starts_with("setup_"));
        assert_eq!(setup.positions.len(), 1);
        assert_eq!(setup.positions[0].level, LegLevel::Initial);
        assert_eq!(setup.pair, "XAUUSD/XAGUSD");
        assert_eq!(coord.store().get(&setup.setup_id), Some(&setup));
    }

    #[tokio::test]
    async fn pyramid_and_adjustment_legs_are_appended() {
        let (mut coord, broker, _dir) = coordinator(1.0);
        let (_, setup) = coord.open_setup(0.05, 0.02, Side::Long, -2.0).await.unwrap();
        let id = setup.unwrap().setup_id;

        let (_, updated) = coord
            .add_pyramid_leg(&id, 1, 0.05, 0.02, -2.5)
            .await
            .unwrap();
        assert_eq!(updated.unwrap().positions[1].level, LegLevel::Pyramid(1));

        let adjustment = HedgeAdjustment {
            setup_id: id.clone(),
            symbol: "XAGUSD".to_string(),
            action: AdjustmentAction::Buy,
            quantity: 0.0159,
            reason: "test".to_string(),
            old_hedge_ratio: 0.4,
            new_hedge_ratio: 0.7179,
            drift_pct: 0.44,
        };
        let fill = coord.execute_adjustment(&adjustment, -2.6).await.unwrap();
        assert!(fill.result.success);
        assert_eq!(fill.executed_lots, 0.02);
        let setup = fill.setup.unwrap();
        let leg = setup.positions.last().unwrap();
        assert_eq!(leg.level, LegLevel::Adjustment(1));
        assert_eq!(leg.primary_ticket, None);
        assert_eq!(leg.secondary_ticket, fill.result.ticket);

        // LONG spread holds the secondary short, so adding to it sells more
        let last = broker.placed().pop().unwrap();
        assert_eq!(last.side, OrderSide::Sell);
        assert_eq!(last.symbol, "XAGUSD");
    }

    #[tokio::test]
    async fn close_all_skips_missing_tickets() {
        let (mut coord, broker, _dir) = coordinator(1.0);
        let (_, setup) = coord.open_setup(0.01, 0.1, Side::Long, -2.0).await.unwrap();
        let setup = setup.unwrap();
        let tickets = setup.tickets();
        broker.remove_position(tickets[1]);

        let report = coord.close_all_legs_in_setup(&setup.setup_id).await.unwrap();
        assert_eq!(report.closed, vec![tickets[0]]);
        assert_eq!(report.already_closed, vec![tickets[1]]);
        assert!(report.success());
    }

    #[tokio::test]
    async fn failed_close_leaves_setup_partial() {
        let (mut coord, broker, _dir) = coordinator(1.0);
        let (_, setup) = coord.open_setup(0.01, 0.1, Side::Short, 2.0).await.unwrap();
        let setup = setup.unwrap();
        let tickets = setup.tickets();
        broker.fail_close(tickets[0]);

        let (report, stored) = coord.close_setup(&setup.setup_id, Some(0.4)).await.unwrap();
        assert_eq!(report.failed, vec![tickets[0]]);
        assert_eq!(report.closed, vec![tickets[1]]);
        assert_eq!(stored.status, SetupStatus::Partial);
        assert_eq!(coord.store().active_count(), 1);
    }

    #[tokio::test]
    async fn close_setup_records_exit() {
        let (mut coord, _broker, _dir) = coordinator(1.0);
        let (_, setup) = coord.open_setup(0.01, 0.1, Side::Short, 2.0).await.unwrap();
        let id = setup.unwrap().setup_id;
        let (report, stored) = coord.close_setup(&id, Some(0.4)).await.unwrap();
        assert_eq!(report.closed.len(), 2);
        assert_eq!(stored.status, SetupStatus::Closed);
        assert_eq!(stored.exit_zscore, Some(0.4));
        assert_eq!(coord.store().active_count(), 0);
    }

    #[tokio::test]
    async fn close_spread_attempts_both_legs() {
        let (coord, broker, _dir) = coordinator(1.0);
        broker.add_position(7, "XAUUSD", OrderSide::Buy, 0.01);
        let (primary, secondary) = coord.close_spread(99, 7).await;
        assert!(!primary.success);
        assert!(secondary.success);
        assert_eq!(broker.closes.lock().unwrap().len(), 2);
    }
}
