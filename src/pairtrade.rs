use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::PairTradeConfig;
use crate::ports::broker::Broker;
use crate::ports::market::{MarketDataProvider, MarketSnapshot, RollingSpreadModel};
use crate::ports::operator::{ConsolePrompt, OperatorPrompt};
use crate::ports::replay_broker::ReplayBroker;
use crate::rebalance::drift::{assess, DriftConfig, DriftState, DriftStatistics};
use crate::rebalance::{HedgeDriftController, PyramidLadder};
use crate::recovery::{RecoveryOutcome, RecoveryReconciler};
use crate::setup::model::{Setup, SetupStatus, Side};
use crate::setup::store::SetupStore;
use crate::trade::execution::{
    BrokerBox, CoordinatorConfig, SpreadExecutionCoordinator, SpreadOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    MeanReversion,
    StopLoss,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitReason::MeanReversion => write!(f, "mean reversion"),
            ExitReason::StopLoss => write!(f, "stop loss"),
        }
    }
}

/// Work item from the signal evaluator to the action executor. The executor
/// re-checks every request against its own state before acting.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    Open {
        side: Side,
        zscore: f64,
        primary_lots: f64,
        secondary_lots: f64,
    },
    Pyramid {
        setup_id: String,
        level_index: usize,
        zscore: f64,
        primary_lots: f64,
        secondary_lots: f64,
    },
    Close {
        setup_id: String,
        zscore: f64,
        reason: ExitReason,
    },
    RebalanceHedge {
        setup_id: String,
        hedge_ratio: f64,
        zscore: f64,
    },
}

#[derive(Debug, Clone)]
pub struct SetupView {
    pub setup_id: String,
    pub side: Side,
    pub status: SetupStatus,
    pub entry_zscore: f64,
    pub legs: usize,
    pub primary_lots: f64,
    pub secondary_lots: f64,
    pub ladder: Option<PyramidLadder>,
    pub hedge_state: DriftState,
}

/// Read-only copy of the executor's state, republished after every iteration.
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub setups: Vec<SetupView>,
    pub hedge: Option<DriftStatistics>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PortfolioView {
    fn has_side(&self, side: Side) -> bool {
        self.setups.iter().any(|s| s.side == side)
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub entry_zscore: f64,
    pub exit_zscore: f64,
    pub stop_loss_zscore: f64,
    pub max_active_setups: usize,
    pub entry_cooldown: Duration,
    pub base_primary_lots: f64,
    pub enable_pyramiding: bool,
    pub drift: DriftConfig,
}

impl From<&PairTradeConfig> for SignalConfig {
    fn from(cfg: &PairTradeConfig) -> Self {
        Self {
            entry_zscore: cfg.entry_zscore,
            exit_zscore: cfg.exit_zscore,
            stop_loss_zscore: cfg.stop_loss_zscore,
            max_active_setups: cfg.max_active_setups,
            entry_cooldown: Duration::from_secs(cfg.entry_cooldown_secs),
            base_primary_lots: cfg.base_primary_lots,
            enable_pyramiding: cfg.enable_pyramiding,
            drift: cfg.drift_config(),
        }
    }
}

/// Turns market snapshots into action requests.
pub struct SignalEvaluator {
    config: SignalConfig,
    last_entry: Option<Instant>,
}

impl SignalEvaluator {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            last_entry: None,
        }
    }

    fn exit_reason(&self, side: Side, zscore: f64) -> Option<ExitReason> {
        if zscore.abs() > self.config.stop_loss_zscore {
            return Some(ExitReason::StopLoss);
        }
        let reverted = match side {
            Side::Long => zscore >= -self.config.exit_zscore,
            Side::Short => zscore <= self.config.exit_zscore,
        };
        reverted.then_some(ExitReason::MeanReversion)
    }

    fn entry_side(&self, zscore: f64) -> Option<Side> {
        if zscore.abs() > self.config.stop_loss_zscore {
            None
        } else if zscore <= -self.config.entry_zscore {
            Some(Side::Long)
        } else if zscore >= self.config.entry_zscore {
            Some(Side::Short)
        } else {
            None
        }
    }

    pub fn evaluate(
        &mut self,
        snapshot: &MarketSnapshot,
        view: &PortfolioView,
    ) -> Vec<ActionRequest> {
        self.evaluate_at(snapshot, view, Instant::now())
    }

    pub fn evaluate_at(
        &mut self,
        snapshot: &MarketSnapshot,
        view: &PortfolioView,
        now: Instant,
    ) -> Vec<ActionRequest> {
        let z = snapshot.zscore;
        let ratio = snapshot.hedge_ratio;
        let mut actions = Vec::new();
        if !z.is_finite() {
            return actions;
        }
        let sizable = ratio.is_finite() && ratio > 0.0;
        let primary_lots = self.config.base_primary_lots;
        let secondary_lots = primary_lots * ratio;

        for setup in &view.setups {
            if let Some(reason) = self.exit_reason(setup.side, z) {
                actions.push(ActionRequest::Close {
                    setup_id: setup.setup_id.clone(),
                    zscore: z,
                    reason,
                });
                continue;
            }
            if setup.status != SetupStatus::Active {
                continue;
            }
            if self.config.enable_pyramiding && sizable {
                if let Some((level_index, _)) =
                    setup.ladder.as_ref().and_then(|l| l.check_trigger(z))
                {
                    actions.push(ActionRequest::Pyramid {
                        setup_id: setup.setup_id.clone(),
                        level_index,
                        zscore: z,
                        primary_lots,
                        secondary_lots,
                    });
                }
            }
            let hedge_open = !matches!(
                setup.hedge_state,
                DriftState::CoolingDown | DriftState::Disabled
            );
            if self.config.drift.enabled
                && hedge_open
                && assess(setup.primary_lots, setup.secondary_lots, ratio, &self.config.drift)
                    .is_some()
            {
                actions.push(ActionRequest::RebalanceHedge {
                    setup_id: setup.setup_id.clone(),
                    hedge_ratio: ratio,
                    zscore: z,
                });
            }
        }

        let cooled = self
            .last_entry
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.entry_cooldown);
        if let Some(side) = self.entry_side(z) {
            if sizable
                && cooled
                && !view.has_side(side)
                && view.setups.len() < self.config.max_active_setups
            {
                self.last_entry = Some(now);
                actions.push(ActionRequest::Open {
                    side,
                    zscore: z,
                    primary_lots,
                    secondary_lots,
                });
            }
        }
        actions
    }
}

/// Single writer of setup state: owns the coordinator (and through it the
/// store), the pyramid ladders and the drift controller.
struct ActionExecutor {
    coordinator: SpreadExecutionCoordinator,
    ladders: HashMap<String, PyramidLadder>,
    drift: HedgeDriftController,
    enable_pyramiding: bool,
    scale_interval: f64,
    max_zscore: f64,
    max_active_setups: usize,
    observe_only: bool,
}

impl ActionExecutor {
    fn new(cfg: &PairTradeConfig, coordinator: SpreadExecutionCoordinator) -> Self {
        let mut executor = Self {
            coordinator,
            ladders: HashMap::new(),
            drift: HedgeDriftController::new(cfg.drift_config()),
            enable_pyramiding: cfg.enable_pyramiding,
            scale_interval: cfg.scale_interval,
            max_zscore: cfg.max_zscore,
            max_active_setups: cfg.max_active_setups,
            observe_only: cfg.observe_only,
        };
        let setups = executor.coordinator.store().read_all_active();
        for setup in &setups {
            executor.track(setup);
        }
        if !setups.is_empty() {
            log::info!(
                "[STATUS] rebuilt {} ladders and {} hedge tracks from the store",
                executor.ladders.len(),
                setups.len()
            );
        }
        executor
    }

    fn track(&mut self, setup: &Setup) {
        if self.enable_pyramiding {
            match PyramidLadder::from_setup(setup, self.scale_interval, self.max_zscore) {
                Ok(ladder) => {
                    self.ladders.insert(setup.setup_id.clone(), ladder);
                }
                Err(e) => log::warn!("[PYRAMID] {} has no ladder: {}", setup.setup_id, e),
            }
        }
        let (primary_lots, secondary_lots) = setup.total_lots();
        let config = self.coordinator.config();
        self.drift.register_setup(
            &setup.setup_id,
            &config.primary_symbol,
            &config.secondary_symbol,
            primary_lots,
            secondary_lots,
            setup.entry_hedge_ratio,
        );
    }

    fn forget(&mut self, setup_id: &str) {
        self.ladders.remove(setup_id);
        self.drift.remove(setup_id);
    }

    async fn handle(&mut self, request: ActionRequest) -> Result<()> {
        match request {
            ActionRequest::Open {
                side,
                zscore,
                primary_lots,
                secondary_lots,
            } => self.open(side, zscore, primary_lots, secondary_lots).await,
            ActionRequest::Pyramid {
                setup_id,
                level_index,
                zscore,
                primary_lots,
                secondary_lots,
            } => {
                self.pyramid(&setup_id, level_index, zscore, primary_lots, secondary_lots)
                    .await
            }
            ActionRequest::Close {
                setup_id,
                zscore,
                reason,
            } => self.close(&setup_id, zscore, reason).await,
            ActionRequest::RebalanceHedge {
                setup_id,
                hedge_ratio,
                zscore,
            } => self.rebalance(&setup_id, hedge_ratio, zscore).await,
        }
    }

    async fn open(
        &mut self,
        side: Side,
        zscore: f64,
        primary_lots: f64,
        secondary_lots: f64,
    ) -> Result<()> {
        let store = self.coordinator.store();
        if store.active().any(|s| s.side == side) {
            log::debug!("[ENTRY] {} setup already open, skipping", side);
            return Ok(());
        }
        if store.active_count() >= self.max_active_setups {
            log::debug!("[ENTRY] {} active setups, limit reached", store.active_count());
            return Ok(());
        }
        if self.observe_only {
            log::info!(
                "[ENTRY] observe only: would open {} {:.4}/{:.4} at z={:.3}",
                side,
                primary_lots,
                secondary_lots,
                zscore
            );
            return Ok(());
        }
        let (outcome, setup) = self
            .coordinator
            .open_setup(primary_lots, secondary_lots, side, zscore)
            .await?;
        match setup {
            Some(setup) => self.track(&setup),
            None => log::warn!(
                "[ENTRY] {} entry at z={:.3} did not fill: {:?}",
                side,
                zscore,
                outcome
            ),
        }
        Ok(())
    }

    async fn pyramid(
        &mut self,
        setup_id: &str,
        level_index: usize,
        zscore: f64,
        primary_lots: f64,
        secondary_lots: f64,
    ) -> Result<()> {
        let level_zscore = match self
            .ladders
            .get(setup_id)
            .and_then(|l| l.check_trigger(zscore))
        {
            Some((idx, level)) if idx == level_index => level.zscore,
            _ => {
                log::debug!("[PYRAMID] {} level {} no longer due", setup_id, level_index);
                return Ok(());
            }
        };
        if self.observe_only {
            log::info!(
                "[PYRAMID] observe only: would scale {} at level {} (z={:.3})",
                setup_id,
                level_index,
                zscore
            );
            return Ok(());
        }
        let (outcome, _) = self
            .coordinator
            .add_pyramid_leg(
                setup_id,
                level_index as u32,
                primary_lots,
                secondary_lots,
                zscore,
            )
            .await?;
        if let SpreadOutcome::Filled(filled) = outcome {
            if let Some(ladder) = self.ladders.get_mut(setup_id) {
                ladder.mark_executed(
                    level_zscore,
                    filled.primary.filled_lots,
                    filled.secondary.filled_lots,
                );
            }
            self.drift.record_scale_in(
                setup_id,
                filled.primary.filled_lots,
                filled.secondary.filled_lots,
            )?;
        }
        Ok(())
    }

    async fn close(&mut self, setup_id: &str, zscore: f64, reason: ExitReason) -> Result<()> {
        if self.coordinator.store().get(setup_id).is_none() {
            log::debug!("[EXIT] {} is not active", setup_id);
            return Ok(());
        }
        if self.observe_only {
            log::info!(
                "[EXIT] observe only: would close {} ({}) at z={:.3}",
                setup_id,
                reason,
                zscore
            );
            return Ok(());
        }
        log::info!("[EXIT] closing {} on {} at z={:.3}", setup_id, reason, zscore);
        let (_, setup) = self.coordinator.close_setup(setup_id, Some(zscore)).await?;
        if setup.status == SetupStatus::Closed {
            self.forget(setup_id);
        }
        Ok(())
    }

    async fn rebalance(&mut self, setup_id: &str, hedge_ratio: f64, zscore: f64) -> Result<()> {
        if self.coordinator.store().get(setup_id).is_none() {
            return Ok(());
        }
        let Some(adjustment) = self.drift.evaluate(setup_id, hedge_ratio) else {
            log::debug!("[HEDGE] {} no adjustment due", setup_id);
            return Ok(());
        };
        if self.observe_only {
            log::info!(
                "[HEDGE] observe only: would {} {:.4} {} ({})",
                adjustment.action,
                adjustment.quantity,
                adjustment.symbol,
                adjustment.reason
            );
            return Ok(());
        }
        let fill = self
            .coordinator
            .execute_adjustment(&adjustment, zscore)
            .await?;
        if fill.executed_lots > 0.0 {
            self.drift.apply(&adjustment, fill.executed_lots)?;
        }
        Ok(())
    }

    fn view(&self, hedge_ratio: Option<f64>) -> PortfolioView {
        let setups = self
            .coordinator
            .store()
            .active()
            .map(|setup| {
                let (primary_lots, secondary_lots) = self
                    .drift
                    .lots(&setup.setup_id)
                    .unwrap_or_else(|| setup.total_lots());
                SetupView {
                    setup_id: setup.setup_id.clone(),
                    side: setup.side,
                    status: setup.status,
                    entry_zscore: setup.entry_zscore,
                    legs: setup.positions.len(),
                    primary_lots,
                    secondary_lots,
                    ladder: self.ladders.get(&setup.setup_id).cloned(),
                    hedge_state: self.drift.state(
                        &setup.setup_id,
                        hedge_ratio.unwrap_or(setup.entry_hedge_ratio),
                    ),
                }
            })
            .collect();
        PortfolioView {
            setups,
            hedge: Some(self.drift.statistics()),
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusSetup {
    setup_id: String,
    side: Side,
    status: SetupStatus,
    legs: usize,
    primary_lots: f64,
    secondary_lots: f64,
    pyramid_levels_left: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    ts: i64,
    updated_at: String,
    pair: String,
    observe_only: bool,
    balance: Option<f64>,
    equity: Option<f64>,
    active_setups: usize,
    total_primary_lots: f64,
    total_secondary_lots: f64,
    last_zscore: Option<f64>,
    hedge_ratio: Option<f64>,
    setups: Vec<StatusSetup>,
    hedge: Option<DriftStatistics>,
}

struct StatusReporter {
    path: Option<PathBuf>,
    pair: String,
    observe_only: bool,
}

impl StatusReporter {
    async fn report(
        &self,
        broker: &dyn Broker,
        snapshot: Option<&MarketSnapshot>,
        view: &PortfolioView,
    ) -> Result<()> {
        let account = match broker.get_account_snapshot().await {
            Ok(a) => Some(a),
            Err(e) => {
                log::warn!("[STATUS] account snapshot unavailable: {}", e);
                None
            }
        };
        let (total_primary, total_secondary) = view
            .setups
            .iter()
            .fold((0.0, 0.0), |(p, s), v| (p + v.primary_lots, s + v.secondary_lots));
        let status = StatusSnapshot {
            ts: Utc::now().timestamp(),
            updated_at: Utc::now().to_rfc3339(),
            pair: self.pair.clone(),
            observe_only: self.observe_only,
            balance: account.as_ref().map(|a| a.balance),
            equity: account.as_ref().map(|a| a.equity),
            active_setups: view.setups.len(),
            total_primary_lots: total_primary,
            total_secondary_lots: total_secondary,
            last_zscore: snapshot.map(|s| s.zscore),
            hedge_ratio: snapshot.map(|s| s.hedge_ratio),
            setups: view
                .setups
                .iter()
                .map(|v| StatusSetup {
                    setup_id: v.setup_id.clone(),
                    side: v.side,
                    status: v.status,
                    legs: v.legs,
                    primary_lots: v.primary_lots,
                    secondary_lots: v.secondary_lots,
                    pyramid_levels_left: v.ladder.as_ref().map(|l| l.remaining()),
                })
                .collect(),
            hedge: view.hedge.clone(),
        };
        log::info!(
            "[STATUS] {} balance={} equity={} setups={} lots={:.4}/{:.4} z={}",
            status.pair,
            status.balance.map_or("n/a".to_string(), |b| format!("{:.2}", b)),
            status.equity.map_or("n/a".to_string(), |e| format!("{:.2}", e)),
            status.active_setups,
            status.total_primary_lots,
            status.total_secondary_lots,
            status
                .last_zscore
                .map_or("n/a".to_string(), |z| format!("{:.3}", z))
        );
        if let Some(path) = &self.path {
            write_status(path, &status)?;
        }
        Ok(())
    }
}

fn write_status(path: &Path, status: &StatusSnapshot) -> Result<()> {
    let payload = serde_json::to_string_pretty(status)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct WorkerTiming {
    poll_interval: Duration,
    status_interval: Duration,
    enqueue_timeout: Duration,
    recv_timeout: Duration,
    error_backoff: Duration,
    shutdown_grace: Duration,
}

impl WorkerTiming {
    fn new(cfg: &PairTradeConfig, replay: bool) -> Self {
        Self {
            poll_interval: if replay {
                Duration::ZERO
            } else {
                Duration::from_secs(cfg.interval_secs)
            },
            status_interval: Duration::from_secs(cfg.status_interval_secs),
            enqueue_timeout: Duration::from_millis(cfg.enqueue_timeout_ms),
            recv_timeout: Duration::from_millis(cfg.recv_timeout_ms),
            error_backoff: Duration::from_secs(cfg.error_backoff_secs),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }
}

/// Waits for `duration` unless shutdown is requested first. Returns true when
/// the worker should stop.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return *shutdown.borrow();
    }
    let closed = tokio::select! {
        _ = sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}

async fn enqueue<T>(queue: &mpsc::Sender<T>, item: T, wait: Duration, what: &str) -> bool {
    match queue.send_timeout(item, wait).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            log::warn!("[QUEUE] {} queue full, item dropped", what);
            true
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

async fn market_worker(
    mut provider: Box<dyn MarketDataProvider>,
    latest: watch::Sender<Option<MarketSnapshot>>,
    queue: mpsc::Sender<MarketSnapshot>,
    mut shutdown: watch::Receiver<bool>,
    timing: WorkerTiming,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match provider.get_snapshot().await {
            Ok(Some(snapshot)) => {
                latest.send_replace(Some(snapshot.clone()));
                if !enqueue(&queue, snapshot, timing.enqueue_timeout, "snapshot").await {
                    break;
                }
            }
            Ok(None) if provider.exhausted() => {
                log::info!("[STATUS] market data exhausted, draining workers");
                break;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("market poll failed: {}", e);
                if pause(timing.error_backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }
        }
        if pause(timing.poll_interval, &mut shutdown).await {
            break;
        }
    }
    log::debug!("market worker stopped");
}

async fn signal_worker(
    mut evaluator: SignalEvaluator,
    mut snapshots: mpsc::Receiver<MarketSnapshot>,
    view: watch::Receiver<PortfolioView>,
    actions: mpsc::Sender<ActionRequest>,
    shutdown: watch::Receiver<bool>,
    timing: WorkerTiming,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let snapshot = match timeout(timing.recv_timeout, snapshots.recv()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => break,
            Err(_) => continue,
        };
        let current = view.borrow().clone();
        let requests = evaluator.evaluate(&snapshot, &current);
        log::debug!(
            "z={:.3} ratio={:.4} setups={} requests={}",
            snapshot.zscore,
            snapshot.hedge_ratio,
            current.setups.len(),
            requests.len()
        );
        for request in requests {
            if !enqueue(&actions, request, timing.enqueue_timeout, "action").await {
                return;
            }
        }
    }
    log::debug!("signal worker stopped");
}

async fn action_worker(
    mut executor: ActionExecutor,
    mut actions: mpsc::Receiver<ActionRequest>,
    latest: watch::Receiver<Option<MarketSnapshot>>,
    view: watch::Sender<PortfolioView>,
    mut shutdown: watch::Receiver<bool>,
    timing: WorkerTiming,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match timeout(timing.recv_timeout, actions.recv()).await {
            Ok(Some(request)) => {
                if let Err(e) = executor.handle(request.clone()).await {
                    log::error!("action {:?} failed: {:?}", request, e);
                    if pause(timing.error_backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
        let ratio = latest.borrow().as_ref().map(|s| s.hedge_ratio);
        view.send_replace(executor.view(ratio));
    }
    log::debug!("action worker stopped");
}

async fn status_worker(
    reporter: StatusReporter,
    broker: Arc<dyn Broker>,
    latest: watch::Receiver<Option<MarketSnapshot>>,
    view: watch::Receiver<PortfolioView>,
    mut shutdown: watch::Receiver<bool>,
    timing: WorkerTiming,
) {
    loop {
        let snapshot = latest.borrow().clone();
        let current = view.borrow().clone();
        if let Err(e) = reporter.report(broker.as_ref(), snapshot.as_ref(), &current).await {
            log::error!("[STATUS] report failed: {:?}", e);
        }
        if pause(timing.status_interval, &mut shutdown).await {
            break;
        }
    }
    // last word for the status file
    let snapshot = latest.borrow().clone();
    let current = view.borrow().clone();
    if let Err(e) = reporter.report(broker.as_ref(), snapshot.as_ref(), &current).await {
        log::warn!("[STATUS] final report failed: {:?}", e);
    }
}

async fn join_with_grace(name: &str, mut handle: JoinHandle<()>, grace: Duration) {
    match timeout(grace, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("{} worker panicked: {}", name, e),
        Err(_) => {
            log::warn!("{} worker did not stop within {:?}, aborting", name, grace);
            handle.abort();
        }
    }
}

pub struct PairTradeEngine {
    cfg: PairTradeConfig,
    broker: Arc<dyn Broker>,
    replay: Option<Arc<ReplayBroker>>,
    coordinator: SpreadExecutionCoordinator,
}

impl PairTradeEngine {
    pub async fn new(cfg: PairTradeConfig) -> Result<Self> {
        let broker = BrokerBox::create(&cfg)
            .with_context(|| format!("failed to create broker {}", cfg.broker_name))?;
        let replay = broker.replay();
        Self::with_broker(cfg, Arc::new(broker), replay)
    }

    pub fn with_broker(
        cfg: PairTradeConfig,
        broker: Arc<dyn Broker>,
        replay: Option<Arc<ReplayBroker>>,
    ) -> Result<Self> {
        let store = SetupStore::open(&cfg.positions_dir)?;
        let coordinator = SpreadExecutionCoordinator::new(
            broker.clone(),
            store,
            CoordinatorConfig {
                primary_symbol: cfg.primary_symbol.clone(),
                secondary_symbol: cfg.secondary_symbol.clone(),
                volume_multiplier: cfg.volume_multiplier,
                deviation: cfg.deviation,
                ratio_error_warn_pct: cfg.ratio_error_warn_pct,
            },
        );
        Ok(Self {
            cfg,
            broker,
            replay,
            coordinator,
        })
    }

    pub async fn run(self) -> Result<()> {
        self.run_with_prompt(&ConsolePrompt::stdin()).await
    }

    /// Reconciles the store against the broker, then runs the workers until
    /// market data runs out or the process is interrupted.
    pub async fn run_with_prompt(mut self, prompt: &dyn OperatorPrompt) -> Result<()> {
        log::info!(
            "[CONFIG] broker={} pair={} observe_only={} multiplier={}",
            self.cfg.broker_name,
            self.cfg.pair_label(),
            self.cfg.observe_only,
            self.cfg.volume_multiplier
        );
        let outcome = RecoveryReconciler::new(
            &mut self.coordinator,
            prompt,
            self.cfg.recovery_mode,
            Duration::from_secs(self.cfg.recovery_timeout_secs),
        )
        .run()
        .await?;
        match outcome {
            RecoveryOutcome::Continue(setups) => {
                log::info!("[RECOVERY] continuing with {} setups", setups.len())
            }
            RecoveryOutcome::Abort { setup_id } => {
                return Err(anyhow!(
                    "startup aborted by operator while reconciling {}",
                    setup_id
                ));
            }
        }

        let primary = self.cfg.instrument(&self.cfg.primary_symbol)?.contract_size;
        let secondary = self.cfg.instrument(&self.cfg.secondary_symbol)?.contract_size;
        let mut model = RollingSpreadModel::new(
            self.broker.clone(),
            (self.cfg.primary_symbol.as_str(), primary),
            (self.cfg.secondary_symbol.as_str(), secondary),
            self.cfg.rolling_window,
            self.cfg.min_samples,
        );
        if let Some(replay) = &self.replay {
            model = model.with_replay(replay.clone());
        }
        self.run_workers(Box::new(model)).await
    }

    pub async fn run_workers(self, provider: Box<dyn MarketDataProvider>) -> Result<()> {
        let timing = WorkerTiming::new(&self.cfg, self.replay.is_some());
        let capacity = self.cfg.queue_capacity;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (latest_tx, latest_rx) = watch::channel(None);
        let (view_tx, view_rx) = watch::channel(PortfolioView::default());
        let (snapshot_tx, snapshot_rx) = mpsc::channel(capacity);
        let (action_tx, action_rx) = mpsc::channel(capacity);

        let evaluator = SignalEvaluator::new(SignalConfig::from(&self.cfg));
        let executor = ActionExecutor::new(&self.cfg, self.coordinator);
        view_tx.send_replace(executor.view(None));
        let reporter = StatusReporter {
            path: self.cfg.status_file.clone(),
            pair: self.cfg.pair_label(),
            observe_only: self.cfg.observe_only,
        };

        let market = tokio::spawn(market_worker(
            provider,
            latest_tx,
            snapshot_tx,
            shutdown_rx.clone(),
            timing,
        ));
        let signals = tokio::spawn(signal_worker(
            evaluator,
            snapshot_rx,
            view_rx.clone(),
            action_tx,
            shutdown_rx.clone(),
            timing,
        ));
        let mut actions = tokio::spawn(action_worker(
            executor,
            action_rx,
            latest_rx.clone(),
            view_tx,
            shutdown_rx.clone(),
            timing,
        ));
        let status = tokio::spawn(status_worker(
            reporter,
            self.broker.clone(),
            latest_rx,
            view_rx,
            shutdown_rx,
            timing,
        ));

        let mut actions_done = false;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("failed to listen for ctrl-c: {}", e);
                }
                log::info!("[STATUS] interrupt received, shutting down");
            }
            joined = &mut actions => {
                actions_done = true;
                if let Err(e) = joined {
                    log::error!("action worker panicked: {}", e);
                }
            }
        }
        let _ = shutdown_tx.send(true);

        join_with_grace("market", market, timing.shutdown_grace).await;
        join_with_grace("signal", signals, timing.shutdown_grace).await;
        if !actions_done {
            join_with_grace("action", actions, timing.shutdown_grace).await;
        }
        join_with_grace("status", status, timing.shutdown_grace).await;
        log::info!("pair-trade engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::broker::{BrokerError, OrderSide};
    use crate::ports::mock_broker::MockBroker;
    use crate::ports::operator::scripted::ScriptedPrompt;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn snapshot(zscore: f64, hedge_ratio: f64) -> MarketSnapshot {
        MarketSnapshot {
            primary_price: 2000.0,
            secondary_price: 25.0,
            zscore,
            hedge_ratio,
            spread_mean: 0.0,
            spread_std: 1.0,
            timestamp: Utc::now(),
        }
    }

    fn signal_config() -> SignalConfig {
        SignalConfig {
            entry_zscore: 2.0,
            exit_zscore: 0.5,
            stop_loss_zscore: 4.0,
            max_active_setups: 2,
            entry_cooldown: Duration::from_secs(30),
            base_primary_lots: 0.01,
            enable_pyramiding: true,
            drift: DriftConfig::default(),
        }
    }

    fn view_of(side: Side, entry: f64, lots: (f64, f64)) -> SetupView {
        SetupView {
            setup_id: "setup_1-2".to_string(),
            side,
            status: SetupStatus::Active,
            entry_zscore: entry,
            legs: 1,
            primary_lots: lots.0,
            secondary_lots: lots.1,
            ladder: PyramidLadder::plan(entry, side, 0.5, 3.5).ok(),
            hedge_state: DriftState::Evaluating,
        }
    }

    #[test]
    fn enters_long_below_negative_threshold() {
        let mut evaluator = SignalEvaluator::new(signal_config());
        let actions = evaluator.evaluate(&snapshot(-2.1, 0.5), &PortfolioView::default());
        assert_eq!(
            actions,
            vec![ActionRequest::Open {
                side: Side::Long,
                zscore: -2.1,
                primary_lots: 0.01,
                secondary_lots: 0.005,
            }]
        );
    }

    #[test]
    fn entry_respects_cooldown_and_stop_loss() {
        let mut evaluator = SignalEvaluator::new(signal_config());
        let now = Instant::now();
        let empty = PortfolioView::default();
        assert_eq!(evaluator.evaluate_at(&snapshot(2.2, 0.5), &empty, now).len(), 1);
        assert!(evaluator
            .evaluate_at(&snapshot(2.2, 0.5), &empty, now + Duration::from_secs(5))
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate_at(&snapshot(2.2, 0.5), &empty, now + Duration::from_secs(31))
                .len(),
            1
        );

        let mut evaluator = SignalEvaluator::new(signal_config());
        assert!(evaluator.evaluate(&snapshot(-4.5, 0.5), &empty).is_empty());
        assert!(evaluator.evaluate(&snapshot(-1.0, 0.5), &empty).is_empty());
        assert!(evaluator.evaluate(&snapshot(-2.5, 0.0), &empty).is_empty());
    }

    #[test]
    fn one_setup_per_side() {
        let mut evaluator = SignalEvaluator::new(signal_config());
        let view = PortfolioView {
            setups: vec![view_of(Side::Long, -2.0, (0.01, 0.005))],
            ..PortfolioView::default()
        };
        let actions = evaluator.evaluate(&snapshot(-2.1, 0.5), &view);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, ActionRequest::Open { .. })));
    }

    #[test]
    fn exits_on_reversion_and_stop_loss() {
        let mut evaluator = SignalEvaluator::new(signal_config());
        let long = PortfolioView {
            setups: vec![view_of(Side::Long, -2.0, (0.01, 0.005))],
            ..PortfolioView::default()
        };
        let actions = evaluator.evaluate(&snapshot(-0.4, 0.5), &long);
        assert!(matches!(
            actions[0],
            ActionRequest::Close {
                reason: ExitReason::MeanReversion,
                ..
            }
        ));
        let actions = evaluator.evaluate(&snapshot(-4.2, 0.5), &long);
        assert!(matches!(
            actions[0],
            ActionRequest::Close {
                reason: ExitReason::StopLoss,
                ..
            }
        ));

        let short = PortfolioView {
            setups: vec![view_of(Side::Short, 2.0, (0.01, 0.005))],
            ..PortfolioView::default()
        };
        assert!(evaluator.evaluate(&snapshot(1.0, 0.5), &short).is_empty());
        assert_eq!(evaluator.evaluate(&snapshot(0.3, 0.5), &short).len(), 1);
    }

    #[test]
    fn requests_pyramid_and_hedge_for_open_setup() {
        let mut evaluator = SignalEvaluator::new(signal_config());
        let view = PortfolioView {
            setups: vec![view_of(Side::Long, -2.0, (0.05, 0.02))],
            ..PortfolioView::default()
        };
        let actions = evaluator.evaluate(&snapshot(-2.55, 0.7179), &view);
        assert!(actions.contains(&ActionRequest::Pyramid {
            setup_id: "setup_1-2".to_string(),
            level_index: 1,
            zscore: -2.55,
            primary_lots: 0.01,
            secondary_lots: 0.01 * 0.7179,
        }));
        assert!(actions.contains(&ActionRequest::RebalanceHedge {
            setup_id: "setup_1-2".to_string(),
            hedge_ratio: 0.7179,
            zscore: -2.55,
        }));

        let mut cooling = view.clone();
        cooling.setups[0].hedge_state = DriftState::CoolingDown;
        let actions = evaluator.evaluate(&snapshot(-2.55, 0.7179), &cooling);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ActionRequest::RebalanceHedge { .. })));
    }

    fn test_config(dir: &TempDir) -> PairTradeConfig {
        PairTradeConfig {
            positions_dir: dir.path().join("positions"),
            status_file: Some(dir.path().join("status.json")),
            interval_secs: 1,
            recv_timeout_ms: 50,
            enqueue_timeout_ms: 50,
            error_backoff_secs: 0,
            shutdown_grace_secs: 2,
            ..PairTradeConfig::default()
        }
    }

    fn mock() -> Arc<MockBroker> {
        Arc::new(
            MockBroker::new()
                .with_instrument("XAUUSD", 0.01, 0.01, 100.0)
                .with_instrument("XAGUSD", 0.01, 0.01, 100.0),
        )
    }

    fn executor(cfg: &PairTradeConfig, broker: Arc<MockBroker>) -> ActionExecutor {
        let engine = PairTradeEngine::with_broker(cfg.clone(), broker, None).unwrap();
        ActionExecutor::new(cfg, engine.coordinator)
    }

    fn open(side: Side, zscore: f64) -> ActionRequest {
        ActionRequest::Open {
            side,
            zscore,
            primary_lots: 0.05,
            secondary_lots: 0.02,
        }
    }

    #[tokio::test]
    async fn executor_opens_scales_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        let mut exec = executor(&cfg, broker.clone());

        exec.handle(open(Side::Long, -2.0)).await.unwrap();
        // second entry on the same side is dropped by re-validation
        exec.handle(open(Side::Long, -2.1)).await.unwrap();
        assert_eq!(broker.placed().len(), 2);
        let view = exec.view(Some(0.4));
        assert_eq!(view.setups.len(), 1);
        let setup_id = view.setups[0].setup_id.clone();
        assert!(exec.ladders.contains_key(&setup_id));

        exec.handle(ActionRequest::Pyramid {
            setup_id: setup_id.clone(),
            level_index: 1,
            zscore: -2.5,
            primary_lots: 0.05,
            secondary_lots: 0.02,
        })
        .await
        .unwrap();
        assert_eq!(exec.ladders[&setup_id].executed_count(), 2);
        assert_eq!(exec.drift.lots(&setup_id), Some((0.1, 0.04)));
        // stale request for the same level is ignored
        exec.handle(ActionRequest::Pyramid {
            setup_id: setup_id.clone(),
            level_index: 1,
            zscore: -2.5,
            primary_lots: 0.05,
            secondary_lots: 0.02,
        })
        .await
        .unwrap();
        assert_eq!(broker.placed().len(), 4);

        exec.handle(ActionRequest::Close {
            setup_id: setup_id.clone(),
            zscore: -0.3,
            reason: ExitReason::MeanReversion,
        })
        .await
        .unwrap();
        assert!(broker.open_tickets().is_empty());
        assert!(exec.view(None).setups.is_empty());
        assert!(!exec.ladders.contains_key(&setup_id));
        assert!(!exec.drift.is_tracked(&setup_id));
    }

    #[tokio::test]
    async fn executor_applies_hedge_adjustment_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        let mut exec = executor(&cfg, broker.clone());
        exec.handle(open(Side::Long, -2.0)).await.unwrap();
        let setup_id = exec.view(None).setups[0].setup_id.clone();

        let rebalance = ActionRequest::RebalanceHedge {
            setup_id: setup_id.clone(),
            hedge_ratio: 0.7179,
            zscore: -2.2,
        };
        exec.handle(rebalance.clone()).await.unwrap();
        exec.handle(rebalance).await.unwrap();
        assert_eq!(broker.placed().len(), 3);
        assert_eq!(exec.drift.history().len(), 1);
        let view = exec.view(Some(0.7179));
        assert_eq!(view.setups[0].hedge_state, DriftState::CoolingDown);
        assert_eq!(view.setups[0].legs, 2);
    }

    #[tokio::test]
    async fn observe_only_sends_no_orders() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PairTradeConfig {
            observe_only: true,
            ..test_config(&dir)
        };
        let broker = mock();
        let mut exec = executor(&cfg, broker.clone());
        exec.handle(open(Side::Short, 2.3)).await.unwrap();
        assert!(broker.placed().is_empty());
        assert!(exec.view(None).setups.is_empty());
    }

    #[tokio::test]
    async fn executor_rebuilds_state_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        let setup_id = {
            let mut exec = executor(&cfg, broker.clone());
            exec.handle(open(Side::Short, 2.0)).await.unwrap();
            exec.handle(ActionRequest::Pyramid {
                setup_id: exec.view(None).setups[0].setup_id.clone(),
                level_index: 1,
                zscore: 2.5,
                primary_lots: 0.05,
                secondary_lots: 0.02,
            })
            .await
            .unwrap();
            exec.view(None).setups[0].setup_id.clone()
        };

        let exec = executor(&cfg, broker);
        assert_eq!(exec.ladders[&setup_id].executed_count(), 2);
        assert_eq!(exec.drift.lots(&setup_id), Some((0.1, 0.04)));
    }

    struct ScriptedMarket {
        snapshots: VecDeque<MarketSnapshot>,
    }

    #[async_trait]
    impl MarketDataProvider for ScriptedMarket {
        async fn get_snapshot(&mut self) -> Result<Option<MarketSnapshot>, BrokerError> {
            Ok(self.snapshots.pop_front())
        }

        fn exhausted(&self) -> bool {
            self.snapshots.is_empty()
        }
    }

    #[tokio::test]
    async fn workers_drain_and_stop_when_data_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        let engine = PairTradeEngine::with_broker(cfg.clone(), broker.clone(), None).unwrap();
        let market = ScriptedMarket {
            snapshots: vec![snapshot(-2.4, 0.4)].into(),
        };
        timeout(Duration::from_secs(10), engine.run_workers(Box::new(market)))
            .await
            .expect("engine stops")
            .unwrap();

        let orders = broker.placed();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[1].side, OrderSide::Sell);
        let store = SetupStore::open(&cfg.positions_dir).unwrap();
        assert_eq!(store.active_count(), 1);

        let status: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("status.json")).unwrap())
                .unwrap();
        assert_eq!(status["active_setups"], 1);
        assert_eq!(status["pair"], "XAUUSD/XAGUSD");
    }

    #[tokio::test]
    async fn full_queue_drops_the_item_and_keeps_the_producer_running() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(enqueue(&tx, 1u32, Duration::from_millis(20), "test").await);

        let started = Instant::now();
        assert!(enqueue(&tx, 2u32, Duration::from_millis(20), "test").await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!enqueue(&tx, 3u32, Duration::from_millis(20), "test").await);
    }

    #[tokio::test]
    async fn action_worker_backs_off_after_a_failure_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        let exec = executor(&cfg, broker.clone());
        let timing = WorkerTiming {
            error_backoff: Duration::from_millis(50),
            ..WorkerTiming::new(&cfg, false)
        };

        let (tx, rx) = mpsc::channel(4);
        let (_latest_tx, latest_rx) = watch::channel(None);
        let (view_tx, view_rx) = watch::channel(PortfolioView::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let bad = ActionRequest::Open {
            side: Side::Short,
            zscore: 2.2,
            primary_lots: 0.0,
            secondary_lots: 0.02,
        };
        tx.send(bad).await.unwrap();
        tx.send(open(Side::Long, -2.2)).await.unwrap();
        drop(tx);

        let started = Instant::now();
        timeout(
            Duration::from_secs(5),
            action_worker(exec, rx, latest_rx, view_tx, shutdown_rx, timing),
        )
        .await
        .expect("worker drains and stops");
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert_eq!(broker.placed().len(), 2);
        let view = view_rx.borrow().clone();
        assert_eq!(view.setups.len(), 1);
        assert_eq!(view.setups[0].side, Side::Long);
    }

    #[tokio::test]
    async fn abort_during_recovery_stops_startup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        let broker = mock();
        {
            let mut exec = executor(&cfg, broker.clone());
            exec.handle(open(Side::Long, -2.0)).await.unwrap();
        }
        for ticket in broker.open_tickets() {
            broker.remove_position(ticket);
        }
        let engine = PairTradeEngine::with_broker(cfg, broker, None).unwrap();
        let prompt = ScriptedPrompt::new(vec![crate::ports::operator::PromptAnswer::Selected(2)]);
        let err = engine.run_with_prompt(&prompt).await.unwrap_err();
        assert!(err.to_string().contains("aborted"));
    }
}
