use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::ports::broker::InstrumentSpec;
use crate::rebalance::DriftConfig;

const DEFAULT_BROKER_NAME: &str = "replay";
const DEFAULT_REPLAY_FILE: &str = "data/replay.jsonl";
const DEFAULT_FILL_PROBABILITY: f64 = 1.0;
const DEFAULT_PRIMARY_SYMBOL: &str = "XAUUSD";
const DEFAULT_SECONDARY_SYMBOL: &str = "XAGUSD";
const DEFAULT_ENTRY_Z: f64 = 2.0;
const DEFAULT_EXIT_Z: f64 = 0.5;
const DEFAULT_STOP_LOSS_Z: f64 = 4.0;
const DEFAULT_MAX_ACTIVE_SETUPS: usize = 10;
const DEFAULT_ENTRY_COOLDOWN_SECS: u64 = 30;
const DEFAULT_BASE_PRIMARY_LOTS: f64 = 0.01;
const DEFAULT_VOLUME_MULTIPLIER: f64 = 1.0;
const DEFAULT_DEVIATION: u32 = 20;
const DEFAULT_RATIO_ERROR_WARN_PCT: f64 = 0.05;
const DEFAULT_ENABLE_PYRAMIDING: bool = true;
const DEFAULT_SCALE_INTERVAL: f64 = 0.5;
const DEFAULT_MAX_ZSCORE: f64 = 3.5;
const DEFAULT_ENABLE_HEDGE_ADJUSTMENT: bool = true;
const DEFAULT_HEDGE_DRIFT_THRESHOLD_PCT: f64 = 0.05;
const DEFAULT_MIN_ABSOLUTE_DRIFT_LOTS: f64 = 0.01;
const DEFAULT_MIN_ADJUSTMENT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_ROLLING_WINDOW: usize = 200;
const DEFAULT_MIN_SAMPLES: usize = 30;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 100;
const DEFAULT_RECV_TIMEOUT_MS: u64 = 5000;
const DEFAULT_ERROR_BACKOFF_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
const DEFAULT_POSITIONS_DIR: &str = "positions";
const DEFAULT_RECOVERY_MODE: RecoveryMode = RecoveryMode::Prompt;
const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;

#[derive(Debug)]
pub enum ConfigError {
    Invalid(String),
    UnknownInstrument(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::UnknownInstrument(s) => {
                write!(f, "no instrument settings for symbol {}", s)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Block until the operator decides.
    Prompt,
    /// Ask with a deadline; close everything when it passes.
    Timeout,
    /// Keep mismatched setups without asking; each one is still logged and alerted.
    Skip,
}

impl FromStr for RecoveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(RecoveryMode::Prompt),
            "timeout" => Ok(RecoveryMode::Timeout),
            "skip" => Ok(RecoveryMode::Skip),
            other => Err(ConfigError::Invalid(format!("unknown recovery mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,
}

fn default_tick_size() -> f64 {
    0.01
}

fn default_contract_size() -> f64 {
    1.0
}

impl InstrumentConfig {
    pub fn to_spec(&self) -> InstrumentSpec {
        InstrumentSpec {
            symbol: self.symbol.clone(),
            min_lot: self.min_lot,
            max_lot: self.max_lot,
            lot_step: self.lot_step,
            tick_size: self.tick_size,
        }
    }
}

fn default_instruments() -> Vec<InstrumentConfig> {
    vec![
        InstrumentConfig {
            symbol: DEFAULT_PRIMARY_SYMBOL.to_string(),
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            tick_size: 0.01,
            contract_size: 100.0,
        },
        InstrumentConfig {
            symbol: DEFAULT_SECONDARY_SYMBOL.to_string(),
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            tick_size: 0.001,
            contract_size: 5000.0,
        },
    ]
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct PairTradeYaml {
    broker_name: Option<String>,
    replay_file: Option<String>,
    fill_probability: Option<f64>,
    primary_symbol: Option<String>,
    secondary_symbol: Option<String>,
    instruments: Option<Vec<InstrumentConfig>>,
    entry_zscore: Option<f64>,
    exit_zscore: Option<f64>,
    stop_loss_zscore: Option<f64>,
    max_active_setups: Option<usize>,
    entry_cooldown_secs: Option<u64>,
    base_primary_lots: Option<f64>,
    volume_multiplier: Option<f64>,
    deviation: Option<u32>,
    ratio_error_warn_pct: Option<f64>,
    enable_pyramiding: Option<bool>,
    scale_interval: Option<f64>,
    max_zscore: Option<f64>,
    enable_hedge_adjustment: Option<bool>,
    hedge_drift_threshold_pct: Option<f64>,
    min_absolute_drift_lots: Option<f64>,
    min_adjustment_interval_secs: Option<u64>,
    rolling_window: Option<usize>,
    min_samples: Option<usize>,
    interval_secs: Option<u64>,
    status_interval_secs: Option<u64>,
    queue_capacity: Option<usize>,
    enqueue_timeout_ms: Option<u64>,
    recv_timeout_ms: Option<u64>,
    error_backoff_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    positions_dir: Option<String>,
    status_file: Option<String>,
    recovery_mode: Option<String>,
    recovery_timeout_secs: Option<u64>,
    observe_only: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PairTradeConfig {
    pub broker_name: String,
    pub replay_file: String,
    pub fill_probability: f64,
    pub primary_symbol: String,
    pub secondary_symbol: String,
    pub instruments: Vec<InstrumentConfig>,
    // Signals
    pub entry_zscore: f64,
    pub exit_zscore: f64,
    pub stop_loss_zscore: f64,
    pub max_active_setups: usize,
    pub entry_cooldown_secs: u64,
    // Sizing
    pub base_primary_lots: f64,
    pub volume_multiplier: f64,
    pub deviation: u32,
    pub ratio_error_warn_pct: f64,
    // Pyramiding
    pub enable_pyramiding: bool,
    pub scale_interval: f64,
    pub max_zscore: f64,
    // Hedge drift
    pub enable_hedge_adjustment: bool,
    pub hedge_drift_threshold_pct: f64,
    pub min_absolute_drift_lots: f64,
    pub min_adjustment_interval_secs: u64,
    // Spread model
    pub rolling_window: usize,
    pub min_samples: usize,
    // Workers
    pub interval_secs: u64,
    pub status_interval_secs: u64,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub error_backoff_secs: u64,
    pub shutdown_grace_secs: u64,
    pub positions_dir: PathBuf,
    pub status_file: Option<PathBuf>,
    pub recovery_mode: RecoveryMode,
    pub recovery_timeout_secs: u64,
    // Safety guard to avoid real orders while observing market data
    pub observe_only: bool,
}

impl Default for PairTradeConfig {
    fn default() -> Self {
        Self::assemble(PairTradeYaml::default(), DEFAULT_RECOVERY_MODE)
    }
}

impl PairTradeConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRTRADE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let cfg = match config_path {
            Some(path) => Self::from_yaml_path(path)?,
            None => Self::from_env()?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open PairTrade config {}", path_ref.display()))?;
        let yaml: PairTradeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse PairTrade config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::from_yaml(PairTradeYaml::default())?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn from_yaml(yaml: PairTradeYaml) -> Result<Self, ConfigError> {
        let recovery_mode = match yaml.recovery_mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => DEFAULT_RECOVERY_MODE,
        };
        Ok(Self::assemble(yaml, recovery_mode))
    }

    fn assemble(yaml: PairTradeYaml, recovery_mode: RecoveryMode) -> Self {
        PairTradeConfig {
            broker_name: yaml
                .broker_name
                .unwrap_or_else(|| DEFAULT_BROKER_NAME.to_string()),
            replay_file: yaml
                .replay_file
                .unwrap_or_else(|| DEFAULT_REPLAY_FILE.to_string()),
            fill_probability: yaml.fill_probability.unwrap_or(DEFAULT_FILL_PROBABILITY),
            primary_symbol: yaml
                .primary_symbol
                .unwrap_or_else(|| DEFAULT_PRIMARY_SYMBOL.to_string()),
            secondary_symbol: yaml
                .secondary_symbol
                .unwrap_or_else(|| DEFAULT_SECONDARY_SYMBOL.to_string()),
            instruments: yaml.instruments.unwrap_or_else(default_instruments),
            entry_zscore: yaml.entry_zscore.unwrap_or(DEFAULT_ENTRY_Z),
            exit_zscore: yaml.exit_zscore.unwrap_or(DEFAULT_EXIT_Z),
            stop_loss_zscore: yaml.stop_loss_zscore.unwrap_or(DEFAULT_STOP_LOSS_Z),
            max_active_setups: yaml.max_active_setups.unwrap_or(DEFAULT_MAX_ACTIVE_SETUPS),
            entry_cooldown_secs: yaml
                .entry_cooldown_secs
                .unwrap_or(DEFAULT_ENTRY_COOLDOWN_SECS),
            base_primary_lots: yaml.base_primary_lots.unwrap_or(DEFAULT_BASE_PRIMARY_LOTS),
            volume_multiplier: yaml.volume_multiplier.unwrap_or(DEFAULT_VOLUME_MULTIPLIER),
            deviation: yaml.deviation.unwrap_or(DEFAULT_DEVIATION),
            ratio_error_warn_pct: yaml
                .ratio_error_warn_pct
                .unwrap_or(DEFAULT_RATIO_ERROR_WARN_PCT),
            enable_pyramiding: yaml.enable_pyramiding.unwrap_or(DEFAULT_ENABLE_PYRAMIDING),
            scale_interval: yaml.scale_interval.unwrap_or(DEFAULT_SCALE_INTERVAL),
            max_zscore: yaml.max_zscore.unwrap_or(DEFAULT_MAX_ZSCORE),
            enable_hedge_adjustment: yaml
                .enable_hedge_adjustment
                .unwrap_or(DEFAULT_ENABLE_HEDGE_ADJUSTMENT),
            hedge_drift_threshold_pct: yaml
                .hedge_drift_threshold_pct
                .unwrap_or(DEFAULT_HEDGE_DRIFT_THRESHOLD_PCT),
            min_absolute_drift_lots: yaml
                .min_absolute_drift_lots
                .unwrap_or(DEFAULT_MIN_ABSOLUTE_DRIFT_LOTS),
            min_adjustment_interval_secs: yaml
                .min_adjustment_interval_secs
                .unwrap_or(DEFAULT_MIN_ADJUSTMENT_INTERVAL_SECS),
            rolling_window: yaml.rolling_window.unwrap_or(DEFAULT_ROLLING_WINDOW),
            min_samples: yaml.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES),
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            status_interval_secs: yaml
                .status_interval_secs
                .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            queue_capacity: yaml.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            enqueue_timeout_ms: yaml.enqueue_timeout_ms.unwrap_or(DEFAULT_ENQUEUE_TIMEOUT_MS),
            recv_timeout_ms: yaml.recv_timeout_ms.unwrap_or(DEFAULT_RECV_TIMEOUT_MS),
            error_backoff_secs: yaml.error_backoff_secs.unwrap_or(DEFAULT_ERROR_BACKOFF_SECS),
            shutdown_grace_secs: yaml
                .shutdown_grace_secs
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            positions_dir: PathBuf::from(
                yaml.positions_dir
                    .unwrap_or_else(|| DEFAULT_POSITIONS_DIR.to_string()),
            ),
            status_file: yaml.status_file.map(PathBuf::from),
            recovery_mode,
            recovery_timeout_secs: yaml
                .recovery_timeout_secs
                .unwrap_or(DEFAULT_RECOVERY_TIMEOUT_SECS),
            observe_only: yaml.observe_only.unwrap_or(false),
        }
    }

    fn apply_env_overrides(&mut self) {
        override_string("BROKER_NAME", &mut self.broker_name);
        override_string("REPLAY_FILE", &mut self.replay_file);
        override_parsed("FILL_PROBABILITY", &mut self.fill_probability);
        override_string("PRIMARY_SYMBOL", &mut self.primary_symbol);
        override_string("SECONDARY_SYMBOL", &mut self.secondary_symbol);
        override_parsed("ENTRY_ZSCORE", &mut self.entry_zscore);
        override_parsed("EXIT_ZSCORE", &mut self.exit_zscore);
        override_parsed("STOP_LOSS_ZSCORE", &mut self.stop_loss_zscore);
        override_parsed("MAX_ACTIVE_SETUPS", &mut self.max_active_setups);
        override_parsed("ENTRY_COOLDOWN_SECS", &mut self.entry_cooldown_secs);
        override_parsed("BASE_PRIMARY_LOTS", &mut self.base_primary_lots);
        override_parsed("VOLUME_MULTIPLIER", &mut self.volume_multiplier);
        override_parsed("DEVIATION", &mut self.deviation);
        override_bool("ENABLE_PYRAMIDING", &mut self.enable_pyramiding);
        override_parsed("SCALE_INTERVAL", &mut self.scale_interval);
        override_parsed("MAX_ZSCORE", &mut self.max_zscore);
        override_bool("ENABLE_HEDGE_ADJUSTMENT", &mut self.enable_hedge_adjustment);
        override_parsed(
            "HEDGE_DRIFT_THRESHOLD_PCT",
            &mut self.hedge_drift_threshold_pct,
        );
        override_parsed("MIN_ABSOLUTE_DRIFT_LOTS", &mut self.min_absolute_drift_lots);
        override_parsed(
            "MIN_ADJUSTMENT_INTERVAL_SECS",
            &mut self.min_adjustment_interval_secs,
        );
        override_parsed("ROLLING_WINDOW", &mut self.rolling_window);
        override_parsed("MIN_SAMPLES", &mut self.min_samples);
        override_parsed("INTERVAL_SECS", &mut self.interval_secs);
        override_parsed("STATUS_INTERVAL_SECS", &mut self.status_interval_secs);
        override_parsed("QUEUE_CAPACITY", &mut self.queue_capacity);
        override_parsed("RECOVERY_TIMEOUT_SECS", &mut self.recovery_timeout_secs);
        override_bool("OBSERVE_ONLY", &mut self.observe_only);
        if let Ok(value) = env::var("POSITIONS_DIR") {
            if !value.trim().is_empty() {
                self.positions_dir = PathBuf::from(value);
            }
        }
        if let Ok(value) = env::var("STATUS_FILE") {
            if !value.trim().is_empty() {
                self.status_file = Some(PathBuf::from(value));
            }
        }
        if let Ok(value) = env::var("RECOVERY_MODE") {
            match value.parse() {
                Ok(mode) => self.recovery_mode = mode,
                Err(e) => log::warn!("ignoring RECOVERY_MODE: {}", e),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("entry_zscore", self.entry_zscore),
            ("stop_loss_zscore", self.stop_loss_zscore),
            ("base_primary_lots", self.base_primary_lots),
            ("volume_multiplier", self.volume_multiplier),
            ("scale_interval", self.scale_interval),
            ("max_zscore", self.max_zscore),
            ("hedge_drift_threshold_pct", self.hedge_drift_threshold_pct),
            ("min_absolute_drift_lots", self.min_absolute_drift_lots),
            ("ratio_error_warn_pct", self.ratio_error_warn_pct),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !self.exit_zscore.is_finite() || self.exit_zscore < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "exit_zscore must be non-negative, got {}",
                self.exit_zscore
            )));
        }
        if self.exit_zscore >= self.entry_zscore {
            return Err(ConfigError::Invalid(format!(
                "exit_zscore {} must be below entry_zscore {}",
                self.exit_zscore, self.entry_zscore
            )));
        }
        if !(0.0..=1.0).contains(&self.fill_probability) {
            return Err(ConfigError::Invalid(format!(
                "fill_probability must be within [0, 1], got {}",
                self.fill_probability
            )));
        }
        if self.interval_secs == 0 || self.status_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker intervals must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_active_setups == 0 {
            return Err(ConfigError::Invalid(
                "max_active_setups must be positive".to_string(),
            ));
        }
        if self.primary_symbol == self.secondary_symbol {
            return Err(ConfigError::Invalid(format!(
                "primary and secondary symbol are both {}",
                self.primary_symbol
            )));
        }
        for symbol in [&self.primary_symbol, &self.secondary_symbol] {
            let instrument = self.instrument(symbol)?;
            if instrument.lot_step <= 0.0
                || instrument.min_lot < 0.0
                || instrument.max_lot < instrument.min_lot
                || instrument.contract_size <= 0.0
            {
                return Err(ConfigError::Invalid(format!(
                    "bad lot settings for {}",
                    symbol
                )));
            }
        }
        Ok(())
    }

    pub fn instrument(&self, symbol: &str) -> Result<&InstrumentConfig, ConfigError> {
        self.instruments
            .iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| ConfigError::UnknownInstrument(symbol.to_string()))
    }

    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.primary_symbol, self.secondary_symbol)
    }

    pub fn drift_config(&self) -> DriftConfig {
        DriftConfig {
            enabled: self.enable_hedge_adjustment,
            threshold_pct: self.hedge_drift_threshold_pct,
            min_absolute_drift: self.min_absolute_drift_lots,
            min_adjustment_interval: Duration::from_secs(self.min_adjustment_interval_secs),
        }
    }
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = env::var(key) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => log::warn!("ignoring unparsable {}={}", key, value),
        }
    }
}

fn override_bool(key: &str, target: &mut bool) {
    if let Ok(value) = env::var(key) {
        let lower = value.trim().to_ascii_lowercase();
        *target = lower == "1" || lower == "true" || lower == "yes";
    }
}
