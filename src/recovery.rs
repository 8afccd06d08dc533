use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::alert_notifier::notify_operator;
use crate::config::RecoveryMode;
use crate::ports::operator::{OperatorPrompt, PromptAnswer};
use crate::setup::model::Setup;
use crate::trade::execution::SpreadExecutionCoordinator;

const OPTIONS: [&str; 3] = [
    "Close every ticket of this setup",
    "Keep the setup active at my own risk",
    "Abort startup for manual investigation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Loaded,
    Checked,
    AllValid,
    Resolving,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    CloseAll,
    KeepAtOwnRisk,
    Abort,
}

impl RecoveryDecision {
    fn from_index(index: usize) -> Self {
        match index {
            0 => RecoveryDecision::CloseAll,
            1 => RecoveryDecision::KeepAtOwnRisk,
            _ => RecoveryDecision::Abort,
        }
    }
}

/// Who settled a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Operator,
    TimeoutDefault,
    /// `recovery_mode: skip` keeps every mismatched setup without asking.
    SkipPolicy,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionSource::Operator => write!(f, "operator choice"),
            DecisionSource::TimeoutDefault => write!(f, "prompt timed out, default policy"),
            DecisionSource::SkipPolicy => write!(f, "skip mode policy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub setup_id: String,
    pub missing: Vec<u64>,
    pub decision: RecoveryDecision,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Setups the engine keeps managing: untouched ones plus any kept despite
    /// a mismatch or left PARTIAL by a failed close.
    Continue(Vec<Setup>),
    Abort { setup_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub setup_id: String,
    pub missing: Vec<u64>,
}

/// A leg counts as found only when every ticket it carries is live.
pub fn check(setup: &Setup, live_tickets: &HashSet<u64>) -> (bool, Vec<u64>) {
    let missing: Vec<u64> = setup
        .tickets()
        .into_iter()
        .filter(|t| !live_tickets.contains(t))
        .collect();
    (missing.is_empty(), missing)
}

fn describe(setup: &Setup, missing: &[u64]) -> String {
    let mut text = format!(
        "Setup {} ({} {}) entered {} at z={:.3}, status {}\n",
        setup.setup_id,
        setup.pair,
        setup.side,
        setup.entry_time.to_rfc3339(),
        setup.entry_zscore,
        setup.status
    );
    for leg in &setup.positions {
        text.push_str(&format!(
            "  {} {} primary={:?} ({} lots) secondary={:?} ({} lots) z={:.3}\n",
            leg.level,
            leg.spread_id,
            leg.primary_ticket,
            leg.primary_lots,
            leg.secondary_ticket,
            leg.secondary_lots,
            leg.entry_zscore
        ));
    }
    text.push_str(&format!("Missing tickets: {:?}", missing));
    text
}

/// Validates persisted setups against live broker positions once at startup.
pub struct RecoveryReconciler<'a> {
    coordinator: &'a mut SpreadExecutionCoordinator,
    prompt: &'a dyn OperatorPrompt,
    mode: RecoveryMode,
    timeout: Duration,
    state: RecoveryState,
    loaded: Vec<Setup>,
    mismatches: Vec<Mismatch>,
    resolutions: Vec<Resolution>,
}

impl<'a> RecoveryReconciler<'a> {
    pub fn new(
        coordinator: &'a mut SpreadExecutionCoordinator,
        prompt: &'a dyn OperatorPrompt,
        mode: RecoveryMode,
        timeout: Duration,
    ) -> Self {
        let loaded = coordinator.store().read_all_active();
        log::info!("[RECOVERY] loaded {} active setups", loaded.len());
        Self {
            coordinator,
            prompt,
            mode,
            timeout,
            state: RecoveryState::Loaded,
            loaded,
            mismatches: Vec::new(),
            resolutions: Vec::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn load_active_setups(&self) -> &[Setup] {
        &self.loaded
    }

    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Compares every loaded setup with the broker's live positions.
    pub async fn check_all(&mut self) -> Result<&[Mismatch]> {
        let live: HashSet<u64> = self
            .coordinator
            .broker()
            .get_open_positions(None)
            .await
            .context("failed to list live positions for reconciliation")?
            .into_iter()
            .map(|p| p.ticket)
            .collect();

        self.mismatches = self
            .loaded
            .iter()
            .filter_map(|setup| {
                let (found, missing) = check(setup, &live);
                if found {
                    log::debug!("[RECOVERY] {} all legs live", setup.setup_id);
                    None
                } else {
                    log::warn!(
                        "[RECOVERY] {} missing tickets {:?}",
                        setup.setup_id,
                        missing
                    );
                    Some(Mismatch {
                        setup_id: setup.setup_id.clone(),
                        missing,
                    })
                }
            })
            .collect();
        self.state = RecoveryState::Checked;
        Ok(&self.mismatches)
    }

    async fn decide(&self, context: &str) -> Result<(RecoveryDecision, DecisionSource)> {
        match self.mode {
            RecoveryMode::Skip => Ok((
                RecoveryDecision::KeepAtOwnRisk,
                DecisionSource::SkipPolicy,
            )),
            RecoveryMode::Prompt => {
                let index = self.prompt.ask_choice(context, &OPTIONS).await?;
                Ok((RecoveryDecision::from_index(index), DecisionSource::Operator))
            }
            RecoveryMode::Timeout => {
                match self
                    .prompt
                    .ask_with_timeout(context, &OPTIONS, self.timeout)
                    .await?
                {
                    PromptAnswer::Selected(index) => {
                        Ok((RecoveryDecision::from_index(index), DecisionSource::Operator))
                    }
                    PromptAnswer::TimedOut => {
                        Ok((RecoveryDecision::CloseAll, DecisionSource::TimeoutDefault))
                    }
                }
            }
        }
    }

    /// Runs the whole reconciliation and returns the setups to keep managing.
    pub async fn run(&mut self) -> Result<RecoveryOutcome> {
        if self.state == RecoveryState::Loaded {
            self.check_all().await?;
        }
        if self.mismatches.is_empty() {
            self.state = RecoveryState::AllValid;
            log::info!(
                "[RECOVERY] all {} active setups match live positions",
                self.loaded.len()
            );
            return Ok(RecoveryOutcome::Continue(self.loaded.clone()));
        }

        self.state = RecoveryState::Resolving;
        let mismatches = self.mismatches.clone();
        for mismatch in &mismatches {
            let Some(setup) = self
                .loaded
                .iter()
                .find(|s| s.setup_id == mismatch.setup_id)
                .cloned()
            else {
                continue;
            };
            let context = describe(&setup, &mismatch.missing);
            let (decision, source) = self.decide(&context).await?;
            log::warn!(
                "[RECOVERY] {} missing {:?}: {:?} ({})",
                setup.setup_id,
                mismatch.missing,
                decision,
                source
            );
            let detail = format!("Decision: {:?} ({})\n{}", decision, source, context);
            self.resolutions.push(Resolution {
                setup_id: setup.setup_id.clone(),
                missing: mismatch.missing.clone(),
                decision,
                source,
            });

            match decision {
                RecoveryDecision::CloseAll => {
                    let (report, stored) = self
                        .coordinator
                        .close_setup(&setup.setup_id, None)
                        .await?;
                    log::warn!(
                        "[RECOVERY] {} close-all: closed {:?}, already gone {:?}, failed {:?} -> {}",
                        setup.setup_id,
                        report.closed,
                        report.already_closed,
                        report.failed,
                        stored.status
                    );
                    notify_operator("reconciliation close-all", &detail);
                }
                RecoveryDecision::KeepAtOwnRisk => {
                    notify_operator("reconciliation kept mismatched setup", &detail);
                }
                RecoveryDecision::Abort => {
                    log::error!("[RECOVERY] startup aborted at {}", setup.setup_id);
                    notify_operator("reconciliation aborted startup", &detail);
                    return Ok(RecoveryOutcome::Abort {
                        setup_id: setup.setup_id,
                    });
                }
            }
        }

        self.state = RecoveryState::Resolved;
        Ok(RecoveryOutcome::Continue(
            self.coordinator.store().read_all_active(),
        ))
    }
}
