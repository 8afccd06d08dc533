use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{Leg, Setup, SetupStatus, Side};
use crate::error::ValidationError;

const INDEX_FILE: &str = "setups.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupSummary {
    pub entry_time: DateTime<Utc>,
    pub entry_zscore: f64,
    pub side: Side,
    pub pair: String,
    pub total_positions: usize,
    pub status: SetupStatus,
}

impl From<&Setup> for SetupSummary {
    fn from(setup: &Setup) -> Self {
        Self {
            entry_time: setup.entry_time,
            entry_zscore: setup.entry_zscore,
            side: setup.side,
            pair: setup.pair.clone(),
            total_positions: setup.positions.len(),
            status: setup.status,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SetupIndex {
    active_setups: BTreeMap<String, SetupSummary>,
    last_updated: Option<DateTime<Utc>>,
}

/// Durable setup records: one pretty-printed JSON file per setup plus an index
/// of the open ones. Closed records stay on disk for audit.
///
/// The store keeps open setups in memory and is the only writer of both the
/// files and the broker-ticket index.
#[derive(Debug)]
pub struct SetupStore {
    dir: PathBuf,
    active: BTreeMap<String, Setup>,
    tickets: HashMap<u64, String>,
}

impl SetupStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create positions dir {}", dir.display()))?;

        let index_path = dir.join(INDEX_FILE);
        let index: SetupIndex = match fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", index_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SetupIndex::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", index_path.display()))
            }
        };

        let mut store = Self {
            dir,
            active: BTreeMap::new(),
            tickets: HashMap::new(),
        };
        for setup_id in index.active_setups.keys() {
            match store.load_record(setup_id)? {
                Some(setup) if setup.status.is_open() => {
                    store.index_tickets(&setup)?;
                    store.active.insert(setup_id.clone(), setup);
                }
                Some(_) => {
                    log::warn!("[STORE] {} is indexed as active but closed on disk", setup_id);
                }
                None => {
                    log::warn!("[STORE] {} is indexed but its record is missing", setup_id);
                }
            }
        }
        log::info!(
            "[STORE] loaded {} active setups from {}",
            store.active.len(),
            store.dir.display()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, setup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", setup_id))
    }

    fn load_record(&self, setup_id: &str) -> Result<Option<Setup>> {
        let path = self.record_path(setup_id);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let setup = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                Ok(Some(setup))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn check_tickets(&self, setup_id: &str, legs: &[Leg]) -> Result<(), ValidationError> {
        for ticket in legs.iter().flat_map(|leg| leg.tickets()) {
            if let Some(owner) = self.tickets.get(&ticket) {
                if owner != setup_id {
                    return Err(ValidationError::DuplicateTicket(ticket));
                }
            }
        }
        Ok(())
    }

    fn index_tickets(&mut self, setup: &Setup) -> Result<(), ValidationError> {
        self.check_tickets(&setup.setup_id, &setup.positions)?;
        for ticket in setup.tickets() {
            self.tickets.insert(ticket, setup.setup_id.clone());
        }
        Ok(())
    }

    fn unindex_tickets(&mut self, setup_id: &str) {
        self.tickets.retain(|_, owner| owner != setup_id);
    }

    /// Persists `setup`. Open setups are kept in the active index; a closed one
    /// is dropped from it while its record file stays.
    pub fn write(&mut self, setup: &Setup) -> Result<()> {
        self.check_tickets(&setup.setup_id, &setup.positions)?;
        write_json_atomic(&self.record_path(&setup.setup_id), setup)?;

        self.unindex_tickets(&setup.setup_id);
        if setup.status.is_open() {
            self.index_tickets(setup)?;
            self.active.insert(setup.setup_id.clone(), setup.clone());
        } else {
            self.active.remove(&setup.setup_id);
        }
        self.write_index()
    }

    fn write_index(&self) -> Result<()> {
        let index = SetupIndex {
            active_setups: self
                .active
                .iter()
                .map(|(id, setup)| (id.clone(), SetupSummary::from(setup)))
                .collect(),
            last_updated: Some(Utc::now()),
        };
        write_json_atomic(&self.dir.join(INDEX_FILE), &index)
    }

    pub fn read_all_active(&self) -> Vec<Setup> {
        self.active.values().cloned().collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Setup> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, setup_id: &str) -> Option<&Setup> {
        self.active.get(setup_id)
    }

    /// Reads any setup, including closed ones kept for audit.
    pub fn read(&self, setup_id: &str) -> Result<Option<Setup>> {
        if let Some(setup) = self.active.get(setup_id) {
            return Ok(Some(setup.clone()));
        }
        self.load_record(setup_id)
    }

    pub fn add_leg(&mut self, setup_id: &str, leg: Leg) -> Result<Setup> {
        let mut setup = self
            .active
            .get(setup_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownSetup(setup_id.to_string()))?;
        self.check_tickets(setup_id, std::slice::from_ref(&leg))?;
        setup.positions.push(leg);
        setup.last_updated = Utc::now();
        self.write(&setup)?;
        Ok(setup)
    }

    pub fn mark_closed(&mut self, setup_id: &str, exit_zscore: Option<f64>) -> Result<Setup> {
        self.set_status(setup_id, SetupStatus::Closed, exit_zscore)
    }

    pub fn mark_partial(&mut self, setup_id: &str) -> Result<Setup> {
        self.set_status(setup_id, SetupStatus::Partial, None)
    }

    fn set_status(
        &mut self,
        setup_id: &str,
        status: SetupStatus,
        exit_zscore: Option<f64>,
    ) -> Result<Setup> {
        let mut setup = self
            .active
            .get(setup_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownSetup(setup_id.to_string()))?;
        setup.status = status;
        if status == SetupStatus::Closed {
            setup.exit_zscore = exit_zscore;
        }
        setup.last_updated = Utc::now();
        self.write(&setup)?;
        Ok(setup)
    }

    pub fn owner_of_ticket(&self, ticket: u64) -> Option<&str> {
        self.tickets.get(&ticket).map(String::as_str)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::model::LegLevel;
    use tempfile::tempdir;

    fn leg(level: LegLevel, primary: u64, secondary: u64) -> Leg {
        Leg {
            spread_id: format!("{}-{}", primary, secondary),
            short_id: "093000".to_string(),
            primary_ticket: Some(primary),
            secondary_ticket: Some(secondary),
            entry_zscore: -2.0,
            primary_lots: 0.01,
            secondary_lots: 0.1,
            level,
            timestamp: Utc::now(),
        }
    }

    fn setup(primary: u64, secondary: u64) -> Setup {
        let now = Utc::now();
        Setup {
            setup_id: format!("setup_{}-{}", primary, secondary),
            entry_time: now,
            entry_zscore: -2.0,
            exit_zscore: None,
            side: Side::Long,
            pair: "XAUUSD/XAGUSD".to_string(),
            entry_hedge_ratio: 10.0,
            positions: vec![leg(LegLevel::Initial, primary, secondary)],
            status: SetupStatus::Active,
            last_updated: now,
        }
    }

    #[test]
    fn write_then_reopen_restores_active_setups() {
        let dir = tempdir().unwrap();
        {
            let mut store = SetupStore::open(dir.path()).unwrap();
            store.write(&setup(1, 2)).unwrap();
            store.write(&setup(3, 4)).unwrap();
        }
        assert!(dir.path().join("setup_1-2.json").exists());
        assert!(dir.path().join(INDEX_FILE).exists());

        let store = SetupStore::open(dir.path()).unwrap();
        let ids: Vec<String> = store.read_all_active().into_iter().map(|s| s.setup_id).collect();
        assert_eq!(ids, vec!["setup_1-2".to_string(), "setup_3-4".to_string()]);
        assert_eq!(store.owner_of_ticket(4), Some("setup_3-4"));
    }

    #[test]
    fn closed_setup_leaves_index_but_keeps_record() {
        let dir = tempdir().unwrap();
        let mut store = SetupStore::open(dir.path()).unwrap();
        store.write(&setup(1, 2)).unwrap();
        let closed = store.mark_closed("setup_1-2", None).unwrap();
        assert_eq!(closed.status, SetupStatus::Closed);
        assert_eq!(closed.exit_zscore, None);
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.owner_of_ticket(1), None);

        let reopened = SetupStore::open(dir.path()).unwrap();
        assert_eq!(reopened.active_count(), 0);
        let audit = reopened.read("setup_1-2").unwrap().unwrap();
        assert_eq!(audit.status, SetupStatus::Closed);
    }

    #[test]
    fn partial_setup_stays_active() {
        let dir = tempdir().unwrap();
        let mut store = SetupStore::open(dir.path()).unwrap();
        store.write(&setup(1, 2)).unwrap();
        store.mark_partial("setup_1-2").unwrap();
        let reopened = SetupStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("setup_1-2").map(|s| s.status),
            Some(SetupStatus::Partial)
        );
    }

    #[test]
    fn add_leg_appends_in_order() {
        let dir = tempdir().unwrap();
        let mut store = SetupStore::open(dir.path()).unwrap();
        store.write(&setup(1, 2)).unwrap();
        let updated = store
            .add_leg("setup_1-2", leg(LegLevel::Pyramid(1), 5, 6))
            .unwrap();
        assert_eq!(updated.positions.len(), 2);
        assert_eq!(updated.positions[1].level, LegLevel::Pyramid(1));
        assert_eq!(store.owner_of_ticket(6), Some("setup_1-2"));
    }

    #[test]
    fn rejects_ticket_owned_by_another_setup() {
        let dir = tempdir().unwrap();
        let mut store = SetupStore::open(dir.path()).unwrap();
        store.write(&setup(1, 2)).unwrap();
        store.write(&setup(3, 4)).unwrap();
        let err = store
            .add_leg("setup_3-4", leg(LegLevel::Pyramid(1), 2, 9))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::DuplicateTicket(2))
        );
        assert_eq!(store.get("setup_3-4").unwrap().positions.len(), 1);
    }

    #[test]
    fn unknown_setup_is_an_error() {
        let dir = tempdir().unwrap();
        let mut store = SetupStore::open(dir.path()).unwrap();
        assert!(store.mark_closed("setup_missing", Some(0.3)).is_err());
        assert!(store.read("setup_missing").unwrap().is_none());
    }
}
