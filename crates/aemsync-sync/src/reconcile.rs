//! Per-record upsert of normalized platform records into the store.

use std::ops::AddAssign;

use aemsync_core::{
    merge_platform, merge_well, EntityKind, Platform, PlatformRecord, RecordRejected, Well,
    WellRecord,
};
use aemsync_storage::{ChangeSet, FacilityStore, PersistenceError, StageKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Clock = fn() -> DateTime<Utc>;

/// Counts for one reconciliation pass, or the sum over several.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub platforms_added: usize,
    pub platforms_updated: usize,
    pub platforms_unchanged: usize,
    pub platforms_skipped: usize,
    pub platforms_rejected: usize,
    pub wells_added: usize,
    pub wells_updated: usize,
    pub wells_unchanged: usize,
    pub wells_skipped: usize,
    pub wells_rejected: usize,
    pub rows_committed: u64,
    pub endpoints_failed: usize,
    /// One line per rejected record, failed record or failed endpoint.
    pub errors: Vec<String>,
}

impl RunOutcome {
    pub fn rejected(&self) -> usize {
        self.platforms_rejected + self.wells_rejected
    }

    /// No endpoint failed and every record was accepted.
    pub fn is_clean(&self) -> bool {
        self.endpoints_failed == 0 && self.errors.is_empty()
    }
}

impl AddAssign for RunOutcome {
    fn add_assign(&mut self, other: Self) {
        self.platforms_added += other.platforms_added;
        self.platforms_updated += other.platforms_updated;
        self.platforms_unchanged += other.platforms_unchanged;
        self.platforms_skipped += other.platforms_skipped;
        self.platforms_rejected += other.platforms_rejected;
        self.wells_added += other.wells_added;
        self.wells_updated += other.wells_updated;
        self.wells_unchanged += other.wells_unchanged;
        self.wells_skipped += other.wells_skipped;
        self.wells_rejected += other.wells_rejected;
        self.rows_committed += other.rows_committed;
        self.endpoints_failed += other.endpoints_failed;
        self.errors.extend(other.errors);
    }
}

/// Failure while processing a single platform record. Recorded, never fatal.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("{kind} {id} cannot take name `{name}`: already used by {kind} {owner}")]
    NameConflict {
        kind: EntityKind,
        id: i64,
        name: String,
        owner: i64,
    },
}

enum Staged {
    Added,
    Updated,
    Restaged,
    Unchanged,
}

/// Loads, merges and stages every record, then commits once.
pub struct ReconciliationEngine<'s, S: FacilityStore> {
    store: &'s mut S,
    clock: Clock,
}

impl<'s, S: FacilityStore> ReconciliationEngine<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self {
            store,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// A failing record is rolled back out of the change set and reported in
    /// `errors`; a failing commit is returned as an error.
    pub async fn process(&mut self, records: &[PlatformRecord]) -> Result<RunOutcome, PersistenceError> {
        let mut changes = ChangeSet::new();
        let mut outcome = RunOutcome::default();

        for record in records {
            let savepoint = changes.savepoint();
            let mut delta = RunOutcome::default();
            match self.process_platform(record, &mut changes, &mut delta).await {
                Ok(()) => {
                    changes.release(savepoint);
                    outcome += delta;
                }
                Err(err) => {
                    changes.rollback_to(savepoint);
                    warn!(
                        platform_id = ?record.id,
                        platform = %record.display_name(),
                        error = %err,
                        "failed to process platform record; continuing"
                    );
                    outcome
                        .errors
                        .push(format!("platform {}: {err}", record.display_name()));
                }
            }
        }

        if changes.is_empty() {
            debug!("nothing staged; skipping commit");
            return Ok(outcome);
        }

        outcome.rows_committed = self.store.commit(&changes).await?;
        info!(rows = outcome.rows_committed, "committed staged changes");
        Ok(outcome)
    }

    async fn process_platform(
        &mut self,
        record: &PlatformRecord,
        changes: &mut ChangeSet,
        outcome: &mut RunOutcome,
    ) -> Result<(), RecordError> {
        let now = (self.clock)();
        let platform_id = record.merge_key();

        match platform_id {
            Some(id) => self.reconcile_platform(id, record, changes, outcome, now).await?,
            None => {
                outcome.platforms_skipped += 1;
                debug!(platform = %record.display_name(), "platform record has no id; skipping platform upsert");
            }
        }

        for well in &record.wells {
            match well.merge_key() {
                Some(well_id) => {
                    self.reconcile_well(well_id, well, platform_id, changes, outcome, now)
                        .await?
                }
                None => {
                    outcome.wells_skipped += 1;
                    debug!(well = %well.display_name(), "well record has no id; skipping");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_platform(
        &mut self,
        id: i64,
        record: &PlatformRecord,
        changes: &mut ChangeSet,
        outcome: &mut RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        let restaging = changes.platform(id).is_some();
        let existing = match changes.platform(id) {
            Some(staged) => Some(staged.clone()),
            None => self.store.load_platform(id).await?,
        };

        let merged = match merge_platform(existing.as_ref(), record, now) {
            Ok(merged) => merged,
            Err(rejected) => {
                reject(outcome, EntityKind::Platform, rejected);
                return Ok(());
            }
        };

        if existing.as_ref().map(|p| p.unique_name.as_str()) != Some(merged.unique_name.as_str()) {
            let owner = self.platform_name_owner(&merged.unique_name, changes).await?;
            if let Some(owner) = owner.filter(|owner| *owner != id) {
                return Err(RecordError::NameConflict {
                    kind: EntityKind::Platform,
                    id,
                    name: merged.unique_name,
                    owner,
                });
            }
        }

        match stage_platform(changes, existing.as_ref(), restaging, merged) {
            Staged::Added => outcome.platforms_added += 1,
            Staged::Updated => outcome.platforms_updated += 1,
            Staged::Unchanged => outcome.platforms_unchanged += 1,
            Staged::Restaged => {}
        }
        Ok(())
    }

    async fn reconcile_well(
        &mut self,
        id: i64,
        record: &WellRecord,
        fallback_platform_id: Option<i64>,
        changes: &mut ChangeSet,
        outcome: &mut RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        let restaging = changes.well(id).is_some();
        let existing = match changes.well(id) {
            Some(staged) => Some(staged.clone()),
            None => self.store.load_well(id).await?,
        };

        let merged = match merge_well(existing.as_ref(), record, fallback_platform_id, now) {
            Ok(merged) => merged,
            Err(rejected) => {
                reject(outcome, EntityKind::Well, rejected);
                return Ok(());
            }
        };

        let platform_moved = existing.as_ref().map(|w| w.platform_id) != Some(merged.platform_id);
        if platform_moved && !self.platform_known(merged.platform_id, changes).await? {
            reject(
                outcome,
                EntityKind::Well,
                RecordRejected::UnknownPlatform {
                    well_id: id,
                    platform_id: merged.platform_id,
                },
            );
            return Ok(());
        }

        if existing.as_ref().map(|w| w.unique_name.as_str()) != Some(merged.unique_name.as_str()) {
            let owner = self.well_name_owner(&merged.unique_name, changes).await?;
            if let Some(owner) = owner.filter(|owner| *owner != id) {
                return Err(RecordError::NameConflict {
                    kind: EntityKind::Well,
                    id,
                    name: merged.unique_name,
                    owner,
                });
            }
        }

        match stage_well(changes, existing.as_ref(), restaging, merged) {
            Staged::Added => outcome.wells_added += 1,
            Staged::Updated => outcome.wells_updated += 1,
            Staged::Unchanged => outcome.wells_unchanged += 1,
            Staged::Restaged => {}
        }
        Ok(())
    }

    async fn platform_known(&self, id: i64, changes: &ChangeSet) -> Result<bool, PersistenceError> {
        if changes.platform(id).is_some() {
            return Ok(true);
        }
        Ok(self.store.load_platform(id).await?.is_some())
    }

    /// Staged names shadow stored ones: a stored owner that was renamed in this
    /// run no longer holds the name.
    async fn platform_name_owner(
        &self,
        name: &str,
        changes: &ChangeSet,
    ) -> Result<Option<i64>, PersistenceError> {
        if let Some(id) = changes.platform_named(name) {
            return Ok(Some(id));
        }
        let stored = self.store.platform_named(name).await?;
        Ok(stored.filter(|owner| changes.platform(*owner).is_none()))
    }

    async fn well_name_owner(
        &self,
        name: &str,
        changes: &ChangeSet,
    ) -> Result<Option<i64>, PersistenceError> {
        if let Some(id) = changes.well_named(name) {
            return Ok(Some(id));
        }
        let stored = self.store.well_named(name).await?;
        Ok(stored.filter(|owner| changes.well(*owner).is_none()))
    }
}

fn stage_platform(
    changes: &mut ChangeSet,
    existing: Option<&Platform>,
    restaging: bool,
    merged: Platform,
) -> Staged {
    match existing {
        Some(current) if *current == merged => Staged::Unchanged,
        Some(_) => {
            info!(platform_id = merged.id, name = %merged.unique_name, latitude = ?merged.latitude, longitude = ?merged.longitude, "updated platform");
            changes.stage_platform(StageKind::Update, merged);
            if restaging {
                Staged::Restaged
            } else {
                Staged::Updated
            }
        }
        None => {
            info!(platform_id = merged.id, name = %merged.unique_name, latitude = ?merged.latitude, longitude = ?merged.longitude, "added platform");
            changes.stage_platform(StageKind::Add, merged);
            Staged::Added
        }
    }
}

fn stage_well(
    changes: &mut ChangeSet,
    existing: Option<&Well>,
    restaging: bool,
    merged: Well,
) -> Staged {
    match existing {
        Some(current) if *current == merged => Staged::Unchanged,
        Some(_) => {
            info!(well_id = merged.id, platform_id = merged.platform_id, name = %merged.unique_name, "updated well");
            changes.stage_well(StageKind::Update, merged);
            if restaging {
                Staged::Restaged
            } else {
                Staged::Updated
            }
        }
        None => {
            info!(well_id = merged.id, platform_id = merged.platform_id, name = %merged.unique_name, "added well");
            changes.stage_well(StageKind::Add, merged);
            Staged::Added
        }
    }
}

fn reject(outcome: &mut RunOutcome, kind: EntityKind, rejected: RecordRejected) {
    warn!(%kind, reason = %rejected, "record rejected");
    match kind {
        EntityKind::Platform => outcome.platforms_rejected += 1,
        EntityKind::Well => outcome.wells_rejected += 1,
    }
    outcome.errors.push(rejected.to_string());
}
