use std::collections::BTreeMap;

use aemsync_core::{coordinate_fits, Platform, Well, MAX_NAME_CHARS};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Add,
    Update,
}

#[derive(Debug, Clone)]
enum Undo {
    Platform(i64, Option<(StageKind, Platform)>),
    Well(i64, Option<(StageKind, Well)>),
}

/// Position in the change set's undo journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

/// Entities staged during one reconciliation pass, committed together.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    platforms: BTreeMap<i64, (StageKind, Platform)>,
    wells: BTreeMap<i64, (StageKind, Well)>,
    journal: Vec<Undo>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restaging an added entity keeps it an add.
    pub fn stage_platform(&mut self, kind: StageKind, platform: Platform) {
        let kind = match self.platforms.get(&platform.id) {
            Some((StageKind::Add, _)) => StageKind::Add,
            _ => kind,
        };
        let id = platform.id;
        let previous = self.platforms.insert(id, (kind, platform));
        self.journal.push(Undo::Platform(id, previous));
    }

    pub fn stage_well(&mut self, kind: StageKind, well: Well) {
        let kind = match self.wells.get(&well.id) {
            Some((StageKind::Add, _)) => StageKind::Add,
            _ => kind,
        };
        let id = well.id;
        let previous = self.wells.insert(id, (kind, well));
        self.journal.push(Undo::Well(id, previous));
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.journal.len())
    }

    /// Undo everything staged since `savepoint`.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.journal.len() > savepoint.0 {
            match self.journal.pop() {
                Some(Undo::Platform(id, previous)) => restore(&mut self.platforms, id, previous),
                Some(Undo::Well(id, previous)) => restore(&mut self.wells, id, previous),
                None => break,
            }
        }
    }

    /// Keep everything staged since `savepoint`; its undo entries are dropped.
    pub fn release(&mut self, savepoint: Savepoint) {
        self.journal.truncate(savepoint.0);
    }

    pub fn platform(&self, id: i64) -> Option<&Platform> {
        self.platforms.get(&id).map(|(_, p)| p)
    }

    pub fn well(&self, id: i64) -> Option<&Well> {
        self.wells.get(&id).map(|(_, w)| w)
    }

    pub fn platform_named(&self, name: &str) -> Option<i64> {
        self.platforms
            .values()
            .find(|(_, p)| p.unique_name == name)
            .map(|(_, p)| p.id)
    }

    pub fn well_named(&self, name: &str) -> Option<i64> {
        self.wells
            .values()
            .find(|(_, w)| w.unique_name == name)
            .map(|(_, w)| w.id)
    }

    /// Updates first, then adds, so a name released by a renamed row is free
    /// before an insert claims it.
    pub fn platforms(&self) -> impl Iterator<Item = (StageKind, &Platform)> {
        in_apply_order(&self.platforms)
    }

    pub fn wells(&self) -> impl Iterator<Item = (StageKind, &Well)> {
        in_apply_order(&self.wells)
    }

    pub fn len(&self) -> usize {
        self.platforms.len() + self.wells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn restore<T>(table: &mut BTreeMap<i64, (StageKind, T)>, id: i64, previous: Option<(StageKind, T)>) {
    match previous {
        Some(entry) => {
            table.insert(id, entry);
        }
        None => {
            table.remove(&id);
        }
    }
}

fn in_apply_order<T>(table: &BTreeMap<i64, (StageKind, T)>) -> impl Iterator<Item = (StageKind, &T)> {
    let updates = table.values().filter(|(kind, _)| *kind == StageKind::Update);
    let adds = table.values().filter(|(kind, _)| *kind == StageKind::Add);
    updates.chain(adds).map(|(kind, row)| (*kind, row))
}

/// Durable platform/well storage. One instance serves one run; it is never
/// shared between concurrent writers.
#[async_trait]
pub trait FacilityStore: Send + Sync {
    async fn load_platform(&self, id: i64) -> Result<Option<Platform>, PersistenceError>;

    async fn load_well(&self, id: i64) -> Result<Option<Well>, PersistenceError>;

    /// Id of the stored platform holding `name`, if any.
    async fn platform_named(&self, name: &str) -> Result<Option<i64>, PersistenceError>;

    async fn well_named(&self, name: &str) -> Result<Option<i64>, PersistenceError>;

    /// Apply every staged change atomically and return the rows affected.
    async fn commit(&mut self, changes: &ChangeSet) -> Result<u64, PersistenceError>;
}

/// In-process store with the same constraints as the SQL schema: primary keys,
/// the platform foreign key and column limits per statement, unique names at
/// the end of the commit (the constraints are `DEFERRABLE INITIALLY DEFERRED`).
/// Backs tests and `--dry-run`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    platforms: BTreeMap<i64, Platform>,
    wells: BTreeMap<i64, Well>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.platforms.values()
    }

    pub fn wells(&self) -> impl Iterator<Item = &Well> {
        self.wells.values()
    }

    pub fn platform(&self, id: i64) -> Option<&Platform> {
        self.platforms.get(&id)
    }

    pub fn well(&self, id: i64) -> Option<&Well> {
        self.wells.get(&id)
    }
}

#[async_trait]
impl FacilityStore for MemoryStore {
    async fn load_platform(&self, id: i64) -> Result<Option<Platform>, PersistenceError> {
        Ok(self.platforms.get(&id).cloned())
    }

    async fn load_well(&self, id: i64) -> Result<Option<Well>, PersistenceError> {
        Ok(self.wells.get(&id).cloned())
    }

    async fn platform_named(&self, name: &str) -> Result<Option<i64>, PersistenceError> {
        Ok(self
            .platforms
            .values()
            .find(|p| p.unique_name == name)
            .map(|p| p.id))
    }

    async fn well_named(&self, name: &str) -> Result<Option<i64>, PersistenceError> {
        Ok(self.wells.values().find(|w| w.unique_name == name).map(|w| w.id))
    }

    async fn commit(&mut self, changes: &ChangeSet) -> Result<u64, PersistenceError> {
        let mut platforms = self.platforms.clone();
        let mut wells = self.wells.clone();
        let mut rows = 0u64;

        for (kind, platform) in changes.platforms() {
            check_columns("platform", platform.id, &platform.unique_name, [platform.latitude, platform.longitude])?;
            rows += apply(&mut platforms, kind, platform.id, platform.clone(), "platform")?;
        }
        for (kind, well) in changes.wells() {
            if !platforms.contains_key(&well.platform_id) {
                return Err(PersistenceError::Constraint(format!(
                    "well {} references missing platform {}",
                    well.id, well.platform_id
                )));
            }
            check_columns("well", well.id, &well.unique_name, [well.latitude, well.longitude])?;
            rows += apply(&mut wells, kind, well.id, well.clone(), "well")?;
        }

        check_unique_names(platforms.values().map(|p| (p.id, p.unique_name.as_str())), "platform")?;
        check_unique_names(wells.values().map(|w| (w.id, w.unique_name.as_str())), "well")?;

        self.platforms = platforms;
        self.wells = wells;
        Ok(rows)
    }
}

fn apply<T>(
    table: &mut BTreeMap<i64, T>,
    kind: StageKind,
    id: i64,
    row: T,
    label: &str,
) -> Result<u64, PersistenceError> {
    match kind {
        StageKind::Add => {
            if table.contains_key(&id) {
                return Err(PersistenceError::Constraint(format!(
                    "duplicate {label} id {id}"
                )));
            }
            table.insert(id, row);
            Ok(1)
        }
        StageKind::Update => match table.get_mut(&id) {
            Some(slot) => {
                *slot = row;
                Ok(1)
            }
            None => Ok(0),
        },
    }
}

fn check_columns(
    label: &str,
    id: i64,
    name: &str,
    coordinates: [Option<Decimal>; 2],
) -> Result<(), PersistenceError> {
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(PersistenceError::Constraint(format!(
            "{label} {id} name exceeds VARCHAR({MAX_NAME_CHARS})"
        )));
    }
    if let Some(value) = coordinates.into_iter().flatten().find(|v| !coordinate_fits(v)) {
        return Err(PersistenceError::Constraint(format!(
            "{label} {id} coordinate {value} does not fit NUMERIC(19, 10)"
        )));
    }
    Ok(())
}

fn check_unique_names<'a>(
    rows: impl Iterator<Item = (i64, &'a str)>,
    label: &str,
) -> Result<(), PersistenceError> {
    let mut seen: BTreeMap<&str, i64> = BTreeMap::new();
    for (id, name) in rows {
        if name.is_empty() {
            return Err(PersistenceError::Constraint(format!(
                "{label} {id} has an empty name"
            )));
        }
        if let Some(other) = seen.insert(name, id) {
            return Err(PersistenceError::Constraint(format!(
                "{label} name `{name}` used by both {other} and {id}"
            )));
        }
    }
    Ok(())
}
