use aemsync_core::{Platform, Well};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::store::{ChangeSet, FacilityStore, PersistenceError, StageKind};

/// Postgres-backed store. Commits run in a single transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn platform_from_row(row: &PgRow) -> Result<Platform, sqlx::Error> {
    Ok(Platform {
        id: row.try_get("id")?,
        unique_name: row.try_get("unique_name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn well_from_row(row: &PgRow) -> Result<Well, sqlx::Error> {
    Ok(Well {
        id: row.try_get("id")?,
        platform_id: row.try_get("platform_id")?,
        unique_name: row.try_get("unique_name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl FacilityStore for PgStore {
    async fn load_platform(&self, id: i64) -> Result<Option<Platform>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, unique_name, latitude, longitude, created_at, updated_at
              FROM platforms
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(platform_from_row).transpose()?)
    }

    async fn load_well(&self, id: i64) -> Result<Option<Well>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, platform_id, unique_name, latitude, longitude, created_at, updated_at
              FROM wells
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(well_from_row).transpose()?)
    }

    async fn platform_named(&self, name: &str) -> Result<Option<i64>, PersistenceError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM platforms WHERE unique_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn well_named(&self, name: &str) -> Result<Option<i64>, PersistenceError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM wells WHERE unique_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// `ChangeSet` yields updates before adds; unique names are deferred
    /// constraints, checked when the transaction commits.
    async fn commit(&mut self, changes: &ChangeSet) -> Result<u64, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut rows = 0u64;

        for (kind, p) in changes.platforms() {
            let query = match kind {
                StageKind::Add => sqlx::query(
                    r#"
                    INSERT INTO platforms (id, unique_name, latitude, longitude, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                ),
                StageKind::Update => sqlx::query(
                    r#"
                    UPDATE platforms
                       SET unique_name = $2,
                           latitude = $3,
                           longitude = $4,
                           created_at = $5,
                           updated_at = $6
                     WHERE id = $1
                    "#,
                ),
            };
            let result = query
                .bind(p.id)
                .bind(&p.unique_name)
                .bind(p.latitude)
                .bind(p.longitude)
                .bind(p.created_at)
                .bind(p.updated_at)
                .execute(&mut *tx)
                .await?;
            rows += result.rows_affected();
        }

        for (kind, w) in changes.wells() {
            let query = match kind {
                StageKind::Add => sqlx::query(
                    r#"
                    INSERT INTO wells (id, platform_id, unique_name, latitude, longitude, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                ),
                StageKind::Update => sqlx::query(
                    r#"
                    UPDATE wells
                       SET platform_id = $2,
                           unique_name = $3,
                           latitude = $4,
                           longitude = $5,
                           created_at = $6,
                           updated_at = $7
                     WHERE id = $1
                    "#,
                ),
            };
            let result = query
                .bind(w.id)
                .bind(w.platform_id)
                .bind(&w.unique_name)
                .bind(w.latitude)
                .bind(w.longitude)
                .bind(w.created_at)
                .bind(w.updated_at)
                .execute(&mut *tx)
                .await?;
            rows += result.rows_affected();
        }

        tx.commit().await?;
        Ok(rows)
    }
}
