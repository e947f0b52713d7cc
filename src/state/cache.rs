//! The externally-owned cache backing a local state: four sqlite tables
//! (state set, deltas, per-state packfile sets, tombstones) behind a
//! connection pool. Callers hand a cache to each state; the engine never
//! decides where caches live.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::resource::{Location, Mac, ResourceType};
use crate::state::DeltaEntry;

#[derive(Clone)]
pub struct StateCache {
    pool: SqlitePool,
}

/// Hands out caches for the aggregated state and for per-session scratch
/// states: sqlite files under a directory, or purely in-memory.
#[derive(Clone, Debug)]
pub enum CacheProvider {
    Directory(PathBuf),
    Memory,
}

impl CacheProvider {
    pub async fn open_aggregate(&self) -> Result<StateCache> {
        match self {
            CacheProvider::Directory(dir) => StateCache::open(&dir.join("state.db")).await,
            CacheProvider::Memory => StateCache::in_memory().await,
        }
    }

    pub async fn open_scratch(&self) -> Result<StateCache> {
        match self {
            CacheProvider::Directory(dir) => {
                let name = format!("{}.db", Uuid::new_v4());
                StateCache::open(&dir.join("tx").join(name)).await
            }
            CacheProvider::Memory => StateCache::in_memory().await,
        }
    }
}

impl StateCache {
    /// Open (creating if needed) a file-backed cache.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Self::create_structure(&pool).await?;
        Ok(Self { pool })
    }

    /// A cache that lives and dies with the process. Pinned to a single
    /// connection: sqlite gives every connection its own `:memory:`
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await?;

        Self::create_structure(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_structure(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "create table if not exists states (
                id blob primary key
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "create table if not exists deltas (
                resource integer not null,
                mac blob not null,
                version integer not null,
                packfile blob not null,
                offset integer not null,
                length integer not null,
                primary key (resource, mac)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "create table if not exists packfiles (
                state_id blob not null,
                packfile blob not null,
                primary key (state_id, packfile)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "create table if not exists tombstones (
                resource integer not null,
                mac blob not null,
                deleted_at integer not null,
                primary key (resource, mac)
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn put_state(&self, id: Mac) -> Result<()> {
        sqlx::query("insert or ignore into states (id) values ($1)")
            .bind(id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn has_state(&self, id: Mac) -> Result<bool> {
        let row = sqlx::query("select 1 from states where id = $1")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub(crate) async fn del_state(&self, id: Mac) -> Result<()> {
        sqlx::query("delete from states where id = $1")
            .bind(id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn list_states(&self) -> Result<Vec<Mac>> {
        let rows = sqlx::query("select id from states order by id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| mac_column(row, "id")).collect()
    }

    /// First insertion wins; content addressing makes a conflicting
    /// binding equally valid, so the existing row is kept.
    pub(crate) async fn put_delta(&self, entry: &DeltaEntry) -> Result<()> {
        sqlx::query(
            "insert or ignore into deltas
                (resource, mac, version, packfile, offset, length)
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(i64::from(entry.resource.as_u32()))
        .bind(entry.mac.as_bytes().to_vec())
        .bind(i64::from(entry.version))
        .bind(entry.location.packfile.as_bytes().to_vec())
        .bind(entry.location.offset as i64)
        .bind(i64::from(entry.location.length))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn get_delta(
        &self,
        resource: ResourceType,
        mac: Mac,
    ) -> Result<Option<DeltaEntry>> {
        let row = sqlx::query(
            "select resource, mac, version, packfile, offset, length
             from deltas where resource = $1 and mac = $2",
        )
        .bind(i64::from(resource.as_u32()))
        .bind(mac.as_bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(delta_from_row).transpose()
    }

    pub(crate) async fn list_deltas(&self) -> Result<Vec<DeltaEntry>> {
        let rows = sqlx::query(
            "select resource, mac, version, packfile, offset, length
             from deltas order by resource, mac",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delta_from_row).collect()
    }

    pub(crate) async fn list_deltas_of_type(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<DeltaEntry>> {
        let rows = sqlx::query(
            "select resource, mac, version, packfile, offset, length
             from deltas where resource = $1 order by mac",
        )
        .bind(i64::from(resource.as_u32()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delta_from_row).collect()
    }

    /// Deltas whose packfile does not appear in any per-state packfile
    /// set; input for external consistency checks.
    pub(crate) async fn list_orphan_deltas(&self) -> Result<Vec<DeltaEntry>> {
        let rows = sqlx::query(
            "select resource, mac, version, packfile, offset, length
             from deltas
             where packfile not in (select packfile from packfiles)
             order by resource, mac",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delta_from_row).collect()
    }

    pub(crate) async fn put_packfile(&self, state_id: Mac, packfile: Mac) -> Result<()> {
        sqlx::query("insert or ignore into packfiles (state_id, packfile) values ($1, $2)")
            .bind(state_id.as_bytes().to_vec())
            .bind(packfile.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn del_packfile(&self, packfile: Mac) -> Result<()> {
        sqlx::query("delete from packfiles where packfile = $1")
            .bind(packfile.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn list_packfiles(&self) -> Result<Vec<Mac>> {
        let rows = sqlx::query("select distinct packfile from packfiles order by packfile")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| mac_column(row, "packfile")).collect()
    }

    pub(crate) async fn list_packfile_records(&self) -> Result<Vec<(Mac, Mac)>> {
        let rows = sqlx::query(
            "select state_id, packfile from packfiles order by state_id, packfile",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((mac_column(row, "state_id")?, mac_column(row, "packfile")?)))
            .collect()
    }

    /// Tombstones keep the newest deletion timestamp per `(resource, mac)`.
    pub(crate) async fn put_tombstone(
        &self,
        resource: ResourceType,
        mac: Mac,
        deleted_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "insert into tombstones (resource, mac, deleted_at) values ($1, $2, $3)
             on conflict (resource, mac) do update
                 set deleted_at = excluded.deleted_at
                 where excluded.deleted_at > tombstones.deleted_at",
        )
        .bind(i64::from(resource.as_u32()))
        .bind(mac.as_bytes().to_vec())
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn get_tombstone(
        &self,
        resource: ResourceType,
        mac: Mac,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "select deleted_at from tombstones where resource = $1 and mac = $2",
        )
        .bind(i64::from(resource.as_u32()))
        .bind(mac.as_bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get::<i64, _>("deleted_at")))
    }

    pub(crate) async fn list_tombstones(
        &self,
        resource: Option<ResourceType>,
    ) -> Result<Vec<(ResourceType, Mac, i64)>> {
        let rows = match resource {
            Some(resource) => {
                sqlx::query(
                    "select resource, mac, deleted_at from tombstones
                     where resource = $1 order by mac",
                )
                .bind(i64::from(resource.as_u32()))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "select resource, mac, deleted_at from tombstones
                     order by resource, mac",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let resource = ResourceType::from_u32(row.get::<i64, _>("resource") as u32)?;
                Ok((resource, mac_column(row, "mac")?, row.get::<i64, _>("deleted_at")))
            })
            .collect()
    }
}

fn mac_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Mac> {
    Mac::from_slice(&row.get::<Vec<u8>, _>(column))
}

fn delta_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DeltaEntry> {
    Ok(DeltaEntry {
        resource: ResourceType::from_u32(row.get::<i64, _>("resource") as u32)?,
        version: row.get::<i64, _>("version") as u32,
        mac: mac_column(row, "mac")?,
        location: Location {
            packfile: mac_column(row, "packfile")?,
            offset: row.get::<i64, _>("offset") as u64,
            length: row.get::<i64, _>("length") as u32,
        },
    })
}
