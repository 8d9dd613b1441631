//! Deckhand persistence: SQLite store for the discovery cache, legacy instance state
//! and release bookkeeping. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use deckhand_core::store::{CacheBackend, InstanceStore, ReleaseStore};
use deckhand_core::{now_ts, AppRelease, InstanceRecord, InstanceState, ReleaseStatus, ResourceInstance};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS discovery_cache (
    cache_key TEXT PRIMARY KEY,
    payload   TEXT NOT NULL,
    updated   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS instance_config (
    namespace_id   TEXT NOT NULL,
    category       TEXT NOT NULL,
    name           TEXT NOT NULL,
    instance_id    INTEGER,
    ins_state      TEXT NOT NULL,
    is_bcs_success INTEGER NOT NULL DEFAULT 0,
    config         TEXT NOT NULL,
    updated        INTEGER NOT NULL,
    deleted        INTEGER NOT NULL DEFAULT 0,
    UNIQUE(namespace_id, category, name)
);
CREATE TABLE IF NOT EXISTS app_release (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    cluster_id  TEXT NOT NULL,
    namespace   TEXT NOT NULL,
    template_id INTEGER NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT NOT NULL DEFAULT '',
    UNIQUE(name, cluster_id, namespace)
);
CREATE TABLE IF NOT EXISTS resource_instance (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    app_release_id INTEGER NOT NULL,
    kind           TEXT NOT NULL,
    name           TEXT NOT NULL,
    manifest       TEXT NOT NULL,
    version        TEXT NOT NULL DEFAULT '',
    revision       INTEGER NOT NULL DEFAULT 0,
    edited         INTEGER NOT NULL DEFAULT 0,
    UNIQUE(app_release_id, kind, name)
);
";

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let cfg = deckhand_core::EngineConfig::from_env();
        if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::open(&cfg.db_path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(SCHEMA).context("creating deckhand tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Private in-memory database, gone when the store is dropped.
    pub fn in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        db.execute_batch(SCHEMA).context("creating deckhand tables")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn parse_json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or(serde_json::Value::Null)
}

fn release_from_row(row: &Row<'_>) -> rusqlite::Result<AppRelease> {
    let status: String = row.get(5)?;
    Ok(AppRelease {
        id: row.get(0)?,
        name: row.get(1)?,
        cluster_id: row.get(2)?,
        namespace: row.get(3)?,
        template_id: row.get(4)?,
        status: ReleaseStatus::parse(&status).unwrap_or(ReleaseStatus::Pending),
        message: row.get(6)?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceInstance> {
    let manifest: String = row.get(4)?;
    Ok(ResourceInstance {
        id: row.get(0)?,
        app_release_id: row.get(1)?,
        kind: row.get(2)?,
        name: row.get(3)?,
        manifest: parse_json(&manifest),
        version: row.get(5)?,
        revision: row.get(6)?,
        edited: row.get(7)?,
    })
}

const RELEASE_COLS: &str = "id, name, cluster_id, namespace, template_id, status, message";
const RESOURCE_COLS: &str = "id, app_release_id, kind, name, manifest, version, revision, edited";

impl CacheBackend for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let v = db
            .query_row("SELECT payload FROM discovery_cache WHERE cache_key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO discovery_cache(cache_key, payload, updated) VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET payload = excluded.payload, updated = excluded.updated",
            params![key, value, now_ts()],
        )
        .with_context(|| format!("writing discovery cache entry {}", key))?;
        histogram!("persist_cache_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM discovery_cache WHERE cache_key = ?1", [key])?;
        Ok(())
    }
}

impl InstanceStore for SqliteStore {
    fn upsert_instance(&self, rec: &InstanceRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO instance_config(namespace_id, category, name, instance_id, ins_state, is_bcs_success, config, updated, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(namespace_id, category, name) DO UPDATE SET
                instance_id = COALESCE(excluded.instance_id, instance_config.instance_id),
                ins_state = excluded.ins_state,
                is_bcs_success = excluded.is_bcs_success,
                config = excluded.config,
                updated = excluded.updated,
                deleted = excluded.deleted",
            params![
                rec.namespace_id,
                rec.category,
                rec.name,
                rec.instance_id,
                rec.ins_state.as_str(),
                rec.is_bcs_success,
                rec.config.to_string(),
                rec.updated,
                rec.deleted,
            ],
        )
        .with_context(|| format!("upserting instance_config {}/{}/{}", rec.namespace_id, rec.category, rec.name))?;
        histogram!("persist_instance_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn list_instances(&self, namespace_id: &str) -> Result<Vec<InstanceRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT namespace_id, category, name, instance_id, ins_state, is_bcs_success, config, updated, deleted
             FROM instance_config WHERE namespace_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([namespace_id], |row| {
            let state: String = row.get(4)?;
            let config: String = row.get(6)?;
            Ok(InstanceRecord {
                namespace_id: row.get(0)?,
                category: row.get(1)?,
                name: row.get(2)?,
                instance_id: row.get(3)?,
                ins_state: InstanceState::parse(&state).unwrap_or(InstanceState::Pending),
                is_bcs_success: row.get(5)?,
                config: parse_json(&config),
                updated: row.get(7)?,
                deleted: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl ReleaseStore for SqliteStore {
    fn upsert_release(&self, name: &str, cluster_id: &str, namespace: &str, template_id: i64) -> Result<AppRelease> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO app_release(name, cluster_id, namespace, template_id, status, message)
             VALUES (?1, ?2, ?3, ?4, 'pending', '')
             ON CONFLICT(name, cluster_id, namespace) DO UPDATE SET
                template_id = excluded.template_id, status = 'pending', message = ''",
            params![name, cluster_id, namespace, template_id],
        )
        .with_context(|| format!("upserting app_release {}/{}/{}", cluster_id, namespace, name))?;
        let sql = format!("SELECT {} FROM app_release WHERE name = ?1 AND cluster_id = ?2 AND namespace = ?3", RELEASE_COLS);
        let rel = db.query_row(&sql, params![name, cluster_id, namespace], release_from_row)?;
        counter!("persist_put_total", 1u64);
        Ok(rel)
    }

    fn set_release_status(&self, id: i64, status: ReleaseStatus, message: &str) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE app_release SET status = ?2, message = ?3 WHERE id = ?1",
            params![id, status.as_str(), message],
        )?;
        if n == 0 {
            return Err(anyhow!("app_release {} not found", id));
        }
        Ok(())
    }

    fn get_release(&self, id: i64) -> Result<Option<AppRelease>> {
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM app_release WHERE id = ?1", RELEASE_COLS);
        Ok(db.query_row(&sql, [id], release_from_row).optional()?)
    }

    fn find_release(&self, name: &str, cluster_id: &str, namespace: &str) -> Result<Option<AppRelease>> {
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM app_release WHERE name = ?1 AND cluster_id = ?2 AND namespace = ?3", RELEASE_COLS);
        Ok(db.query_row(&sql, params![name, cluster_id, namespace], release_from_row).optional()?)
    }

    fn list_releases(&self, cluster_id: &str, namespace: Option<&str>) -> Result<Vec<AppRelease>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT {} FROM app_release WHERE cluster_id = ?1 AND (?2 IS NULL OR namespace = ?2) ORDER BY namespace, name",
            RELEASE_COLS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![cluster_id, namespace], release_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_release(&self, id: i64) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM app_release WHERE id = ?1", [id])?;
        Ok(())
    }

    fn upsert_resource(
        &self,
        app_release_id: i64,
        kind: &str,
        name: &str,
        manifest: &serde_json::Value,
        version: &str,
        revision: i64,
    ) -> Result<ResourceInstance> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO resource_instance(app_release_id, kind, name, manifest, version, revision, edited)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
             ON CONFLICT(app_release_id, kind, name) DO UPDATE SET
                manifest = excluded.manifest, version = excluded.version,
                revision = excluded.revision, edited = 0",
            params![app_release_id, kind, name, manifest.to_string(), version, revision],
        )
        .with_context(|| format!("upserting resource_instance {}/{}/{}", app_release_id, kind, name))?;
        let sql = format!("SELECT {} FROM resource_instance WHERE app_release_id = ?1 AND kind = ?2 AND name = ?3", RESOURCE_COLS);
        let res = db.query_row(&sql, params![app_release_id, kind, name], resource_from_row)?;
        histogram!("persist_resource_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(res)
    }

    fn get_resource(&self, id: i64) -> Result<Option<ResourceInstance>> {
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM resource_instance WHERE id = ?1", RESOURCE_COLS);
        Ok(db.query_row(&sql, [id], resource_from_row).optional()?)
    }

    fn list_resources(&self, app_release_id: i64) -> Result<Vec<ResourceInstance>> {
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM resource_instance WHERE app_release_id = ?1 ORDER BY id", RESOURCE_COLS);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([app_release_id], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn mark_edited(&self, id: i64, manifest: &serde_json::Value) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE resource_instance SET manifest = ?2, edited = 1 WHERE id = ?1",
            params![id, manifest.to_string()],
        )?;
        if n == 0 {
            return Err(anyhow!("resource_instance {} not found", id));
        }
        Ok(())
    }

    fn delete_resource(&self, id: i64) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM resource_instance WHERE id = ?1", [id])?;
        Ok(())
    }
}
