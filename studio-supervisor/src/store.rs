//! SQLite-backed deployment table.
//!
//! Records are never deleted. Every transition is a conditional `UPDATE`
//! so a stale caller cannot move a row out of a state it no longer holds.
//! All statements run on the blocking pool.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use studio_core::error::StudioError;
use tracing::debug;

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Starting,
    Running,
    Stopped,
    Exited,
    Dead,
    Error,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Exited => "exited",
            DeploymentStatus::Dead => "dead",
            DeploymentStatus::Error => "error",
        }
    }

    /// Whether the deployment may still hold a host port.
    pub fn holds_port(&self) -> bool {
        matches!(self, DeploymentStatus::Starting | DeploymentStatus::Running)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(DeploymentStatus::Starting),
            "running" => Ok(DeploymentStatus::Running),
            "stopped" => Ok(DeploymentStatus::Stopped),
            "exited" => Ok(DeploymentStatus::Exited),
            "dead" => Ok(DeploymentStatus::Dead),
            "error" => Ok(DeploymentStatus::Error),
            other => Err(StudioError::invalid_request(format!(
                "unknown deployment status '{other}'"
            ))),
        }
    }
}

impl ToSql for DeploymentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DeploymentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: StudioError| FromSqlError::Other(Box::new(e)))
    }
}

/// One row of the deployment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Stable surrogate key, assigned before the container exists.
    pub deploy_id: String,
    /// Runtime container id, filled once CCS confirms the launch.
    pub container_id: Option<String>,
    pub container_name: String,
    pub model_id: String,
    pub device: String,
    pub deployed_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: DeploymentStatus,
    pub stopped_by_user: bool,
    pub port: Option<u16>,
    pub weights_id: Option<String>,
    pub error_message: Option<String>,
}

impl DeploymentRecord {
    /// A fresh record in `starting`.
    pub fn starting(
        deploy_id: impl Into<String>,
        container_name: impl Into<String>,
        model_id: impl Into<String>,
        device: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            deploy_id: deploy_id.into(),
            container_id: None,
            container_name: container_name.into(),
            model_id: model_id.into(),
            device: device.into(),
            deployed_at: Utc::now(),
            stopped_at: None,
            status: DeploymentStatus::Starting,
            stopped_by_user: false,
            port: Some(port),
            weights_id: None,
            error_message: None,
        }
    }
}

/// Errors from the deployment table.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Join(String),
}

impl From<StoreError> for StudioError {
    fn from(e: StoreError) -> Self {
        StudioError::internal(format!("deployment store: {e}"))
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS deployments (
    deploy_id       TEXT PRIMARY KEY,
    container_id    TEXT UNIQUE,
    container_name  TEXT NOT NULL,
    model_id        TEXT NOT NULL,
    device          TEXT NOT NULL,
    deployed_at     TEXT NOT NULL,
    stopped_at      TEXT,
    status          TEXT NOT NULL,
    stopped_by_user INTEGER NOT NULL DEFAULT 0,
    port            INTEGER,
    weights_id      TEXT,
    error_message   TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments (status, deployed_at);
CREATE INDEX IF NOT EXISTS idx_deployments_model ON deployments (model_id, deployed_at);
";

const COLUMNS: &str = "deploy_id, container_id, container_name, model_id, device, deployed_at, \
                       stopped_at, status, stopped_by_user, port, weights_id, error_message";

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    let stopped_at: Option<String> = row.get(6)?;
    Ok(DeploymentRecord {
        deploy_id: row.get(0)?,
        container_id: row.get(1)?,
        container_name: row.get(2)?,
        model_id: row.get(3)?,
        device: row.get(4)?,
        deployed_at: parse_timestamp(5, row.get(5)?)?,
        stopped_at: stopped_at.map(|s| parse_timestamp(6, s)).transpose()?,
        status: row.get(7)?,
        stopped_by_user: row.get(8)?,
        port: row.get(9)?,
        weights_id: row.get(10)?,
        error_message: row.get(11)?,
    })
}

/// Handle to the deployment table. Cheap to clone.
#[derive(Clone)]
pub struct DeploymentStore {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for DeploymentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentStore").finish_non_exhaustive()
    }
}

impl DeploymentStore {
    /// Open (or create) the table at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    /// A private in-memory table.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!("Deployment table ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }

    pub async fn insert(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let r = record.clone();
        self.call(move |conn| {
            conn.execute(
                &format!("INSERT INTO deployments ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
                params![
                    r.deploy_id,
                    r.container_id,
                    r.container_name,
                    r.model_id,
                    r.device,
                    timestamp(&r.deployed_at),
                    r.stopped_at.as_ref().map(timestamp),
                    r.status,
                    r.stopped_by_user,
                    r.port,
                    r.weights_id,
                    r.error_message,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// Fetch by deploy id or container id.
    pub async fn get(&self, key: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM deployments WHERE deploy_id = ?1 OR container_id = ?1"),
                params![key],
                record_from_row,
            )
            .optional()
        })
        .await
    }

    /// All records, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.call(move |conn| {
            let mut stmt = match status {
                Some(_) => conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM deployments WHERE status = ?1 ORDER BY deployed_at DESC"
                ))?,
                None => conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM deployments ORDER BY deployed_at DESC"
                ))?,
            };
            let rows = match status {
                Some(s) => stmt.query_map(params![s], record_from_row)?,
                None => stmt.query_map([], record_from_row)?,
            };
            rows.collect()
        })
        .await
    }

    /// Records for one model, newest first.
    pub async fn list_for_model(&self, model_id: &str) -> Result<Vec<DeploymentRecord>, StoreError> {
        let model_id = model_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM deployments WHERE model_id = ?1 ORDER BY deployed_at DESC"
            ))?;
            let rows = stmt.query_map(params![model_id], record_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Any state but `running`/`stopped` → `running` with the confirmed container.
    ///
    /// Records the user stopped are never revived.
    pub async fn mark_running(
        &self,
        deploy_id: &str,
        container_id: &str,
        container_name: &str,
        port: Option<u16>,
    ) -> Result<bool, StoreError> {
        let (id, cid, name) = (
            deploy_id.to_string(),
            container_id.to_string(),
            container_name.to_string(),
        );
        self.call(move |conn| {
            conn.execute(
                "UPDATE deployments
                 SET status = 'running', container_id = ?2, container_name = ?3, port = ?4,
                     error_message = NULL, stopped_at = NULL
                 WHERE deploy_id = ?1 AND status IN ('starting', 'error', 'exited', 'dead')
                   AND stopped_by_user = 0",
                params![id, cid, name, port],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// `starting` → `error`.
    pub async fn mark_error(&self, deploy_id: &str, message: &str) -> Result<bool, StoreError> {
        let (id, message) = (deploy_id.to_string(), message.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE deployments SET status = 'error', error_message = ?2, stopped_at = ?3
                 WHERE deploy_id = ?1 AND status = 'starting'",
                params![id, message, timestamp(&Utc::now())],
            )
            .map(|n| n > 0)
        })
        .await
    }

    pub async fn mark_stopped_by_user(&self, deploy_id: &str) -> Result<bool, StoreError> {
        let id = deploy_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE deployments SET stopped_by_user = 1 WHERE deploy_id = ?1",
                params![id],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// Any state → `stopped`.
    pub async fn mark_stopped(&self, deploy_id: &str) -> Result<bool, StoreError> {
        let id = deploy_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE deployments SET status = 'stopped', stopped_at = COALESCE(stopped_at, ?2)
                 WHERE deploy_id = ?1 AND status != 'stopped'",
                params![id, timestamp(&Utc::now())],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// `running` → `exited`/`dead`, unless the user asked for the stop.
    pub async fn mark_lost(
        &self,
        deploy_id: &str,
        status: DeploymentStatus,
    ) -> Result<bool, StoreError> {
        let id = deploy_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE deployments SET status = ?2, stopped_at = ?3
                 WHERE deploy_id = ?1 AND status = 'running' AND stopped_by_user = 0",
                params![id, status, timestamp(&Utc::now())],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// Records still `starting` without a container, deployed before `cutoff`.
    pub async fn stale_starting(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM deployments
                 WHERE status = 'starting' AND container_id IS NULL AND deployed_at < ?1
                 ORDER BY deployed_at"
            ))?;
            let rows = stmt.query_map(params![timestamp(&cutoff)], record_from_row)?;
            rows.collect()
        })
        .await
    }
}
