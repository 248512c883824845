#![allow(clippy::missing_errors_doc)]

mod ddl;
mod executor;
mod policy;
mod session;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use extraction_kernel_core::{
    format_rfc3339, now_utc, Direction, MigrationError, MigrationPath, MigrationTarget, PathStep,
    Principal, RevisionGraph, RevisionId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use policy::{
    has_principal_source, install_principal_source, policy_view_name, shadow_protected_tables,
    PolicyEngine, PolicyRecord, ProtectedTable,
};
pub use session::PrincipalSession;

const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tables owned by the migrator itself. They are never part of a revision.
pub const BOOKKEEPING_TABLES: [&str; 7] = [
    "schema_revision",
    "schema_revision_log",
    "schema_migration_lock",
    "schema_catalog",
    "schema_enum_types",
    "rls_tables",
    "rls_policies",
];

const SCHEMA_BOOKKEEPING: &str = r"
CREATE TABLE IF NOT EXISTS schema_revision (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  revision_id TEXT NOT NULL,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_revision_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  revision_id TEXT NOT NULL,
  direction TEXT NOT NULL CHECK (direction IN ('up', 'down')),
  head_after TEXT,
  holder TEXT NOT NULL,
  applied_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_schema_revision_log_no_update
BEFORE UPDATE ON schema_revision_log
BEGIN
  SELECT RAISE(FAIL, 'schema_revision_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_schema_revision_log_no_delete
BEFORE DELETE ON schema_revision_log
BEGIN
  SELECT RAISE(FAIL, 'schema_revision_log is append-only');
END;

CREATE TABLE IF NOT EXISTS schema_migration_lock (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_catalog (
  table_name TEXT PRIMARY KEY,
  schema_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_enum_types (
  type_name TEXT PRIMARY KEY,
  labels_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rls_tables (
  table_name TEXT PRIMARY KEY,
  owner_column TEXT NOT NULL,
  enabled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rls_policies (
  table_name TEXT NOT NULL,
  policy_name TEXT NOT NULL,
  command TEXT NOT NULL CHECK (command IN ('select', 'insert', 'update', 'delete')),
  role TEXT NOT NULL,
  using_expr TEXT,
  check_expr TEXT,
  PRIMARY KEY (table_name, command)
);
";

pub struct SqliteSchemaStore {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Recorded in the lock row and in every log entry.
    pub holder: String,
    /// How long to wait for another migrator's lock. Zero fails fast.
    pub lock_wait: Duration,
    /// Checked between nodes; a node that has started always finishes or rolls back.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Refuse any walk that runs the other way. Checked under the lock.
    pub direction: Option<Direction>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            holder: default_holder(),
            lock_wait: Duration::ZERO,
            cancel: None,
            direction: None,
        }
    }
}

impl MigrateOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[must_use]
pub fn default_holder() -> String {
    format!("pid-{}-{}", std::process::id(), Ulid::new())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoTrustBoundary,
    NotEnabled,
    Failed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTrustBoundary => f.write_str("no_trust_boundary"),
            Self::NotEnabled => f.write_str("not_enabled"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedOperation {
    pub revision: RevisionId,
    pub table: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedNode {
    pub revision: RevisionId,
    pub direction: Direction,
    pub head_after: Option<RevisionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: Option<RevisionId>,
    pub to: Option<RevisionId>,
    pub applied: Vec<AppliedNode>,
    pub skipped: Vec<SkippedOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionLogEntry {
    pub seq: i64,
    pub revision: RevisionId,
    pub direction: Direction,
    pub head_after: Option<RevisionId>,
    pub holder: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: String,
}

/// Structural fingerprint of the user schema, used to compare states across migrations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SchemaShape {
    pub tables: BTreeMap<String, Vec<String>>,
    pub objects: BTreeMap<String, String>,
    pub catalog: BTreeMap<String, String>,
    pub enum_types: BTreeMap<String, Vec<String>>,
    pub protected_tables: Vec<String>,
}

impl SqliteSchemaStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        let conn = open_connection(path, busy_timeout_ms)?;
        conn.execute_batch(SCHEMA_BOOKKEEPING)
            .context("failed to ensure migrator bookkeeping tables")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn install_principal_source(&self, principal: &Principal) -> Result<()> {
        install_principal_source(&self.conn, principal)
    }

    #[must_use]
    pub fn has_principal_source(&self) -> bool {
        has_principal_source(&self.conn)
    }

    #[must_use]
    pub fn policy_engine(&self) -> PolicyEngine<'_> {
        PolicyEngine::new(&self.conn)
    }

    pub fn current_head(&self) -> Result<Option<RevisionId>> {
        let head: Option<String> = self
            .conn
            .query_row(
                "SELECT revision_id FROM schema_revision WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read schema_revision")?;
        Ok(head.map(RevisionId::from))
    }

    pub fn history(&self) -> Result<Vec<RevisionLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, revision_id, direction, head_after, holder, applied_at
                 FROM schema_revision_log
                 ORDER BY seq ASC",
            )
            .context("failed to prepare schema_revision_log query")?;
        let mut rows = stmt.query([])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_direction: String = row.get(2)?;
            let direction = Direction::parse(&raw_direction)
                .ok_or_else(|| anyhow!("invalid direction in revision log: {raw_direction}"))?;
            entries.push(RevisionLogEntry {
                seq: row.get(0)?,
                revision: RevisionId::from(row.get::<_, String>(1)?),
                direction,
                head_after: row.get::<_, Option<String>>(3)?.map(RevisionId::from),
                holder: row.get(4)?,
                applied_at: row.get(5)?,
            });
        }
        Ok(entries)
    }

    pub fn lock_status(&self) -> Result<Option<LockRecord>> {
        self.conn
            .query_row(
                "SELECT holder, acquired_at FROM schema_migration_lock WHERE singleton = 1",
                [],
                |row| {
                    Ok(LockRecord {
                        holder: row.get(0)?,
                        acquired_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("failed to read schema_migration_lock")
    }

    /// Clears a lock left behind by a migrator that died. Returns the removed lock.
    pub fn force_unlock(&self) -> Result<Option<LockRecord>> {
        let existing = self.lock_status()?;
        if let Some(lock) = &existing {
            self.conn
                .execute("DELETE FROM schema_migration_lock WHERE singleton = 1", [])
                .context("failed to clear schema_migration_lock")?;
            tracing::warn!(holder = %lock.holder, acquired_at = %lock.acquired_at, "migration lock forcibly released");
        }
        Ok(existing)
    }

    /// Resolves the walk from the applied head without executing it.
    pub fn plan<'g>(
        &self,
        graph: &'g RevisionGraph,
        target: &MigrationTarget,
    ) -> Result<MigrationPath<'g>, MigrationError> {
        let from = self.current_head().map_err(storage)?;
        Ok(graph.resolve_path(from.as_ref(), target)?)
    }

    /// Moves the schema to `target`, one committed transaction per revision.
    pub fn migrate(
        &self,
        graph: &RevisionGraph,
        target: &MigrationTarget,
        options: &MigrateOptions,
    ) -> Result<MigrationReport, MigrationError> {
        let _lock = MigrationLock::acquire(&self.conn, &options.holder, options.lock_wait)?;
        self.verify_mark_consistency()?;

        let from = self.current_head().map_err(storage)?;
        let path = graph.resolve_path(from.as_ref(), target)?;
        if let (Some(expected), Some(actual)) = (options.direction, path.direction()) {
            if expected != actual {
                return Err(MigrationError::WrongDirection {
                    expected,
                    actual,
                    to: path.iter().last().and_then(|step| step.head_after().cloned()),
                    from,
                });
            }
        }

        if !path.is_empty() && !self.has_principal_source() && self.has_protected_tables()? {
            self.install_principal_source(&Principal::Service)
                .map_err(storage)?;
            tracing::info!("protected tables present; migrator connection acts as service_role");
        }

        let mut report = MigrationReport {
            from: from.clone(),
            to: from,
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        if path.is_empty() {
            tracing::info!(head = ?report.to.as_ref().map(RevisionId::as_str), "schema already at target");
            return Ok(report);
        }

        for step in path.iter() {
            if options.is_cancelled() {
                tracing::warn!(head = ?report.to.as_ref().map(RevisionId::as_str), "migration cancelled at node boundary");
                return Err(MigrationError::Cancelled {
                    last_applied: report.to,
                });
            }

            let skipped = self.apply_node(step, &options.holder)?;
            report.to = step.head_after().cloned();
            report.applied.push(AppliedNode {
                revision: step.revision.id.clone(),
                direction: step.direction,
                head_after: report.to.clone(),
            });
            report.skipped.extend(skipped);
        }

        Ok(report)
    }

    fn apply_node(
        &self,
        step: &PathStep<'_>,
        holder: &str,
    ) -> Result<Vec<SkippedOperation>, MigrationError> {
        let revision = step.revision;
        let failed = |cause: String| MigrationError::StepFailed {
            revision: revision.id.clone(),
            cause,
        };
        let started = Instant::now();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(|err| failed(format!("failed to begin transaction: {err}")))?;

        let mut skipped = Vec::new();
        for (position, item) in revision.steps(step.direction).iter().enumerate() {
            tracing::debug!(
                revision = %revision.id,
                direction = %step.direction,
                step = position + 1,
                "{}",
                item.describe()
            );
            match executor::execute_step(&tx, revision, item) {
                Ok(Some(skip)) => skipped.push(skip),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        revision = %revision.id,
                        direction = %step.direction,
                        step = position + 1,
                        error = %format!("{err:#}"),
                        "revision step failed; node rolled back"
                    );
                    return Err(failed(format!(
                        "{} step #{} ({}): {err:#}",
                        step.direction,
                        position + 1,
                        item.describe()
                    )));
                }
            }
        }

        record_transition(&tx, step, holder).map_err(|err| failed(format!("{err:#}")))?;
        tx.commit()
            .map_err(|err| failed(format!("failed to commit: {err}")))?;

        tracing::info!(
            revision = %revision.id,
            direction = %step.direction,
            message = %revision.message,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "revision applied"
        );
        Ok(skipped)
    }

    fn verify_mark_consistency(&self) -> Result<(), MigrationError> {
        let mark = self.current_head().map_err(storage)?;
        let last_logged: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT head_after FROM schema_revision_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;

        match last_logged {
            None => match mark {
                Some(mark) => Err(MigrationError::PartialApplyDetected {
                    detail: format!("head marker names {mark} but the revision log is empty"),
                }),
                None => Ok(()),
            },
            Some(logged) => {
                let logged = logged.map(RevisionId::from);
                if logged == mark {
                    Ok(())
                } else {
                    Err(MigrationError::PartialApplyDetected {
                        detail: format!(
                            "revision log ends at {} but head marker names {}",
                            head_label(logged.as_ref()),
                            head_label(mark.as_ref())
                        ),
                    })
                }
            }
        }
    }

    fn has_protected_tables(&self) -> Result<bool, MigrationError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rls_tables", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(count > 0)
    }

    /// Fingerprint of everything revisions create: tables, indexes, triggers, views,
    /// catalog entries, enumerated types and protection flags.
    pub fn schema_shape(&self) -> Result<SchemaShape> {
        let mut shape = SchemaShape::default();

        let mut stmt = self
            .conn
            .prepare(
                "SELECT type, name, sql
                 FROM sqlite_master
                 WHERE name NOT LIKE 'sqlite%' AND sql IS NOT NULL
                 ORDER BY name",
            )
            .context("failed to prepare sqlite_master query")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sql: String = row.get(2)?;
            if BOOKKEEPING_TABLES.contains(&name.as_str())
                || name.starts_with("trg_schema_revision_log")
            {
                continue;
            }
            if kind == "table" {
                let columns = ddl::table_columns(&self.conn, &name)?
                    .into_iter()
                    .map(|(column, declared, not_null)| {
                        format!("{column} {declared}{}", if not_null { " NOT NULL" } else { "" })
                    })
                    .collect();
                shape.tables.insert(name.clone(), columns);
                shape.objects.insert(format!("table:{name}"), normalize_sql(&sql));
            } else {
                shape.objects.insert(format!("{kind}:{name}"), normalize_sql(&sql));
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT table_name, schema_json FROM schema_catalog")
            .context("failed to prepare schema_catalog query")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            shape.catalog.insert(row.get(0)?, row.get(1)?);
        }

        shape.enum_types = ddl::load_enum_types(&self.conn)?;

        let mut stmt = self
            .conn
            .prepare("SELECT table_name FROM rls_tables ORDER BY table_name")
            .context("failed to prepare rls_tables query")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            shape.protected_tables.push(row.get(0)?);
        }

        Ok(shape)
    }
}

pub(crate) fn open_connection(path: &Path, busy_timeout_ms: u32) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// Appends the log row, then moves the head marker. The marker update is the node's
/// final statement.
fn record_transition(conn: &Connection, step: &PathStep<'_>, holder: &str) -> Result<()> {
    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    let head_after = step.head_after().map(RevisionId::as_str);

    conn.execute(
        "INSERT INTO schema_revision_log(revision_id, direction, head_after, holder, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            step.revision.id.as_str(),
            step.direction.as_str(),
            head_after,
            holder,
            now
        ],
    )
    .context("failed to append schema_revision_log entry")?;

    match head_after {
        Some(head) => conn.execute(
            "INSERT INTO schema_revision(singleton, revision_id, applied_at) VALUES (1, ?1, ?2)
             ON CONFLICT(singleton) DO UPDATE SET
               revision_id = excluded.revision_id,
               applied_at = excluded.applied_at",
            params![head, now],
        ),
        None => conn.execute("DELETE FROM schema_revision", []),
    }
    .context("failed to update schema_revision head marker")?;

    Ok(())
}

/// Exclusive right to migrate, released when dropped.
struct MigrationLock<'c> {
    conn: &'c Connection,
    holder: String,
}

impl<'c> MigrationLock<'c> {
    fn acquire(
        conn: &'c Connection,
        holder: &str,
        wait: Duration,
    ) -> Result<Self, MigrationError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = format_rfc3339(now_utc()).map_err(storage)?;
            let attempt = conn.execute(
                "INSERT INTO schema_migration_lock(singleton, holder, acquired_at) VALUES (1, ?1, ?2)",
                params![holder, now],
            );
            match attempt {
                Ok(_) => {
                    tracing::debug!(holder, "migration lock acquired");
                    return Ok(Self {
                        conn,
                        holder: holder.to_string(),
                    });
                }
                Err(err) if is_lock_contention(&err) => {
                    if Instant::now() >= deadline {
                        let current: Option<String> = conn
                            .query_row(
                                "SELECT holder FROM schema_migration_lock WHERE singleton = 1",
                                [],
                                |row| row.get(0),
                            )
                            .optional()
                            .map_err(storage)?;
                        return Err(MigrationError::LockHeld {
                            holder: current.unwrap_or_else(|| "unknown".to_string()),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(storage(err)),
            }
        }
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        let released = self.conn.execute(
            "DELETE FROM schema_migration_lock WHERE singleton = 1 AND holder = ?1",
            params![self.holder],
        );
        match released {
            Ok(_) => tracing::debug!(holder = %self.holder, "migration lock released"),
            Err(err) => {
                tracing::warn!(holder = %self.holder, error = %err, "failed to release migration lock");
            }
        }
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
    )
}

#[allow(clippy::needless_pass_by_value)]
fn storage(err: impl std::fmt::Display) -> MigrationError {
    MigrationError::Storage(err.to_string())
}

fn head_label(head: Option<&RevisionId>) -> &str {
    head.map_or("base", RevisionId::as_str)
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use extraction_kernel_core::{
        extraction_revisions, ColumnChange, Revision, Step, EXTRACTION_STATUS_TYPE,
    };
    use proptest::prelude::*;

    const HEAD: &str = "0e7dd198b7c7";
    const POLICIES: &str = "0b5a4a39bd8c";

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn graph() -> RevisionGraph {
        must(RevisionGraph::new(extraction_revisions()))
    }

    fn memory_store() -> SqliteSchemaStore {
        must(SqliteSchemaStore::open(Path::new(":memory:")))
    }

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("extraction-kernel-store-{}.sqlite3", Ulid::new()))
    }

    fn to(revision: &str) -> MigrationTarget {
        MigrationTarget::Revision(RevisionId::from(revision))
    }

    fn migrate(
        store: &SqliteSchemaStore,
        graph: &RevisionGraph,
        target: &MigrationTarget,
    ) -> MigrationReport {
        must(store.migrate(graph, target, &MigrateOptions::default()))
    }

    fn head(store: &SqliteSchemaStore) -> Option<String> {
        must(store.current_head()).map(|id| id.to_string())
    }

    fn seed_owner_and_extraction(store: &SqliteSchemaStore, status: &str) {
        must(store.connection().execute_batch(&format!(
            "INSERT INTO \"user\"(id, email, hashed_password) VALUES ('u1', 'a@example.com', 'x');
             INSERT INTO extractions(id, owner_id, filename, file_size, mime_type, status, presigned_url, storage_path)
             VALUES ('e1', 'u1', 'scan.pdf', 10, 'application/pdf', '{status}', 'https://files/e1', 'files/e1');"
        )));
    }

    fn stored_status(store: &SqliteSchemaStore) -> String {
        must(store.connection().query_row(
            "SELECT status FROM extractions WHERE id = 'e1'",
            [],
            |row| row.get(0),
        ))
    }

    #[test]
    fn fresh_migrate_without_trust_boundary_skips_ownership_policies() {
        let store = memory_store();
        let report = migrate(&store, &graph(), &MigrationTarget::Head);

        assert_eq!(report.from, None);
        assert_eq!(report.to.as_ref().map(RevisionId::as_str), Some(HEAD));
        assert_eq!(report.applied.len(), 5);
        assert_eq!(report.skipped.len(), 2);
        assert!(report
            .skipped
            .iter()
            .all(|skip| skip.reason == SkipReason::NoTrustBoundary
                && skip.revision.as_str() == POLICIES));
        assert_eq!(head(&store).as_deref(), Some(HEAD));
        assert!(must(store.policy_engine().status()).is_empty());
        assert_eq!(must(store.history()).len(), 5);
        assert_eq!(must(store.lock_status()), None);
    }

    #[test]
    fn migrate_with_trust_boundary_protects_user_and_extractions() {
        let store = memory_store();
        must(store.install_principal_source(&Principal::Service));
        let report = migrate(&store, &graph(), &MigrationTarget::Head);
        assert!(report.skipped.is_empty());

        let protected: Vec<String> = must(store.policy_engine().status())
            .into_iter()
            .map(|table| table.table)
            .collect();
        assert_eq!(protected, vec!["extractions".to_string(), "user".to_string()]);

        let profile = must(store.policy_engine().status())
            .into_iter()
            .find(|table| table.table == "user")
            .map(|table| table.policies.len());
        assert_eq!(profile, Some(2));
    }

    #[test]
    fn migrate_at_head_is_a_no_op() {
        let store = memory_store();
        let graph = graph();
        migrate(&store, &graph, &MigrationTarget::Head);
        let again = migrate(&store, &graph, &MigrationTarget::Head);
        assert!(again.applied.is_empty());
        assert_eq!(must(store.history()).len(), 5);
    }

    #[test]
    fn downgrade_to_base_restores_the_empty_schema() {
        let store = memory_store();
        must(store.install_principal_source(&Principal::Service));
        let graph = graph();
        let empty = must(store.schema_shape());

        migrate(&store, &graph, &MigrationTarget::Head);
        let report = migrate(&store, &graph, &MigrationTarget::Base);

        assert_eq!(report.to, None);
        assert_eq!(
            report
                .applied
                .iter()
                .map(|node| node.revision.as_str())
                .collect::<Vec<_>>(),
            vec![HEAD, POLICIES, "aaacfc2783ba", "efc9ab8c3122", "20038a3ab258"]
        );
        assert!(report
            .applied
            .iter()
            .all(|node| node.direction == Direction::Down));
        assert_eq!(head(&store), None);
        assert_eq!(must(store.schema_shape()), empty);
        assert_eq!(must(store.history()).len(), 10);
    }

    #[test]
    fn every_revision_round_trips_its_shape() {
        let store = memory_store();
        must(store.install_principal_source(&Principal::Service));
        let graph = graph();

        for revision in graph.ordered() {
            let before = must(store.schema_shape());
            let previous = revision
                .predecessor
                .clone()
                .map_or(MigrationTarget::Base, MigrationTarget::Revision);

            migrate(&store, &graph, &MigrationTarget::Revision(revision.id.clone()));
            let after = must(store.schema_shape());
            assert_ne!(before, after, "{} changed nothing", revision.id);

            migrate(&store, &graph, &previous);
            assert_eq!(
                must(store.schema_shape()),
                before,
                "downgrade of {} did not restore the prior shape",
                revision.id
            );

            migrate(&store, &graph, &MigrationTarget::Revision(revision.id.clone()));
            assert_eq!(must(store.schema_shape()), after);
        }
    }

    #[test]
    fn status_conversion_renames_legacy_labels_and_restores_them() {
        let store = memory_store();
        let graph = graph();
        migrate(&store, &graph, &to(POLICIES));
        seed_owner_and_extraction(&store, "OCR_PROCESSING");

        migrate(&store, &graph, &MigrationTarget::Head);
        assert_eq!(stored_status(&store), "OCR_IN_PROGRESS");
        let legacy_insert = store.connection().execute(
            "INSERT INTO extractions(id, owner_id, filename, file_size, mime_type, status, presigned_url, storage_path)
             VALUES ('e2', 'u1', 'b.pdf', 1, 'application/pdf', 'OCR_PROCESSING', 'u', 'p')",
            [],
        );
        assert!(legacy_insert.is_err());

        must(store.connection().execute(
            "INSERT INTO extractions(id, owner_id, filename, file_size, mime_type, presigned_url, storage_path)
             VALUES ('e3', 'u1', 'c.pdf', 1, 'application/pdf', 'u', 'p')",
            [],
        ));
        let defaulted: String = must(store.connection().query_row(
            "SELECT status FROM extractions WHERE id = 'e3'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(defaulted, "UPLOADED");

        migrate(&store, &graph, &to(POLICIES));
        assert_eq!(stored_status(&store), "OCR_PROCESSING");
        assert!(!must(ddl::load_enum_types(store.connection())).contains_key(EXTRACTION_STATUS_TYPE));
    }

    #[test]
    fn retyping_before_renaming_fails_and_leaves_the_head_unchanged() {
        let mut revisions = extraction_revisions();
        let Some(conversion) = revisions.last_mut() else {
            panic!("missing conversion revision");
        };
        let rewrite_at = conversion
            .upgrade_steps
            .iter()
            .position(|step| matches!(step, Step::DataRewrite { .. }));
        let retype_at = conversion.upgrade_steps.iter().position(|step| {
            matches!(step, Step::AlterColumn { alter } if matches!(alter.change, ColumnChange::SetType(_)))
        });
        match (rewrite_at, retype_at) {
            (Some(rewrite), Some(retype)) => conversion.upgrade_steps.swap(rewrite, retype),
            _ => panic!("conversion revision lost its rewrite or retype step"),
        }
        let graph = must(RevisionGraph::new(revisions));

        let store = memory_store();
        migrate(&store, &graph, &to(POLICIES));
        seed_owner_and_extraction(&store, "OCR_PROCESSING");

        match store.migrate(&graph, &MigrationTarget::Head, &MigrateOptions::default()) {
            Err(MigrationError::StepFailed { revision, cause }) => {
                assert_eq!(revision.as_str(), HEAD);
                assert!(cause.contains("set type extractionstatus"), "cause: {cause}");
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        assert_eq!(head(&store).as_deref(), Some(POLICIES));
        assert_eq!(stored_status(&store), "OCR_PROCESSING");
        assert!(must(ddl::load_enum_types(store.connection())).is_empty());
        assert_eq!(must(store.lock_status()), None);
    }

    #[test]
    fn failing_step_rolls_back_its_whole_node() {
        let mut revisions = extraction_revisions();
        revisions.push(
            Revision::new("b1c2d3e4f5a6", Some(HEAD), "broken follow-up")
                .up(Step::raw("CREATE TABLE audit_trail (id INTEGER PRIMARY KEY)"))
                .up(Step::raw("INSERT INTO missing_table VALUES (1)"))
                .down(Step::drop_table("audit_trail")),
        );
        let graph = must(RevisionGraph::new(revisions));
        let store = memory_store();

        let result = store.migrate(&graph, &MigrationTarget::Head, &MigrateOptions::default());
        match result {
            Err(MigrationError::StepFailed { revision, cause }) => {
                assert_eq!(revision.as_str(), "b1c2d3e4f5a6");
                assert!(cause.contains("up step #2"), "cause: {cause}");
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        assert_eq!(head(&store).as_deref(), Some(HEAD));
        assert!(!must(ddl::table_exists(store.connection(), "audit_trail")));
        assert_eq!(must(store.history()).len(), 5);
    }

    #[test]
    fn lock_held_by_another_migrator_blocks_and_force_unlock_clears_it() {
        let path = temp_db_path();
        let first = must(SqliteSchemaStore::open(&path));
        let second = must(SqliteSchemaStore::open(&path));
        let graph = graph();

        must(first.connection().execute(
            "INSERT INTO schema_migration_lock(singleton, holder, acquired_at) VALUES (1, 'deploy-bot', '2026-01-01T00:00:00Z')",
            [],
        ));

        let options = MigrateOptions {
            holder: "operator".to_string(),
            lock_wait: Duration::from_millis(120),
            cancel: None,
            direction: None,
        };
        match second.migrate(&graph, &MigrationTarget::Head, &options) {
            Err(MigrationError::LockHeld { holder }) => assert_eq!(holder, "deploy-bot"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
        assert_eq!(head(&second), None);

        let removed = must(second.force_unlock());
        assert_eq!(removed.map(|lock| lock.holder).as_deref(), Some("deploy-bot"));
        let report = must(second.migrate(&graph, &MigrationTarget::Head, &options));
        assert_eq!(report.applied.len(), 5);
        assert!(must(first.history())
            .iter()
            .all(|entry| entry.holder == "operator"));

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancellation_is_honoured_at_node_boundaries() {
        let store = memory_store();
        let flag = Arc::new(AtomicBool::new(true));
        let options = MigrateOptions {
            cancel: Some(Arc::clone(&flag)),
            ..MigrateOptions::default()
        };

        match store.migrate(&graph(), &MigrationTarget::Head, &options) {
            Err(MigrationError::Cancelled { last_applied }) => assert_eq!(last_applied, None),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(head(&store), None);
        assert_eq!(must(store.lock_status()), None);
    }

    #[test]
    fn direction_guard_refuses_walks_the_other_way_under_the_lock() {
        let store = memory_store();
        let graph = graph();
        migrate(&store, &graph, &MigrationTarget::Head);
        let logged = must(store.history()).len();

        let forward_only = MigrateOptions {
            direction: Some(Direction::Up),
            ..MigrateOptions::default()
        };
        match store.migrate(&graph, &to("20038a3ab258"), &forward_only) {
            Err(MigrationError::WrongDirection {
                expected,
                actual,
                from,
                to,
            }) => {
                assert_eq!(expected, Direction::Up);
                assert_eq!(actual, Direction::Down);
                assert_eq!(from.as_ref().map(RevisionId::as_str), Some(HEAD));
                assert_eq!(to.as_ref().map(RevisionId::as_str), Some("20038a3ab258"));
            }
            other => panic!("expected WrongDirection, got {other:?}"),
        }
        assert_eq!(head(&store).as_deref(), Some(HEAD));
        assert!(must(ddl::table_exists(store.connection(), "extractions")));
        assert_eq!(must(store.history()).len(), logged);
        assert_eq!(must(store.lock_status()), None);

        let at_target = must(store.migrate(&graph, &MigrationTarget::Head, &forward_only));
        assert!(at_target.applied.is_empty());

        migrate(&store, &graph, &to("efc9ab8c3122"));
        let backward_only = MigrateOptions {
            direction: Some(Direction::Down),
            ..MigrateOptions::default()
        };
        assert!(matches!(
            store.migrate(&graph, &MigrationTarget::Head, &backward_only),
            Err(MigrationError::WrongDirection {
                expected: Direction::Down,
                actual: Direction::Up,
                ..
            })
        ));
        assert_eq!(head(&store).as_deref(), Some("efc9ab8c3122"));

        let report = must(store.migrate(&graph, &MigrationTarget::Base, &backward_only));
        assert_eq!(report.to, None);
    }

    #[test]
    fn diverging_head_marker_is_reported_as_partial_apply() {
        let store = memory_store();
        let graph = graph();
        migrate(&store, &graph, &to("efc9ab8c3122"));

        must(store.connection().execute(
            "UPDATE schema_revision SET revision_id = ?1 WHERE singleton = 1",
            params![HEAD],
        ));
        match store.migrate(&graph, &MigrationTarget::Head, &MigrateOptions::default()) {
            Err(MigrationError::PartialApplyDetected { detail }) => {
                assert!(detail.contains("efc9ab8c3122"), "detail: {detail}");
            }
            other => panic!("expected PartialApplyDetected, got {other:?}"),
        }
        assert_eq!(must(store.lock_status()), None);
    }

    #[test]
    fn revision_log_is_append_only() {
        let store = memory_store();
        migrate(&store, &graph(), &to("20038a3ab258"));
        assert!(store
            .connection()
            .execute("UPDATE schema_revision_log SET holder = 'x'", [])
            .is_err());
        assert!(store
            .connection()
            .execute("DELETE FROM schema_revision_log", [])
            .is_err());
    }

    #[test]
    fn unknown_stored_head_is_reported_verbatim() {
        let store = memory_store();
        must(store.connection().execute_batch(
            "INSERT INTO schema_revision_log(revision_id, direction, head_after, holder, applied_at)
             VALUES ('deadbeef0000', 'up', 'deadbeef0000', 'elsewhere', '2026-01-01T00:00:00Z');
             INSERT INTO schema_revision(singleton, revision_id, applied_at)
             VALUES (1, 'deadbeef0000', '2026-01-01T00:00:00Z');",
        ));
        match store.migrate(&graph(), &MigrationTarget::Head, &MigrateOptions::default()) {
            Err(err) => {
                assert_eq!(err.kind(), "unknown_revision");
                assert!(err.to_string().contains("deadbeef0000"));
            }
            Ok(report) => panic!("expected failure, got {report:?}"),
        }
    }

    #[test]
    fn plan_is_a_dry_run() {
        let store = memory_store();
        let graph = graph();
        let path = must(store.plan(&graph, &MigrationTarget::Head));
        assert_eq!(path.len(), 5);
        assert_eq!(head(&store), None);
        assert!(must(store.history()).is_empty());
    }

    #[test]
    fn file_backed_database_keeps_the_head_across_reopen() {
        let path = temp_db_path();
        {
            let store = must(SqliteSchemaStore::open(&path));
            migrate(&store, &graph(), &to(POLICIES));
        }
        let reopened = must(SqliteSchemaStore::open(&path));
        assert_eq!(head(&reopened).as_deref(), Some(POLICIES));
        let report = migrate(&reopened, &graph(), &MigrationTarget::Head);
        assert_eq!(report.applied.len(), 1);
        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }

    fn target_for(index: usize, ids: &[RevisionId]) -> MigrationTarget {
        match index.checked_sub(1) {
            Some(position) => MigrationTarget::Revision(ids[position].clone()),
            None => MigrationTarget::Base,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn arbitrary_migration_walks_land_on_the_reference_shape(
            walk in prop::collection::vec(0usize..6, 1..6),
            trust_boundary in any::<bool>(),
        ) {
            let graph = graph();
            let ids: Vec<RevisionId> = graph.ordered().iter().map(|revision| revision.id.clone()).collect();

            let reference = memory_store();
            if trust_boundary {
                must(reference.install_principal_source(&Principal::Service));
            }
            let mut shapes = vec![must(reference.schema_shape())];
            for index in 1..=ids.len() {
                migrate(&reference, &graph, &target_for(index, &ids));
                shapes.push(must(reference.schema_shape()));
            }

            let store = memory_store();
            if trust_boundary {
                must(store.install_principal_source(&Principal::Service));
            }
            for index in walk {
                migrate(&store, &graph, &target_for(index, &ids));
                prop_assert_eq!(&must(store.schema_shape()), &shapes[index]);
            }
        }
    }
}
