//! Row ownership enforcement.
//!
//! A protected table carries a filtering view for reads (`rls_<table>_select`) and one
//! `BEFORE` trigger per write command. Every predicate goes through `auth_uid()` and
//! `auth_role()`, which only exist on connections that installed a principal source,
//! so a connection without one fails closed on protected tables.
//!
//! Principal connections also get a temp view named after each protected table, so
//! unqualified reads of the table name resolve to the filtering view. Views and triggers
//! in `main` bind their table references to `main` and never see the temp shadow.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use extraction_kernel_core::{
    format_rfc3339, now_utc, OwnershipPolicy, PolicyCommand, PolicyError, Principal, SERVICE_ROLE,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::ddl::{quote_ident, quote_literal, table_columns, table_exists};

/// Registers `auth_uid()` and `auth_role()` on the connection for `principal`.
pub fn install_principal_source(conn: &Connection, principal: &Principal) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8
        | FunctionFlags::SQLITE_DETERMINISTIC
        | FunctionFlags::SQLITE_INNOCUOUS;

    let uid = principal.uid().map(str::to_string);
    conn.create_scalar_function("auth_uid", 0, flags, move |_ctx| Ok(uid.clone()))
        .context("failed to register auth_uid()")?;

    let role = principal.role();
    conn.create_scalar_function("auth_role", 0, flags, move |_ctx| Ok(role))
        .context("failed to register auth_role()")?;

    Ok(())
}

/// Whether the connection can resolve the principal identity functions.
#[must_use]
pub fn has_principal_source(conn: &Connection) -> bool {
    conn.prepare("SELECT auth_uid(), auth_role()").is_ok()
}

/// Shadows every protected table on `conn` with a temp view over its filtering view.
/// Writes must name `main.<table>` explicitly; the shadow itself is read-only.
pub fn shadow_protected_tables(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut protected = BTreeSet::new();
    {
        let mut stmt = conn
            .prepare("SELECT table_name FROM main.rls_tables")
            .context("failed to read rls_tables; has the database been migrated?")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            protected.insert(row.get::<_, String>(0)?);
        }
    }

    let mut sql = String::new();
    for table in &protected {
        sql.push_str(&format!(
            "DROP VIEW IF EXISTS temp.{table_q};\nCREATE TEMP VIEW {table_q} AS SELECT * FROM main.{view};\n",
            table_q = quote_ident(table),
            view = quote_ident(&policy_view_name(table)),
        ));
    }
    conn.execute_batch(&sql)
        .context("failed to shadow protected tables")?;
    Ok(protected)
}

#[must_use]
pub fn policy_view_name(table: &str) -> String {
    format!("rls_{table}_select")
}

fn trigger_name(table: &str, command: PolicyCommand) -> String {
    format!("rls_{table}_{}", command.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRecord {
    pub name: String,
    pub command: PolicyCommand,
    pub role: String,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectedTable {
    pub table: String,
    pub owner_column: String,
    pub enabled_at: String,
    pub policies: Vec<PolicyRecord>,
}

pub struct PolicyEngine<'c> {
    conn: &'c Connection,
}

impl<'c> PolicyEngine<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Protects `table` with `policy`. Either every enforcement object and catalog row is
    /// created, or nothing is.
    pub fn enable(&self, table: &str, policy: &OwnershipPolicy) -> Result<(), PolicyError> {
        if !has_principal_source(self.conn) {
            return Err(PolicyError::NoPrincipalSource {
                table: table.to_string(),
            });
        }
        policy
            .validate(table)
            .map_err(|err| storage_error(table, err))?;
        if !table_exists(self.conn, table).map_err(|err| storage_error(table, err))? {
            return Err(PolicyError::TableMissing {
                table: table.to_string(),
            });
        }
        if self.is_enabled(table)? {
            return Err(PolicyError::AlreadyEnabled {
                table: table.to_string(),
            });
        }

        let columns = table_columns(self.conn, table).map_err(|err| storage_error(table, err))?;
        match columns
            .iter()
            .find(|(name, _, _)| *name == policy.owner_column)
        {
            None => {
                return Err(PolicyError::ColumnMissing {
                    table: table.to_string(),
                    column: policy.owner_column.clone(),
                })
            }
            Some((_, _, false)) => {
                return Err(PolicyError::ColumnNullable {
                    table: table.to_string(),
                    column: policy.owner_column.clone(),
                })
            }
            Some(_) => {}
        }

        self.in_savepoint(table, || {
            self.conn.execute_batch(&render_policy_objects(table, policy))?;
            let predicate = policy.predicate_text();
            for command in PolicyCommand::ALL {
                if !policy.grants(command) {
                    continue;
                }
                self.conn.execute(
                    "INSERT INTO rls_policies(table_name, policy_name, command, role, using_expr, check_expr)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        table,
                        policy.policy_name(command),
                        command.as_str(),
                        policy.role,
                        command.filters_existing_rows().then(|| predicate.clone()),
                        command.checks_new_rows().then(|| predicate.clone()),
                    ],
                )?;
            }
            let now = format_rfc3339(now_utc()).map_err(|err| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(err))
            })?;
            self.conn.execute(
                "INSERT INTO rls_tables(table_name, owner_column, enabled_at) VALUES (?1, ?2, ?3)",
                params![table, policy.owner_column, now],
            )?;
            Ok(())
        })
    }

    /// Removes enforcement objects, then policy rows, then the protection flag.
    pub fn disable(&self, table: &str) -> Result<(), PolicyError> {
        if !self.is_enabled(table)? {
            return Err(PolicyError::NotEnabled {
                table: table.to_string(),
            });
        }

        self.in_savepoint(table, || {
            drop_policy_objects(self.conn, table)?;
            self.conn.execute(
                "DELETE FROM rls_policies WHERE table_name = ?1",
                params![table],
            )?;
            self.conn
                .execute("DELETE FROM rls_tables WHERE table_name = ?1", params![table])?;
            Ok(())
        })
    }

    pub fn is_enabled(&self, table: &str) -> Result<bool, PolicyError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM rls_tables WHERE table_name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(|err| storage_error(table, err))?;
        Ok(count > 0)
    }

    pub fn status(&self) -> Result<Vec<ProtectedTable>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT table_name, owner_column, enabled_at
                 FROM rls_tables
                 ORDER BY table_name",
            )
            .context("failed to prepare rls_tables query")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProtectedTable {
                table: row.get(0)?,
                owner_column: row.get(1)?,
                enabled_at: row.get(2)?,
                policies: Vec::new(),
            })
        })?;

        let mut tables = Vec::new();
        for row in rows {
            let mut table = row.context("failed to decode rls_tables row")?;
            table.policies = self.policies_for(&table.table)?;
            tables.push(table);
        }
        Ok(tables)
    }

    fn policies_for(&self, table: &str) -> Result<Vec<PolicyRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT policy_name, command, role, using_expr, check_expr
                 FROM rls_policies
                 WHERE table_name = ?1
                 ORDER BY CASE command
                   WHEN 'select' THEN 0 WHEN 'insert' THEN 1
                   WHEN 'update' THEN 2 ELSE 3 END",
            )
            .context("failed to prepare rls_policies query")?;
        let mut rows = stmt.query(params![table])?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_command: String = row.get(1)?;
            let command = PolicyCommand::parse(&raw_command).ok_or_else(|| {
                anyhow::anyhow!("invalid policy command {raw_command} for table {table}")
            })?;
            policies.push(PolicyRecord {
                name: row.get(0)?,
                command,
                role: row.get(2)?,
                using_expr: row.get(3)?,
                check_expr: row.get(4)?,
            });
        }
        Ok(policies)
    }

    fn in_savepoint(
        &self,
        table: &str,
        body: impl FnOnce() -> rusqlite::Result<()>,
    ) -> Result<(), PolicyError> {
        self.conn
            .execute_batch("SAVEPOINT ownership_policy")
            .map_err(|err| storage_error(table, err))?;
        match body() {
            Ok(()) => self
                .conn
                .execute_batch("RELEASE ownership_policy")
                .map_err(|err| storage_error(table, err)),
            Err(err) => {
                if let Err(rollback_err) = self
                    .conn
                    .execute_batch("ROLLBACK TO ownership_policy; RELEASE ownership_policy")
                {
                    tracing::warn!(table, error = %rollback_err, "failed to roll back ownership policy savepoint");
                }
                Err(storage_error(table, err))
            }
        }
    }
}

fn storage_error(table: &str, err: impl std::fmt::Display) -> PolicyError {
    PolicyError::Storage {
        table: table.to_string(),
        message: err.to_string(),
    }
}

pub(crate) fn drop_policy_objects(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    let mut sql = String::new();
    for command in [
        PolicyCommand::Insert,
        PolicyCommand::Update,
        PolicyCommand::Delete,
    ] {
        sql.push_str(&format!(
            "DROP TRIGGER IF EXISTS {};\n",
            quote_ident(&trigger_name(table, command))
        ));
    }
    sql.push_str(&format!(
        "DROP VIEW IF EXISTS {};",
        quote_ident(&policy_view_name(table))
    ));
    conn.execute_batch(&sql)
}

fn bypass() -> String {
    format!("COALESCE(auth_role() = {}, 0)", quote_literal(SERVICE_ROLE))
}

/// Ownership predicate for `command`; `row` is `NEW`/`OLD` inside triggers.
fn predicate(policy: &OwnershipPolicy, command: PolicyCommand, row: Option<&str>) -> String {
    if !policy.grants(command) {
        return "0".to_string();
    }
    let column = match row {
        Some(alias) => format!("{alias}.{}", quote_ident(&policy.owner_column)),
        None => quote_ident(&policy.owner_column),
    };
    format!(
        "COALESCE(auth_role() = {} AND {column} = auth_uid(), 0)",
        quote_literal(&policy.role)
    )
}

fn render_policy_objects(table: &str, policy: &OwnershipPolicy) -> String {
    let table_q = quote_ident(table);
    let violation = quote_literal(&format!(
        "new row violates row-level security policy for table \"{table}\""
    ));
    let bypass = bypass();

    format!(
        "CREATE VIEW {view} AS
SELECT * FROM {table_q}
WHERE {bypass} OR {select_using};

CREATE TRIGGER {insert_trigger}
BEFORE INSERT ON {table_q}
FOR EACH ROW
WHEN NOT {bypass}
BEGIN
  SELECT RAISE(ABORT, {violation}) WHERE NOT {insert_check};
END;

CREATE TRIGGER {update_trigger}
BEFORE UPDATE ON {table_q}
FOR EACH ROW
WHEN NOT {bypass}
BEGIN
  SELECT RAISE(IGNORE) WHERE NOT {update_using};
  SELECT RAISE(ABORT, {violation}) WHERE NOT {update_check};
END;

CREATE TRIGGER {delete_trigger}
BEFORE DELETE ON {table_q}
FOR EACH ROW
WHEN NOT {bypass}
BEGIN
  SELECT RAISE(IGNORE) WHERE NOT {delete_using};
END;",
        view = quote_ident(&policy_view_name(table)),
        select_using = predicate(policy, PolicyCommand::Select, None),
        insert_trigger = quote_ident(&trigger_name(table, PolicyCommand::Insert)),
        insert_check = predicate(policy, PolicyCommand::Insert, Some("NEW")),
        update_trigger = quote_ident(&trigger_name(table, PolicyCommand::Update)),
        update_using = predicate(policy, PolicyCommand::Update, Some("OLD")),
        update_check = predicate(policy, PolicyCommand::Update, Some("NEW")),
        delete_trigger = quote_ident(&trigger_name(table, PolicyCommand::Delete)),
        delete_using = predicate(policy, PolicyCommand::Delete, Some("OLD")),
    )
}
