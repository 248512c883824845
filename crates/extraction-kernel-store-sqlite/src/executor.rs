use anyhow::{anyhow, Context, Result};
use extraction_kernel_core::{PolicyError, Revision, Step};
use rusqlite::{params_from_iter, Connection};

use crate::ddl::{
    catalog_get, catalog_put, catalog_remove, create_enum_type, drop_enum_type, quote_ident,
    rebuild_table, render_create_index, render_create_table, load_enum_types, table_exists,
};
use crate::policy::{drop_policy_objects, PolicyEngine};
use crate::{SkipReason, SkippedOperation};

/// Runs one step on the node's transaction. Ownership steps never fail the node;
/// they report a skip instead.
pub(crate) fn execute_step(
    conn: &Connection,
    revision: &Revision,
    step: &Step,
) -> Result<Option<SkippedOperation>> {
    match step {
        Step::RawStatement { sql } => {
            conn.execute_batch(sql)
                .context("failed to execute raw statement")?;
        }
        Step::CreateTable { schema } => {
            let enums = load_enum_types(conn)?;
            conn.execute_batch(&render_create_table(schema, &schema.name, &enums)?)
                .with_context(|| format!("failed to create table {}", schema.name))?;
            catalog_put(conn, schema)?;
        }
        Step::DropTable { table, if_exists } => {
            if !table_exists(conn, table)? {
                if *if_exists {
                    tracing::debug!(table = %table, "table already absent");
                    return Ok(None);
                }
                return Err(anyhow!("table {table} does not exist"));
            }
            drop_policy_objects(conn, table)
                .with_context(|| format!("failed to drop ownership objects of {table}"))?;
            conn.execute(
                "DELETE FROM rls_policies WHERE table_name = ?1",
                [table.as_str()],
            )?;
            conn.execute(
                "DELETE FROM rls_tables WHERE table_name = ?1",
                [table.as_str()],
            )?;
            conn.execute_batch(&format!("DROP TABLE {}", quote_ident(table)))
                .with_context(|| format!("failed to drop table {table}"))?;
            catalog_remove(conn, table)?;
        }
        Step::CreateIndex { index } => {
            conn.execute_batch(&render_create_index(index))
                .with_context(|| format!("failed to create index {}", index.name))?;
        }
        Step::DropIndex { name, if_exists } => {
            conn.execute_batch(&format!(
                "DROP INDEX {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                quote_ident(name)
            ))
            .with_context(|| format!("failed to drop index {name}"))?;
        }
        Step::AlterColumn { alter } => {
            let current = catalog_get(conn, &alter.table)?.ok_or_else(|| {
                anyhow!(
                    "table {} has no schema_catalog entry; only tables created by a typed step can be altered",
                    alter.table
                )
            })?;
            let next = alter.apply_to(&current)?;
            rebuild_table(conn, &current, &next)?;
            catalog_put(conn, &next)?;
        }
        Step::DataRewrite { rewrite } => {
            let filter = rewrite
                .predicate
                .as_deref()
                .map(|predicate| format!(" AND ({predicate})"))
                .unwrap_or_default();
            let sql = format!(
                "UPDATE {table} SET {column} = ?1 WHERE {column} = ?2{filter}",
                table = quote_ident(&rewrite.table),
                column = quote_ident(&rewrite.column)
            );
            for pair in &rewrite.mapping {
                let rows = conn
                    .execute(&sql, params_from_iter([&pair.to, &pair.from]))
                    .with_context(|| {
                        format!(
                            "failed to rewrite {}.{} from {} to {}",
                            rewrite.table, rewrite.column, pair.from, pair.to
                        )
                    })?;
                tracing::debug!(
                    table = %rewrite.table,
                    column = %rewrite.column,
                    from = %pair.from,
                    to = %pair.to,
                    rows,
                    "labels rewritten"
                );
            }
        }
        Step::CreateEnumType {
            name,
            labels,
            if_not_exists,
        } => create_enum_type(conn, name, labels, *if_not_exists)?,
        Step::DropEnumType { name, if_exists } => drop_enum_type(conn, name, *if_exists)?,
        Step::EnableOwnershipPolicy { table, policy } => {
            return Ok(policy_outcome(
                revision,
                table,
                PolicyEngine::new(conn).enable(table, policy),
                "ownership policies enabled",
            ));
        }
        Step::DisableOwnershipPolicy { table } => {
            return Ok(policy_outcome(
                revision,
                table,
                PolicyEngine::new(conn).disable(table),
                "ownership policies disabled",
            ));
        }
    }
    Ok(None)
}

fn policy_outcome(
    revision: &Revision,
    table: &str,
    result: Result<(), PolicyError>,
    success: &str,
) -> Option<SkippedOperation> {
    let reason = match result {
        Ok(()) => {
            tracing::info!(revision = %revision.id, table, "{success}");
            return None;
        }
        Err(PolicyError::NoPrincipalSource { .. }) => {
            tracing::warn!(
                revision = %revision.id,
                table,
                reason = "no_trust_boundary",
                "intentionally skipped: no principal-identity source; rows of this table are NOT owner-restricted"
            );
            SkipReason::NoTrustBoundary
        }
        Err(PolicyError::NotEnabled { .. }) => {
            tracing::warn!(
                revision = %revision.id,
                table,
                reason = "not_enabled",
                "intentionally skipped: ownership policies were never enabled on this table"
            );
            SkipReason::NotEnabled
        }
        Err(err) => {
            tracing::error!(
                revision = %revision.id,
                table,
                kind = err.kind(),
                error = %err,
                "failed unexpectedly: ownership policy setup aborted for this table only"
            );
            SkipReason::Failed(err.to_string())
        }
    };

    Some(SkippedOperation {
        revision: revision.id.clone(),
        table: table.to_string(),
        reason,
    })
}
