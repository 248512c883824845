//! SQLite rendering of typed schema steps, plus the catalogs that let later
//! revisions rebuild a table faithfully.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use extraction_kernel_core::{
    format_rfc3339, now_utc, ColumnDef, DefaultValue, IndexSpec, TableSchema,
};
use rusqlite::{params, Connection, OptionalExtension};

const TIMESTAMP_NOW_SQL: &str = "(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))";

pub(crate) type EnumTypes = BTreeMap<String, Vec<String>>;

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn render_default(default: &DefaultValue) -> String {
    match default {
        DefaultValue::Text(value) => quote_literal(value),
        DefaultValue::Integer(value) => value.to_string(),
        DefaultValue::Boolean(value) => i64::from(*value).to_string(),
        DefaultValue::CurrentTimestamp => TIMESTAMP_NOW_SQL.to_string(),
    }
}

fn render_column(column: &ColumnDef, enums: &EnumTypes) -> Result<String> {
    let mut sql = format!(
        "{} {}",
        quote_ident(&column.name),
        column.column_type.declared_name()
    );
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&render_default(default));
    }
    if let Some(type_name) = column.column_type.enum_name() {
        let labels = enums
            .get(type_name)
            .ok_or_else(|| anyhow!("enumerated type {type_name} does not exist"))?;
        let allowed = labels
            .iter()
            .map(|label| quote_literal(label))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            " CONSTRAINT {} CHECK ({} IN ({allowed}))",
            quote_ident(type_name),
            quote_ident(&column.name)
        ));
    }
    Ok(sql)
}

fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders `schema` as a `CREATE TABLE` named `table_name`.
pub(crate) fn render_create_table(
    schema: &TableSchema,
    table_name: &str,
    enums: &EnumTypes,
) -> Result<String> {
    let mut parts = schema
        .columns
        .iter()
        .map(|column| render_column(column, enums))
        .collect::<Result<Vec<_>>>()?;

    if !schema.primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", quote_list(&schema.primary_key)));
    }
    for fk in &schema.foreign_keys {
        let mut clause = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_list(&fk.columns),
            quote_ident(&fk.references_table),
            quote_list(&fk.references_columns)
        );
        if let Some(action) = fk.on_delete {
            clause.push_str(" ON DELETE ");
            clause.push_str(action.as_sql());
        }
        parts.push(clause);
    }
    for check in &schema.checks {
        parts.push(format!(
            "CONSTRAINT {} CHECK ({})",
            quote_ident(&check.name),
            check.expression
        ));
    }

    Ok(format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_ident(table_name),
        parts.join(",\n  ")
    ))
}

pub(crate) fn render_create_index(index: &IndexSpec) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(&index.table),
        quote_list(&index.columns)
    )
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

/// `(name, declared_type, not_null)` for each column, in table order.
pub(crate) fn table_columns(
    conn: &Connection,
    table_name: &str,
) -> Result<Vec<(String, String, bool)>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let not_null: i64 = row.get(3)?;
        columns.push((row.get(1)?, row.get(2)?, not_null == 1));
    }

    Ok(columns)
}

pub(crate) fn load_enum_types(conn: &Connection) -> Result<EnumTypes> {
    let mut stmt = conn
        .prepare("SELECT type_name, labels_json FROM schema_enum_types ORDER BY type_name")
        .context("failed to prepare enumerated type query")?;
    let mut rows = stmt.query([])?;

    let mut types = EnumTypes::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let raw: String = row.get(1)?;
        let labels: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid labels_json for enumerated type {name}"))?;
        types.insert(name, labels);
    }

    Ok(types)
}

pub(crate) fn create_enum_type(
    conn: &Connection,
    name: &str,
    labels: &[String],
    if_not_exists: bool,
) -> Result<()> {
    if let Some(existing) = load_enum_types(conn)?.get(name) {
        if if_not_exists && existing == labels {
            tracing::debug!(type_name = name, "enumerated type already present");
            return Ok(());
        }
        return Err(anyhow!("enumerated type {name} already exists"));
    }

    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO schema_enum_types(type_name, labels_json, created_at) VALUES (?1, ?2, ?3)",
        params![
            name,
            serde_json::to_string(labels).context("failed to serialize enum labels")?,
            now
        ],
    )
    .with_context(|| format!("failed to register enumerated type {name}"))?;
    Ok(())
}

pub(crate) fn drop_enum_type(conn: &Connection, name: &str, if_exists: bool) -> Result<()> {
    if !load_enum_types(conn)?.contains_key(name) {
        if if_exists {
            return Ok(());
        }
        return Err(anyhow!("enumerated type {name} does not exist"));
    }

    for schema in catalog_all(conn)? {
        if let Some(column) = schema
            .columns
            .iter()
            .find(|column| column.column_type.enum_name() == Some(name))
        {
            return Err(anyhow!(
                "cannot drop enumerated type {name}: column {}.{} depends on it",
                schema.name,
                column.name
            ));
        }
    }

    conn.execute(
        "DELETE FROM schema_enum_types WHERE type_name = ?1",
        params![name],
    )
    .with_context(|| format!("failed to drop enumerated type {name}"))?;
    Ok(())
}

pub(crate) fn catalog_get(conn: &Connection, table_name: &str) -> Result<Option<TableSchema>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT schema_json FROM schema_catalog WHERE table_name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read schema_catalog entry for {table_name}"))?;

    raw.map(|json| {
        serde_json::from_str(&json)
            .with_context(|| format!("invalid schema_json for table {table_name}"))
    })
    .transpose()
}

pub(crate) fn catalog_all(conn: &Connection) -> Result<Vec<TableSchema>> {
    let mut stmt = conn
        .prepare("SELECT table_name, schema_json FROM schema_catalog ORDER BY table_name")
        .context("failed to prepare schema_catalog query")?;
    let mut rows = stmt.query([])?;

    let mut schemas = Vec::new();
    while let Some(row) = rows.next()? {
        let table_name: String = row.get(0)?;
        let raw: String = row.get(1)?;
        schemas.push(
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid schema_json for table {table_name}"))?,
        );
    }
    Ok(schemas)
}

pub(crate) fn catalog_put(conn: &Connection, schema: &TableSchema) -> Result<()> {
    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO schema_catalog(table_name, schema_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET
           schema_json = excluded.schema_json,
           updated_at = excluded.updated_at",
        params![
            schema.name,
            serde_json::to_string(schema).context("failed to serialize table schema")?,
            now
        ],
    )
    .with_context(|| format!("failed to record schema_catalog entry for {}", schema.name))?;
    Ok(())
}

pub(crate) fn catalog_remove(conn: &Connection, table_name: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM schema_catalog WHERE table_name = ?1",
        params![table_name],
    )
    .with_context(|| format!("failed to remove schema_catalog entry for {table_name}"))?;
    Ok(())
}

/// Rewrites `current` into `next` with the create/copy/drop/rename procedure.
///
/// Indexes and triggers on the table are captured and recreated. Views are dropped
/// for the duration because a rename validates every view in the schema.
pub(crate) fn rebuild_table(
    conn: &Connection,
    current: &TableSchema,
    next: &TableSchema,
) -> Result<()> {
    let table = next.name.as_str();

    if let Some(parent) = catalog_all(conn)?.iter().find(|schema| {
        schema.name != table
            && schema
                .foreign_keys
                .iter()
                .any(|fk| fk.references_table == table)
    }) {
        return Err(anyhow!(
            "cannot rebuild {table}: table {} references it",
            parent.name
        ));
    }

    let dependents = capture_dependents(conn, table)?;
    for (kind, name, _) in &dependents {
        if kind == "view" {
            conn.execute_batch(&format!("DROP VIEW {}", quote_ident(name)))
                .with_context(|| format!("failed to drop view {name} before rebuilding {table}"))?;
        }
    }

    let enums = load_enum_types(conn)?;
    let shadow = format!("__rebuild_{table}");
    conn.execute_batch(&render_create_table(next, &shadow, &enums)?)
        .with_context(|| format!("failed to create shadow table for {table}"))?;

    let shared: Vec<String> = next
        .columns
        .iter()
        .filter(|column| current.column(&column.name).is_some())
        .map(|column| column.name.clone())
        .collect();
    let column_list = quote_list(&shared);
    let copied = conn
        .execute(
            &format!(
                "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {}",
                quote_ident(&shadow),
                quote_ident(table)
            ),
            [],
        )
        .with_context(|| format!("failed to copy rows of {table} into its new definition"))?;

    conn.execute_batch(&format!(
        "DROP TABLE {table_q};
         PRAGMA legacy_alter_table = ON;
         ALTER TABLE {shadow_q} RENAME TO {table_q};
         PRAGMA legacy_alter_table = OFF;",
        table_q = quote_ident(table),
        shadow_q = quote_ident(&shadow)
    ))
    .with_context(|| format!("failed to swap rebuilt table {table} into place"))?;

    for (kind, name, sql) in &dependents {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to recreate {kind} {name} after rebuilding {table}"))?;
    }

    let violations: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM pragma_foreign_key_check({})",
                quote_literal(table)
            ),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check foreign keys of {table}"))?;
    if violations > 0 {
        return Err(anyhow!(
            "rebuilt table {table} has {violations} foreign key violation(s)"
        ));
    }

    tracing::debug!(table, rows = copied, "table rebuilt");
    Ok(())
}

/// `(type, name, sql)` of indexes and triggers on `table` and of every view, in creation order.
fn capture_dependents(conn: &Connection, table: &str) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, sql
             FROM sqlite_master
             WHERE sql IS NOT NULL
               AND ((type IN ('index', 'trigger') AND tbl_name = ?1) OR type = 'view')
             ORDER BY rowid",
        )
        .context("failed to prepare dependent object query")?;
    let mut rows = stmt.query(params![table])?;

    let mut dependents = Vec::new();
    while let Some(row) = rows.next()? {
        dependents.push((row.get(0)?, row.get(1)?, row.get(2)?));
    }
    Ok(dependents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use extraction_kernel_core::{ColumnType, ReferentialAction};

    #[test]
    fn enumerated_columns_render_a_named_check() {
        let schema = TableSchema::new(
            "extractions",
            vec![
                ColumnDef::new("id", ColumnType::Uuid),
                ColumnDef::new("status", ColumnType::Enum("extractionstatus".to_string()))
                    .with_default(DefaultValue::Text("UPLOADED".to_string())),
            ],
        )
        .primary_key(&["id"])
        .foreign_key("id", "user", "id", Some(ReferentialAction::Cascade))
        .check("file_size_positive", "1 > 0");
        let mut enums = EnumTypes::new();
        enums.insert(
            "extractionstatus".to_string(),
            vec!["UPLOADED".to_string(), "DRAFT".to_string()],
        );

        let sql = match render_create_table(&schema, "extractions", &enums) {
            Ok(sql) => sql,
            Err(err) => panic!("expected render to succeed: {err}"),
        };
        assert!(sql.contains(
            "\"status\" TEXT NOT NULL DEFAULT 'UPLOADED' CONSTRAINT \"extractionstatus\" CHECK (\"status\" IN ('UPLOADED', 'DRAFT'))"
        ));
        assert!(sql.contains("FOREIGN KEY (\"id\") REFERENCES \"user\" (\"id\") ON DELETE CASCADE"));
        assert!(sql.contains("CONSTRAINT \"file_size_positive\" CHECK (1 > 0)"));

        assert!(render_create_table(&schema, "extractions", &EnumTypes::new()).is_err());
    }

    #[test]
    fn literals_and_identifiers_are_escaped() {
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(
            render_create_index(&IndexSpec::new("ix_user_email", "user", &["email"]).unique()),
            "CREATE UNIQUE INDEX \"ix_user_email\" ON \"user\" (\"email\")"
        );
    }
}
