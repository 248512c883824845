use serde::{Deserialize, Serialize};

use crate::StepError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Uuid,
    Text { max_len: Option<u32> },
    Integer,
    Boolean,
    Float,
    Timestamp,
    /// Column constrained to the labels of a named enumerated type.
    Enum(String),
}

impl ColumnType {
    #[must_use]
    pub fn text(max_len: u32) -> Self {
        Self::Text {
            max_len: Some(max_len),
        }
    }

    #[must_use]
    pub fn unbounded_text() -> Self {
        Self::Text { max_len: None }
    }

    /// Declared type name as written in DDL. Enumerated columns store their labels as text.
    #[must_use]
    pub fn declared_name(&self) -> String {
        match self {
            Self::Uuid => "CHAR(36)".to_string(),
            Self::Text { max_len: Some(len) } => format!("VARCHAR({len})"),
            Self::Text { max_len: None } | Self::Enum(_) => "TEXT".to_string(),
            Self::Integer => "INTEGER".to_string(),
            Self::Boolean => "BOOLEAN".to_string(),
            Self::Float => "REAL".to_string(),
            Self::Timestamp => "TIMESTAMP".to_string(),
        }
    }

    #[must_use]
    pub fn enum_name(&self) -> Option<&str> {
        match self {
            Self::Enum(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    CurrentTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
}

impl ReferentialAction {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub references_table: String,
    pub references_columns: Vec<String>,
    pub on_delete: Option<ReferentialAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckConstraint {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub checks: Vec<CheckConstraint>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: &str, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            checks: Vec::new(),
        }
    }

    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|column| (*column).to_string()).collect();
        self
    }

    #[must_use]
    pub fn foreign_key(
        mut self,
        column: &str,
        references_table: &str,
        references_column: &str,
        on_delete: Option<ReferentialAction>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: vec![column.to_string()],
            references_table: references_table.to_string(),
            references_columns: vec![references_column.to_string()],
            on_delete,
        });
        self
    }

    #[must_use]
    pub fn check(mut self, name: &str, expression: &str) -> Self {
        self.checks.push(CheckConstraint {
            name: name.to_string(),
            expression: expression.to_string(),
        });
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Enumerated type names referenced by this table's columns.
    pub fn enum_types(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter_map(|column| column.column_type.enum_name())
    }

    /// # Errors
    /// Returns [`StepError`] when identifiers are malformed or columns are inconsistent.
    pub fn validate(&self) -> Result<(), StepError> {
        validate_identifier("table", &self.name)?;
        if self.columns.is_empty() {
            return Err(StepError::NoColumns {
                table: self.name.clone(),
            });
        }

        let mut seen = std::collections::BTreeSet::new();
        for column in &self.columns {
            validate_identifier("column", &column.name)?;
            if let Some(name) = column.column_type.enum_name() {
                validate_identifier("enumerated type", name)?;
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StepError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let referenced = self
            .primary_key
            .iter()
            .chain(self.foreign_keys.iter().flat_map(|fk| fk.columns.iter()));
        for column in referenced {
            if !seen.contains(column.as_str()) {
                return Err(StepError::UnknownColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }

        for fk in &self.foreign_keys {
            validate_identifier("table", &fk.references_table)?;
            for column in &fk.references_columns {
                validate_identifier("column", column)?;
            }
        }
        for check in &self.checks {
            validate_identifier("constraint", &check.name)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn new(name: &str, table: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|column| (*column).to_string()).collect(),
            unique: false,
        }
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnChange {
    SetType(ColumnType),
    SetDefault(DefaultValue),
    DropDefault,
    SetNullable(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AlterColumn {
    pub table: String,
    pub column: String,
    pub change: ColumnChange,
}

impl AlterColumn {
    /// Returns the table definition with the change applied. The input is left untouched.
    ///
    /// # Errors
    /// Returns [`StepError::UnknownColumn`] when the column is absent.
    pub fn apply_to(&self, schema: &TableSchema) -> Result<TableSchema, StepError> {
        let mut next = schema.clone();
        let Some(column) = next
            .columns
            .iter_mut()
            .find(|column| column.name == self.column)
        else {
            return Err(StepError::UnknownColumn {
                table: self.table.clone(),
                column: self.column.clone(),
            });
        };

        match &self.change {
            ColumnChange::SetType(column_type) => column.column_type = column_type.clone(),
            ColumnChange::SetDefault(default) => column.default = Some(default.clone()),
            ColumnChange::DropDefault => column.default = None,
            ColumnChange::SetNullable(nullable) => column.nullable = *nullable,
        }

        Ok(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LabelRewrite {
    pub from: String,
    pub to: String,
}

/// Rewrites stored label values in place, e.g. renaming a legacy status.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DataRewrite {
    pub table: String,
    pub column: String,
    pub mapping: Vec<LabelRewrite>,
    /// Extra SQL filter ANDed onto each rewrite.
    #[serde(default)]
    pub predicate: Option<String>,
}

impl DataRewrite {
    #[must_use]
    pub fn new(table: &str, column: &str, mapping: &[(&str, &str)]) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            mapping: mapping
                .iter()
                .map(|(from, to)| LabelRewrite {
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                })
                .collect(),
            predicate: None,
        }
    }

    /// The mapping read backwards.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            table: self.table.clone(),
            column: self.column.clone(),
            mapping: self
                .mapping
                .iter()
                .map(|rewrite| LabelRewrite {
                    from: rewrite.to.clone(),
                    to: rewrite.from.clone(),
                })
                .collect(),
            predicate: self.predicate.clone(),
        }
    }
}

/// One unit of schema or data change inside a revision.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    RawStatement {
        sql: String,
    },
    CreateTable {
        schema: TableSchema,
    },
    DropTable {
        table: String,
        if_exists: bool,
    },
    CreateIndex {
        index: IndexSpec,
    },
    DropIndex {
        name: String,
        if_exists: bool,
    },
    AlterColumn {
        alter: AlterColumn,
    },
    DataRewrite {
        rewrite: DataRewrite,
    },
    CreateEnumType {
        name: String,
        labels: Vec<String>,
        if_not_exists: bool,
    },
    DropEnumType {
        name: String,
        if_exists: bool,
    },
    EnableOwnershipPolicy {
        table: String,
        policy: crate::OwnershipPolicy,
    },
    DisableOwnershipPolicy {
        table: String,
    },
}

impl Step {
    #[must_use]
    pub fn raw(sql: &str) -> Self {
        Self::RawStatement {
            sql: sql.to_string(),
        }
    }

    #[must_use]
    pub fn create_table(schema: TableSchema) -> Self {
        Self::CreateTable { schema }
    }

    #[must_use]
    pub fn drop_table(table: &str) -> Self {
        Self::DropTable {
            table: table.to_string(),
            if_exists: false,
        }
    }

    #[must_use]
    pub fn create_index(index: IndexSpec) -> Self {
        Self::CreateIndex { index }
    }

    #[must_use]
    pub fn drop_index(name: &str) -> Self {
        Self::DropIndex {
            name: name.to_string(),
            if_exists: false,
        }
    }

    #[must_use]
    pub fn alter_column(table: &str, column: &str, change: ColumnChange) -> Self {
        Self::AlterColumn {
            alter: AlterColumn {
                table: table.to_string(),
                column: column.to_string(),
                change,
            },
        }
    }

    #[must_use]
    pub fn rewrite(rewrite: DataRewrite) -> Self {
        Self::DataRewrite { rewrite }
    }

    #[must_use]
    pub fn create_enum(name: &str, labels: &[&str]) -> Self {
        Self::CreateEnumType {
            name: name.to_string(),
            labels: labels.iter().map(|label| (*label).to_string()).collect(),
            if_not_exists: true,
        }
    }

    #[must_use]
    pub fn drop_enum(name: &str) -> Self {
        Self::DropEnumType {
            name: name.to_string(),
            if_exists: true,
        }
    }

    /// Table the step operates on, when there is exactly one.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::CreateTable { schema } => Some(&schema.name),
            Self::DropTable { table, .. }
            | Self::EnableOwnershipPolicy { table, .. }
            | Self::DisableOwnershipPolicy { table } => Some(table),
            Self::CreateIndex { index } => Some(&index.table),
            Self::AlterColumn { alter } => Some(&alter.table),
            Self::DataRewrite { rewrite } => Some(&rewrite.table),
            Self::RawStatement { .. }
            | Self::DropIndex { .. }
            | Self::CreateEnumType { .. }
            | Self::DropEnumType { .. } => None,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::RawStatement { sql } => {
                let first_line = sql.trim().lines().next().unwrap_or_default();
                format!("execute `{first_line}`")
            }
            Self::CreateTable { schema } => format!(
                "create table {} ({} columns)",
                schema.name,
                schema.columns.len()
            ),
            Self::DropTable { table, .. } => format!("drop table {table}"),
            Self::CreateIndex { index } => format!(
                "create {}index {} on {} ({})",
                if index.unique { "unique " } else { "" },
                index.name,
                index.table,
                index.columns.join(", ")
            ),
            Self::DropIndex { name, .. } => format!("drop index {name}"),
            Self::AlterColumn { alter } => {
                let change = match &alter.change {
                    ColumnChange::SetType(column_type) => match column_type.enum_name() {
                        Some(name) => format!("set type {name}"),
                        None => format!("set type {}", column_type.declared_name()),
                    },
                    ColumnChange::SetDefault(_) => "set default".to_string(),
                    ColumnChange::DropDefault => "drop default".to_string(),
                    ColumnChange::SetNullable(true) => "drop not null".to_string(),
                    ColumnChange::SetNullable(false) => "set not null".to_string(),
                };
                format!("alter column {}.{} {change}", alter.table, alter.column)
            }
            Self::DataRewrite { rewrite } => {
                let pairs = rewrite
                    .mapping
                    .iter()
                    .map(|pair| format!("{}->{}", pair.from, pair.to))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("rewrite {}.{} [{pairs}]", rewrite.table, rewrite.column)
            }
            Self::CreateEnumType { name, labels, .. } => {
                format!("create enumerated type {name} ({} labels)", labels.len())
            }
            Self::DropEnumType { name, .. } => format!("drop enumerated type {name}"),
            Self::EnableOwnershipPolicy { table, policy } => format!(
                "enable ownership policy on {table} ({} = auth_uid())",
                policy.owner_column
            ),
            Self::DisableOwnershipPolicy { table } => {
                format!("disable ownership policy on {table}")
            }
        }
    }

    /// # Errors
    /// Returns [`StepError`] describing the first structural problem found.
    pub fn validate(&self) -> Result<(), StepError> {
        match self {
            Self::RawStatement { sql } => {
                if sql.trim().is_empty() {
                    return Err(StepError::EmptyStatement);
                }
                Ok(())
            }
            Self::CreateTable { schema } => schema.validate(),
            Self::DropTable { table, .. } | Self::DisableOwnershipPolicy { table } => {
                validate_identifier("table", table)
            }
            Self::CreateIndex { index } => {
                validate_identifier("index", &index.name)?;
                validate_identifier("table", &index.table)?;
                if index.columns.is_empty() {
                    return Err(StepError::EmptyIndex {
                        index: index.name.clone(),
                    });
                }
                index
                    .columns
                    .iter()
                    .try_for_each(|column| validate_identifier("column", column))
            }
            Self::DropIndex { name, .. } => validate_identifier("index", name),
            Self::AlterColumn { alter } => {
                validate_identifier("table", &alter.table)?;
                validate_identifier("column", &alter.column)?;
                if let ColumnChange::SetType(ColumnType::Enum(name)) = &alter.change {
                    validate_identifier("enumerated type", name)?;
                }
                Ok(())
            }
            Self::DataRewrite { rewrite } => {
                validate_identifier("table", &rewrite.table)?;
                validate_identifier("column", &rewrite.column)?;
                if rewrite.mapping.is_empty() {
                    return Err(StepError::EmptyMapping {
                        table: rewrite.table.clone(),
                        column: rewrite.column.clone(),
                    });
                }
                if let Some(pair) = rewrite.mapping.iter().find(|pair| pair.from == pair.to) {
                    return Err(StepError::IdentityRewrite {
                        label: pair.from.clone(),
                    });
                }
                Ok(())
            }
            Self::CreateEnumType { name, labels, .. } => {
                validate_identifier("enumerated type", name)?;
                if labels.is_empty() {
                    return Err(StepError::EmptyEnum { name: name.clone() });
                }
                let mut seen = std::collections::BTreeSet::new();
                for label in labels {
                    if !seen.insert(label.as_str()) {
                        return Err(StepError::DuplicateLabel {
                            name: name.clone(),
                            label: label.clone(),
                        });
                    }
                }
                Ok(())
            }
            Self::DropEnumType { name, .. } => validate_identifier("enumerated type", name),
            Self::EnableOwnershipPolicy { table, policy } => {
                validate_identifier("table", table)?;
                policy.validate(table)
            }
        }
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`.
///
/// # Errors
/// Returns [`StepError::InvalidIdentifier`] for anything else.
pub(crate) fn validate_identifier(what: &'static str, value: &str) -> Result<(), StepError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    if valid_start && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Ok(());
    }
    Err(StepError::InvalidIdentifier {
        what,
        value: value.to_string(),
    })
}
