//! Domain model for the extraction schema kernel.
//!
//! This crate is free of I/O. It owns:
//! - the revision graph ([`RevisionGraph`]) and its typed steps ([`Step`]),
//! - the extraction status state machine ([`ExtractionStatus`]),
//! - the ownership policy model ([`OwnershipPolicy`], [`Principal`]),
//! - the error taxonomy shared by the store and the CLI.
//!
//! Storage engines realise the steps and policies; see the sqlite store crate.

mod extraction;
mod graph;
mod policy;
mod revisions;
mod step;

pub use extraction::{
    legacy_label_renames, validate_transition, Extraction, ExtractionStatus, NewExtraction,
    LEGACY_STATUS_LABELS,
};
pub use graph::{
    AuditFinding, AuditSeverity, Direction, MigrationPath, MigrationTarget, PathStep,
    Reversibility, Revision, RevisionGraph, RevisionId,
};
pub use policy::{
    OwnershipPolicy, PolicyCommand, Principal, ANON_ROLE, AUTHENTICATED_ROLE, SERVICE_ROLE,
};
pub use revisions::{extraction_revisions, EXTRACTION_STATUS_TYPE};
pub use step::{
    AlterColumn, CheckConstraint, ColumnChange, ColumnDef, ColumnType, DataRewrite, DefaultValue,
    ForeignKey, IndexSpec, LabelRewrite, ReferentialAction, Step, TableSchema,
};

use time::{OffsetDateTime, UtcOffset};

/// Structural problems found in a single step before it is executed.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StepError {
    #[error("{what} identifier {value:?} is invalid (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidIdentifier { what: &'static str, value: String },
    #[error("raw statement is empty")]
    EmptyStatement,
    #[error("table {table} declares no columns")]
    NoColumns { table: String },
    #[error("table {table} declares column {column} more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("index {index} lists no columns")]
    EmptyIndex { index: String },
    #[error("enumerated type {name} declares no labels")]
    EmptyEnum { name: String },
    #[error("enumerated type {name} declares label {label:?} more than once")]
    DuplicateLabel { name: String, label: String },
    #[error("rewrite of {table}.{column} has an empty mapping")]
    EmptyMapping { table: String, column: String },
    #[error("rewrite maps label {label:?} onto itself")]
    IdentityRewrite { label: String },
    #[error("ownership policy on {table} grants no operations")]
    NoOperations { table: String },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GraphError {
    #[error("revision graph contains a cycle reachable from {revision}")]
    Cycle { revision: RevisionId },
    #[error("unknown revision {revision}")]
    UnknownRevision { revision: RevisionId },
    #[error("multiple heads present ({}); name an explicit target revision", join_ids(.heads))]
    MultipleHeads { heads: Vec<RevisionId> },
    #[error("revision {revision} is declared more than once")]
    DuplicateRevision { revision: RevisionId },
    #[error("revision {revision} names missing predecessor {predecessor}")]
    MissingPredecessor {
        revision: RevisionId,
        predecessor: RevisionId,
    },
    #[error("revision graph has no root revision")]
    NoRoot,
    #[error("revision graph has more than one root ({})", join_ids(.roots))]
    MultipleRoots { roots: Vec<RevisionId> },
    #[error("no linear path from {} to {}", display_head(.from.as_ref()), display_head(.to.as_ref()))]
    Divergent {
        from: Option<RevisionId>,
        to: Option<RevisionId>,
    },
    #[error("revision {revision} is irreversible and cannot be downgraded")]
    Irreversible { revision: RevisionId },
    #[error("revision {revision} depends on {dependency}, which is not one of its ancestors")]
    UnsatisfiedDependency {
        revision: RevisionId,
        dependency: RevisionId,
    },
    #[error("revision {revision} is invalid: {reason}")]
    InvalidRevision { revision: RevisionId, reason: String },
}

impl GraphError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "cycle",
            Self::UnknownRevision { .. } => "unknown_revision",
            Self::MultipleHeads { .. } => "multiple_heads",
            Self::DuplicateRevision { .. } => "duplicate_revision",
            Self::MissingPredecessor { .. } => "missing_predecessor",
            Self::NoRoot => "no_root",
            Self::MultipleRoots { .. } => "multiple_roots",
            Self::Divergent { .. } => "divergent",
            Self::Irreversible { .. } => "irreversible",
            Self::UnsatisfiedDependency { .. } => "unsatisfied_dependency",
            Self::InvalidRevision { .. } => "invalid_revision",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("revision {revision} failed: {cause}")]
    StepFailed { revision: RevisionId, cause: String },
    #[error("migration lock is held by {holder}")]
    LockHeld { holder: String },
    #[error("partial apply detected: {detail}")]
    PartialApplyDetected { detail: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("migration cancelled at a node boundary; head is {}", display_head(.last_applied.as_ref()))]
    Cancelled { last_applied: Option<RevisionId> },
    #[error(
        "walk from {} to {} runs {actual}, but only {expected} was requested",
        display_head(.from.as_ref()),
        display_head(.to.as_ref())
    )]
    WrongDirection {
        expected: Direction,
        actual: Direction,
        from: Option<RevisionId>,
        to: Option<RevisionId>,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl MigrationError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StepFailed { .. } => "step_failed",
            Self::LockHeld { .. } => "lock_held",
            Self::PartialApplyDetected { .. } => "partial_apply_detected",
            Self::Graph(inner) => inner.kind(),
            Self::Cancelled { .. } => "cancelled",
            Self::WrongDirection { .. } => "wrong_direction",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TransitionError {
    #[error("illegal status transition {current} -> {next}")]
    Illegal {
        current: ExtractionStatus,
        next: ExtractionStatus,
    },
    #[error("stored status label {label:?} is not a known extraction status")]
    UnknownStatus { label: String },
}

impl TransitionError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Illegal { .. } => "illegal_transition",
            Self::UnknownStatus { .. } => "unknown_status",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PolicyError {
    #[error("cannot enable ownership policy on {table}: no principal-identity source (auth_uid) is resolvable")]
    NoPrincipalSource { table: String },
    #[error("ownership policy already enabled on {table}")]
    AlreadyEnabled { table: String },
    #[error("ownership policy on {table} references missing column {column}")]
    ColumnMissing { table: String, column: String },
    #[error("ownership policy on {table} requires {column} to be NOT NULL")]
    ColumnNullable { table: String, column: String },
    #[error("table {table} does not exist")]
    TableMissing { table: String },
    #[error("ownership policy is not enabled on {table}")]
    NotEnabled { table: String },
    #[error("policy storage error on {table}: {message}")]
    Storage { table: String, message: String },
}

impl PolicyError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoPrincipalSource { .. } => "no_principal_source",
            Self::AlreadyEnabled { .. } => "already_enabled",
            Self::ColumnMissing { .. } => "column_missing",
            Self::ColumnNullable { .. } => "column_nullable",
            Self::TableMissing { .. } => "table_missing",
            Self::NotEnabled { .. } => "not_enabled",
            Self::Storage { .. } => "storage",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("timestamp error: {0}")]
pub struct TimestampError(pub String);

fn join_ids(ids: &[RevisionId]) -> String {
    ids.iter()
        .map(RevisionId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_head(head: Option<&RevisionId>) -> String {
    match head {
        Some(id) => id.to_string(),
        None => "base".to_string(),
    }
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`TimestampError`] when the value is not RFC3339 or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("invalid RFC3339 timestamp {value:?}: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TimestampError(format!(
            "timestamp {value:?} MUST use UTC offset Z"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TimestampError`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
