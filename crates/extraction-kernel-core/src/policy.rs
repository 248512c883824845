use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::step::validate_identifier;
use crate::StepError;

pub const SERVICE_ROLE: &str = "service_role";
pub const AUTHENTICATED_ROLE: &str = "authenticated";
pub const ANON_ROLE: &str = "anon";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub const ALL: [Self; 4] = [Self::Select, Self::Insert, Self::Update, Self::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "select" => Some(Self::Select),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the command filters existing rows (a USING predicate).
    #[must_use]
    pub fn filters_existing_rows(self) -> bool {
        !matches!(self, Self::Insert)
    }

    /// Whether the command checks the row being written (a WITH CHECK predicate).
    #[must_use]
    pub fn checks_new_rows(self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }

    fn verb(self) -> &'static str {
        match self {
            Self::Select => "view",
            Self::Insert => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Row ownership rule: a principal may touch a row only when `owner_column = auth_uid()`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OwnershipPolicy {
    pub owner_column: String,
    pub operations: BTreeSet<PolicyCommand>,
    pub role: String,
    /// Noun used in policy names, e.g. "extractions" or "profile".
    pub subject: String,
}

impl OwnershipPolicy {
    /// Grants all four commands to the authenticated role.
    #[must_use]
    pub fn owner_only(owner_column: &str, subject: &str) -> Self {
        Self {
            owner_column: owner_column.to_string(),
            operations: PolicyCommand::ALL.into_iter().collect(),
            role: AUTHENTICATED_ROLE.to_string(),
            subject: subject.to_string(),
        }
    }

    #[must_use]
    pub fn with_operations(mut self, operations: &[PolicyCommand]) -> Self {
        self.operations = operations.iter().copied().collect();
        self
    }

    #[must_use]
    pub fn grants(&self, command: PolicyCommand) -> bool {
        self.operations.contains(&command)
    }

    #[must_use]
    pub fn policy_name(&self, command: PolicyCommand) -> String {
        format!("Users can {} own {}", command.verb(), self.subject)
    }

    /// Textual form of the ownership predicate, as recorded in the policy catalog.
    #[must_use]
    pub fn predicate_text(&self) -> String {
        format!("({} = auth_uid())", self.owner_column)
    }

    /// # Errors
    /// Returns [`StepError`] when the owner column is malformed or no operation is granted.
    pub fn validate(&self, table: &str) -> Result<(), StepError> {
        validate_identifier("column", &self.owner_column)?;
        validate_identifier("role", &self.role)?;
        if self.operations.is_empty() {
            return Err(StepError::NoOperations {
                table: table.to_string(),
            });
        }
        Ok(())
    }
}

/// Identity a connection acts as when ownership policies are evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "role", content = "uid", rename_all = "snake_case")]
pub enum Principal {
    /// Privileged role that bypasses ownership policies (migrations, admin jobs).
    Service,
    Authenticated(String),
    Anonymous,
}

impl Principal {
    #[must_use]
    pub fn authenticated(uid: &str) -> Self {
        Self::Authenticated(uid.to_string())
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::Service => SERVICE_ROLE,
            Self::Authenticated(_) => AUTHENTICATED_ROLE,
            Self::Anonymous => ANON_ROLE,
        }
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::Authenticated(uid) => Some(uid),
            Self::Service | Self::Anonymous => None,
        }
    }
}
