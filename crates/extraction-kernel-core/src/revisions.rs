//! The revision chain that provisions the extraction schema.

use crate::{
    ColumnChange, ColumnDef, ColumnType, DataRewrite, DefaultValue, ExtractionStatus, IndexSpec,
    OwnershipPolicy, PolicyCommand, ReferentialAction, Reversibility, Revision, Step, TableSchema,
};

pub const EXTRACTION_STATUS_TYPE: &str = "extractionstatus";

const SET_TIMESTAMP_TRIGGER: &str = "CREATE TRIGGER set_timestamp
AFTER UPDATE ON extractions
FOR EACH ROW
WHEN NEW.updated_at IS OLD.updated_at
BEGIN
    UPDATE extractions
    SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id;
END";

fn user_table() -> TableSchema {
    TableSchema::new(
        "user",
        vec![
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("email", ColumnType::text(255)),
            ColumnDef::new("is_active", ColumnType::Boolean)
                .with_default(DefaultValue::Boolean(true)),
            ColumnDef::new("is_superuser", ColumnType::Boolean)
                .with_default(DefaultValue::Boolean(false)),
            ColumnDef::new("full_name", ColumnType::text(255)).nullable(),
            ColumnDef::new("hashed_password", ColumnType::unbounded_text()),
        ],
    )
    .primary_key(&["id"])
}

fn item_table() -> TableSchema {
    TableSchema::new(
        "item",
        vec![
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("owner_id", ColumnType::Uuid),
            ColumnDef::new("title", ColumnType::text(255)),
            ColumnDef::new("description", ColumnType::text(255)).nullable(),
        ],
    )
    .primary_key(&["id"])
    .foreign_key("owner_id", "user", "id", Some(ReferentialAction::Cascade))
}

fn extractions_table() -> TableSchema {
    TableSchema::new(
        "extractions",
        vec![
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("owner_id", ColumnType::Uuid),
            ColumnDef::new("filename", ColumnType::text(255)),
            ColumnDef::new("file_size", ColumnType::Integer),
            ColumnDef::new("page_count", ColumnType::Integer).nullable(),
            ColumnDef::new("mime_type", ColumnType::text(100)),
            ColumnDef::new("status", ColumnType::unbounded_text()).with_default(
                DefaultValue::Text(ExtractionStatus::INITIAL.as_str().to_string()),
            ),
            ColumnDef::new("presigned_url", ColumnType::text(2048)),
            ColumnDef::new("storage_path", ColumnType::text(512)),
            ColumnDef::new("uploaded_at", ColumnType::Timestamp)
                .with_default(DefaultValue::CurrentTimestamp),
            ColumnDef::new("updated_at", ColumnType::Timestamp)
                .with_default(DefaultValue::CurrentTimestamp),
        ],
    )
    .primary_key(&["id"])
    .foreign_key("owner_id", "user", "id", Some(ReferentialAction::Cascade))
    .check("file_size_positive", "file_size > 0")
}

fn initial_schema() -> Revision {
    Revision::new("20038a3ab258", None, "initial schema")
        .up(Step::create_table(user_table()))
        .up(Step::create_index(
            IndexSpec::new("ix_user_email", "user", &["email"]).unique(),
        ))
        .up(Step::create_table(item_table()))
        .down(Step::drop_table("item"))
        .down(Step::drop_index("ix_user_email"))
        .down(Step::drop_table("user"))
}

fn create_extractions() -> Revision {
    Revision::new(
        "efc9ab8c3122",
        Some("20038a3ab258"),
        "create extractions table",
    )
    .up(Step::create_table(extractions_table()))
    .up(Step::create_index(IndexSpec::new(
        "ix_extractions_owner_id",
        "extractions",
        &["owner_id"],
    )))
    .up(Step::create_index(IndexSpec::new(
        "ix_extractions_status",
        "extractions",
        &["status"],
    )))
    .up(Step::create_index(IndexSpec::new(
        "ix_extractions_uploaded_at",
        "extractions",
        &["uploaded_at"],
    )))
    .up(Step::raw(SET_TIMESTAMP_TRIGGER))
    .down(Step::raw("DROP TRIGGER IF EXISTS set_timestamp"))
    .down(Step::drop_index("ix_extractions_uploaded_at"))
    .down(Step::drop_index("ix_extractions_status"))
    .down(Step::drop_index("ix_extractions_owner_id"))
    .down(Step::drop_table("extractions"))
}

fn cleanup_legacy_item() -> Revision {
    Revision::new(
        "aaacfc2783ba",
        Some("efc9ab8c3122"),
        "cleanup legacy item table",
    )
    .up(Step::DropTable {
        table: "item".to_string(),
        if_exists: true,
    })
    .down(Step::create_table(item_table()))
    .reversibility(Reversibility::Lossy {
        note: "item is recreated empty".to_string(),
    })
}

fn enable_ownership_policies() -> Revision {
    Revision::new(
        "0b5a4a39bd8c",
        Some("aaacfc2783ba"),
        "enable row level security and create ownership policies",
    )
    .up(Step::EnableOwnershipPolicy {
        table: "user".to_string(),
        policy: OwnershipPolicy::owner_only("id", "profile")
            .with_operations(&[PolicyCommand::Select, PolicyCommand::Update]),
    })
    .up(Step::EnableOwnershipPolicy {
        table: "extractions".to_string(),
        policy: OwnershipPolicy::owner_only("owner_id", "extractions"),
    })
    .down(Step::DisableOwnershipPolicy {
        table: "extractions".to_string(),
    })
    .down(Step::DisableOwnershipPolicy {
        table: "user".to_string(),
    })
}

fn convert_status_to_enum() -> Revision {
    let renames: Vec<(&str, &str)> = crate::legacy_label_renames().to_vec();
    let rename = DataRewrite::new("extractions", "status", &renames);
    let initial = DefaultValue::Text(ExtractionStatus::INITIAL.as_str().to_string());

    Revision::new(
        "0e7dd198b7c7",
        Some("0b5a4a39bd8c"),
        "convert status to enum type",
    )
    .depends_on("efc9ab8c3122")
    .up(Step::create_enum(
        EXTRACTION_STATUS_TYPE,
        &ExtractionStatus::labels(),
    ))
    .up(Step::rewrite(rename.clone()))
    .up(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::DropDefault,
    ))
    .up(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::SetType(ColumnType::Enum(EXTRACTION_STATUS_TYPE.to_string())),
    ))
    .up(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::SetDefault(initial.clone()),
    ))
    .down(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::DropDefault,
    ))
    .down(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::SetType(ColumnType::unbounded_text()),
    ))
    .down(Step::alter_column(
        "extractions",
        "status",
        ColumnChange::SetDefault(initial),
    ))
    .down(Step::drop_enum(EXTRACTION_STATUS_TYPE))
    .down(Step::rewrite(rename.reversed()))
}

/// Revisions provisioning the extraction schema, root first.
#[must_use]
pub fn extraction_revisions() -> Vec<Revision> {
    vec![
        initial_schema(),
        create_extractions(),
        cleanup_legacy_item(),
        enable_ownership_policies(),
        convert_status_to_enum(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditSeverity, Direction, MigrationTarget, RevisionGraph};

    fn graph() -> RevisionGraph {
        match RevisionGraph::new(extraction_revisions()) {
            Ok(graph) => graph,
            Err(err) => panic!("extraction revisions must form a valid graph: {err}"),
        }
    }

    #[test]
    fn chain_is_linear_with_a_single_head() {
        let graph = graph();
        let head = match graph.head() {
            Ok(head) => head,
            Err(err) => panic!("expected a single head: {err}"),
        };
        assert_eq!(head.id.as_str(), "0e7dd198b7c7");
        assert_eq!(graph.root().id.as_str(), "20038a3ab258");

        let path = match graph.resolve_path(None, &MigrationTarget::Head) {
            Ok(path) => path,
            Err(err) => panic!("expected a forward path: {err}"),
        };
        let order: Vec<&str> = path
            .revision_ids()
            .into_iter()
            .map(crate::RevisionId::as_str)
            .collect();
        assert_eq!(
            order,
            vec![
                "20038a3ab258",
                "efc9ab8c3122",
                "aaacfc2783ba",
                "0b5a4a39bd8c",
                "0e7dd198b7c7"
            ]
        );
    }

    #[test]
    fn status_conversion_renames_labels_before_retyping() {
        let graph = graph();
        let Some(revision) = graph.get(&crate::RevisionId::from("0e7dd198b7c7")) else {
            panic!("enum conversion revision missing");
        };

        let upgrade = revision.steps(Direction::Up);
        let rewrite_at = upgrade
            .iter()
            .position(|step| matches!(step, Step::DataRewrite { .. }));
        let retype_at = upgrade.iter().position(|step| {
            matches!(step, Step::AlterColumn { alter } if matches!(alter.change, ColumnChange::SetType(_)))
        });
        let (Some(rewrite_at), Some(retype_at)) = (rewrite_at, retype_at) else {
            panic!("upgrade must both rewrite labels and retype the column");
        };
        assert!(rewrite_at < retype_at);

        let downgrade = revision.steps(Direction::Down);
        let retype_back = downgrade.iter().position(|step| {
            matches!(step, Step::AlterColumn { alter } if matches!(alter.change, ColumnChange::SetType(_)))
        });
        let rewrite_back = downgrade
            .iter()
            .position(|step| matches!(step, Step::DataRewrite { .. }));
        let (Some(retype_back), Some(rewrite_back)) = (retype_back, rewrite_back) else {
            panic!("downgrade must both retype the column and restore labels");
        };
        assert!(retype_back < rewrite_back);
    }

    #[test]
    fn audit_reports_no_errors_for_the_extraction_chain() {
        let findings = graph().audit();
        assert!(
            findings
                .iter()
                .all(|finding| finding.severity != AuditSeverity::Error),
            "unexpected findings: {findings:?}"
        );
    }
}
