//! Application-side access to extraction rows on behalf of one principal.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use extraction_kernel_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, validate_transition, Extraction,
    ExtractionStatus, NewExtraction, Principal, TransitionError,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use ulid::Ulid;

use crate::ddl::quote_ident;
use crate::policy::{install_principal_source, shadow_protected_tables};
use crate::{open_connection, DEFAULT_BUSY_TIMEOUT_MS};

const EXTRACTION_COLUMNS: &str = "id, owner_id, filename, file_size, page_count, mime_type, status, \
     presigned_url, storage_path, uploaded_at, updated_at";

/// A connection bound to a principal. On this connection the name of a protected table
/// resolves to its filtering view, so plain reads only return rows the principal may see.
/// Writes name `main.<table>` and go through the table's ownership triggers.
pub struct PrincipalSession {
    conn: Connection,
    principal: Principal,
    protected: BTreeSet<String>,
}

impl PrincipalSession {
    pub fn open(path: &Path, principal: Principal) -> Result<Self> {
        let conn = open_connection(path, DEFAULT_BUSY_TIMEOUT_MS)?;
        install_principal_source(&conn, &principal)?;
        let protected = shadow_protected_tables(&conn)?;

        tracing::debug!(role = principal.role(), protected = protected.len(), "principal session opened");
        Ok(Self {
            conn,
            principal,
            protected,
        })
    }

    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    #[must_use]
    pub fn is_protected(&self, table: &str) -> bool {
        self.protected.contains(table)
    }

    pub fn insert_extraction(&self, new: &NewExtraction) -> Result<Extraction> {
        let now = now_utc();
        let stamp = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let extraction = Extraction {
            id: Ulid::new().to_string(),
            owner_id: new.owner_id.clone(),
            filename: new.filename.clone(),
            file_size: new.file_size,
            page_count: new.page_count,
            mime_type: new.mime_type.clone(),
            status: ExtractionStatus::INITIAL,
            presigned_url: new.presigned_url.clone(),
            storage_path: new.storage_path.clone(),
            uploaded_at: now,
            updated_at: now,
        };

        self.conn
            .execute(
                &format!(
                    "INSERT INTO main.extractions({EXTRACTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    extraction.id,
                    extraction.owner_id,
                    extraction.filename,
                    extraction.file_size,
                    extraction.page_count,
                    extraction.mime_type,
                    extraction.status.as_str(),
                    extraction.presigned_url,
                    extraction.storage_path,
                    stamp,
                    stamp
                ],
            )
            .with_context(|| format!("failed to insert extraction for owner {}", new.owner_id))?;

        Ok(extraction)
    }

    pub fn list_extractions(&self) -> Result<Vec<Extraction>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EXTRACTION_COLUMNS} FROM extractions ORDER BY uploaded_at ASC, id ASC"
            ))
            .context("failed to prepare extraction listing")?;
        let mut rows = stmt.query([])?;

        let mut extractions = Vec::new();
        while let Some(row) = rows.next()? {
            extractions.push(extraction_from_row(row)?);
        }
        Ok(extractions)
    }

    pub fn get_extraction(&self, id: &str) -> Result<Option<Extraction>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE id = ?1"
            ))
            .context("failed to prepare extraction lookup")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(extraction_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Moves a visible extraction to `next`. Illegal moves surface as
    /// [`TransitionError`] and leave the row untouched.
    pub fn transition_status(&mut self, id: &str, next: ExtractionStatus) -> Result<Extraction> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin status transition")?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM extractions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read extraction status")?;
        let stored = stored.ok_or_else(|| anyhow!("extraction {id} not found"))?;
        let current = ExtractionStatus::parse_stored(&stored)
            .ok_or(TransitionError::UnknownStatus { label: stored })?;

        validate_transition(current, next)?;

        let changed = tx
            .execute(
                "UPDATE main.extractions SET status = ?1 WHERE id = ?2",
                params![next.as_str(), id],
            )
            .with_context(|| format!("failed to move extraction {id} to {next}"))?;
        if changed == 0 {
            return Err(anyhow!("extraction {id} was not updated"));
        }
        tx.commit().context("failed to commit status transition")?;

        tracing::info!(extraction = id, from = %current, to = %next, "extraction status changed");
        self.get_extraction(id)?
            .ok_or_else(|| anyhow!("extraction {id} vanished after update"))
    }

    /// Returns whether a row changed. Rows owned by someone else are left alone.
    pub fn transfer_ownership(&self, id: &str, new_owner: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE main.extractions SET owner_id = ?1 WHERE id = ?2",
                params![new_owner, id],
            )
            .with_context(|| format!("failed to transfer extraction {id}"))?;
        Ok(changed > 0)
    }

    pub fn delete_extraction(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM main.extractions WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete extraction {id}"))?;
        Ok(changed > 0)
    }

    pub fn count_visible(&self, table: &str) -> Result<i64> {
        self.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count rows of {table}"))
    }
}

fn extraction_from_row(row: &Row<'_>) -> Result<Extraction> {
    let raw_status: String = row.get(6)?;
    let status = ExtractionStatus::parse_stored(&raw_status)
        .ok_or(TransitionError::UnknownStatus { label: raw_status })?;
    let uploaded_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Extraction {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        filename: row.get(2)?,
        file_size: row.get(3)?,
        page_count: row.get(4)?,
        mime_type: row.get(5)?,
        status,
        presigned_url: row.get(7)?,
        storage_path: row.get(8)?,
        uploaded_at: parse_rfc3339_utc(&uploaded_at).map_err(|err| anyhow!(err.to_string()))?,
        updated_at: parse_rfc3339_utc(&updated_at).map_err(|err| anyhow!(err.to_string()))?,
    })
}
