use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::TransitionError;

/// Lifecycle of a document under extraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionStatus {
    Uploaded,
    OcrInProgress,
    OcrComplete,
    OcrFailed,
    SegmentationProcessing,
    SegmentationComplete,
    TaggingProcessing,
    Draft,
    InReview,
    Approved,
    Rejected,
    Failed,
}

/// Label set stored before `OCR_PROCESSING` was renamed to `OCR_IN_PROGRESS`.
pub const LEGACY_STATUS_LABELS: [&str; 12] = [
    "UPLOADED",
    "OCR_PROCESSING",
    "OCR_COMPLETE",
    "OCR_FAILED",
    "SEGMENTATION_PROCESSING",
    "SEGMENTATION_COMPLETE",
    "TAGGING_PROCESSING",
    "DRAFT",
    "IN_REVIEW",
    "APPROVED",
    "REJECTED",
    "FAILED",
];

/// `(legacy, current)` label pairs applied before the column becomes enumerated.
#[must_use]
pub fn legacy_label_renames() -> &'static [(&'static str, &'static str)] {
    &[("OCR_PROCESSING", "OCR_IN_PROGRESS")]
}

impl ExtractionStatus {
    pub const INITIAL: Self = Self::Uploaded;

    pub const ALL: [Self; 12] = [
        Self::Uploaded,
        Self::OcrInProgress,
        Self::OcrComplete,
        Self::OcrFailed,
        Self::SegmentationProcessing,
        Self::SegmentationComplete,
        Self::TaggingProcessing,
        Self::Draft,
        Self::InReview,
        Self::Approved,
        Self::Rejected,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::OcrInProgress => "OCR_IN_PROGRESS",
            Self::OcrComplete => "OCR_COMPLETE",
            Self::OcrFailed => "OCR_FAILED",
            Self::SegmentationProcessing => "SEGMENTATION_PROCESSING",
            Self::SegmentationComplete => "SEGMENTATION_COMPLETE",
            Self::TaggingProcessing => "TAGGING_PROCESSING",
            Self::Draft => "DRAFT",
            Self::InReview => "IN_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Like [`Self::parse`], but also accepts labels written before a rename.
    #[must_use]
    pub fn parse_stored(value: &str) -> Option<Self> {
        Self::parse(value).or_else(|| {
            legacy_label_renames()
                .iter()
                .find(|(legacy, _)| *legacy == value)
                .and_then(|(_, current)| Self::parse(current))
        })
    }

    /// Current label set in declaration order, as stored by the enumerated type.
    #[must_use]
    pub fn labels() -> Vec<&'static str> {
        Self::ALL.into_iter().map(Self::as_str).collect()
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::OcrFailed | Self::Failed
        )
    }

    /// Declared edges out of this state. The `FAILED` catch-all is not listed.
    #[must_use]
    pub fn successors(self) -> &'static [Self] {
        match self {
            Self::Uploaded => &[Self::OcrInProgress, Self::OcrFailed],
            Self::OcrInProgress => &[Self::OcrComplete, Self::OcrFailed],
            Self::OcrComplete => &[Self::SegmentationProcessing],
            Self::SegmentationProcessing => &[Self::SegmentationComplete],
            Self::SegmentationComplete => &[Self::TaggingProcessing],
            Self::TaggingProcessing => &[Self::Draft],
            Self::Draft => &[Self::InReview],
            Self::InReview => &[Self::Approved, Self::Rejected],
            Self::OcrFailed | Self::Approved | Self::Rejected | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts a declared edge, or a move to `FAILED` from any state.
///
/// # Errors
/// Returns [`TransitionError::Illegal`] for every other pair. Callers must surface it
/// rather than substitute a neighbouring state.
pub fn validate_transition(
    current: ExtractionStatus,
    next: ExtractionStatus,
) -> Result<(), TransitionError> {
    if next == ExtractionStatus::Failed || current.successors().contains(&next) {
        return Ok(());
    }
    Err(TransitionError::Illegal { current, next })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Extraction {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub file_size: i64,
    pub page_count: Option<i64>,
    pub mime_type: String,
    pub status: ExtractionStatus,
    pub presigned_url: String,
    pub storage_path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewExtraction {
    pub owner_id: String,
    pub filename: String,
    pub file_size: i64,
    pub page_count: Option<i64>,
    pub mime_type: String,
    pub presigned_url: String,
    pub storage_path: String,
}
