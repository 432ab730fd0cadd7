//! Content sniffing: decides what a file really is from its leading bytes.
//!
//! The claimed filename and content type never influence the detected
//! category; they are only compared against it to raise `security_risk`.

mod signatures;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use signatures::{allowed_mime_types, extension_aliases, SIGNATURES};

/// Number of leading bytes inspected.
pub const HEADER_LEN: usize = 64;

/// The four supported file categories.
///
/// `id()` is the routing key stored in the registry and the only category
/// value downstream code trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Audio,
    Pdf,
    Document,
}

impl FileCategory {
    pub const ALL: [FileCategory; 4] = [
        FileCategory::Image,
        FileCategory::Audio,
        FileCategory::Pdf,
        FileCategory::Document,
    ];

    pub fn id(self) -> u8 {
        match self {
            FileCategory::Image => 1,
            FileCategory::Audio => 2,
            FileCategory::Pdf => 3,
            FileCategory::Document => 4,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(FileCategory::Image),
            2 => Some(FileCategory::Audio),
            3 => Some(FileCategory::Pdf),
            4 => Some(FileCategory::Document),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Image => "image",
            FileCategory::Audio => "audio",
            FileCategory::Pdf => "pdf",
            FileCategory::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// Name of the durable queue that carries this category's jobs.
    pub fn queue_name(self) -> &'static str {
        match self {
            FileCategory::Image => "image-processing",
            FileCategory::Audio => "audio-processing",
            FileCategory::Pdf => "pdf-processing",
            FileCategory::Document => "document-processing",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.queue_name() == name)
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a detection was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchDetails {
    pub expected_category: String,
    pub actual_category: String,
    pub reasons: Vec<String>,
}

impl MismatchDetails {
    pub fn reason(&self) -> String {
        self.reasons.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub detected_mime_type: String,
    /// `None` when no signature matched.
    pub detected_category: Option<FileCategory>,
    pub detected_extension: String,
    pub category_id: u8,
    pub is_valid: bool,
    pub security_risk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch_details: Option<MismatchDetails>,
}

impl DetectionResult {
    fn unknown() -> Self {
        Self {
            detected_mime_type: "application/octet-stream".to_string(),
            detected_category: None,
            detected_extension: "bin".to_string(),
            category_id: 0,
            is_valid: false,
            security_risk: true,
            mismatch_details: Some(MismatchDetails {
                expected_category: "unknown".to_string(),
                actual_category: "unknown".to_string(),
                reasons: vec!["No matching magic number signature found".to_string()],
            }),
        }
    }

    pub fn category_label(&self) -> &'static str {
        self.detected_category
            .map(FileCategory::as_str)
            .unwrap_or("unknown")
    }
}

/// Detects the true type of `buffer`.
///
/// `claimed_name` and `claimed_mime` are optional; when both are absent there
/// is nothing to compare against and no risk is raised for a known signature.
pub fn detect(
    buffer: &[u8],
    claimed_name: Option<&str>,
    claimed_mime: Option<&str>,
) -> DetectionResult {
    let header = &buffer[..buffer.len().min(HEADER_LEN)];

    let Some(signature) = SIGNATURES.iter().find(|s| s.matches(header)) else {
        return DetectionResult::unknown();
    };

    let mut reasons = Vec::new();

    if let Some(ext) = claimed_name.and_then(claimed_extension) {
        if ext != signature.extension && !extension_aliases(signature.extension).contains(&ext.as_str())
        {
            reasons.push(format!(
                "Filename suggests '{}' but magic number indicates '{}'.",
                ext, signature.extension
            ));
        }
    }

    if let Some(mime) = claimed_mime.map(normalize_mime).filter(|m| !m.is_empty()) {
        if mime != signature.mime_type
            && !allowed_mime_types(signature.category).contains(&mime.as_str())
        {
            reasons.push(format!(
                "User-provided MIME type '{}' doesn't match detected type '{}'.",
                mime, signature.mime_type
            ));
        }
    }

    let security_risk = !reasons.is_empty();
    let mismatch_details = security_risk.then(|| MismatchDetails {
        expected_category: "as_claimed".to_string(),
        actual_category: signature.category.as_str().to_string(),
        reasons,
    });

    DetectionResult {
        detected_mime_type: signature.mime_type.to_string(),
        detected_category: Some(signature.category),
        detected_extension: signature.extension.to_string(),
        category_id: signature.category.id(),
        is_valid: !security_risk,
        security_risk,
        mismatch_details,
    }
}

/// Lower-cased extension of a claimed filename. Names without a dot carry no
/// extension claim.
fn claimed_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Strips parameters (`; charset=...`) and case from a content type.
fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
