//! Secure intake: runs the detector over an upload batch and decides, per
//! policy, what goes on to storage.
//!
//! Accepted files carry the *detected* MIME type and extension; the claimed
//! values are only ever used for the mismatch comparison.

use serde::Serialize;

use crate::config::{IntakeConfig, LimitsConfig};
use crate::detect::{self, DetectionResult, FileCategory};
use crate::error::IntakeError;
use crate::storage::filesystem::bytes_to_mb;

/// Which files are let through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakePolicy {
    pub allowed_categories: Vec<FileCategory>,
    /// Reject flagged files, and with them the whole batch.
    pub reject_on_mismatch: bool,
    pub log_suspicious: bool,
}

impl IntakePolicy {
    pub fn strict() -> Self {
        Self {
            allowed_categories: FileCategory::ALL.to_vec(),
            reject_on_mismatch: true,
            log_suspicious: true,
        }
    }

    /// Flags mismatches but lets them through under their detected type.
    pub fn lenient() -> Self {
        Self {
            reject_on_mismatch: false,
            ..Self::strict()
        }
    }

    pub fn from_config(config: &IntakeConfig) -> Self {
        Self {
            allowed_categories: config.allowed_categories.clone(),
            reject_on_mismatch: config.reject_on_mismatch,
            log_suspicious: config.log_suspicious,
        }
    }

    pub fn allows(&self, category: FileCategory) -> bool {
        self.allowed_categories.contains(&category)
    }

    fn allowed_list(&self) -> String {
        self.allowed_categories
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

/// One raw file as received.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content_type: Option<&str>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.map(str::to_string),
            bytes,
        }
    }
}

/// A file that passed intake.
#[derive(Debug, Clone)]
pub struct ValidatedFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
    pub category: FileCategory,
    pub detection: DetectionResult,
    pub size_mb: f64,
}

impl ValidatedFile {
    pub fn mime_type(&self) -> &str {
        &self.detection.detected_mime_type
    }

    pub fn extension(&self) -> &str {
        &self.detection.detected_extension
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub filename: String,
    pub reason: String,
    pub security_risk: bool,
    pub detected_type: String,
}

#[derive(Debug)]
pub enum IntakeOutcome {
    /// Files to store. Under a lenient policy `rejected` may be non-empty.
    Accepted {
        files: Vec<ValidatedFile>,
        rejected: Vec<Rejection>,
    },
    /// The whole batch was refused.
    Rejected(Vec<Rejection>),
}

/// Validates every file in the batch.
///
/// Under a policy that rejects on mismatch, one rejected file refuses the
/// whole batch so a multi-file upload never half-lands.
pub fn validate_batch(
    files: Vec<UploadedFile>,
    policy: &IntakePolicy,
    limits: &LimitsConfig,
) -> Result<IntakeOutcome, IntakeError> {
    if files.is_empty() {
        return Err(IntakeError::NoFiles);
    }

    let _span = tracing::info_span!("intake.validate", files = files.len()).entered();

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for file in files {
        match validate_file(file, policy, limits) {
            Ok(valid) => accepted.push(valid),
            Err(rejection) => rejected.push(rejection),
        }
    }

    if policy.reject_on_mismatch && !rejected.is_empty() {
        tracing::warn!(
            rejected = rejected.len(),
            accepted = accepted.len(),
            "Upload batch refused"
        );
        return Ok(IntakeOutcome::Rejected(rejected));
    }

    Ok(IntakeOutcome::Accepted {
        files: accepted,
        rejected,
    })
}

fn validate_file(
    file: UploadedFile,
    policy: &IntakePolicy,
    limits: &LimitsConfig,
) -> Result<ValidatedFile, Rejection> {
    let reject = |reason: String, security_risk: bool, detected_type: &str| Rejection {
        filename: file.name.clone(),
        reason,
        security_risk,
        detected_type: detected_type.to_string(),
    };

    if file.bytes.is_empty() {
        return Err(reject("File buffer is empty".to_string(), false, "unknown"));
    }
    if file.name.trim().is_empty() {
        return Err(reject("File name is missing".to_string(), false, "unknown"));
    }

    let detection = detect::detect(&file.bytes, Some(&file.name), file.content_type.as_deref());

    if detection.security_risk && policy.log_suspicious {
        tracing::warn!(
            filename = %file.name,
            claimed_type = file.content_type.as_deref().unwrap_or("none"),
            detected_type = %detection.detected_mime_type,
            reasons = %detection
                .mismatch_details
                .as_ref()
                .map(|d| d.reason())
                .unwrap_or_default(),
            "Security mismatch detected during intake"
        );
    }

    let label = detection.category_label();
    let category = match detection.detected_category {
        Some(category) if policy.allows(category) => category,
        _ => {
            return Err(reject(
                format!(
                    "File type '{}' is not allowed. Allowed types: {}",
                    label,
                    policy.allowed_list()
                ),
                detection.security_risk,
                label,
            ))
        }
    };

    if policy.reject_on_mismatch && detection.security_risk {
        let details = detection
            .mismatch_details
            .as_ref()
            .map(|d| d.reason())
            .unwrap_or_default();
        return Err(reject(
            format!("Security risk detected: {}", details),
            true,
            label,
        ));
    }

    let size = file.bytes.len() as u64;
    if size > limits.max_bytes(category) {
        return Err(reject(
            format!(
                "File size {} MB exceeds the {} MB limit for {} files",
                bytes_to_mb(size),
                limits.max_mb(category),
                category
            ),
            false,
            label,
        ));
    }

    Ok(ValidatedFile {
        size_mb: bytes_to_mb(size),
        original_name: file.name,
        bytes: file.bytes,
        category,
        detection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const PDF: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n";

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn accepted(outcome: IntakeOutcome) -> (Vec<ValidatedFile>, Vec<Rejection>) {
        match outcome {
            IntakeOutcome::Accepted { files, rejected } => (files, rejected),
            IntakeOutcome::Rejected(r) => panic!("batch unexpectedly rejected: {:?}", r),
        }
    }

    fn refused(outcome: IntakeOutcome) -> Vec<Rejection> {
        match outcome {
            IntakeOutcome::Rejected(r) => r,
            IntakeOutcome::Accepted { .. } => panic!("batch unexpectedly accepted"),
        }
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        assert!(matches!(
            validate_batch(vec![], &IntakePolicy::strict(), &limits()),
            Err(IntakeError::NoFiles)
        ));
    }

    #[test]
    fn test_matching_file_is_accepted_with_detected_values() {
        let files = vec![UploadedFile::new("pic.png", Some("image/png"), PNG.to_vec())];
        let (files, rejected) =
            accepted(validate_batch(files, &IntakePolicy::strict(), &limits()).unwrap());

        assert!(rejected.is_empty());
        assert_eq!(files[0].category, FileCategory::Image);
        assert_eq!(files[0].mime_type(), "image/png");
        assert_eq!(files[0].extension(), "png");
        assert_eq!(files[0].size_mb, 0.0);
    }

    #[test]
    fn test_strict_policy_refuses_whole_batch_on_mismatch() {
        let files = vec![
            UploadedFile::new("ok.pdf", Some("application/pdf"), PDF.to_vec()),
            UploadedFile::new("doc.pdf", Some("application/pdf"), PNG.to_vec()),
        ];
        let rejected = refused(validate_batch(files, &IntakePolicy::strict(), &limits()).unwrap());

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].filename, "doc.pdf");
        assert!(rejected[0].security_risk);
        assert!(rejected[0].reason.starts_with("Security risk detected:"));
        assert_eq!(rejected[0].detected_type, "image");
    }

    #[test]
    fn test_lenient_policy_accepts_under_detected_type() {
        let files = vec![UploadedFile::new("doc.pdf", Some("application/pdf"), PNG.to_vec())];
        let (files, rejected) =
            accepted(validate_batch(files, &IntakePolicy::lenient(), &limits()).unwrap());

        assert!(rejected.is_empty());
        assert_eq!(files[0].category, FileCategory::Image);
        assert_eq!(files[0].extension(), "png");
        assert!(files[0].detection.security_risk);
    }

    #[test]
    fn test_lenient_policy_reports_rejects_alongside() {
        let files = vec![
            UploadedFile::new("a.png", None, PNG.to_vec()),
            UploadedFile::new("x.exe", None, b"MZ\x90\0\x03\0\0\0".to_vec()),
        ];
        let (files, rejected) =
            accepted(validate_batch(files, &IntakePolicy::lenient(), &limits()).unwrap());

        assert_eq!(files.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].reason.starts_with("File type 'unknown' is not allowed"));
    }

    #[test]
    fn test_disallowed_category() {
        let policy = IntakePolicy {
            allowed_categories: vec![FileCategory::Pdf],
            ..IntakePolicy::strict()
        };
        let files = vec![UploadedFile::new("a.png", Some("image/png"), PNG.to_vec())];
        let rejected = refused(validate_batch(files, &policy, &limits()).unwrap());
        assert_eq!(
            rejected[0].reason,
            "File type 'image' is not allowed. Allowed types: pdf"
        );
        assert!(!rejected[0].security_risk);
    }

    #[test]
    fn test_empty_buffer_and_missing_name() {
        let files = vec![
            UploadedFile::new("a.png", None, vec![]),
            UploadedFile::new("  ", None, PNG.to_vec()),
        ];
        let (files, rejected) =
            accepted(validate_batch(files, &IntakePolicy::lenient(), &limits()).unwrap());
        assert!(files.is_empty());
        assert_eq!(rejected[0].reason, "File buffer is empty");
        assert_eq!(rejected[1].reason, "File name is missing");
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let limits = LimitsConfig {
            image_max_mb: 0.00001,
            ..LimitsConfig::default()
        };
        let mut bytes = PNG.to_vec();
        bytes.resize(4096, 0);
        let files = vec![UploadedFile::new("big.png", Some("image/png"), bytes)];

        let rejected = refused(validate_batch(files, &IntakePolicy::strict(), &limits).unwrap());
        assert!(rejected[0].reason.contains("exceeds"));
        assert!(rejected[0].reason.contains("image files"));
    }
}
