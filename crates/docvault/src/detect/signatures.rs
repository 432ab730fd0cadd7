//! Magic-number signature table.
//!
//! Order matters: the first matching entry wins. RIFF containers carry a
//! secondary marker at offset 8 that separates WebP from WAV.

use super::FileCategory;

pub(crate) struct Signature {
    pub bytes: &'static [u8],
    pub offset: usize,
    /// Secondary marker that must also be present, as `(bytes, offset)`.
    pub marker: Option<(&'static [u8], usize)>,
    pub mime_type: &'static str,
    pub category: FileCategory,
    pub extension: &'static str,
}

impl Signature {
    const fn new(
        bytes: &'static [u8],
        mime_type: &'static str,
        category: FileCategory,
        extension: &'static str,
    ) -> Self {
        Self {
            bytes,
            offset: 0,
            marker: None,
            mime_type,
            category,
            extension,
        }
    }

    const fn at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    const fn with_marker(mut self, bytes: &'static [u8], offset: usize) -> Self {
        self.marker = Some((bytes, offset));
        self
    }

    pub fn matches(&self, header: &[u8]) -> bool {
        if !slice_at(header, self.bytes, self.offset) {
            return false;
        }
        match self.marker {
            Some((bytes, offset)) => slice_at(header, bytes, offset),
            None => true,
        }
    }
}

fn slice_at(header: &[u8], expected: &[u8], offset: usize) -> bool {
    header
        .get(offset..offset + expected.len())
        .is_some_and(|window| window == expected)
}

pub(crate) const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

use super::FileCategory::{Audio, Document, Image, Pdf};

pub(crate) const SIGNATURES: &[Signature] = &[
    Signature::new(b"\x89PNG\r\n\x1a\n", "image/png", Image, "png"),
    Signature::new(b"\xFF\xD8\xFF", "image/jpeg", Image, "jpg"),
    Signature::new(b"GIF87a", "image/gif", Image, "gif"),
    Signature::new(b"GIF89a", "image/gif", Image, "gif"),
    Signature::new(b"RIFF", "image/webp", Image, "webp").with_marker(b"WEBP", 8),
    Signature::new(b"BM", "image/bmp", Image, "bmp"),
    Signature::new(b"<svg", "image/svg+xml", Image, "svg"),
    Signature::new(b"<?xml", "image/svg+xml", Image, "svg"),
    Signature::new(b"ID3", "audio/mpeg", Audio, "mp3"),
    Signature::new(b"\xFF\xFB", "audio/mpeg", Audio, "mp3"),
    Signature::new(b"\xFF\xF3", "audio/mpeg", Audio, "mp3"),
    Signature::new(b"\xFF\xF2", "audio/mpeg", Audio, "mp3"),
    Signature::new(b"RIFF", "audio/wav", Audio, "wav").with_marker(b"WAVE", 8),
    Signature::new(b"OggS", "audio/ogg", Audio, "ogg"),
    Signature::new(b"ftypM4A", "audio/m4a", Audio, "m4a").at(4),
    Signature::new(b"fLaC", "audio/flac", Audio, "flac"),
    Signature::new(b"\xFF\xF1", "audio/aac", Audio, "aac"),
    Signature::new(b"\xFF\xF9", "audio/aac", Audio, "aac"),
    Signature::new(b"%PDF", "application/pdf", Pdf, "pdf"),
    Signature::new(
        b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1",
        "application/msword",
        Document,
        "doc",
    ),
    Signature::new(b"PK\x03\x04", DOCX_MIME, Document, "docx"),
    Signature::new(b"PK\x05\x06", DOCX_MIME, Document, "docx"),
    Signature::new(b"PK\x07\x08", DOCX_MIME, Document, "docx"),
];

/// Content types a client may legitimately claim for each category.
pub(crate) fn allowed_mime_types(category: FileCategory) -> &'static [&'static str] {
    match category {
        Image => &[
            "image/png",
            "image/jpeg",
            "image/jpg",
            "image/gif",
            "image/webp",
            "image/bmp",
            "image/svg+xml",
        ],
        Audio => &[
            "audio/mpeg",
            "audio/wav",
            "audio/ogg",
            "audio/m4a",
            "audio/flac",
            "audio/aac",
        ],
        Pdf => &["application/pdf"],
        Document => &["application/msword", DOCX_MIME],
    }
}

/// Other spellings accepted for a detected extension.
pub(crate) fn extension_aliases(extension: &str) -> &'static [&'static str] {
    match extension {
        "jpg" => &["jpeg", "jpe"],
        "jpeg" => &["jpg", "jpe"],
        "svg" => &["svgz"],
        _ => &[],
    }
}
