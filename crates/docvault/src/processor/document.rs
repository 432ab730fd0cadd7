use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::DocumentConfig;
use crate::detect::FileCategory;
use crate::error::ProcessError;
use crate::processor::{read_error, write_error, MediaProcessor, WorkItem};
use crate::storage::filesystem::bytes_to_mb;

/// Gzips word documents. They get a text description instead of a visual
/// thumbnail, with an excerpt for DOCX files.
pub struct DocumentProcessor {
    config: DocumentConfig,
}

impl DocumentProcessor {
    pub fn new(config: DocumentConfig) -> Self {
        Self { config }
    }

    fn describe(&self, item: &WorkItem<'_>) -> String {
        let extension = item
            .input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        let original = std::fs::metadata(item.input).map(|m| m.len()).unwrap_or(0);
        let compressed = std::fs::metadata(item.output).map(|m| m.len()).unwrap_or(0);

        let mut info = format!(
            "Document: {}\nType: {}\nCompression: gzip (level {})\nOriginal size: {} MB\nCompressed size: {} MB\n",
            item.display_name,
            extension.to_ascii_uppercase(),
            self.config.compression_level.min(9),
            bytes_to_mb(original),
            bytes_to_mb(compressed),
        );

        if extension == "docx" {
            match docx_excerpt(item.input, self.config.excerpt_chars) {
                Ok(excerpt) if !excerpt.is_empty() => {
                    info.push_str("Excerpt: ");
                    info.push_str(&excerpt);
                    info.push('\n');
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "No excerpt for document"),
            }
        }

        info
    }
}

impl MediaProcessor for DocumentProcessor {
    fn category(&self) -> FileCategory {
        FileCategory::Document
    }

    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError> {
        let _span = tracing::info_span!("processor.document").entered();

        let input = File::open(item.input).map_err(|e| read_error(item.input, e))?;
        let output = File::create(item.output).map_err(|e| write_error(item.output, e))?;

        let mut encoder = GzEncoder::new(
            BufWriter::new(output),
            Compression::new(self.config.compression_level.min(9)),
        );
        std::io::copy(&mut BufReader::new(input), &mut encoder)
            .map_err(|e| write_error(item.output, e))?;

        let writer = encoder.finish().map_err(|e| write_error(item.output, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| write_error(item.output, e.into_error()))?;
        file.sync_all().map_err(|e| write_error(item.output, e))
    }

    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError> {
        let path = item.thumbnail_path("_info.txt");
        std::fs::write(&path, self.describe(item)).map_err(|e| write_error(&path, e))?;
        Ok(path)
    }
}

/// First `max_chars` characters of a DOCX body, whitespace collapsed.
pub fn docx_excerpt(path: &Path, max_chars: usize) -> Result<String, ProcessError> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        ProcessError::DocumentProcessing(format!("Failed to open DOCX: {}", e))
    })?;

    let text = extract_docx_text(&mut archive)?;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(collapsed.chars().take(max_chars).collect())
}

fn extract_docx_text<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<String, ProcessError> {
    let mut document_xml = archive.by_name("word/document.xml").map_err(|e| {
        ProcessError::DocumentProcessing(format!("Failed to find document.xml: {}", e))
    })?;

    let mut xml_content = String::new();
    document_xml
        .read_to_string(&mut xml_content)
        .map_err(|e| {
            ProcessError::DocumentProcessing(format!("Failed to read document.xml: {}", e))
        })?;

    parse_docx_xml(&xml_content)
}

fn parse_docx_xml(xml: &str) -> Result<String, ProcessError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    let mut in_text_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"t" => {
                in_text_element = true;
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text_element = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text_element => {
                text.push_str(&e.decode().unwrap_or_default());
            }
            // Entities arrive as separate events between text chunks.
            Ok(Event::GeneralRef(e)) if in_text_element => {
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else if let Ok(name) = e.decode() {
                    if let Some(value) = resolve_predefined_entity(&name) {
                        text.push_str(value);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProcessError::DocumentProcessing(format!(
                    "XML parsing error: {}",
                    e
                )));
            }
            _ => {}
        }
    }

    Ok(text)
}
