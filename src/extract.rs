//! Attachment classification and content extraction.
//!
//! The reconciler consults a single extension lookup to decide how each
//! attachment travels to the destination: images go through an external
//! vision describer, spreadsheets through the built-in xlsx extractor, and
//! everything else with a known extension passes through as raw bytes.
//! The destination document name substitutes `.txt` for the original
//! extension exactly when the content was transformed into extracted text,
//! and the same rule is applied when deleting, so removal always targets
//! the name that was stored.

use async_trait::async_trait;
use base64::Engine;
use std::io::Read;
use std::time::Duration;

use crate::config::ImageExtractorConfig;
use crate::error::{SyncError, SyncResult};

/// How an attachment is routed, decided once per attachment by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentClass {
    /// Described by the external vision endpoint, stored as text.
    Image,
    /// Spreadsheet; cell text extracted, stored as text.
    Tabular,
    /// Uploaded unchanged as a file document.
    Generic,
    /// No extension to classify by; skipped with a notice.
    Unsupported,
}

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "jfif", "bmp", "webp", "tiff"];
const TABULAR_EXTENSIONS: [&str; 2] = ["xlsx", "xls"];

/// Classify an attachment by its file extension.
pub fn classify(filename: &str) -> AttachmentClass {
    match extension_of(filename) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => AttachmentClass::Image,
        Some(ext) if TABULAR_EXTENSIONS.contains(&ext.as_str()) => AttachmentClass::Tabular,
        Some(_) => AttachmentClass::Generic,
        None => AttachmentClass::Unsupported,
    }
}

/// Destination document name for an attachment.
///
/// Image and tabular attachments are stored as extracted text, so their
/// document name swaps the extension for `.txt`; generic files keep the
/// original name. Deletion uses this same function.
pub fn destination_name(filename: &str) -> String {
    match classify(filename) {
        AttachmentClass::Image | AttachmentClass::Tabular => {
            let stem = match filename.rfind('.') {
                Some(dot) => &filename[..dot],
                None => filename,
            };
            format!("{stem}.txt")
        }
        _ => filename.to_string(),
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let dot = filename.rfind('.')?;
    let ext = &filename[dot + 1..];
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

// ============ Tabular extraction ============

/// Maximum decompressed bytes read from a single archive entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum worksheets processed per workbook.
const MAX_SHEETS: usize = 100;

/// Extract cell text from an xlsx workbook, one row per output line with
/// cells joined by `; `.
///
/// Legacy binary `.xls` workbooks are not parseable here and yield an
/// extraction error, which the reconciler records and skips.
pub fn extract_tabular_text(filename: &str, bytes: &[u8]) -> SyncResult<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| SyncError::extraction(filename, format!("not an xlsx archive: {e}")))?;

    let shared = read_shared_strings(filename, &mut archive)?;
    let sheets = worksheet_names(&mut archive);

    let mut lines: Vec<String> = Vec::new();
    for name in sheets.into_iter().take(MAX_SHEETS) {
        let xml = read_entry(filename, &mut archive, &name)?;
        extract_sheet_rows(filename, &xml, &shared, &mut lines)?;
    }
    Ok(lines.join("\n"))
}

fn read_entry(
    filename: &str,
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> SyncResult<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| SyncError::extraction(filename, e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::extraction(filename, e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(SyncError::extraction(
            filename,
            format!("archive entry {name} exceeds size limit"),
        ));
    }
    Ok(out)
}

fn read_shared_strings(
    filename: &str,
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> SyncResult<Vec<String>> {
    // workbooks with no string cells have no sharedStrings part
    if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_entry(filename, archive, "xl/sharedStrings.xml")?;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                    current.clear();
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        current.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(SyncError::extraction(filename, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_sheet_rows(
    filename: &str,
    xml: &[u8],
    shared: &[String],
    lines: &mut Vec<String>,
) -> SyncResult<()> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut row: Vec<String> = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let value = te.unescape().unwrap_or_default();
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    if cell_is_shared {
                        if let Ok(idx) = trimmed.parse::<usize>() {
                            if let Some(s) = shared.get(idx) {
                                row.push(s.clone());
                            }
                        }
                    } else {
                        row.push(trimmed.to_string());
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join("; "));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(SyncError::extraction(filename, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

// ============ Image description ============

/// External collaborator that turns an image into descriptive text.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, filename: &str, bytes: &[u8]) -> SyncResult<String>;
}

const IMAGE_PROMPT: &str =
    "Describe this image in detail and transcribe every piece of text and data visible in it.";

/// Describer backed by an OpenAI-compatible vision endpoint.
pub struct VisionDescriber {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: u32,
}

impl VisionDescriber {
    pub fn new(config: &ImageExtractorConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SyncError::extraction("image-describer", e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ImageDescriber for VisionDescriber {
    async fn describe(&self, filename: &str, bytes: &[u8]) -> SyncResult<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let data_url = format!("data:image/jpeg;base64,{encoded}");

        let mut payload = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": IMAGE_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": self.max_tokens,
        });
        if let Some(model) = &self.model {
            payload["model"] = serde_json::json!(model);
        }

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SyncError::extraction(filename, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::extraction(
                filename,
                format!("vision endpoint HTTP {status}: {body}"),
            ));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SyncError::extraction(filename, e.to_string()))?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        if text.is_empty() {
            return Err(SyncError::extraction(filename, "empty description"));
        }

        Ok(format!("Image Name: {filename}\nImage Description:\n{text}"))
    }
}
