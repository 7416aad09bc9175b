//! Built-in converters backed by external command-line tools.
//!
//! Every conversion runs in its own child process spawned with
//! `kill_on_drop(true)`, so a timed out or cancelled conversion is killed
//! when the dispatcher drops the future.

pub mod libreoffice;
pub mod pandoc;
pub mod pdftotext;
pub mod tesseract;

use std::path::Path;
use std::process::Stdio;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::process::Command;
use tracing::debug;

use docconv_core::{defaults, Error, Result};

use crate::dispatcher::Dispatcher;

pub use libreoffice::LibreOfficeConverter;
pub use pandoc::PandocConverter;
pub use pdftotext::PdfToTextConverter;
pub use tesseract::TesseractConverter;

/// Locations of the external tools used by the built-in converters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub libreoffice: String,
    pub pandoc: String,
    pub pdftotext: String,
    pub tesseract: String,
    /// Default OCR language when a job does not set `language`.
    pub ocr_language: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            libreoffice: defaults::LIBREOFFICE_PATH.to_string(),
            pandoc: defaults::PANDOC_PATH.to_string(),
            pdftotext: defaults::PDFTOTEXT_PATH.to_string(),
            tesseract: defaults::TESSERACT_PATH.to_string(),
            ocr_language: defaults::OCR_LANGUAGE.to_string(),
        }
    }
}

impl ToolPaths {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LIBREOFFICE_PATH` | `soffice` | LibreOffice executable |
    /// | `PANDOC_PATH` | `pandoc` | Pandoc executable |
    /// | `PDFTOTEXT_PATH` | `pdftotext` | Poppler pdftotext executable |
    /// | `TESSERACT_PATH` | `tesseract` | Tesseract executable |
    /// | `OCR_LANGUAGE` | `eng` | Default tesseract language |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, fallback: String| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(fallback)
        };
        Self {
            libreoffice: var("LIBREOFFICE_PATH", defaults.libreoffice),
            pandoc: var("PANDOC_PATH", defaults.pandoc),
            pdftotext: var("PDFTOTEXT_PATH", defaults.pdftotext),
            tesseract: var("TESSERACT_PATH", defaults.tesseract),
            ocr_language: var("OCR_LANGUAGE", defaults.ocr_language),
        }
    }
}

/// Dispatcher with a converter registered for every conversion type.
pub fn builtin_dispatcher(paths: &ToolPaths) -> Dispatcher {
    Dispatcher::new()
        .with_converter(LibreOfficeConverter::office_to_pdf(&paths.libreoffice))
        .with_converter(LibreOfficeConverter::excel_to_csv(&paths.libreoffice))
        .with_converter(LibreOfficeConverter::csv_to_excel(&paths.libreoffice))
        .with_converter(PandocConverter::markdown_to_html(&paths.pandoc))
        .with_converter(PandocConverter::html_to_markdown(&paths.pandoc))
        .with_converter(PdfToTextConverter::new(&paths.pdftotext))
        .with_converter(TesseractConverter::new(
            &paths.tesseract,
            &paths.ocr_language,
        ))
}

/// Fail unless `input` names a readable regular file.
pub(crate) async fn require_input(input: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(input)
        .await
        .map_err(|e| Error::Validation(format!("input {} is not readable: {}", input.display(), e)))?;
    if !meta.is_file() {
        return Err(Error::Validation(format!(
            "input {} is not a regular file",
            input.display()
        )));
    }
    Ok(meta.len())
}

/// Run a tool to completion, returning its stdout.
///
/// A non-zero exit becomes `Error::Conversion` carrying the tool's stderr.
pub(crate) async fn run_tool(cmd: &mut Command, tool: &str) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    debug!(subsystem = "jobs", component = "converter", tool, "Running converter tool");

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Conversion(format!("failed to run {}: {}", tool, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Conversion(format!(
            "{} failed ({}): {}",
            tool,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

// =============================================================================
// OPTION HELPERS
// =============================================================================

pub(crate) fn reject_unknown(options: &JsonMap<String, JsonValue>, known: &[&str]) -> Result<()> {
    match options.keys().find(|k| !known.contains(&k.as_str())) {
        Some(key) => Err(Error::Validation(format!("unknown option: {}", key))),
        None => Ok(()),
    }
}

pub(crate) fn opt_bool(options: &JsonMap<String, JsonValue>, key: &str) -> Result<Option<bool>> {
    match options.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::Validation(format!("option {} must be a boolean", key))),
    }
}

pub(crate) fn opt_str<'a>(
    options: &'a JsonMap<String, JsonValue>,
    key: &str,
) -> Result<Option<&'a str>> {
    match options.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(Error::Validation(format!("option {} must be a string", key))),
    }
}

pub(crate) fn opt_positive_int(
    options: &JsonMap<String, JsonValue>,
    key: &str,
) -> Result<Option<u64>> {
    match options.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => Ok(Some(n)),
            _ => Err(Error::Validation(format!(
                "option {} must be a positive integer",
                key
            ))),
        },
    }
}
