//! PDF text-layer extraction with poppler's `pdftotext`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::process::Command;
use tracing::warn;

use docconv_core::{ConversionOutput, Converter, Error, JobType, Result};

use super::{opt_bool, opt_positive_int, reject_unknown, require_input, run_tool};

/// Converter for `pdf-to-text`.
///
/// Options: `layout` (keep physical layout), `first_page`, `last_page`.
/// A PDF without a text layer yields empty output and `needs_ocr: true` in
/// the metadata.
pub struct PdfToTextConverter {
    binary: String,
}

impl PdfToTextConverter {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn args(options: &JsonMap<String, JsonValue>) -> Result<Vec<String>> {
        reject_unknown(options, &["layout", "first_page", "last_page"])?;
        let first = opt_positive_int(options, "first_page")?;
        let last = opt_positive_int(options, "last_page")?;
        if let (Some(f), Some(l)) = (first, last) {
            if f > l {
                return Err(Error::Validation(
                    "option first_page must not exceed last_page".into(),
                ));
            }
        }

        let mut args = vec!["-enc".to_string(), "UTF-8".to_string()];
        if opt_bool(options, "layout")?.unwrap_or(false) {
            args.push("-layout".into());
        }
        if let Some(f) = first {
            args.extend(["-f".to_string(), f.to_string()]);
        }
        if let Some(l) = last {
            args.extend(["-l".to_string(), l.to_string()]);
        }
        Ok(args)
    }
}

#[async_trait]
impl Converter for PdfToTextConverter {
    fn job_type(&self) -> JobType {
        JobType::PdfToText
    }

    fn name(&self) -> &str {
        "pdftotext"
    }

    fn validate_options(&self, options: &JsonMap<String, JsonValue>) -> Result<()> {
        Self::args(options).map(|_| ())
    }

    async fn convert(
        &self,
        input: &Path,
        options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput> {
        let input_bytes = require_input(input).await?;
        let args = Self::args(options)?;

        // "-" sends the text to stdout
        let bytes = run_tool(
            Command::new(&self.binary).args(&args).arg(input).arg("-"),
            "pdftotext",
        )
        .await?;

        let text = String::from_utf8_lossy(&bytes);
        let needs_ocr = text.trim().is_empty();
        if needs_ocr {
            warn!(
                subsystem = "jobs",
                component = "converter",
                input = %input.display(),
                "PDF has no text layer"
            );
        }
        let line_count = text.lines().count();

        Ok(ConversionOutput {
            content_type: "text/plain; charset=utf-8".to_string(),
            extension: "txt".to_string(),
            metadata: json!({
                "converter": "pdftotext",
                "input_bytes": input_bytes,
                "char_count": text.chars().count(),
                "line_count": line_count,
                "needs_ocr": needs_ocr,
            }),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_page_range_args() {
        let args =
            PdfToTextConverter::args(&options(json!({"first_page": 2, "last_page": 5, "layout": true})))
                .unwrap();
        assert_eq!(
            args,
            vec!["-enc", "UTF-8", "-layout", "-f", "2", "-l", "5"]
        );
    }

    #[test]
    fn test_inverted_page_range_rejected() {
        let conv = PdfToTextConverter::new("pdftotext");
        let err = conv
            .validate_options(&options(json!({"first_page": 9, "last_page": 3})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
