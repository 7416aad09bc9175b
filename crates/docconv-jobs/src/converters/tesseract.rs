//! OCR of raster images with tesseract.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::process::Command;

use docconv_core::{ConversionOutput, Converter, Error, JobType, Result};

use super::{opt_positive_int, opt_str, reject_unknown, require_input, run_tool};

/// Converter for `image-to-text`.
///
/// Options: `language` (tesseract language codes joined by `+`, e.g.
/// `eng+deu`) and `psm` (page segmentation mode, 1-13).
pub struct TesseractConverter {
    binary: String,
    default_language: String,
}

impl TesseractConverter {
    pub fn new(binary: &str, default_language: &str) -> Self {
        Self {
            binary: binary.to_string(),
            default_language: default_language.to_string(),
        }
    }

    fn args(&self, options: &JsonMap<String, JsonValue>) -> Result<Vec<String>> {
        reject_unknown(options, &["language", "psm"])?;
        let language = opt_str(options, "language")?.unwrap_or(self.default_language.as_str());
        let valid = !language.is_empty()
            && language
                .split('+')
                .all(|code| !code.is_empty() && code.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        if !valid {
            return Err(Error::Validation(format!(
                "option language is not a tesseract language code: {}",
                language
            )));
        }

        let mut args = vec!["-l".to_string(), language.to_string()];
        if let Some(psm) = opt_positive_int(options, "psm")? {
            if psm > 13 {
                return Err(Error::Validation("option psm must be between 1 and 13".into()));
            }
            args.extend(["--psm".to_string(), psm.to_string()]);
        }
        Ok(args)
    }
}

#[async_trait]
impl Converter for TesseractConverter {
    fn job_type(&self) -> JobType {
        JobType::ImageToText
    }

    fn name(&self) -> &str {
        "tesseract"
    }

    fn validate_options(&self, options: &JsonMap<String, JsonValue>) -> Result<()> {
        self.args(options).map(|_| ())
    }

    async fn convert(
        &self,
        input: &Path,
        options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput> {
        let input_bytes = require_input(input).await?;
        let args = self.args(options)?;

        // tesseract <image> stdout -l <lang> [--psm N]
        let bytes = run_tool(
            Command::new(&self.binary)
                .arg(input)
                .arg("stdout")
                .args(&args),
            "tesseract",
        )
        .await?;

        let text = String::from_utf8_lossy(&bytes);
        let word_count = text.split_whitespace().count();

        Ok(ConversionOutput {
            content_type: "text/plain; charset=utf-8".to_string(),
            extension: "txt".to_string(),
            metadata: json!({
                "converter": "tesseract",
                "language": args[1],
                "input_bytes": input_bytes,
                "word_count": word_count,
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
    fn test_default_language() {
        let conv = TesseractConverter::new("tesseract", "eng");
        assert_eq!(conv.args(&JsonMap::new()).unwrap(), vec!["-l", "eng"]);
    }

    #[test]
    fn test_language_and_psm() {
        let conv = TesseractConverter::new("tesseract", "eng");
        let args = conv
            .args(&options(json!({"language": "eng+chi_sim", "psm": 6})))
            .unwrap();
        assert_eq!(args, vec!["-l", "eng+chi_sim", "--psm", "6"]);
    }

    #[test]
    fn test_rejects_shell_like_language() {
        let conv = TesseractConverter::new("tesseract", "eng");
        for bad in ["", "eng+", "eng;rm", "ENG"] {
            assert!(
                conv.validate_options(&options(json!({ "language": bad })))
                    .is_err(),
                "{}",
                bad
            );
        }
        assert!(conv.validate_options(&options(json!({"psm": 14}))).is_err());
    }
}
