//! Pandoc conversions between markdown and HTML.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::process::Command;

use docconv_core::{ConversionOutput, Converter, Error, JobType, Result};

use super::{opt_bool, opt_str, reject_unknown, require_input, run_tool};

/// Markdown flavors accepted for `html-to-markdown`.
const MARKDOWN_FLAVORS: [&str; 3] = ["gfm", "commonmark", "markdown"];

pub struct PandocConverter {
    job_type: JobType,
    binary: String,
}

impl PandocConverter {
    /// Markdown to HTML.
    ///
    /// Options: `standalone` (default `true`) and `title` for the HTML head.
    pub fn markdown_to_html(binary: &str) -> Self {
        Self {
            job_type: JobType::MarkdownToHtml,
            binary: binary.to_string(),
        }
    }

    /// HTML to markdown. Option: `flavor` (`gfm`, `commonmark` or `markdown`).
    pub fn html_to_markdown(binary: &str) -> Self {
        Self {
            job_type: JobType::HtmlToMarkdown,
            binary: binary.to_string(),
        }
    }

    fn args(&self, options: &JsonMap<String, JsonValue>) -> Result<Vec<String>> {
        let mut args = Vec::new();
        match self.job_type {
            JobType::MarkdownToHtml => {
                reject_unknown(options, &["standalone", "title"])?;
                args.extend(["-f", "markdown", "-t", "html5"].map(String::from));
                let title = opt_str(options, "title")?;
                if opt_bool(options, "standalone")?.unwrap_or(true) {
                    args.push("--standalone".into());
                    // pandoc warns and guesses a title when none is given
                    args.push(format!("--metadata=title={}", title.unwrap_or("Document")));
                } else if title.is_some() {
                    return Err(Error::Validation(
                        "option title requires standalone output".into(),
                    ));
                }
            }
            _ => {
                reject_unknown(options, &["flavor"])?;
                let flavor = opt_str(options, "flavor")?.unwrap_or("gfm");
                if !MARKDOWN_FLAVORS.contains(&flavor) {
                    return Err(Error::Validation(format!(
                        "option flavor must be one of {}",
                        MARKDOWN_FLAVORS.join(", ")
                    )));
                }
                args.extend(["-f", "html", "-t", flavor, "--wrap=none"].map(String::from));
            }
        }
        Ok(args)
    }

    fn output_kind(&self) -> (&'static str, &'static str) {
        match self.job_type {
            JobType::MarkdownToHtml => ("text/html; charset=utf-8", "html"),
            _ => ("text/markdown; charset=utf-8", "md"),
        }
    }
}

#[async_trait]
impl Converter for PandocConverter {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn name(&self) -> &str {
        "pandoc"
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

        let bytes = run_tool(Command::new(&self.binary).args(&args).arg(input), "pandoc").await?;
        let (content_type, extension) = self.output_kind();

        Ok(ConversionOutput {
            content_type: content_type.to_string(),
            extension: extension.to_string(),
            metadata: json!({
                "converter": "pandoc",
                "args": args,
                "input_bytes": input_bytes,
                "output_bytes": bytes.len(),
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
    fn test_markdown_to_html_defaults_to_standalone() {
        let conv = PandocConverter::markdown_to_html("pandoc");
        let args = conv.args(&JsonMap::new()).unwrap();
        assert!(args.contains(&"--standalone".to_string()));
        assert!(args.contains(&"--metadata=title=Document".to_string()));
    }

    #[test]
    fn test_fragment_output_rejects_title() {
        let conv = PandocConverter::markdown_to_html("pandoc");
        let args = conv
            .args(&options(json!({"standalone": false})))
            .unwrap();
        assert!(!args.contains(&"--standalone".to_string()));
        assert!(conv
            .validate_options(&options(json!({"standalone": false, "title": "x"})))
            .is_err());
    }

    #[test]
    fn test_html_to_markdown_flavor() {
        let conv = PandocConverter::html_to_markdown("pandoc");
        let args = conv
            .args(&options(json!({"flavor": "commonmark"})))
            .unwrap();
        assert_eq!(args[3], "commonmark");
        assert!(conv
            .validate_options(&options(json!({"flavor": "rst"})))
            .is_err());
        assert_eq!(conv.output_kind().1, "md");
    }
}
