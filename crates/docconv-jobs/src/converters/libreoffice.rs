//! LibreOffice headless conversions: office documents to PDF, spreadsheets to
//! CSV and CSV to xlsx.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::process::Command;
use tracing::debug;

use docconv_core::{ConversionOutput, Converter, Error, JobType, Result};

use super::{opt_positive_int, opt_str, reject_unknown, require_input, run_tool};

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Pdf,
    Csv,
    Xlsx,
}

impl Target {
    fn extension(self) -> &'static str {
        match self {
            Target::Pdf => "pdf",
            Target::Csv => "csv",
            Target::Xlsx => "xlsx",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Target::Pdf => "application/pdf",
            Target::Csv => "text/csv",
            Target::Xlsx => XLSX_CONTENT_TYPE,
        }
    }
}

/// Converter running `soffice --headless --convert-to`.
pub struct LibreOfficeConverter {
    job_type: JobType,
    binary: String,
    target: Target,
}

impl LibreOfficeConverter {
    /// Word processor, presentation or spreadsheet document to PDF.
    pub fn office_to_pdf(binary: &str) -> Self {
        Self {
            job_type: JobType::OfficeToPdf,
            binary: binary.to_string(),
            target: Target::Pdf,
        }
    }

    /// One sheet of a spreadsheet to CSV.
    ///
    /// Options: `delimiter` (single ASCII character, default `,`),
    /// `sheet` (1-based index, default 1).
    pub fn excel_to_csv(binary: &str) -> Self {
        Self {
            job_type: JobType::ExcelToCsv,
            binary: binary.to_string(),
            target: Target::Csv,
        }
    }

    /// CSV to xlsx. Option: `delimiter` of the input (default `,`).
    pub fn csv_to_excel(binary: &str) -> Self {
        Self {
            job_type: JobType::CsvToExcel,
            binary: binary.to_string(),
            target: Target::Xlsx,
        }
    }

    fn known_options(&self) -> &'static [&'static str] {
        match self.target {
            Target::Pdf => &[],
            Target::Csv => &["delimiter", "sheet"],
            Target::Xlsx => &["delimiter"],
        }
    }

    /// `--convert-to` argument and optional `--infilter` argument.
    fn filter_args(&self, options: &JsonMap<String, JsonValue>) -> Result<(String, Option<String>)> {
        let delimiter = delimiter_code(options)?;
        Ok(match self.target {
            Target::Pdf => ("pdf".to_string(), None),
            Target::Csv => {
                let sheet = opt_positive_int(options, "sheet")?.unwrap_or(1);
                (
                    format!(
                        "csv:Text - txt - csv (StarCalc):{},34,76,1,,0,false,true,false,false,false,{}",
                        delimiter, sheet
                    ),
                    None,
                )
            }
            Target::Xlsx => (
                "xlsx:Calc MS Excel 2007 XML".to_string(),
                Some(format!("--infilter=CSV:{},34,76,1", delimiter)),
            ),
        })
    }
}

/// ASCII code of the `delimiter` option, as LibreOffice filter strings expect.
fn delimiter_code(options: &JsonMap<String, JsonValue>) -> Result<u32> {
    match opt_str(options, "delimiter")? {
        None => Ok(u32::from(b',')),
        Some(d) => {
            let mut chars = d.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() && !c.is_ascii_alphanumeric() => Ok(c as u32),
                _ => Err(Error::Validation(
                    "option delimiter must be a single non-alphanumeric ASCII character".into(),
                )),
            }
        }
    }
}

/// Path LibreOffice writes its output to inside `outdir`.
fn output_path(outdir: &Path, input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    outdir.join(format!("{}.{}", stem, extension))
}

#[async_trait]
impl Converter for LibreOfficeConverter {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn name(&self) -> &str {
        "libreoffice"
    }

    fn validate_options(&self, options: &JsonMap<String, JsonValue>) -> Result<()> {
        reject_unknown(options, self.known_options())?;
        self.filter_args(options).map(|_| ())
    }

    async fn convert(
        &self,
        input: &Path,
        options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput> {
        let input_bytes = require_input(input).await?;
        let (convert_to, infilter) = self.filter_args(options)?;

        // Private profile and output directory so concurrent soffice
        // processes do not contend for the same user installation lock.
        let workdir = tempfile::tempdir()
            .map_err(|e| Error::Conversion(format!("failed to create work dir: {}", e)))?;
        let outdir = workdir.path().join("out");
        let profile = workdir.path().join("profile");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--headless")
            .arg("--norestore")
            .arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .arg("--convert-to")
            .arg(&convert_to);
        if let Some(infilter) = &infilter {
            cmd.arg(infilter);
        }
        cmd.arg("--outdir").arg(&outdir).arg(input);

        debug!(
            subsystem = "jobs",
            component = "converter",
            job_type = %self.job_type,
            input = %input.display(),
            convert_to = %convert_to,
            "Converting with LibreOffice"
        );
        run_tool(&mut cmd, "soffice").await?;

        let produced = output_path(&outdir, input, self.target.extension());
        let bytes = tokio::fs::read(&produced).await.map_err(|e| {
            Error::Conversion(format!(
                "soffice produced no {} output: {}",
                self.target.extension(),
                e
            ))
        })?;

        Ok(ConversionOutput {
            content_type: self.target.content_type().to_string(),
            extension: self.target.extension().to_string(),
            metadata: json!({
                "converter": "libreoffice",
                "filter": convert_to,
                "input_bytes": input_bytes,
                "output_bytes": bytes.len(),
            }),
            bytes,
        })
    }
}
