//! The sequential extract → analyze → classify → update run for one request.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::usable_credential;
use crate::models::ProcessingResult;
use crate::services::classifier::InvoiceClassifier;
use crate::services::extractor::InvoiceExtractor;
use crate::services::spreadsheet::{SheetAnalyzer, SheetUpdater};
use crate::services::stager::StagedInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Staged,
    Extracted,
    Analyzed,
    Classified,
    Updated,
    Cleaned,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Staged => "staged",
            PipelineStage::Extracted => "extracted",
            PipelineStage::Analyzed => "analyzed",
            PipelineStage::Classified => "classified",
            PipelineStage::Updated => "updated",
            PipelineStage::Cleaned => "cleaned",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A stage failure. Carries the collaborator's error chain for logging only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error("analysis failed: {0:#}")]
    Analysis(anyhow::Error),

    #[error("classification failed: {0:#}")]
    Classification(anyhow::Error),

    #[error("update failed: {0:#}")]
    Update(anyhow::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Last stage reached before the failure.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Extraction(_) => PipelineStage::Staged,
            PipelineError::Analysis(_) => PipelineStage::Extracted,
            PipelineError::Classification(_) | PipelineError::Configuration(_) => {
                PipelineStage::Analyzed
            }
            PipelineError::Update(_) => PipelineStage::Classified,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    extractor: Arc<dyn InvoiceExtractor>,
    analyzer: Arc<dyn SheetAnalyzer>,
    classifier: Arc<dyn InvoiceClassifier>,
    updater: Arc<dyn SheetUpdater>,
    credential: Option<String>,
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn InvoiceExtractor>,
        analyzer: Arc<dyn SheetAnalyzer>,
        classifier: Arc<dyn InvoiceClassifier>,
        updater: Arc<dyn SheetUpdater>,
        credential: Option<String>,
    ) -> Self {
        Self {
            extractor,
            analyzer,
            classifier,
            updater,
            credential,
        }
    }

    pub fn has_credential(&self) -> bool {
        usable_credential(self.credential.as_deref()).is_some()
    }

    /// Runs every stage against the staged inputs, then removes them.
    ///
    /// The staged files are deleted exactly once whatever the outcome; the
    /// produced workbook is not.
    pub async fn run(
        &self,
        inputs: StagedInputs,
        sheet_name: &str,
    ) -> Result<ProcessingResult, PipelineError> {
        let outcome = self.execute(&inputs, sheet_name).await;
        inputs.cleanup();

        match &outcome {
            Ok(result) => info!(
                stage = %PipelineStage::Cleaned,
                "Processing completed: {}",
                result.output_file_name()
            ),
            Err(e) => warn!(stage = %PipelineStage::Failed, "Processing failed after {}: {}", e.stage(), e),
        }
        outcome
    }

    async fn execute(
        &self,
        inputs: &StagedInputs,
        sheet_name: &str,
    ) -> Result<ProcessingResult, PipelineError> {
        info!(stage = %PipelineStage::Staged, "Processing {} against {}", inputs.pdf.name, inputs.excel.name);

        let invoice_text = self
            .extractor
            .extract(&inputs.pdf.path)
            .await
            .map_err(PipelineError::Extraction)?;
        info!(stage = %PipelineStage::Extracted, "Extracted {} chars of invoice text", invoice_text.len());

        let (sheet, structure) = self
            .analyzer
            .analyze(&inputs.excel.path, sheet_name)
            .await
            .map_err(PipelineError::Analysis)?;
        info!(
            stage = %PipelineStage::Analyzed,
            "Analyzed sheet {:?}: {} cells, {} labelled rows",
            sheet_name,
            sheet.cells.len(),
            structure.rows.len()
        );

        let api_key = usable_credential(self.credential.as_deref()).ok_or_else(|| {
            PipelineError::Configuration("ANTHROPIC_API_KEY is not configured".to_string())
        })?;
        let data = self
            .classifier
            .classify(&invoice_text, &sheet, &structure, api_key)
            .await
            .map_err(PipelineError::Classification)?;
        info!(stage = %PipelineStage::Classified, "Classified {} entries", data.entries.len());

        let output_path = self
            .updater
            .update(&inputs.excel.path, sheet_name, &data)
            .await
            .map_err(PipelineError::Update)?;
        info!(stage = %PipelineStage::Updated, "Updated workbook written to {}", output_path.display());

        Ok(ProcessingResult::completed(output_path))
    }
}
