use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::services::classifier::AnthropicClassifier;
use crate::services::extractor::PdfTextExtractor;
use crate::services::pipeline::Pipeline;
use crate::services::spreadsheet::{XlsxSheetAnalyzer, XlsxSheetUpdater};

/// Wires the production collaborators into a pipeline.
///
/// A missing credential is not fatal here: the service starts, and each
/// `/process` request fails at the classification step until one is set.
pub fn setup_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let classifier = AnthropicClassifier::new(
        config.anthropic_base_url.clone(),
        config.anthropic_model.clone(),
        config.classifier_max_tokens,
        std::time::Duration::from_secs(config.classifier_timeout_secs),
    )?;

    let pipeline = Pipeline::new(
        Arc::new(PdfTextExtractor),
        Arc::new(XlsxSheetAnalyzer),
        Arc::new(classifier),
        Arc::new(XlsxSheetUpdater),
        config.classifier_credential().map(String::from),
    );

    if pipeline.has_credential() {
        info!("🤖 Classifier: {} via {}", config.anthropic_model, config.anthropic_base_url);
    } else {
        warn!("⚠️  ANTHROPIC_API_KEY is not set or is a placeholder. Processing requests will fail.");
    }

    Ok(pipeline)
}
