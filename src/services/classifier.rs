//! Maps invoice line items onto ledger cells using the Anthropic Messages API.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::services::spreadsheet::{CellRef, CellValue, SheetGrid, SheetStructure};

const API_VERSION: &str = "2023-06-01";

/// Longest invoice text sent to the model; the rest is cut off.
const MAX_INVOICE_CHARS: usize = 60_000;

/// One value to write into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEntry {
    pub cell: CellRef,
    pub value: CellValue,
    pub description: Option<String>,
}

/// Structured classification output consumed by the sheet updater.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedData {
    pub entries: Vec<ClassifiedEntry>,
}

impl ClassifiedData {
    /// Cell updates keyed by position. A later entry for the same cell wins.
    pub fn updates(&self) -> BTreeMap<CellRef, CellValue> {
        self.entries
            .iter()
            .map(|e| (e.cell, e.value.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
pub trait InvoiceClassifier: Send + Sync {
    async fn classify(
        &self,
        invoice_text: &str,
        sheet: &SheetGrid,
        structure: &SheetStructure,
        api_key: &str,
    ) -> Result<ClassifiedData>;
}

#[derive(Debug, Clone)]
pub struct AnthropicClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<MessageParam>,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlockResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockResponse {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    cell: String,
    value: CellValue,
    #[serde(default)]
    description: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are an accounting assistant reconciling supplier invoices \
against a chart-of-accounts ledger worksheet. Decide which ledger cells the invoice amounts \
belong in. Answer with a single JSON object and nothing else, shaped as \
{\"entries\":[{\"cell\":\"D12\",\"value\":123.45,\"description\":\"short reason\"}]}. \
Use A1-style cell references that exist in the described sheet layout. Values are numbers \
unless the target cell holds text. Return {\"entries\":[]} when nothing matches.";

impl AnthropicClassifier {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_tokens,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    async fn call_messages(&self, prompt: String, api_key: &str) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send Messages API request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Anthropic Messages API failed with status {}: {}",
                status,
                error_text
            ));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Messages API response")?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlockResponse::Text { text } => Some(text),
                ContentBlockResponse::Other => None,
            })
            .collect();
        Ok(text)
    }
}

#[async_trait]
impl InvoiceClassifier for AnthropicClassifier {
    async fn classify(
        &self,
        invoice_text: &str,
        sheet: &SheetGrid,
        structure: &SheetStructure,
        api_key: &str,
    ) -> Result<ClassifiedData> {
        let prompt = build_prompt(invoice_text, sheet, structure);
        let reply = self.call_messages(prompt, api_key).await?;
        let data = parse_classification(&reply)?;
        if data.is_empty() {
            tracing::warn!("Classifier matched no invoice items to sheet {:?}", structure.sheet_name);
        } else {
            tracing::info!("Classifier proposed {} cell update(s)", data.entries.len());
        }
        Ok(data)
    }
}

pub fn build_prompt(invoice_text: &str, sheet: &SheetGrid, structure: &SheetStructure) -> String {
    let invoice = truncate_chars(invoice_text, MAX_INVOICE_CHARS);
    format!(
        "## Invoice text\n{}\n\n## Ledger layout\n{}\n## Ledger contents (row | column: value)\n{}\n",
        invoice,
        structure.describe(),
        sheet.render()
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Parses the model reply. Prose or code fences around the JSON object are ignored.
pub fn parse_classification(reply: &str) -> Result<ClassifiedData> {
    let json = extract_json_object(reply)
        .ok_or_else(|| anyhow!("classifier reply contains no JSON object"))?;
    let raw: RawClassification =
        serde_json::from_str(json).context("classifier reply is not valid classification JSON")?;

    let mut entries = Vec::with_capacity(raw.entries.len());
    for entry in raw.entries {
        let cell: CellRef = entry
            .cell
            .parse()
            .with_context(|| format!("classifier returned an unusable cell for {:?}", entry.description))?;
        if let CellValue::Number(n) = entry.value {
            if !n.is_finite() {
                bail!("classifier returned a non-finite value for {}", cell);
            }
        }
        entries.push(ClassifiedEntry {
            cell,
            value: entry.value,
            description: entry.description.filter(|d| !d.trim().is_empty()),
        });
    }
    Ok(ClassifiedData { entries })
}

/// Slice from the first `{` to the last `}`.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
