#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use http_body_util::BodyExt;
use invoice_reconciler::config::AppConfig;
use invoice_reconciler::services::classifier::{ClassifiedData, ClassifiedEntry, InvoiceClassifier};
use invoice_reconciler::services::extractor::{InvoiceExtractor, PdfTextExtractor};
use invoice_reconciler::services::pipeline::Pipeline;
use invoice_reconciler::services::spreadsheet::{
    CellRef, CellValue, SheetGrid, SheetStructure, XlsxSheetAnalyzer, XlsxSheetUpdater,
};
use invoice_reconciler::{AppState, create_app};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use serde_json::Value;
use tower::ServiceExt;
use zip::write::FileOptions;

pub const BOUNDARY: &str = "---------------------------974767299852498929531610575";

/// Classifier double that records calls and returns a fixed mapping.
pub struct StubClassifier {
    pub calls: AtomicUsize,
    reply: ClassifiedData,
}

impl StubClassifier {
    pub fn returning(entries: &[(&str, CellValue)]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: ClassifiedData {
                entries: entries
                    .iter()
                    .map(|(cell, value)| ClassifiedEntry {
                        cell: cell.parse::<CellRef>().unwrap(),
                        value: value.clone(),
                        description: None,
                    })
                    .collect(),
            },
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceClassifier for StubClassifier {
    async fn classify(
        &self,
        invoice_text: &str,
        _sheet: &SheetGrid,
        _structure: &SheetStructure,
        _api_key: &str,
    ) -> Result<ClassifiedData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if invoice_text.is_empty() {
            return Err(anyhow!("no invoice text"));
        }
        Ok(self.reply.clone())
    }
}

/// Extractor double that never finishes in time.
pub struct SlowExtractor;

#[async_trait]
impl InvoiceExtractor for SlowExtractor {
    async fn extract(&self, _document: &Path) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

pub fn pipeline_with(
    extractor: Arc<dyn InvoiceExtractor>,
    classifier: Arc<StubClassifier>,
    credential: Option<&str>,
) -> Pipeline {
    Pipeline::new(
        extractor,
        Arc::new(XlsxSheetAnalyzer),
        classifier,
        Arc::new(XlsxSheetUpdater),
        credential.map(String::from),
    )
}

/// Real extraction, analysis and update around a stubbed classifier.
pub fn real_pipeline(classifier: Arc<StubClassifier>) -> Pipeline {
    pipeline_with(Arc::new(PdfTextExtractor), classifier, Some("sk-ant-test"))
}

pub fn test_config(upload_dir: &Path) -> AppConfig {
    AppConfig {
        upload_dir: upload_dir.to_path_buf(),
        ..AppConfig::default()
    }
}

pub fn test_app(config: AppConfig, pipeline: Pipeline) -> Router {
    create_app(AppState::new(config, pipeline))
}

/// One multipart part: (field name, optional filename, content).
pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(filename) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
            }
            None => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn process_request(parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/process")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="COA i-Kcal" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

const LEDGER_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Account</t></is></c><c r="B1" t="inlineStr"><is><t>Description</t></is></c><c r="C1" t="inlineStr"><is><t>Amount</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Cash</t></is></c><c r="C2"><v>1500</v></c></row><row r="3"><c r="A3" t="inlineStr"><is><t>Office Supplies</t></is></c></row></sheetData></worksheet>"#;

/// A one-sheet `.xlsx` with a "COA i-Kcal" ledger.
pub fn ledger_xlsx() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = FileOptions::default();
        for (name, content) in [
            ("[Content_Types].xml", "<Types/>"),
            ("xl/workbook.xml", WORKBOOK),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            ("xl/worksheets/sheet1.xml", LEDGER_SHEET),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

/// A one-page PDF with a text layer.
pub fn invoice_pdf(lines: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 12.into()]),
        Operation::new("Td", vec![50.into(), 750.into()]),
    ];
    for line in lines {
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
        operations.push(Operation::new("Td", vec![0.into(), (-16).into()]));
    }
    operations.push(Operation::new("ET", vec![]));

    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        Content { operations }.encode().unwrap(),
    ));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}
