//! HTTP client for the document field-extraction API.
//!
//! Request: `POST {endpoint}` with `{document_id, file_name, mime_type, content_base64}`.
//! Response: `{fields, confidence?}`, where `fields` is the declarations-page
//! JSON object, or a string holding that JSON.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::pipeline::reconcile::{
    DocumentRef, ExtractedFields, ExtractionClient, ExtractionFailure, ExtractionFailureKind,
    ExtractionOutput,
};

/// Blocking HTTP extraction client. The timeout is applied per request.
pub struct HttpExtractionClient {
    endpoint: String,
    api_key: Option<String>,
    documents_root: Option<PathBuf>,
    client: reqwest::blocking::Client,
}

impl HttpExtractionClient {
    /// `documents_root` resolves relative document paths from the remote source.
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        documents_root: Option<PathBuf>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            documents_root,
            client,
        })
    }

    fn resolve_path(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        match &self.documents_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    document_id: &'a str,
    file_name: &'a str,
    mime_type: String,
    content_base64: String,
}

#[derive(Deserialize)]
struct ExtractResponse {
    fields: serde_json::Value,
    #[serde(default)]
    confidence: Option<f32>,
}

impl ExtractionClient for HttpExtractionClient {
    fn extract(
        &self,
        document: &DocumentRef,
        timeout: Duration,
    ) -> Result<ExtractionOutput, ExtractionFailure> {
        let path = self.resolve_path(&document.file_path);
        let bytes = std::fs::read(&path).map_err(|e| {
            ExtractionFailure::new(
                ExtractionFailureKind::Document,
                format!("cannot read {}: {e}", path.display()),
            )
        })?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(document.document_id.as_str());
        let body = ExtractRequest {
            document_id: &document.document_id,
            file_name,
            mime_type: mime_type_for(&path),
            content_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                ExtractionFailure::new(
                    ExtractionFailureKind::Timeout,
                    format!("no response within {}s", timeout.as_secs()),
                )
            } else if e.is_connect() {
                ExtractionFailure::new(
                    ExtractionFailureKind::Transport,
                    format!("cannot connect to {}", self.endpoint),
                )
            } else {
                ExtractionFailure::new(ExtractionFailureKind::Transport, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().map_err(|e| {
            let kind = if e.is_timeout() {
                ExtractionFailureKind::Timeout
            } else {
                ExtractionFailureKind::Transport
            };
            ExtractionFailure::new(kind, e.to_string())
        })?;

        tracing::info!(
            document_id = %document.document_id,
            status,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extraction call"
        );
        if !(200..300).contains(&status) {
            return Err(status_failure(status, &text));
        }

        Ok(ExtractionOutput {
            fields: parse_response(&text)?,
        })
    }
}

fn mime_type_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

fn status_failure(status: u16, body: &str) -> ExtractionFailure {
    let kind = match status {
        401 | 403 => ExtractionFailureKind::Auth,
        408 | 504 => ExtractionFailureKind::Timeout,
        429 | 500..=599 => ExtractionFailureKind::Server,
        _ => ExtractionFailureKind::Document,
    };
    let snippet: String = body.chars().take(200).collect();
    ExtractionFailure::new(kind, format!("HTTP {status}: {snippet}"))
}

/// Parse a response body into typed fields.
pub fn parse_response(body: &str) -> Result<ExtractedFields, ExtractionFailure> {
    let response: ExtractResponse = serde_json::from_str(body).map_err(|e| {
        ExtractionFailure::new(ExtractionFailureKind::MalformedResponse, e.to_string())
    })?;

    let fields = match response.fields {
        serde_json::Value::String(raw) => serde_json::from_str(strip_code_fence(&raw)).map_err(|e| {
            ExtractionFailure::new(
                ExtractionFailureKind::MalformedResponse,
                format!("fields string is not JSON: {e}"),
            )
        })?,
        other => other,
    };

    if !fields.is_object() {
        return Err(ExtractionFailure::new(
            ExtractionFailureKind::MalformedResponse,
            "fields is not an object",
        ));
    }

    Ok(ExtractedFields::from_field_mapping(&fields, response.confidence))
}

/// Model output sometimes arrives wrapped in a markdown code fence.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
