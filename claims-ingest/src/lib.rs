#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Evidence Document intake: signs an upload, creates the Evidence Document
//! record, and enqueues it for the Parser Service.
//!
//! Grounded in this workspace's document-intake facade: upload signing plus
//! an ingestion queue, unchanged in shape — only the enqueued payload
//! changes, from a generic upload job to an Evidence Document whose
//! `parser_status` starts `Pending` and is populated asynchronously by the
//! Parser Service.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use chrono::DateTime;
use chrono::Utc;
use claims_tenancy::Provider;
use claims_tenancy::SellerId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::Instrument;
use tracing::info_span;
use uuid::Uuid;

pub type DocumentId = String;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParserStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequestPayload {
    pub seller_id: SellerId,
    pub provider: Provider,
    pub file_name: String,
    pub content_type: String,
    pub content_length: u64,
    /// Caller-supplied hint at the document's kind (invoice, shipping
    /// label, removal report, ...); the Parser Service may overwrite this
    /// once classification runs.
    pub doc_type: Option<String>,
}

impl UploadRequestPayload {
    pub fn validate(&self) -> IngestResult<()> {
        if self.seller_id.trim().is_empty() {
            return Err(IngestError::Validation("seller_id must be provided".into()));
        }
        if self.file_name.trim().is_empty() {
            return Err(IngestError::Validation("file_name must be provided".into()));
        }
        if self.content_length == 0 {
            return Err(IngestError::Validation(
                "content_length must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedUploadResponse {
    pub document_id: DocumentId,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
    pub fields: serde_json::Value,
}

/// The Evidence Document record as it exists right after intake: parser
/// fields are unset and get populated asynchronously once the Parser
/// Service processes the upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub document_id: DocumentId,
    pub seller_id: SellerId,
    pub provider: Provider,
    pub filename: String,
    pub content_type: String,
    pub doc_type: Option<String>,
    pub parser_status: ParserStatus,
    pub ingested_at: DateTime<Utc>,
}

#[async_trait]
pub trait UploadSigner: Send + Sync {
    async fn sign(&self, payload: &UploadRequestPayload) -> IngestResult<SignedUploadResponse>;
}

#[async_trait]
pub trait IngestionQueue: Send + Sync {
    async fn enqueue(&self, document: EvidenceDocument) -> IngestResult<()>;
}

#[async_trait]
pub trait IngestionService: Send + Sync {
    async fn create_upload(
        &self,
        payload: UploadRequestPayload,
    ) -> IngestResult<SignedUploadResponse>;
}

#[derive(Clone)]
pub struct IngestionFacade {
    signer: Arc<dyn UploadSigner>,
    queue: Arc<dyn IngestionQueue>,
}

impl IngestionFacade {
    #[must_use]
    pub fn new(signer: Arc<dyn UploadSigner>, queue: Arc<dyn IngestionQueue>) -> Self {
        Self { signer, queue }
    }
}

#[async_trait]
impl IngestionService for IngestionFacade {
    async fn create_upload(
        &self,
        payload: UploadRequestPayload,
    ) -> IngestResult<SignedUploadResponse> {
        payload.validate()?;
        let response = self.signer.sign(&payload).await?;
        let document = EvidenceDocument {
            document_id: response.document_id.clone(),
            seller_id: payload.seller_id.clone(),
            provider: payload.provider,
            filename: payload.file_name.clone(),
            content_type: payload.content_type.clone(),
            doc_type: payload.doc_type.clone(),
            parser_status: ParserStatus::Pending,
            ingested_at: Utc::now(),
        };
        self.queue.enqueue(document).await?;
        Ok(response)
    }
}

#[derive(Clone)]
pub struct ApiState {
    service: Arc<dyn IngestionService>,
}

pub fn router(service: Arc<dyn IngestionService>) -> Router<ApiState> {
    Router::new()
        .route("/upload-url", post(create_upload_handler))
        .with_state(ApiState { service })
}

async fn create_upload_handler(
    State(state): State<ApiState>,
    Json(payload): Json<UploadRequestPayload>,
) -> Result<Json<SignedUploadResponse>, ApiError> {
    let span = info_span!("create_upload_url", seller = %payload.seller_id);
    let result = state
        .service
        .create_upload(payload)
        .instrument(span)
        .await
        .map(Json);
    result.map_err(ApiError)
}

#[derive(Debug)]
pub struct ApiError(IngestError);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Upstream(_) => StatusCode::BAD_GATEWAY,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Default)]
pub struct MockUploadSigner;

#[async_trait]
impl UploadSigner for MockUploadSigner {
    async fn sign(&self, payload: &UploadRequestPayload) -> IngestResult<SignedUploadResponse> {
        let document_id = generate_document_id();
        Ok(SignedUploadResponse {
            document_id,
            upload_url: format!(
                "https://mock-storage/{}/{}",
                payload.seller_id, payload.file_name
            ),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            fields: serde_json::json!({ "token": "mock-token" }),
        })
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    documents: RwLock<Vec<EvidenceDocument>>,
}

impl InMemoryQueue {
    pub async fn documents(&self) -> Vec<EvidenceDocument> {
        self.documents.read().await.clone()
    }
}

#[async_trait]
impl IngestionQueue for InMemoryQueue {
    async fn enqueue(&self, document: EvidenceDocument) -> IngestResult<()> {
        self.documents.write().await.push(document);
        Ok(())
    }
}

pub mod cli {
    use super::*;

    #[derive(Clone)]
    pub struct CliHarness {
        service: Arc<dyn IngestionService>,
    }

    impl CliHarness {
        #[must_use]
        pub fn new(service: Arc<dyn IngestionService>) -> Self {
            Self { service }
        }

        pub async fn simulate_signed_upload(
            &self,
            seller_id: SellerId,
            provider: Provider,
            file_name: &str,
            content_length: u64,
        ) -> IngestResult<SignedUploadResponse> {
            self.service
                .create_upload(UploadRequestPayload {
                    seller_id,
                    provider,
                    file_name: file_name.to_string(),
                    content_type: mime_guess::from_path(file_name)
                        .first_raw()
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    content_length,
                    doc_type: None,
                })
                .await
        }
    }
}

pub fn generate_document_id() -> DocumentId {
    Uuid::new_v4().to_string()
}
