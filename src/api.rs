//! HTTP surface for Rusty Corpus.
//!
//! This module exposes a compact Axum router over any [`PipelineApi`]:
//!
//! - `POST /documents` – Redact, chunk and submit documents; returns the operation id.
//! - `GET /operations/:id` – Snapshot of an operation's progress.
//! - `POST /operations/:id/cancel` – Cancel a running operation.
//! - `DELETE /operations/:id` – Release a finished operation's in-memory state.
//! - `GET /operations/:id/insights?level=N` – Aggregate completed results at level 0, 1 or 2.
//! - `POST /search` – Similarity search over stored vectors.
//! - `GET /metrics` – Pipeline counters.

use crate::batch::BatchError;
use crate::error::PipelineError;
use crate::hierarchy::{AggregationError, Insight};
use crate::metrics::MetricsSnapshot;
use crate::privacy::{Document, Metadata, PrivacyError};
use crate::progress::{OperationId, OperationSnapshot, TrackerError};
use crate::rag::{RagError, ScoredRecord};
use crate::service::{IngestReceipt, PipelineApi, SearchRequest};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Build the HTTP router exposing the pipeline.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: PipelineApi + 'static,
{
    Router::new()
        .route("/documents", post(ingest_documents::<S>))
        .route(
            "/operations/:id",
            get(get_operation::<S>).delete(forget_operation::<S>),
        )
        .route("/operations/:id/cancel", post(cancel_operation::<S>))
        .route("/operations/:id/insights", get(get_insights::<S>))
        .route("/search", post(search::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .with_state(service)
}

/// Request body for `POST /documents`.
#[derive(Deserialize)]
struct IngestRequest {
    documents: Vec<DocumentPayload>,
}

#[derive(Deserialize)]
struct DocumentPayload {
    id: String,
    text: String,
    #[serde(default)]
    metadata: Metadata,
}

impl From<DocumentPayload> for Document {
    fn from(payload: DocumentPayload) -> Self {
        Document {
            id: payload.id,
            text: payload.text,
            metadata: payload.metadata,
        }
    }
}

async fn ingest_documents<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestReceipt>), AppError>
where
    S: PipelineApi,
{
    let documents = request.documents.into_iter().map(Document::from).collect();
    let receipt = service.ingest(documents).await?;
    tracing::info!(
        operation = %receipt.operation,
        documents = receipt.documents,
        chunks = receipt.chunks,
        rejected = receipt.rejected.len(),
        "Ingest request accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_operation<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<OperationSnapshot>, AppError>
where
    S: PipelineApi,
{
    let operation = parse_operation(&id)?;
    Ok(Json(service.status(operation).await?))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_operation<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError>
where
    S: PipelineApi,
{
    let operation = parse_operation(&id)?;
    let cancelled = service.cancel(operation).await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Serialize)]
struct ForgetResponse {
    forgotten: bool,
}

async fn forget_operation<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<ForgetResponse>, AppError>
where
    S: PipelineApi,
{
    let operation = parse_operation(&id)?;
    let forgotten = service.forget(operation).await?;
    Ok(Json(ForgetResponse { forgotten }))
}

#[derive(Deserialize)]
struct InsightQuery {
    #[serde(default)]
    level: u8,
}

/// Aggregate an operation's completed results.
///
/// Returns 409 while items are still pending or running.
async fn get_insights<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
    Query(query): Query<InsightQuery>,
) -> Result<Json<Vec<Insight>>, AppError>
where
    S: PipelineApi,
{
    let operation = parse_operation(&id)?;
    Ok(Json(service.aggregate(operation, query.level).await?))
}

async fn search<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<ScoredRecord>>, AppError>
where
    S: PipelineApi,
{
    Ok(Json(service.search(request).await?))
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: PipelineApi,
{
    Json(service.metrics_snapshot())
}

fn parse_operation(raw: &str) -> Result<OperationId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid operation id `{raw}`")))
}

enum AppError {
    BadRequest(String),
    Pipeline(PipelineError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Pipeline(error) => pipeline_status(error),
        }
    }
}

fn pipeline_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation(_)
        | PipelineError::Batch(BatchError::Validation(_) | BatchError::DuplicateItem(_))
        | PipelineError::Rag(RagError::DimensionMismatch { .. })
        | PipelineError::Rag(RagError::NonFiniteEmbedding { .. })
        | PipelineError::Aggregation(AggregationError::InvalidLevel(_)) => StatusCode::BAD_REQUEST,
        PipelineError::Tracker(TrackerError::UnknownOperation(_))
        | PipelineError::Batch(BatchError::Tracker(TrackerError::UnknownOperation(_)))
        | PipelineError::Aggregation(AggregationError::UnknownOperation(_)) => {
            StatusCode::NOT_FOUND
        }
        PipelineError::Tracker(TrackerError::InvalidTransition { .. })
        | PipelineError::Aggregation(AggregationError::IncompleteInput { .. }) => {
            StatusCode::CONFLICT
        }
        PipelineError::Privacy(PrivacyError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(message) => message.clone(),
            Self::Pipeline(error) => error.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self::Pipeline(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::create_router;
    use crate::error::PipelineError;
    use crate::hierarchy::{AggregationError, Insight};
    use crate::metrics::MetricsSnapshot;
    use crate::privacy::Document;
    use crate::progress::{OperationId, OperationSnapshot, OperationState, TrackerError};
    use crate::rag::{ScoredRecord, VectorRecord};
    use crate::service::{IngestReceipt, PipelineApi, SearchRequest};
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubPipeline {
        known: Option<OperationId>,
        ingested: Mutex<Vec<Document>>,
        searches: Mutex<Vec<SearchRequest>>,
    }

    impl StubPipeline {
        fn with_operation(operation: OperationId) -> Self {
            Self {
                known: Some(operation),
                ..Self::default()
            }
        }

        fn lookup(&self, operation: OperationId) -> Result<(), PipelineError> {
            if self.known == Some(operation) {
                Ok(())
            } else {
                Err(TrackerError::UnknownOperation(operation).into())
            }
        }

        fn snapshot(operation: OperationId) -> OperationSnapshot {
            OperationSnapshot {
                id: operation,
                state: OperationState::Running,
                total: 4,
                completed: 1,
                failed_count: 0,
                failed_items: Vec::new(),
                cancelled: 0,
                retries: 2,
                eta_ms: Some(300),
                metadata: BTreeMap::new(),
                error: None,
                created_at: "2024-01-01T00:00:00Z".into(),
                updated_at: "2024-01-01T00:00:01Z".into(),
            }
        }
    }

    #[async_trait]
    impl PipelineApi for StubPipeline {
        async fn ingest(&self, documents: Vec<Document>) -> Result<IngestReceipt, PipelineError> {
            let count = documents.len();
            self.ingested.lock().await.extend(documents);
            Ok(IngestReceipt {
                operation: self.known.unwrap_or_default(),
                documents: count,
                chunks: count * 2,
                rejected: Vec::new(),
            })
        }

        async fn wait(&self, operation: OperationId) -> Result<OperationSnapshot, PipelineError> {
            self.status(operation).await
        }

        async fn status(
            &self,
            operation: OperationId,
        ) -> Result<OperationSnapshot, PipelineError> {
            self.lookup(operation)?;
            Ok(Self::snapshot(operation))
        }

        async fn cancel(&self, operation: OperationId) -> Result<bool, PipelineError> {
            self.lookup(operation)?;
            Ok(true)
        }

        async fn forget(&self, operation: OperationId) -> Result<bool, PipelineError> {
            self.lookup(operation)?;
            Ok(false)
        }

        async fn aggregate(
            &self,
            operation: OperationId,
            level: u8,
        ) -> Result<Vec<Insight>, PipelineError> {
            self.lookup(operation)?;
            match level {
                0..=1 => Err(AggregationError::IncompleteInput {
                    operation,
                    pending: 2,
                    running: 1,
                }
                .into()),
                2 => Ok(Vec::new()),
                other => Err(AggregationError::InvalidLevel(other).into()),
            }
        }

        async fn search(
            &self,
            request: SearchRequest,
        ) -> Result<Vec<ScoredRecord>, PipelineError> {
            self.searches.lock().await.push(request);
            Ok(vec![ScoredRecord {
                record: VectorRecord::new("doc#0", vec![1.0, 0.0]),
                similarity: 0.9,
            }])
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                documents_chunked: 3,
                ..MetricsSnapshot::default()
            }
        }
    }

    async fn send(
        service: Arc<StubPipeline>,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let app = create_router(service);
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    #[tokio::test]
    async fn ingest_route_forwards_documents_with_metadata() {
        let operation = OperationId::new();
        let service = Arc::new(StubPipeline::with_operation(operation));
        let payload = json!({
            "documents": [
                { "id": "a", "text": "Alpha text.", "metadata": { "source": "crm" } },
                { "id": "b", "text": "Beta text." }
            ]
        });

        let (status, body) = send(service.clone(), Method::POST, "/documents", Some(payload)).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["operation"], operation.to_string());
        assert_eq!(body["chunks"], 4);
        let ingested = service.ingested.lock().await;
        assert_eq!(ingested.len(), 2);
        assert_eq!(ingested[0].metadata.get("source").map(String::as_str), Some("crm"));
        assert!(ingested[1].metadata.is_empty());
    }

    #[tokio::test]
    async fn status_route_returns_snapshot_or_not_found() {
        let operation = OperationId::new();
        let service = Arc::new(StubPipeline::with_operation(operation));

        let (status, body) = send(
            service.clone(),
            Method::GET,
            &format!("/operations/{operation}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "running");
        assert_eq!(body["retries"], 2);

        let (status, body) = send(
            service.clone(),
            Method::GET,
            &format!("/operations/{}", OperationId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().is_some());

        let (status, _) = send(service, Method::GET, "/operations/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_route_reports_outcome() {
        let operation = OperationId::new();
        let service = Arc::new(StubPipeline::with_operation(operation));
        let (status, body) = send(
            service,
            Method::POST,
            &format!("/operations/{operation}/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);
    }

    #[tokio::test]
    async fn delete_route_reports_release_or_not_found() {
        let operation = OperationId::new();
        let service = Arc::new(StubPipeline::with_operation(operation));
        let (status, body) = send(
            service.clone(),
            Method::DELETE,
            &format!("/operations/{operation}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["forgotten"], false);

        let (status, _) = send(
            service,
            Method::DELETE,
            &format!("/operations/{}", OperationId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn insights_route_maps_aggregation_errors() {
        let operation = OperationId::new();
        let service = Arc::new(StubPipeline::with_operation(operation));

        let (status, _) = send(
            service.clone(),
            Method::GET,
            &format!("/operations/{operation}/insights?level=1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            service.clone(),
            Method::GET,
            &format!("/operations/{operation}/insights?level=7"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            service,
            Method::GET,
            &format!("/operations/{operation}/insights?level=2"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn search_route_applies_defaults() {
        let service = Arc::new(StubPipeline::default());
        let payload = json!({
            "embedding": [1.0, 0.0],
            "filter": { "must": [{ "match": "equals", "key": "document_id", "value": "doc" }] }
        });

        let (status, body) = send(service.clone(), Method::POST, "/search", Some(payload)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["record"]["id"], "doc#0");
        let searches = service.searches.lock().await;
        assert_eq!(searches[0].k, 10);
        assert!(searches[0].namespace.is_none());
        assert!(!searches[0].filter.is_empty());
    }

    #[tokio::test]
    async fn metrics_route_serializes_snapshot() {
        let service = Arc::new(StubPipeline::default());
        let (status, body) = send(service, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents_chunked"], 3);
        assert_eq!(body["retries"], 0);
    }
}
