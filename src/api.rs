//! HTTP surface for the document QA pipeline.
//!
//! This module exposes a compact Axum router:
//!
//! - `GET /ping` – Liveness probe.
//! - `POST /documents` – Extract, chunk and index one document. Accepts either raw `text` (with
//!   an optional `mime_type`) or pre-extracted `pages`, plus an optional explicit `id`.
//! - `GET /documents` – List stored documents with their chunk counts.
//! - `DELETE /documents/:id` – Remove a document, its chunks and their vectors.
//! - `POST /ask` – Retrieve, answer per document and aggregate cross-document themes.
//! - `GET /metrics` – Observe ingestion and answering counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.
//!
//! The CLI drives the same [`ProcessingApi`], so behavior is identical across interfaces.

use crate::extraction::{ExtractedPage, ExtractionError};
use crate::index::IndexError;
use crate::processing::{
    AskError, AskRequest, AskResponse, ChunkError, DocumentContent, DocumentId, DocumentInput,
    DocumentRecord, IngestError, IngestSummary, ProcessingApi,
};
use crate::retrieval::SearchError;
use crate::synthesis::SynthesisError;
use crate::themes::ThemeReport;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Build the HTTP router exposing the pipeline.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: ProcessingApi + 'static,
{
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/documents",
            get(list_documents::<S>).post(ingest_document::<S>),
        )
        .route("/documents/:id", delete(delete_document::<S>))
        .route("/ask", post(ask::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

async fn ping() -> &'static str {
    "pong"
}

/// Request body for `POST /documents`.
#[derive(Deserialize)]
struct IngestRequest {
    /// Optional explicit identifier (defaults to `name`).
    #[serde(default)]
    id: Option<String>,
    /// Display name, typically the file name.
    name: String,
    /// Raw document text.
    #[serde(default)]
    text: Option<String>,
    /// MIME type of `text` (defaults to `text/plain`).
    #[serde(default)]
    mime_type: Option<String>,
    /// Pre-extracted pages; takes precedence over `text`.
    #[serde(default)]
    pages: Option<Vec<PagePayload>>,
}

#[derive(Deserialize)]
struct PagePayload {
    page_number: u32,
    text: String,
}

/// Extract, chunk and index a document.
async fn ingest_document<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestSummary>, AppError>
where
    S: ProcessingApi,
{
    let IngestRequest {
        id,
        name,
        text,
        mime_type,
        pages,
    } = request;

    let content = match (pages, text) {
        (Some(pages), _) => DocumentContent::Pages(
            pages
                .into_iter()
                .map(|page| ExtractedPage {
                    page_number: page.page_number,
                    text: page.text,
                })
                .collect(),
        ),
        (None, Some(text)) => DocumentContent::Raw {
            bytes: text.into_bytes(),
            mime_type: mime_type.unwrap_or_else(|| "text/plain".into()),
        },
        (None, None) => {
            return Err(AppError::BadRequest(
                "either `text` or `pages` must be provided".into(),
            ));
        }
    };

    let summary = service
        .ingest_document(DocumentInput { id, name, content })
        .await?;
    tracing::info!(
        document_id = %summary.document_id,
        pages = summary.page_count,
        chunks = summary.chunk_count,
        "Ingest request completed"
    );
    Ok(Json(summary))
}

/// Entry of the `GET /documents` response.
#[derive(Serialize)]
struct DocumentView {
    id: DocumentId,
    name: String,
    mime_type: String,
    page_count: usize,
    chunk_count: usize,
    ingested_at: String,
    fingerprint: String,
}

impl From<DocumentRecord> for DocumentView {
    fn from(record: DocumentRecord) -> Self {
        Self {
            chunk_count: record.chunk_ids.len(),
            id: record.id,
            name: record.name,
            mime_type: record.mime_type,
            page_count: record.page_count,
            ingested_at: record.ingested_at,
            fingerprint: record.fingerprint,
        }
    }
}

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<DocumentView>,
}

/// List stored documents.
async fn list_documents<S>(State(service): State<Arc<S>>) -> Json<DocumentsResponse>
where
    S: ProcessingApi,
{
    let documents = service
        .list_documents()
        .await
        .into_iter()
        .map(DocumentView::from)
        .collect();
    Json(DocumentsResponse { documents })
}

/// Remove a document and everything derived from it.
async fn delete_document<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError>
where
    S: ProcessingApi,
{
    let record = service.delete_document(&DocumentId::new(id)).await?;
    Ok(Json(record.into()))
}

/// Request body for `POST /ask`.
#[derive(Deserialize)]
struct AskPayload {
    question: String,
    #[serde(default)]
    top_k: Option<i64>,
    #[serde(default)]
    min_score: Option<f32>,
    #[serde(default)]
    documents: Option<Vec<String>>,
}

#[derive(Serialize)]
struct RetrievedView {
    chunk_id: u64,
    document_id: DocumentId,
    page_number: u32,
    paragraph_index: u32,
    score: f32,
    text: String,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AnswerView {
    Answered {
        document_id: DocumentId,
        answer: crate::synthesis::Answer,
    },
    Failed {
        document_id: DocumentId,
        error: String,
    },
}

#[derive(Serialize)]
struct AskResponseBody {
    question: String,
    retrieved: Vec<RetrievedView>,
    answers: Vec<AnswerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    themes: Option<ThemeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    themes_error: Option<String>,
}

impl From<AskResponse> for AskResponseBody {
    fn from(response: AskResponse) -> Self {
        let retrieved = response
            .retrieved
            .hits()
            .iter()
            .map(|hit| RetrievedView {
                chunk_id: hit.chunk.chunk_id.get(),
                document_id: hit.chunk.document_id.clone(),
                page_number: hit.chunk.page_number,
                paragraph_index: hit.chunk.paragraph_index,
                score: hit.score,
                text: hit.chunk.text.clone(),
            })
            .collect();

        let answers = response
            .answers
            .into_iter()
            .map(|outcome| match outcome.result {
                Ok(answer) => AnswerView::Answered {
                    document_id: outcome.document_id,
                    answer,
                },
                Err(error) => AnswerView::Failed {
                    document_id: outcome.document_id,
                    error: error.to_string(),
                },
            })
            .collect();

        let (themes, themes_error) = match response.themes {
            Ok(report) => (Some(report), None),
            Err(error) => (None, Some(error.to_string())),
        };

        Self {
            question: response.question,
            retrieved,
            answers,
            themes,
            themes_error,
        }
    }
}

/// Answer a question across the indexed documents.
async fn ask<S>(
    State(service): State<Arc<S>>,
    Json(payload): Json<AskPayload>,
) -> Result<Json<AskResponseBody>, AppError>
where
    S: ProcessingApi,
{
    let request = AskRequest {
        question: payload.question,
        top_k: payload.top_k,
        min_score: payload.min_score,
        documents: payload
            .documents
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.into_iter().map(DocumentId::new).collect()),
    };
    let response = service.ask(request).await?;
    let failed = response
        .answers
        .iter()
        .filter(|outcome| matches!(outcome.result, Err(SynthesisError::SynthesisFailed { .. })))
        .count();
    tracing::info!(
        hits = response.retrieved.len(),
        documents = response.answers.len(),
        failed,
        "Ask request completed"
    );
    Ok(Json(response.into()))
}

/// Return the current pipeline counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<crate::metrics::MetricsSnapshot>
where
    S: ProcessingApi,
{
    Json(service.metrics_snapshot())
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/documents",
                description: "Extract, chunk and index one document. Response returns { \"document_id\": string, \"page_count\": number, \"chunk_count\": number }.",
                request_example: Some(json!({
                    "name": "report.txt",
                    "text": "Document contents"
                })),
            },
            CommandDescriptor {
                name: "list_documents",
                method: "GET",
                path: "/documents",
                description: "Return stored documents with page and chunk counts.",
                request_example: None,
            },
            CommandDescriptor {
                name: "delete_document",
                method: "DELETE",
                path: "/documents/:id",
                description: "Remove a document together with its chunks and vectors.",
                request_example: None,
            },
            CommandDescriptor {
                name: "ask",
                method: "POST",
                path: "/ask",
                description: "Answer a question per document with chunk citations, then aggregate cross-document themes.",
                request_example: Some(json!({
                    "question": "What drove costs up?",
                    "top_k": 10,
                    "min_score": 0.2,
                    "documents": ["report.txt"]
                })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return ingestion and answering counters.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    BadRequest(String),
    Ingest(IngestError),
    Ask(AskError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Ingest(error) => match error {
                IngestError::Extraction(ExtractionError::Unsupported { .. }) => {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
                IngestError::Extraction(ExtractionError::Corrupt(_)) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                IngestError::Extraction(ExtractionError::Collaborator(_)) => StatusCode::BAD_GATEWAY,
                IngestError::Chunking(ChunkError::DuplicateDocument { .. }) => StatusCode::CONFLICT,
                IngestError::Chunking(_) => StatusCode::BAD_REQUEST,
                IngestError::Index(IndexError::Embedding(_)) => StatusCode::BAD_GATEWAY,
                IngestError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
                IngestError::UnknownDocument(_) => StatusCode::NOT_FOUND,
            },
            Self::Ask(AskError::Search(error)) => match error {
                SearchError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
                SearchError::Index(IndexError::Embedding(_)) => StatusCode::BAD_GATEWAY,
                SearchError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(message) => message.clone(),
            Self::Ingest(error) => error.to_string(),
            Self::Ask(error) => error.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(inner: IngestError) -> Self {
        Self::Ingest(inner)
    }
}

impl From<AskError> for AppError {
    fn from(inner: AskError) -> Self {
        Self::Ask(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::metrics::MetricsSnapshot;
    use crate::processing::{
        AskError, AskRequest, AskResponse, Chunk, ChunkId, DocumentContent, DocumentId,
        DocumentInput, DocumentRecord, IngestError, IngestSummary, ProcessingApi,
    };
    use crate::retrieval::{RetrievalResult, ScoredChunk, SearchError};
    use crate::synthesis::{Answer, DocumentOutcome};
    use crate::themes::ThemeError;
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[tokio::test]
    async fn commands_catalog_exposes_ask_endpoint() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let ask = commands
            .iter()
            .find(|cmd| cmd.name == "ask")
            .expect("ask command present");

        assert_eq!(ask.method, "POST");
        assert_eq!(ask.path, "/ask");
        assert!(commands.iter().any(|cmd| cmd.path == "/documents"));
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let app = create_router(Arc::new(StubPipeline::default()));
        let response = send(app, Method::GET, "/ping", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn ingest_route_accepts_pre_extracted_pages() {
        let service = Arc::new(StubPipeline::default());
        let app = create_router(service.clone());

        let payload = json!({
            "id": "doc-1",
            "name": "scan.pdf",
            "pages": [
                { "page_number": 1, "text": "First page." },
                { "page_number": 2, "text": "Second page." }
            ]
        });
        let response = send(app, Method::POST, "/documents", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["document_id"], "doc-1");
        assert_eq!(json["page_count"], 2);

        let calls = service.ingested.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("doc-1"));
        assert!(matches!(&calls[0].content, DocumentContent::Pages(pages) if pages.len() == 2));
    }

    #[tokio::test]
    async fn ingest_route_requires_content() {
        let app = create_router(Arc::new(StubPipeline::default()));
        let response = send(
            app,
            Method::POST,
            "/documents",
            Some(json!({ "name": "empty.txt" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_document_maps_to_conflict() {
        let app = create_router(Arc::new(StubPipeline::default()));
        let response = send(
            app,
            Method::POST,
            "/documents",
            Some(json!({ "name": "taken.txt", "text": "Body" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn deleting_unknown_document_is_not_found() {
        let app = create_router(Arc::new(StubPipeline::default()));
        let response = send(app, Method::DELETE, "/documents/missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn invalid_query_is_bad_request() {
        let app = create_router(Arc::new(StubPipeline::default()));
        let response = send(
            app,
            Method::POST,
            "/ask",
            Some(json!({ "question": "Why?", "top_k": 0 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ask_route_reports_answers_and_failures() {
        let service = Arc::new(StubPipeline::default());
        let app = create_router(service.clone());
        let response = send(
            app,
            Method::POST,
            "/ask",
            Some(json!({ "question": "Why?", "top_k": 3, "documents": ["a"] })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["retrieved"][0]["chunk_id"], 7);
        assert_eq!(json["answers"][0]["status"], "answered");
        assert_eq!(json["answers"][0]["answer"]["citations"][0]["chunk_id"], 7);
        assert_eq!(json["answers"][1]["status"], "failed");
        assert!(json.get("themes").is_none());
        assert!(json["themes_error"].is_string());

        let asked = service.asked.lock().await;
        assert_eq!(asked[0].top_k, Some(3));
        assert_eq!(asked[0].documents, Some(vec![DocumentId::new("a")]));
    }

    async fn send(app: axum::Router, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.oneshot(request.body(body).expect("request"))
            .await
            .expect("router response")
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    #[derive(Default)]
    struct StubPipeline {
        ingested: Mutex<Vec<DocumentInput>>,
        asked: Mutex<Vec<AskRequest>>,
    }

    #[async_trait]
    impl ProcessingApi for StubPipeline {
        async fn ingest_document(
            &self,
            input: DocumentInput,
        ) -> Result<IngestSummary, IngestError> {
            if input.name == "taken.txt" {
                return Err(crate::processing::ChunkError::DuplicateDocument {
                    document_id: DocumentId::new("taken.txt"),
                }
                .into());
            }
            let page_count = match &input.content {
                DocumentContent::Pages(pages) => pages.len(),
                DocumentContent::Raw { .. } => 1,
            };
            let document_id = DocumentId::new(input.id.clone().unwrap_or(input.name.clone()));
            self.ingested.lock().await.push(input);
            Ok(IngestSummary {
                document_id,
                page_count,
                chunk_count: page_count,
            })
        }

        async fn ask(&self, request: AskRequest) -> Result<AskResponse, AskError> {
            if request.top_k.is_some_and(|k| k <= 0) {
                return Err(SearchError::InvalidQuery("top_k must be greater than zero".into()).into());
            }
            self.asked.lock().await.push(request.clone());

            let chunk = Arc::new(Chunk {
                chunk_id: ChunkId::new(7),
                document_id: DocumentId::new("a"),
                page_number: 1,
                paragraph_index: 0,
                text: "Because of rain.".into(),
            });
            let answered = DocumentOutcome {
                document_id: DocumentId::new("a"),
                result: Ok(Answer {
                    document_id: DocumentId::new("a"),
                    text: "Rain [[chunk:7]].".into(),
                    citations: vec![chunk.citation()],
                }),
            };
            let failed = DocumentOutcome {
                document_id: DocumentId::new("b"),
                result: Err(crate::synthesis::SynthesisError::EmptyContext),
            };
            Ok(AskResponse {
                question: request.question,
                retrieved: RetrievalResult::new(vec![ScoredChunk { chunk, score: 0.9 }]),
                answers: vec![answered, failed],
                themes: Err(ThemeError::NoAnswersAvailable),
            })
        }

        async fn list_documents(&self) -> Vec<DocumentRecord> {
            Vec::new()
        }

        async fn delete_document(
            &self,
            document_id: &DocumentId,
        ) -> Result<DocumentRecord, IngestError> {
            Err(IngestError::UnknownDocument(document_id.clone()))
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }
}
