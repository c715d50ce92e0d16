use std::{path::PathBuf, sync::Arc, time::Duration};

use docsynth::{
    config::{Config, EmbeddingProvider, LlmProvider},
    embedding::HashingEmbeddingClient,
    extraction::PlainTextExtractor,
    llm::OllamaLanguageModel,
    processing::{AskRequest, DocumentInput, DocumentPipeline, PipelineSettings},
    synthesis::{RetryPolicy, SynthesisError, SynthesisSettings},
};
use httpmock::{Method::POST, MockServer};
use serde_json::json;

const THEME_REPLY: &str = "THEMES:\n1. Harbour Economy\n   - Trade flows through the harbour.\n   - Documents: D1, D2\n\nSYNTHESIZED ANSWER:\nThe harbour anchors the local economy.";

fn settings(snapshot_path: Option<PathBuf>) -> PipelineSettings {
    PipelineSettings {
        synthesis: SynthesisSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            call_timeout: Duration::from_secs(5),
            ..SynthesisSettings::default()
        },
        default_min_score: 0.0,
        snapshot_path,
        ..PipelineSettings::default()
    }
}

fn pipeline(server: &MockServer, settings: PipelineSettings) -> DocumentPipeline {
    let model = Arc::new(OllamaLanguageModel::new(server.base_url(), "llama3.1").expect("model"));
    DocumentPipeline::new(
        Arc::new(HashingEmbeddingClient::new("integration", 256)),
        model.clone(),
        model,
        Arc::new(PlainTextExtractor::new()),
        settings,
    )
}

async fn ingest_fixtures(pipeline: &DocumentPipeline, second: &str) {
    pipeline
        .ingest(DocumentInput::text(
            "harbour.txt",
            "The harbour moves grain and timber for the region.\n\nDredging keeps the harbour open in winter.",
        ))
        .await
        .expect("ingest harbour");
    pipeline
        .ingest(DocumentInput::text(
            second,
            "Customs fees from the harbour grain trade fund the town budget.",
        ))
        .await
        .expect("ingest second document");
}

#[tokio::test]
async fn question_flows_through_answers_and_themes() {
    let server = MockServer::start_async().await;
    let answers = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"options":{"num_predict":400}}"#);
            then.status(200).json_body(json!({
                "response": "Grain moves through the harbour [[chunk:0]] [[chunk:2]].",
                "done": true
            }));
        })
        .await;
    let themes = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"options":{"num_predict":600}}"#);
            then.status(200)
                .json_body(json!({ "response": THEME_REPLY, "done": true }));
        })
        .await;

    let pipeline = pipeline(&server, settings(None));
    ingest_fixtures(&pipeline, "ledger.txt").await;

    let response = pipeline
        .ask(AskRequest::new("How is harbour grain trade used?"))
        .await
        .expect("ask");

    answers.assert_hits_async(2).await;
    themes.assert_hits_async(1).await;

    assert_eq!(response.answers.len(), 2);
    for outcome in &response.answers {
        let answer = outcome.answer().expect("answer");
        assert_eq!(answer.document_id, outcome.document_id);
        assert!(!answer.citations.is_empty());
        for citation in &answer.citations {
            assert!(response.retrieved.contains(citation.chunk_id));
            assert_eq!(citation.document_id, outcome.document_id);
        }
    }

    let report = response.themes.expect("themes");
    assert_eq!(report.themes.len(), 1);
    assert_eq!(report.themes[0].title, "Harbour Economy");
    assert_eq!(report.themes[0].supporting.len(), 2);
    assert_eq!(
        report.synthesized_answer.as_deref(),
        Some("The harbour anchors the local economy.")
    );
}

#[tokio::test]
async fn failing_document_does_not_block_the_rest() {
    let server = MockServer::start_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"options":{"num_predict":400}}"#)
                .body_contains("harbour.txt");
            then.status(200).json_body(json!({
                "response": "Grain and timber move through it.",
                "done": true
            }));
        })
        .await;
    let outage = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"options":{"num_predict":400}}"#)
                .body_contains("outage.txt");
            then.status(503).body("overloaded");
        })
        .await;
    let themes = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"options":{"num_predict":600}}"#);
            then.status(200)
                .json_body(json!({ "response": THEME_REPLY, "done": true }));
        })
        .await;

    let pipeline = pipeline(&server, settings(None));
    ingest_fixtures(&pipeline, "outage.txt").await;

    let response = pipeline
        .ask(AskRequest::new("How is harbour grain trade used?"))
        .await
        .expect("ask");

    healthy.assert_hits_async(1).await;
    outage.assert_hits_async(2).await;
    themes.assert_hits_async(1).await;

    let failed: Vec<_> = response
        .answers
        .iter()
        .filter(|outcome| outcome.answer().is_none())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].document_id.as_str(), "outage.txt");
    assert!(matches!(
        failed[0].result,
        Err(SynthesisError::SynthesisFailed { attempts: 2, .. })
    ));

    // only the healthy answer is labelled, so D2 is dropped
    let report = response.themes.expect("themes");
    let supporting: Vec<&str> = report.themes[0]
        .supporting
        .iter()
        .map(|support| support.document_id.as_str())
        .collect();
    assert_eq!(supporting, vec!["harbour.txt"]);
    assert_eq!(pipeline.metrics_snapshot().answers_failed, 1);
}

#[tokio::test]
async fn restart_restores_documents_from_snapshot() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        embedding_provider: EmbeddingProvider::Hashing,
        embedding_model: "integration".into(),
        embedding_dimension: 256,
        embedding_timeout_secs: 5,
        llm_provider: LlmProvider::Ollama,
        llm_model: "llama3.1".into(),
        theme_model: None,
        ollama_url: server.base_url(),
        openai_base_url: "https://api.openai.com".into(),
        openai_api_key: None,
        llm_timeout_secs: 5,
        llm_max_tokens: 400,
        theme_max_tokens: 600,
        llm_retry_attempts: 1,
        llm_retry_base_delay_ms: 1,
        synthesis_concurrency: 2,
        ingest_concurrency: 2,
        prompt_token_budget: 3000,
        chunk_min_words: 2,
        chunk_max_chars: 1000,
        search_default_limit: 10,
        search_max_limit: 50,
        search_default_min_score: 0.0,
        index_snapshot_path: Some(dir.path().join("snapshot.json")),
        server_port: None,
    };

    let first = DocumentPipeline::from_config(&config)
        .await
        .expect("first pipeline");
    ingest_fixtures(&first, "ledger.txt").await;
    let before = first.documents().await;
    drop(first);

    let second = DocumentPipeline::from_config(&config)
        .await
        .expect("second pipeline");
    assert_eq!(second.documents().await, before);
    assert_eq!(
        second.index().len().await,
        second.store().chunk_count().await
    );

    let error = second
        .ingest(DocumentInput::text("ledger.txt", "Replacement text here."))
        .await
        .expect_err("duplicate after restart");
    assert!(error.to_string().contains("already ingested"));
}
