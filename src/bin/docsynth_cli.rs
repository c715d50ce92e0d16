use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docsynth::{
    config::Config,
    extraction::mime_for_path,
    logging,
    processing::{
        AskRequest, DocumentContent, DocumentId, DocumentInput, DocumentPipeline,
    },
};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "docsynth-cli",
    about = "Ingest documents and ask grounded questions from the command line"
)]
struct Cli {
    /// Snapshot file holding the index between runs (overrides INDEX_SNAPSHOT_PATH).
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest files or directories of supported documents.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Ask a question across the indexed documents.
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<i64>,
        #[arg(long)]
        min_score: Option<f32>,
        /// Restrict retrieval to these document ids (repeatable).
        #[arg(long = "document")]
        documents: Vec<String>,
    },
    /// List stored documents.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete a document and its chunks.
    Delete { id: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(path) = cli.snapshot {
        config.index_snapshot_path = Some(path);
    }
    if config.index_snapshot_path.is_none() {
        tracing::warn!("No snapshot path configured; state will not outlive this run");
    }

    let pipeline = DocumentPipeline::from_config(&config)
        .await
        .context("failed to initialize pipeline")?;

    match cli.command {
        Command::Ingest { paths } => ingest(&pipeline, &paths).await,
        Command::Ask {
            question,
            top_k,
            min_score,
            documents,
        } => {
            let request = AskRequest {
                question,
                top_k,
                min_score,
                documents: (!documents.is_empty())
                    .then(|| documents.into_iter().map(DocumentId::new).collect()),
            };
            ask(&pipeline, request).await
        }
        Command::List { json } => {
            let documents = pipeline.documents().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&documents)?);
            } else {
                for record in documents {
                    println!(
                        "{}\t{} pages\t{} chunks\t{}",
                        record.id,
                        record.page_count,
                        record.chunk_ids.len(),
                        record.ingested_at
                    );
                }
            }
            Ok(())
        }
        Command::Delete { id } => {
            let record = pipeline.delete_document(&DocumentId::new(id)).await?;
            println!("deleted {} ({} chunks)", record.id, record.chunk_ids.len());
            Ok(())
        }
    }
}

async fn ingest(pipeline: &DocumentPipeline, paths: &[PathBuf]) -> Result<()> {
    let files = collect_files(paths)?;
    if files.is_empty() {
        bail!("no supported documents found");
    }

    let mut inputs = Vec::with_capacity(files.len());
    for (path, mime_type) in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        inputs.push(DocumentInput {
            id: None,
            name,
            content: DocumentContent::Raw {
                bytes,
                mime_type: mime_type.to_string(),
            },
        });
    }

    let reports = pipeline.ingest_batch(inputs).await?;
    let mut failed = 0;
    for report in reports {
        match report.result {
            Ok(summary) => println!(
                "indexed {}\t{} pages\t{} chunks",
                summary.document_id, summary.page_count, summary.chunk_count
            ),
            Err(err) => {
                failed += 1;
                println!("skipped {}\t{err}", report.document_id);
            }
        }
    }
    if failed > 0 {
        eprintln!("{failed} document(s) skipped");
    }
    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<(PathBuf, &'static str)>> {
    let mut files = Vec::new();
    for root in paths {
        if !root.exists() {
            bail!("{} does not exist", root.display());
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path: &Path = entry.path();
            match mime_for_path(path) {
                Some(mime_type) => files.push((path.to_path_buf(), mime_type)),
                None => tracing::debug!(path = %path.display(), "Skipping unsupported file"),
            }
        }
    }
    Ok(files)
}

async fn ask(pipeline: &DocumentPipeline, request: AskRequest) -> Result<()> {
    let response = pipeline.ask(request).await?;
    if response.retrieved.is_empty() {
        println!("No relevant passages found.");
        return Ok(());
    }

    println!("# {}\n", response.question);
    for outcome in &response.answers {
        match &outcome.result {
            Ok(answer) => {
                println!("## {}\n{}", outcome.document_id, answer.text);
                for citation in &answer.citations {
                    println!(
                        "  [chunk {}] page {}, paragraph {}",
                        citation.chunk_id, citation.page_number, citation.paragraph_index
                    );
                }
                println!();
            }
            Err(err) => println!("## {}\n(failed: {err})\n", outcome.document_id),
        }
    }

    match &response.themes {
        Ok(report) => {
            for (position, theme) in report.themes.iter().enumerate() {
                let documents: Vec<&str> = theme
                    .supporting
                    .iter()
                    .map(|support| support.document_id.as_str())
                    .collect();
                println!(
                    "Theme {}: {}\n  {}\n  Documents: {}",
                    position + 1,
                    theme.title,
                    theme.summary,
                    documents.join(", ")
                );
            }
            if let Some(answer) = &report.synthesized_answer {
                println!("\nSynthesized answer:\n{answer}");
            }
        }
        Err(err) => println!("No themes: {err}"),
    }
    Ok(())
}
