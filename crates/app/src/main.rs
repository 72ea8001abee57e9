use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pdf_qa_core::{
    discover_pdf_files, Breakpoint, CharacterNgramEmbedder, ChunkingConfig, Embedder,
    IndexBackend, InMemoryBackend, LopdfExtractor, OpenAiChatModel, OpenAiEmbedder, QaConfig,
    QaPipeline, QaSession, QdrantBackend, RetrievalOptions, RetrievalResult, Role, SplitPolicy,
    UploadedPdf,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "pdf-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    backends: BackendArgs,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args)]
struct BackendArgs {
    /// Embedding backend
    #[arg(long, value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Vector index backend
    #[arg(long, value_enum, default_value_t = IndexKind::Memory)]
    index: IndexKind,

    /// OpenAI API key (chat and embeddings)
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// OpenAI-compatible base URL; point at a local server for local models
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// Chat model name
    #[arg(long, default_value = "gpt-4o")]
    chat_model: String,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Seconds to wait for each remote call to respond
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Prefix for per-ingestion Qdrant collections
    #[arg(long, default_value = "pdf_qa")]
    qdrant_collection_prefix: String,
}

#[derive(Args)]
struct TuningArgs {
    /// Splitting policy
    #[arg(long, value_enum, default_value_t = SplitKind::Fixed)]
    split: SplitKind,

    /// Maximum characters per chunk
    #[arg(long, default_value = "1000")]
    chunk_size: usize,

    /// Characters shared by neighbouring chunks
    #[arg(long, default_value = "200")]
    chunk_overlap: usize,

    /// Semantic split: break below this adjacent-sentence similarity
    #[arg(long, conflicts_with = "breakpoint_percentile")]
    breakpoint_similarity: Option<f32>,

    /// Semantic split: break above this distance percentile
    #[arg(long, default_value = "95")]
    breakpoint_percentile: f32,

    /// Chunks returned per question
    #[arg(long, default_value = "5")]
    k: usize,

    /// Candidates fetched before diversity re-ranking
    #[arg(long, default_value = "20")]
    fetch_k: usize,

    /// Relevance vs. diversity trade-off, 1.0 is pure relevance
    #[arg(long, default_value = "0.7")]
    lambda: f32,

    /// Chunks per embedding request
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Ask the model to answer in this language
    #[arg(long)]
    answer_language: Option<String>,
}

#[derive(Args)]
struct Inputs {
    /// PDF file to ingest; repeatable
    #[arg(long = "pdf")]
    pdfs: Vec<PathBuf>,

    /// Folder searched recursively for PDFs
    #[arg(long)]
    folder: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Ngram,
    Openai,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexKind {
    Memory,
    Qdrant,
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitKind {
    Fixed,
    Semantic,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest PDFs and stream one grounded answer.
    Ask {
        #[command(flatten)]
        inputs: Inputs,
        /// Question to answer
        #[arg(long)]
        question: String,
        /// Print the full supporting chunks, not just their pages.
        #[arg(long, default_value_t = false)]
        show_evidence: bool,
    },
    /// Ingest PDFs and print the chunks retrieved for a query.
    Retrieve {
        #[command(flatten)]
        inputs: Inputs,
        /// Search query
        #[arg(long)]
        query: String,
    },
    /// Ingest PDFs once, then answer questions read from stdin.
    Chat {
        #[command(flatten)]
        inputs: Inputs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "pdf-qa boot"
    );

    let pipeline = Arc::new(build_pipeline(&cli.backends, &cli.tuning)?);
    let mut session = QaSession::new(pipeline);

    let outcome = run(cli.command, &mut session).await;
    session.close().await;
    outcome
}

async fn run(command: Command, session: &mut QaSession) -> anyhow::Result<()> {
    match command {
        Command::Ask {
            inputs,
            question,
            show_evidence,
        } => {
            ingest(session, &inputs).await?;
            let outcome = session.ask(&question, print_fragment).await?;
            println!();
            print_sources(&outcome.evidence);
            if show_evidence {
                print_evidence(&outcome.evidence);
            }
        }
        Command::Retrieve { inputs, query } => {
            ingest(session, &inputs).await?;
            let evidence = session.retrieve_only(&query).await?;
            print_evidence(&evidence);
        }
        Command::Chat { inputs } => {
            ingest(session, &inputs).await?;
            chat(session).await?;
        }
    }

    Ok(())
}

fn build_pipeline(backends: &BackendArgs, tuning: &TuningArgs) -> anyhow::Result<QaPipeline> {
    let timeout = Duration::from_secs(backends.timeout_secs);
    let openai_base = Url::parse(&backends.openai_base_url)
        .with_context(|| format!("invalid openai base url {}", backends.openai_base_url))?;

    let embedder: Arc<dyn Embedder> = match backends.embedder {
        EmbedderKind::Ngram => Arc::new(CharacterNgramEmbedder::default()),
        EmbedderKind::Openai => {
            let api_key = backends
                .openai_api_key
                .clone()
                .context("--embedder openai requires OPENAI_API_KEY")?;
            Arc::new(
                OpenAiEmbedder::new(api_key)?
                    .with_base_url(openai_base.as_str())
                    .with_model(&backends.embedding_model)
                    .with_timeout(timeout)?,
            )
        }
    };

    let backend: Arc<dyn IndexBackend> = match backends.index {
        IndexKind::Memory => Arc::new(InMemoryBackend),
        IndexKind::Qdrant => {
            let qdrant = Url::parse(&backends.qdrant_url)
                .with_context(|| format!("invalid qdrant url {}", backends.qdrant_url))?;
            Arc::new(
                QdrantBackend::new(qdrant.as_str(), &backends.qdrant_collection_prefix)
                    .with_timeout(timeout)?,
            )
        }
    };

    if backends.openai_api_key.is_none() && openai_base.host_str() == Some("api.openai.com") {
        warn!("OPENAI_API_KEY is not set; answering will fail against api.openai.com");
    }
    let model = OpenAiChatModel::new(backends.openai_api_key.clone())
        .with_base_url(openai_base.as_str())
        .with_model(&backends.chat_model)
        .with_timeout(timeout);

    let split = match tuning.split {
        SplitKind::Fixed => SplitPolicy::FixedWindow,
        SplitKind::Semantic => SplitPolicy::Semantic {
            breakpoint: match tuning.breakpoint_similarity {
                Some(threshold) => Breakpoint::Similarity(threshold),
                None => Breakpoint::Percentile(tuning.breakpoint_percentile),
            },
        },
    };

    let config = QaConfig {
        chunking: ChunkingConfig {
            chunk_size: tuning.chunk_size,
            overlap: tuning.chunk_overlap,
        },
        split,
        retrieval: RetrievalOptions {
            k: tuning.k,
            fetch_k: tuning.fetch_k,
            lambda: tuning.lambda,
        },
        embedding_batch_size: tuning.batch_size,
        answer_language: tuning.answer_language.clone(),
    };

    Ok(QaPipeline::new(
        config,
        Arc::new(LopdfExtractor),
        embedder,
        backend,
        Arc::new(model),
    )?)
}

fn collect_uploads(inputs: &Inputs) -> anyhow::Result<Vec<UploadedPdf>> {
    let mut paths = inputs.pdfs.clone();
    if let Some(folder) = &inputs.folder {
        let found = discover_pdf_files(folder);
        if found.is_empty() {
            warn!(folder = %folder.display(), "no pdf files found");
        }
        paths.extend(found);
    }
    if paths.is_empty() {
        bail!("pass at least one --pdf or a --folder containing PDFs");
    }

    paths
        .iter()
        .map(|path| {
            UploadedPdf::from_path(path).with_context(|| format!("reading {}", path.display()))
        })
        .collect()
}

async fn ingest(session: &mut QaSession, inputs: &Inputs) -> anyhow::Result<()> {
    let uploads = collect_uploads(inputs)?;
    let handle = session.ingest(&uploads).await?;
    eprintln!(
        "{} document(s) indexed into {} chunk(s) at {}",
        uploads.len(),
        handle.chunk_count,
        handle.built_at.to_rfc3339()
    );
    Ok(())
}

async fn chat(session: &mut QaSession) -> anyhow::Result<()> {
    eprintln!("ask a question, /history to review, /reset to clear, /quit to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        match question {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.clear_history();
                eprintln!("history cleared");
                continue;
            }
            "/history" => {
                for turn in session.history() {
                    let speaker = match turn.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                    };
                    println!("[{speaker}] {}", turn.text);
                }
                continue;
            }
            _ => {}
        }

        match session.ask(question, print_fragment).await {
            Ok(outcome) => {
                println!();
                print_sources(&outcome.evidence);
            }
            Err(error) => eprintln!("\nerror: {error}"),
        }
    }

    Ok(())
}

fn print_fragment(fragment: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(fragment.as_bytes());
    let _ = stdout.flush();
}

fn print_sources(evidence: &RetrievalResult) {
    println!("{}", sources_line(evidence));
}

fn sources_line(evidence: &RetrievalResult) -> String {
    if evidence.is_empty() {
        return "sources: none".to_string();
    }
    let pages: Vec<String> = evidence
        .chunks
        .iter()
        .map(|retrieved| {
            format!(
                "{} p.{}",
                retrieved.chunk.document_name, retrieved.chunk.page_number
            )
        })
        .collect();
    format!("sources: {}", pages.join(", "))
}

fn print_evidence(evidence: &RetrievalResult) {
    println!("query: {}", evidence.query);
    if evidence.is_empty() {
        println!("no supporting chunks");
        return;
    }
    for (rank, retrieved) in evidence.chunks.iter().enumerate() {
        let chunk = &retrieved.chunk;
        println!(
            "#{} relevance={:.4} document={} page={} chunk={}",
            rank + 1,
            retrieved.relevance,
            chunk.document_name,
            chunk.page_number,
            chunk.chunk_index
        );
        println!("{}\n", chunk.text.trim());
    }
}
