mod client;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use delve_core::{
    Config, ConfigLoader, DocumentUpload, ExplainFormat, FileType, ReasoningTimeline,
    ResearchService, SecretValue, ServiceComponents, SessionDetail, SessionRequest,
    SessionStatus, TelemetryOptions, UsageReport, init_telemetry,
};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::client::ApiClient;

#[derive(Parser, Debug)]
#[command(name = "delve", version, about = "Resumable research sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a research session in-process and print its report.
    Run(RunArgs),
    /// Start a session on a delve-api server.
    Start(StartArgs),
    /// Continue a completed session on a delve-api server.
    Continue(ContinueArgs),
    /// Attach a document to a session on a delve-api server.
    Upload(UploadArgs),
    /// Show a session's detail.
    Show(ShowArgs),
    /// List recent sessions.
    History(HistoryArgs),
    /// Delete a session and its artifacts.
    Delete(DeleteArgs),
    /// Summarise a session audit log.
    Usage(UsageArgs),
}

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Base URL of the delve-api server.
    #[arg(long, env = "DELVE_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Bearer token for the `/api` routes.
    #[arg(long, env = "DELVE_API_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl RemoteArgs {
    fn client(&self) -> ApiClient {
        let token = self
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(SecretValue::new);
        ApiClient::new(self.server.clone(), token)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Query to research.
    #[arg(long)]
    query: String,

    /// Follow-up queries, each continuing the previous session.
    #[arg(long = "follow-up")]
    follow_ups: Vec<String>,

    /// File or directory of pdf/txt documents to attach to the first session.
    #[arg(long = "document")]
    documents: Vec<PathBuf>,

    /// Use the deterministic stub engine and extractive summaries.
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Configuration file (falls back to `DELVE_CONFIG`, then `./delve.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the reasoning timeline after each report.
    #[arg(long, value_parser = parse_format)]
    explain: Option<ExplainFormat>,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[arg(long)]
    query: String,

    /// Completed session to continue from.
    #[arg(long)]
    parent: Option<Uuid>,

    /// File or directory of pdf/txt documents to attach.
    #[arg(long = "document")]
    documents: Vec<PathBuf>,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct ContinueArgs {
    /// Completed session to continue from.
    session: Uuid,

    #[arg(long)]
    query: String,

    /// File or directory of pdf/txt documents to attach.
    #[arg(long = "document")]
    documents: Vec<PathBuf>,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct UploadArgs {
    session: Uuid,

    path: PathBuf,

    /// Override type detection (`pdf` or `txt`).
    #[arg(long)]
    file_type: Option<String>,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct ShowArgs {
    session: Uuid,

    #[arg(long, value_parser = parse_format)]
    explain: Option<ExplainFormat>,

    /// Print the raw JSON response.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Print the ancestor chain instead of the detail.
    #[arg(long, default_value_t = false)]
    lineage: bool,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Only list direct continuations of this session.
    #[arg(long)]
    parent: Option<Uuid>,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    session: Uuid,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args, Debug)]
struct UsageArgs {
    /// Path to a `session.jsonl` audit log.
    #[arg(long)]
    log: PathBuf,

    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_format(value: &str) -> Result<ExplainFormat, String> {
    value.parse::<ExplainFormat>().map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await?,
            Command::Start(args) => start_command(args).await?,
            Command::Continue(args) => continue_command(args).await?,
            Command::Upload(args) => upload_command(args).await?,
            Command::Show(args) => show_command(args).await?,
            Command::History(args) => history_command(args).await?,
            Command::Delete(args) => delete_command(args).await?,
            Command::Usage(args) => usage_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load(args.config.clone())?;
    let components = if args.offline {
        ServiceComponents::offline(&config)
    } else {
        ServiceComponents::from_config(&config)?
    };
    let service = ResearchService::start(&config, components);
    let manager = service.manager();
    let wait = run_timeout(&config);

    let mut request = SessionRequest::new(args.query.clone());
    for upload in collect_documents(&args.documents)? {
        request = request.with_document(upload);
    }

    let outcome = async {
        let mut session = manager.start_session(request).await?;
        info!(session_id = %session.id, "session started");

        let mut queries = args.follow_ups.iter();
        loop {
            let finished = manager.wait_for_terminal(session.id, wait).await?;
            let detail = manager.session_detail(finished.id).await?;
            print_detail(&detail, args.explain);

            if finished.status != SessionStatus::Completed {
                bail!(
                    "session {} failed: {}",
                    finished.id,
                    finished.failure_reason.as_deref().unwrap_or("unknown reason")
                );
            }

            let Some(query) = queries.next() else {
                break;
            };
            session = manager.start_continuation(finished.id, query.clone()).await?;
            info!(session_id = %session.id, parent_id = %finished.id, "continuation started");
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    service.shutdown().await;
    outcome
}

/// Upper bound for one session: every attempt may wait out the document
/// window, hit the agent timeout and back off.
fn run_timeout(config: &Config) -> Duration {
    let attempts = config.scheduler.max_attempts.max(1);
    let per_attempt = config.context.document_wait()
        + config.agent.timeout()
        + Duration::from_millis(config.scheduler.max_backoff_ms);
    per_attempt * attempts + Duration::from_secs(60)
}

fn collect_documents(paths: &[PathBuf]) -> Result<Vec<DocumentUpload>> {
    document_paths(paths)?
        .iter()
        .map(|path| read_document(path))
        .collect()
}

/// Expand files and directories into the supported documents they hold.
fn document_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("document path {} does not exist", path.display());
        }

        for entry in WalkDir::new(path).into_iter().filter_map(|entry| entry.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if FileType::from_name(&file_name).is_err() {
                warn!(path = %entry.path().display(), "skipping unsupported document");
                continue;
            }
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn read_document(path: &Path) -> Result<DocumentUpload> {
    let content =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok(DocumentUpload::new(name, content))
}

fn print_detail(detail: &SessionDetail, explain: Option<ExplainFormat>) {
    let session = &detail.session;
    println!("session {} [{}]", session.id, session.status);
    if let Some(parent_id) = session.parent_id() {
        println!("continues {parent_id}");
    }
    println!("query: {}", session.query);
    if let Some(reason) = &session.failure_reason {
        println!("failure: {reason}");
    }

    if let Some(report) = &session.final_report {
        println!("\n{report}\n");
    }
    if let Some(summary) = &detail.summary {
        println!("summary: {}", summary.text);
    }
    if let Some(cost) = &detail.cost {
        println!(
            "cost: {} tokens on {} (~${:.4})",
            cost.total_tokens, cost.model_name, cost.estimated_cost_usd
        );
    }
    for document in &detail.documents {
        println!("document {} [{}] {}", document.name, document.file_type, document.status);
    }

    if let Some(format) = explain {
        println!("\n{}", ReasoningTimeline::new(&detail.reasoning).render(format));
    }
}

async fn start_command(args: StartArgs) -> Result<()> {
    let documents = document_paths(&args.documents)?;
    let response = args
        .remote
        .client()
        .start_session(&args.query, args.parent, &documents)
        .await?;
    print_accepted(&response);
    Ok(())
}

async fn continue_command(args: ContinueArgs) -> Result<()> {
    let documents = document_paths(&args.documents)?;
    let response = args
        .remote
        .client()
        .continue_session(args.session, &args.query, &documents)
        .await?;
    print_accepted(&response);
    Ok(())
}

fn print_accepted(response: &Value) {
    println!(
        "session {} [{}]",
        text(&response["session_id"]),
        text(&response["status"])
    );
    if let Some(parent_id) = response["parent_id"].as_str() {
        println!("continues {parent_id}");
    }
}

async fn upload_command(args: UploadArgs) -> Result<()> {
    let document = args
        .remote
        .client()
        .upload(args.session, &args.path, args.file_type.as_deref())
        .await?;
    println!(
        "document {} ({}) [{}]",
        text(&document["id"]),
        text(&document["file_type"]),
        text(&document["status"])
    );
    Ok(())
}

async fn show_command(args: ShowArgs) -> Result<()> {
    let client = args.remote.client();
    if args.lineage {
        let lineage = client.lineage(args.session).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&lineage)?);
            return Ok(());
        }
        for session in lineage["sessions"].as_array().into_iter().flatten() {
            print_row(session);
        }
        return Ok(());
    }

    let detail = client.session(args.session, args.explain).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    println!(
        "session {} [{}]",
        text(&detail["session"]["id"]),
        text(&detail["session"]["status"])
    );
    println!("query: {}", text(&detail["session"]["query"]));
    if let Some(reason) = detail["session"]["failure_reason"].as_str() {
        println!("failure: {reason}");
    }
    if let Some(report) = detail["session"]["final_report"].as_str() {
        println!("\n{report}\n");
    }
    if let Some(summary) = detail["summary"]["text"].as_str() {
        println!("summary: {summary}");
    }
    if detail["cost"].is_object() {
        println!(
            "cost: {} tokens on {} (~${:.4})",
            detail["cost"]["total_tokens"],
            text(&detail["cost"]["model_name"]),
            detail["cost"]["estimated_cost_usd"].as_f64().unwrap_or_default()
        );
    }
    for document in detail["documents"].as_array().into_iter().flatten() {
        println!(
            "document {} [{}] {}",
            text(&document["name"]),
            text(&document["file_type"]),
            text(&document["status"])
        );
    }
    if let Some(content) = detail["explanation"]["content"].as_str() {
        println!("\n{content}");
    }
    Ok(())
}

async fn history_command(args: HistoryArgs) -> Result<()> {
    let response = args.remote.client().history(args.limit, args.parent).await?;
    let rows = response["sessions"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();
    if rows.is_empty() {
        println!("no sessions");
    }
    for session in rows {
        print_row(session);
    }
    Ok(())
}

fn print_row(session: &Value) {
    let parent = session["parent_id"]
        .as_str()
        .map(|parent| format!(" <- {parent}"))
        .unwrap_or_default();
    println!(
        "{} {:<9} {}{}",
        text(&session["id"]),
        text(&session["status"]),
        text(&session["query"]),
        parent
    );
}

async fn delete_command(args: DeleteArgs) -> Result<()> {
    args.remote.client().delete(args.session).await?;
    println!("deleted {}", args.session);
    Ok(())
}

fn usage_command(args: UsageArgs) -> Result<()> {
    let report = UsageReport::analyze_log(&args.log)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }
    Ok(())
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn collects_supported_documents_from_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "battery notes").unwrap();
        fs::write(dir.path().join("sheet.xlsx"), "ignored").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("more.txt"), "more").unwrap();

        let mut names: Vec<_> = collect_documents(&[dir.path().to_path_buf()])
            .unwrap()
            .into_iter()
            .map(|upload| upload.name)
            .collect();
        names.sort();

        assert_eq!(names, vec!["more.txt", "notes.txt"]);
    }

    #[test]
    fn rejects_missing_document_paths() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(collect_documents(&[missing]).is_err());
    }

    #[test]
    fn parses_follow_up_chain() {
        let cli = Cli::try_parse_from([
            "delve",
            "run",
            "--query",
            "lithium supply",
            "--follow-up",
            "what about sodium?",
            "--follow-up",
            "and recycling?",
            "--offline",
            "--explain",
            "mermaid",
        ])
        .unwrap();

        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.follow_ups.len(), 2);
                assert!(args.offline);
                assert_eq!(args.explain, Some(ExplainFormat::Mermaid));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_timeout_covers_every_attempt() {
        let config = Config::default();
        let timeout = run_timeout(&config);
        assert!(timeout >= config.agent.timeout() * config.scheduler.max_attempts);
    }

    #[test]
    fn run_timeout_includes_the_document_window() {
        let mut config = Config::default();
        config.scheduler.max_attempts = 2;
        let base = run_timeout(&config);
        config.context.document_wait_ms += 600_000;
        assert_eq!(run_timeout(&config), base + Duration::from_secs(1_200));
    }

    #[test]
    fn start_accepts_documents() {
        let cli = Cli::try_parse_from([
            "delve",
            "start",
            "--query",
            "heat pumps",
            "--document",
            "notes.txt",
            "--document",
            "specs",
        ])
        .unwrap();

        match cli.command {
            Command::Start(args) => assert_eq!(args.documents.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
