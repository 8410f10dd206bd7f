use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use ragdb_core::config::{expand_path, Config, EngineConfig};
use ragdb_core::loader::TxtDirectoryLoader;
use ragdb_core::telemetry::init_tracing;
use ragdb_core::traits::DocumentLoader;
use ragdb_core::Filter;
use ragdb_hybrid::{Engine, SearchRequest, SearchResponse};

const INGEST_BATCH: usize = 32;

const USAGE: &str = "Usage: ragdb <ingest|query|repl> [args...]
  ingest [dir]
  query \"<query>\" [--dir <dir>] [--top-k <n>] [--alpha <a> | --rrf] [--rerank] [--category <c>]
  repl [dir]";

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let cmd = args.remove(0);
    (cmd, args)
}

#[derive(Default)]
struct QueryArgs {
    query: Option<String>,
    dir: Option<PathBuf>,
    top_k: Option<usize>,
    alpha: Option<f32>,
    rrf: bool,
    rerank: bool,
    category: Option<String>,
}

fn parse_query_args(args: &[String]) -> anyhow::Result<QueryArgs> {
    let mut out = QueryArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().cloned().with_context(|| format!("{flag} requires a value"));
        match arg.as_str() {
            "--dir" => out.dir = Some(PathBuf::from(value("--dir")?)),
            "--top-k" | "-k" => out.top_k = Some(value("--top-k")?.parse().context("--top-k expects a number")?),
            "--alpha" => out.alpha = Some(value("--alpha")?.parse().context("--alpha expects a number")?),
            "--category" => out.category = Some(value("--category")?),
            "--rrf" => out.rrf = true,
            "--rerank" => out.rerank = true,
            other if other.starts_with('-') => bail!("unknown flag {other}"),
            other => out.query = Some(other.to_string()),
        }
    }
    Ok(out)
}

/// Loads the `.txt` corpus and ingests it in batches behind a progress bar.
async fn ingest_dir(engine: &Engine, config: &EngineConfig, dir: &Path) -> anyhow::Result<()> {
    let collection = &config.data.collection;
    if engine.collection(collection).is_err() {
        engine.create_collection(collection, config.collection.clone())?;
    }
    let documents = TxtDirectoryLoader::new(dir).load()?;
    let bar = ProgressBar::new(documents.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} docs {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let (mut upserted, mut superseded, mut failed, mut fallback) = (0, 0, 0, false);
    for batch in documents.chunks(INGEST_BATCH) {
        let response = engine.ingest(collection, batch, &config.data.chunking).await?;
        for e in &response.errors {
            warn!(chunk = %e.chunk_id, kind = ?e.kind, "{}", e.message);
        }
        upserted += response.upserted;
        superseded += response.superseded;
        failed += response.errors.len();
        fallback |= response.fallback_used;
        bar.inc(batch.len() as u64);
    }
    bar.finish_with_message("done");

    info!(documents = documents.len(), upserted, superseded, failed, "ingest complete");
    println!("✅ Ingested {} documents into '{}' ({} chunks, {} superseded, {} failed)", documents.len(), collection, upserted, superseded, failed);
    if fallback {
        println!("⚠️  Some embeddings were served by the fallback provider");
    }
    Ok(())
}

fn print_response(query: &str, response: &SearchResponse) {
    let cached = if response.cached { " (cached)" } else { "" };
    println!("\n🔍 Found {} results for: \"{}\"{}", response.results.len(), query, cached);
    for w in &response.warnings {
        println!("  ⚠️  {:?}: {}", w.kind, w.message);
    }
    for (i, r) in response.results.iter().enumerate() {
        let path = r.payload.get("path").and_then(|v| v.as_str()).unwrap_or("-");
        println!("\n  {}. score={:.4}  id={}  source={:?}  path={}", i + 1, r.score, r.chunk_id, r.source, path);
        let snippet: String = r.text.chars().take(200).collect();
        println!("     📝 {}", snippet.replace('\n', " "));
    }
}

fn request(query: String, args: &QueryArgs) -> SearchRequest {
    let mut request = SearchRequest::new(query).rerank(args.rerank);
    if let Some(k) = args.top_k {
        request = request.top_k(k);
    }
    if args.rrf {
        request = request.rrf();
    } else if let Some(alpha) = args.alpha {
        request = request.linear(alpha);
    }
    if let Some(category) = &args.category {
        request = request.filter(Filter::eq("category", category.as_str()));
    }
    request
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    let engine_config = config.engine()?;
    let (cmd, args) = parse_args();
    let engine = Engine::from_config(&engine_config)?;
    let default_dir = || expand_path(&engine_config.data.raw_txt_dir);

    match cmd.as_str() {
        "ingest" => {
            let dir = args.first().map(PathBuf::from).unwrap_or_else(default_dir);
            println!("Ingesting from {}", dir.display());
            ingest_dir(&engine, &engine_config, &dir).await?;
        }
        "query" => {
            let parsed = parse_query_args(&args)?;
            let Some(query) = parsed.query.clone() else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            let dir = parsed.dir.clone().unwrap_or_else(default_dir);
            ingest_dir(&engine, &engine_config, &dir).await?;
            let response = engine.search(&engine_config.data.collection, request(query.clone(), &parsed)).await?;
            print_response(&query, &response);
        }
        "repl" => {
            let dir = args.first().map(PathBuf::from).unwrap_or_else(default_dir);
            ingest_dir(&engine, &engine_config, &dir).await?;
            let parsed = QueryArgs::default();
            let stdin = io::stdin();
            loop {
                print!("\nquery> ");
                io::stdout().flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let query = line.trim();
                if query.is_empty() {
                    continue;
                }
                if query == ":q" {
                    break;
                }
                match engine.search(&engine_config.data.collection, request(query.to_string(), &parsed)).await {
                    Ok(response) => print_response(query, &response),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
        }
        _ => {
            eprintln!("Unknown command: {}\n{USAGE}", cmd);
            std::process::exit(1);
        }
    }
    Ok(())
}
