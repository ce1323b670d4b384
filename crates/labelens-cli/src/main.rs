use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use labelens_contracts::events::EventWriter;
use labelens_contracts::history::{HistoryStore, JsonlHistoryStore, NoHistory, HISTORY_READ_LIMIT};
use labelens_contracts::scan::{ImageSource, ProductRecord, ScanRequest, ScanResponse};
use labelens_engine::providers::barcode::ScriptedProductLookup;
use labelens_engine::providers::model::ScriptedModelClient;
use labelens_engine::providers::search::{ScriptedSearch, ScriptedSearchClient, SearchClient};
use labelens_engine::{ScanPipeline, StageContext};

#[derive(Debug, Parser)]
#[command(name = "labelens", version, about = "Food label scan pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scan through the full pipeline and print the response JSON.
    Scan(ScanArgs),
    /// Show the recent scan history for a session.
    History(HistoryArgs),
}

#[derive(Debug, Parser)]
struct ScanArgs {
    /// Photo of the product label.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Product barcode; tried before the photo.
    #[arg(long)]
    barcode: Option<String>,
    /// Free-text scan location, used as an intent hint.
    #[arg(long)]
    location: Option<String>,
    /// Session id for history-informed intent inference.
    #[arg(long)]
    session: Option<String>,
    /// Append pipeline events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Run against scripted collaborators instead of live services.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    session: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("labelens error: {err:#}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::History(args) => run_history(args),
    }
}

async fn run_scan(args: ScanArgs) -> Result<i32> {
    let image = match &args.image {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("could not read image {}", path.display()))?;
            Some(ImageSource::Bytes(bytes))
        }
        None => None,
    };
    let mut request = ScanRequest {
        image,
        barcode: args.barcode.clone(),
        scan_location: args.location.clone(),
        session_id: args.session.clone(),
    };

    let mut pipeline = if args.dryrun {
        if request.barcode.is_none() {
            request.barcode = Some(DRYRUN_BARCODE.to_string());
        }
        dryrun_pipeline(request.barcode.as_deref().unwrap_or(DRYRUN_BARCODE))
    } else {
        ScanPipeline::from_env()?
    };
    if let Some(path) = &args.events {
        pipeline = pipeline.with_events(EventWriter::new(path, format!("scan-{}", Uuid::new_v4())));
    }

    let response = pipeline.run(request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(match response {
        ScanResponse::Success { .. } => 0,
        ScanResponse::VisionFailed { .. } => 2,
        ScanResponse::TimedOut { .. } => 3,
    })
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let config = labelens_engine::EngineConfig::from_env();
    let Some(root) = config.history_root else {
        bail!("LABELENS_HISTORY_DIR is not set; there is no history to read");
    };
    let store = JsonlHistoryStore::new(root);
    for entry in store.recent(&args.session, HISTORY_READ_LIMIT) {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(0)
}

const DRYRUN_BARCODE: &str = "0000000000000";

const DRYRUN_INTENT: &str = r#"{"persona": "General Health", "contextBias": "balanced overview",
"confidence": "medium", "riskAssessment": {"ingredientsToResearch": ["Palm Oil", "Honey", "Oats"],
"riskDetails": {"Palm Oil": {"riskLevel": "moderate_concern", "reasoning": "saturated fat content"}}}}"#;

const DRYRUN_CLASSIFICATION: &str = r#"{"claims": [
  {"source": "EFSA", "credibility": "regulatory", "claim": "Permitted food ingredient in the EU.",
   "stance": "approved", "region": "eu", "confidence": 0.85},
  {"source": "Nutrition Review", "credibility": "academic", "claim": "No safety concerns at typical intake.",
   "stance": "generally_safe", "region": "global", "confidence": 0.8},
  {"source": "FDA", "credibility": "regulatory", "claim": "Listed as a permitted ingredient.",
   "stance": "approved", "region": "us", "confidence": 0.85}
], "conflictDetected": false, "ambiguityLevel": "low", "overallConfidence": 0.82}"#;

const DRYRUN_SYNTHESIS: &str = "All three ingredients are widely permitted and carry no notable \
regulatory concerns. Palm oil stands out only for its saturated fat content, which is a dietary \
consideration rather than a safety one.";

const DRYRUN_UI: &str = r#"{"schema": {"generatedComponents": [
  {"name": "GranolaSafetyOverview", "description": "Overall verdict for this granola",
   "requiredProps": [
     {"name": "summary", "type": "text"},
     {"name": "agreement", "type": "percentage"}
   ]},
  {"name": "SaturatedFatNote", "description": "Dietary note on palm oil",
   "requiredProps": [{"name": "note", "type": "text"}]}
]},
"components": [
  {"component": "GranolaSafetyOverview", "variant": "banner", "priority": 8,
   "props": {"summary": "Nothing alarming in this label.", "agreement": 82},
   "metadata": {"intent": "verdict", "confidence": 0.82, "sources": ["EFSA"]}},
  {"component": "SaturatedFatNote", "variant": "card", "priority": 5,
   "props": {"note": "Palm oil is high in saturated fat."},
   "metadata": {"intent": "dietary note", "confidence": 0.75, "sources": []}}
]}"#;

/// A pipeline wired to scripted collaborators: a canned product lookup,
/// canned search results, and a fixed model script covering intent, three
/// classifications, synthesis, and UI generation.
fn dryrun_pipeline(barcode: &str) -> ScanPipeline {
    let model = Arc::new(ScriptedModelClient::with_texts(vec![
        DRYRUN_INTENT,
        DRYRUN_CLASSIFICATION,
        DRYRUN_CLASSIFICATION,
        DRYRUN_CLASSIFICATION,
        DRYRUN_SYNTHESIS,
        DRYRUN_UI,
    ]));
    let search: Arc<dyn SearchClient> = Arc::new(ScriptedSearchClient::new(vec![
        ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
        ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
        ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
    ]));
    let lookup = ScriptedProductLookup::new(vec![ProductRecord {
        barcode: barcode.to_string(),
        product_name: Some("Demo granola".to_string()),
        ingredients_text: Some("Oats, Honey, Palm Oil".to_string()),
    }]);
    let history: Arc<dyn HistoryStore> = Arc::new(NoHistory);
    ScanPipeline::new(
        StageContext::scripted(model, Some(search)),
        history,
        Arc::new(lookup),
    )
}
