use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{SecondsFormat, Utc};
use indexmap::IndexSet;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::{timeout, Instant};

use labelens_contracts::events::{EventPayload, EventWriter};
use labelens_contracts::history::{
    HistoryEntry, HistoryStore, JsonlHistoryStore, NoHistory, HISTORY_READ_LIMIT,
};
use labelens_contracts::scan::{
    parse_ingredient_list, ConversationPrompt, ImageSource, ScanRequest, ScanResponse,
};
use labelens_contracts::vision::{VisionFailure, VisionOutcome};

use crate::config::EngineConfig;
use crate::intent::infer_intent;
use crate::providers::barcode::{ProductLookup, ProductLookupClient};
use crate::providers::model::{ChatModelClient, ImageAttachment, ModelClient, ModelRequest};
use crate::providers::search::{NeuralSearchClient, SearchClient};
use crate::research::run_research;
use crate::retry::{with_retry, RetryPolicy};
use crate::throttle::RateLimiter;
use crate::ui::synthesize_ui;
use crate::vision::extract_from_image;

const TIMEOUT_MESSAGE: &str =
    "The scan took too long and was stopped. Please try scanning again.";

/// Where a scan currently is; the names double as event-log stage labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Extracting,
    InferringIntent,
    Researching,
    SynthesizingUi,
    Complete,
    VisionFailed,
    TimedOut,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extracting => "extracting",
            Self::InferringIntent => "inferring_intent",
            Self::Researching => "researching",
            Self::SynthesizingUi => "synthesizing_ui",
            Self::Complete => "complete",
            Self::VisionFailed => "vision_failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Everything a stage needs to talk to the outside world. Cheap to share:
/// the clients and limiter sit behind Arcs.
pub struct StageContext {
    pub config: EngineConfig,
    pub text_model: Arc<dyn ModelClient>,
    pub vision_model: Arc<dyn ModelClient>,
    pub search: Option<Arc<dyn SearchClient>>,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub events: Option<EventWriter>,
}

impl StageContext {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let text_model: Arc<dyn ModelClient> =
            Arc::new(ChatModelClient::new(&config, &config.text_model)?);
        let vision_model: Arc<dyn ModelClient> =
            Arc::new(ChatModelClient::new(&config, &config.vision_model)?);
        let search: Option<Arc<dyn SearchClient>> = if config.search_api_key.is_some() {
            Some(Arc::new(NeuralSearchClient::new(&config)?))
        } else {
            None
        };
        let limiter = Arc::new(RateLimiter::new(config.min_call_interval));
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            config,
            text_model,
            vision_model,
            search,
            limiter,
            retry,
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Context backed entirely by scripted clients; the one model serves
    /// both the text and vision roles.
    pub fn scripted(
        model: Arc<crate::providers::model::ScriptedModelClient>,
        search: Option<Arc<dyn SearchClient>>,
    ) -> Self {
        Self::scripted_with(model, search, EngineConfig::offline())
    }

    pub fn scripted_with(
        model: Arc<crate::providers::model::ScriptedModelClient>,
        search: Option<Arc<dyn SearchClient>>,
        config: EngineConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.min_call_interval));
        let retry = RetryPolicy::from_config(&config);
        Self {
            config,
            text_model: model.clone(),
            vision_model: model,
            search,
            limiter,
            retry,
            events: None,
        }
    }

    /// One throttled, retried call against the text model. Every dispatch,
    /// including each retry attempt, waits its turn at the limiter.
    pub async fn text_call(&self, request: &ModelRequest) -> Result<String> {
        let model = self.text_model.as_ref();
        let limiter = self.limiter.as_ref();
        with_retry(&self.retry, || async move {
            limiter.throttle(model.complete(request)).await
        })
        .await
    }

    pub async fn vision_call(&self, request: &ModelRequest) -> Result<String> {
        let model = self.vision_model.as_ref();
        let limiter = self.limiter.as_ref();
        with_retry(&self.retry, || async move {
            limiter.throttle(model.complete(request)).await
        })
        .await
    }

    pub fn warn(&self, message: &str) {
        if let Some(events) = &self.events {
            events.warn(message);
        }
    }

    fn stage(&self, state: PipelineState, started: Instant) {
        if let Some(events) = &self.events {
            events.stage(state.as_str(), elapsed_ms(started));
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// What the input-resolution step produced: either an ingredient list ready
/// for analysis, or an early conversational exit.
enum ResolvedInput {
    Ingredients {
        ingredients: IndexSet<String>,
        product_name: Option<String>,
    },
    VisionFailed(VisionFailure),
}

pub struct ScanPipeline {
    context: StageContext,
    history: Arc<dyn HistoryStore>,
    lookup: Arc<dyn ProductLookup>,
}

impl ScanPipeline {
    pub fn new(
        context: StageContext,
        history: Arc<dyn HistoryStore>,
        lookup: Arc<dyn ProductLookup>,
    ) -> Self {
        Self {
            context,
            history,
            lookup,
        }
    }

    pub fn from_env() -> Result<Self> {
        let config = EngineConfig::from_env();
        let history: Arc<dyn HistoryStore> = match &config.history_root {
            Some(root) => Arc::new(JsonlHistoryStore::new(root)),
            None => Arc::new(NoHistory),
        };
        let lookup: Arc<dyn ProductLookup> = Arc::new(ProductLookupClient::new(&config));
        let context = StageContext::from_config(config)?;
        Ok(Self {
            context,
            history,
            lookup,
        })
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.context = self.context.with_events(events);
        self
    }

    pub fn context(&self) -> &StageContext {
        &self.context
    }

    /// Runs one scan to completion, racing the whole pipeline against the
    /// global deadline. Input problems surface as errors; everything that
    /// happens after the input gate comes back as a [`ScanResponse`].
    pub async fn run(&self, request: ScanRequest) -> Result<ScanResponse> {
        request.validate()?;
        let started = Instant::now();
        match timeout(
            self.context.config.pipeline_timeout,
            self.execute(&request, started),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.context.stage(PipelineState::TimedOut, started);
                Ok(ScanResponse::TimedOut {
                    elapsed_ms: elapsed_ms(started),
                    message: TIMEOUT_MESSAGE.to_string(),
                })
            }
        }
    }

    async fn execute(&self, request: &ScanRequest, started: Instant) -> Result<ScanResponse> {
        self.context.stage(PipelineState::Extracting, started);
        let (ingredients, product_name) = match self.resolve_input(request).await? {
            ResolvedInput::Ingredients {
                ingredients,
                product_name,
            } => (ingredients, product_name),
            ResolvedInput::VisionFailed(failure) => {
                self.context.stage(PipelineState::VisionFailed, started);
                return Ok(ScanResponse::VisionFailed {
                    detected_context: failure.product_type_guess.clone(),
                    failure_reason: failure.reason,
                    confidence: failure.confidence,
                    // Exactly one conversational prompt; the client renders
                    // it instead of an analysis.
                    components: vec![ConversationPrompt {
                        message: failure.message.clone(),
                        suggested_questions: failure.suggested_questions.clone(),
                    }],
                    message: failure.message,
                });
            }
        };

        self.context.stage(PipelineState::InferringIntent, started);
        let history_entries = match request.session_id.as_deref() {
            Some(session_id) => self.history.recent(session_id, HISTORY_READ_LIMIT),
            None => Vec::new(),
        };
        let intent = infer_intent(
            &self.context,
            &ingredients,
            product_name.as_deref(),
            request.scan_location.as_deref(),
            &history_entries,
        )
        .await;

        self.context.stage(PipelineState::Researching, started);
        let research = run_research(&self.context, &ingredients, &intent).await;

        self.context.stage(PipelineState::SynthesizingUi, started);
        let ui = synthesize_ui(&self.context, &research, &intent).await;

        // Persistence is detached: the response never waits on disk, and a
        // lost write degrades to a warning.
        if let Some(session_id) = request.session_id.clone() {
            let history = Arc::clone(&self.history);
            let events = self.context.events.clone();
            let entry = HistoryEntry {
                scanned_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                product_name: product_name.clone(),
                ingredients: ingredients.iter().cloned().collect(),
                persona: intent.persona.clone(),
                context_bias: intent.context_bias.clone(),
            };
            tokio::task::spawn_blocking(move || {
                if let Some(events) = &events {
                    let mut payload = EventPayload::new();
                    payload.insert(
                        "session_id".to_string(),
                        Value::String(session_id.clone()),
                    );
                    payload.insert(
                        "ingredient_count".to_string(),
                        Value::Number(entry.ingredients.len().into()),
                    );
                    if let Some(name) = &entry.product_name {
                        payload.insert("product_name".to_string(), Value::String(name.clone()));
                    }
                    let _ = events.emit("scan_recorded", payload);
                }
                if !history.append(&session_id, entry) {
                    if let Some(events) = &events {
                        events.warn("history append was lost");
                    }
                }
            });
        }

        self.context.stage(PipelineState::Complete, started);
        Ok(ScanResponse::Success {
            ui,
            research_metadata: research.metadata,
        })
    }

    /// Barcode first, image second. A known barcode skips vision entirely;
    /// a lookup failure with an image in hand degrades to vision; a miss
    /// with no image is an input error raised before any model call.
    async fn resolve_input(&self, request: &ScanRequest) -> Result<ResolvedInput> {
        let barcode = request
            .barcode
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty());

        if let Some(code) = barcode {
            let lookup = self.lookup.as_ref();
            match with_retry(&self.context.retry, || async move {
                lookup.lookup(code).await
            })
            .await
            {
                Ok(Some(record)) => {
                    let parsed = record
                        .ingredients_text
                        .as_deref()
                        .map(parse_ingredient_list)
                        .unwrap_or_default();
                    if !parsed.is_empty() {
                        return Ok(ResolvedInput::Ingredients {
                            ingredients: parsed,
                            product_name: record.product_name,
                        });
                    }
                    if request.image.is_none() {
                        bail!("product {code} has no ingredient list on record and no image was provided");
                    }
                    self.context
                        .warn(&format!("product {code} listed without ingredients; falling back to the photo"));
                }
                Ok(None) => {
                    if request.image.is_none() {
                        bail!("barcode {code} is not in the product database and no image was provided");
                    }
                    self.context
                        .warn(&format!("barcode {code} unknown; falling back to the photo"));
                }
                Err(err) => {
                    if request.image.is_none() {
                        return Err(err.context("barcode lookup failed"));
                    }
                    self.context
                        .warn(&format!("barcode lookup failed; falling back to the photo: {err:#}"));
                }
            }
        }

        let Some(image) = &request.image else {
            bail!("scan request needs an image or a barcode");
        };
        let attachment = match image {
            ImageSource::Bytes(bytes) => ImageAttachment::from_bytes(bytes)?,
            ImageSource::Base64(encoded) => ImageAttachment::from_base64(encoded)?,
        };
        if let Some(events) = &self.context.events {
            let fingerprint = hex::encode(Sha256::digest(attachment.data_url.as_bytes()));
            let mut payload = EventPayload::new();
            payload.insert(
                "image_fingerprint".to_string(),
                Value::String(fingerprint[..16].to_string()),
            );
            let _ = events.emit("image_received", payload);
        }

        match extract_from_image(&self.context, &attachment).await? {
            VisionOutcome::Success(extraction) => Ok(ResolvedInput::Ingredients {
                ingredients: extraction.ingredients,
                product_name: None,
            }),
            VisionOutcome::Failure(failure) => Ok(ResolvedInput::VisionFailed(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use labelens_contracts::scan::ProductRecord;

    use super::*;
    use crate::providers::barcode::ScriptedProductLookup;
    use crate::providers::model::{ScriptedModelClient, ScriptedReply};
    use crate::providers::search::{ScriptedSearch, ScriptedSearchClient};

    const PNG_MAGIC: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn chocolate_record() -> ProductRecord {
        ProductRecord {
            barcode: "4006381333931".to_string(),
            product_name: Some("Chocolate bar".to_string()),
            ingredients_text: Some("sugar, palm oil, msg".to_string()),
        }
    }

    fn intent_reply() -> String {
        r#"{"persona": "General Health", "contextBias": "balanced overview", "confidence": "medium"}"#
            .to_string()
    }

    fn classification_reply() -> String {
        serde_json::json!({
            "claims": [
                { "source": "EFSA", "credibility": "regulatory", "claim": "permitted",
                  "stance": "approved", "region": "eu", "confidence": 0.85 },
                { "source": "Journal", "credibility": "academic", "claim": "no concerns at typical intake",
                  "stance": "generally_safe", "region": "global", "confidence": 0.8 }
            ],
            "conflictDetected": false,
            "overallConfidence": 0.82
        })
        .to_string()
    }

    fn ui_reply() -> String {
        serde_json::json!({
            "schema": { "generatedComponents": [
                { "name": "IngredientVerdict", "requiredProps": [
                    { "name": "summary", "type": "text" }
                ] }
            ]},
            "components": [
                { "component": "IngredientVerdict", "priority": 7,
                  "props": { "summary": "nothing alarming" },
                  "metadata": { "confidence": 0.8 } }
            ]
        })
        .to_string()
    }

    fn pipeline_with(
        model: Arc<ScriptedModelClient>,
        search: Option<Arc<dyn SearchClient>>,
        lookup: ScriptedProductLookup,
    ) -> ScanPipeline {
        ScanPipeline::new(
            StageContext::scripted(model, search),
            Arc::new(NoHistory),
            Arc::new(lookup),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn barcode_scan_runs_the_full_pipeline() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            intent_reply().as_str(),
            classification_reply().as_str(),
            classification_reply().as_str(),
            classification_reply().as_str(),
            "The three ingredients are widely permitted.",
            ui_reply().as_str(),
        ]));
        let search: Arc<dyn SearchClient> = Arc::new(ScriptedSearchClient::new(vec![
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
        ]));
        let pipeline = pipeline_with(
            Arc::clone(&model),
            Some(search),
            ScriptedProductLookup::new(vec![chocolate_record()]),
        );

        let response = pipeline
            .run(ScanRequest {
                barcode: Some("4006381333931".to_string()),
                ..Default::default()
            })
            .await
            .expect("scan");

        let ScanResponse::Success {
            ui,
            research_metadata,
        } = response
        else {
            panic!("expected success");
        };
        assert_eq!(ui.components[0].component, "IngredientVerdict");
        assert!(ui.missing_schema_names().is_empty());
        assert_eq!(research_metadata.sources_consulted, 6);
        // Every scripted reply was consumed; no extra model calls happened.
        assert_eq!(model.remaining(), 0);
    }

    #[tokio::test]
    async fn unreadable_photo_returns_one_conversational_prompt() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            r#"{"readable": false, "ingredients": []}"#,
            r#"{"usable": false, "confidence": 0.2, "failureReason": "blurry_image", "productTypeGuess": "soda can"}"#,
            r#"{"message": "Too blurry to read.", "suggestedQuestions": ["Retake?", "Barcode?", "Type it?"]}"#,
        ]));
        let pipeline = pipeline_with(model, None, ScriptedProductLookup::default());

        let response = pipeline
            .run(ScanRequest {
                image: Some(ImageSource::Bytes(PNG_MAGIC.to_vec())),
                ..Default::default()
            })
            .await
            .expect("scan");

        let ScanResponse::VisionFailed {
            message,
            detected_context,
            components,
            ..
        } = response
        else {
            panic!("expected vision failure");
        };
        assert_eq!(message, "Too blurry to read.");
        assert_eq!(detected_context.as_deref(), Some("soda can"));
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].suggested_questions.len(), 3);
    }

    #[tokio::test]
    async fn barcode_miss_without_image_fails_before_any_model_call() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec!["never used"]));
        let pipeline = pipeline_with(Arc::clone(&model), None, ScriptedProductLookup::default());

        let err = pipeline
            .run(ScanRequest {
                barcode: Some("0000000000000".to_string()),
                ..Default::default()
            })
            .await
            .expect_err("expected an input error");
        assert!(err.to_string().contains("not in the product database"));
        assert_eq!(model.remaining(), 1);
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let model = Arc::new(ScriptedModelClient::default());
        let pipeline = pipeline_with(model, None, ScriptedProductLookup::default());
        assert!(pipeline.run(ScanRequest::default()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn global_deadline_converts_a_stuck_scan_into_timed_out() {
        // The intent call hangs past the 60s pipeline deadline.
        let model = Arc::new(ScriptedModelClient::new(vec![ScriptedReply::Slow(
            Duration::from_secs(300),
            intent_reply(),
        )]));
        let pipeline = pipeline_with(
            model,
            None,
            ScriptedProductLookup::new(vec![chocolate_record()]),
        );

        let response = pipeline
            .run(ScanRequest {
                barcode: Some("4006381333931".to_string()),
                ..Default::default()
            })
            .await
            .expect("scan");

        let ScanResponse::TimedOut {
            elapsed_ms,
            message,
        } = response
        else {
            panic!("expected timeout");
        };
        assert!(elapsed_ms >= 60_000);
        assert_eq!(message, TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn completed_scan_is_appended_to_session_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JsonlHistoryStore::new(temp.path()));
        // With no search client the research stage makes no model calls.
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            intent_reply().as_str(),
            ui_reply().as_str(),
        ]));
        let pipeline = ScanPipeline::new(
            StageContext::scripted(model, None),
            Arc::clone(&store) as Arc<dyn HistoryStore>,
            Arc::new(ScriptedProductLookup::new(vec![chocolate_record()])),
        );

        let response = pipeline
            .run(ScanRequest {
                barcode: Some("4006381333931".to_string()),
                session_id: Some("kitchen-session".to_string()),
                ..Default::default()
            })
            .await
            .expect("scan");
        assert!(matches!(response, ScanResponse::Success { .. }));

        // The append is detached; poll briefly for it to land.
        let mut entries = Vec::new();
        for _ in 0..200 {
            entries = store.recent("kitchen-session", HISTORY_READ_LIMIT);
            if !entries.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].product_name.as_deref(), Some("Chocolate bar"));
        assert_eq!(entries[0].ingredients.len(), 3);
    }

    #[tokio::test]
    async fn unknown_barcode_with_image_falls_back_to_vision() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            // vision extraction (tier one passes)
            r#"{"readable": true, "ingredients": ["water", "barley", "hops"], "confidence": 0.92}"#,
            intent_reply().as_str(),
            ui_reply().as_str(),
        ]));
        let pipeline = pipeline_with(model, None, ScriptedProductLookup::default());

        let response = pipeline
            .run(ScanRequest {
                barcode: Some("0000000000000".to_string()),
                image: Some(ImageSource::Bytes(PNG_MAGIC.to_vec())),
                ..Default::default()
            })
            .await
            .expect("scan");
        assert!(matches!(response, ScanResponse::Success { .. }));
    }
}
