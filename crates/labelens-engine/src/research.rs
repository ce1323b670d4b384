use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use indexmap::IndexSet;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};

use labelens_contracts::coerce::{
    json_object_from_text, push_unique_warning, string_field, value_as_bool, value_as_f64,
};
use labelens_contracts::intent::{IntentProfile, RiskAssessment, RiskLevel};
use labelens_contracts::research::{
    determine_consensus_status, AmbiguityLevel, ConflictType, ConsensusStatus, IngredientResearch,
    ResearchMetadata, ResearchResult, SourceClaim, Stance, TradeOffContext, TradeOffPosition,
};

use crate::pipeline::StageContext;
use crate::providers::model::ModelRequest;
use crate::providers::search::SearchDocument;
use crate::retry::with_retry;

/// Ingredients researched side by side.
const BATCH_SIZE: usize = 2;
/// Pause between batches, spacing load on the search provider.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(500);
/// Margin reserved at the end of the research window for synthesis.
const WINDOW_MARGIN: Duration = Duration::from_secs(10);

const CLASSIFICATION_SYSTEM: &str = "You classify search results about a food ingredient and \
judge, across the whole set, whether the sources genuinely disagree. A low-credibility source \
contradicting high-credibility ones is an apparent conflict, not a genuine one. Reply with one \
JSON object: {\"claims\": [{\"source\": string, \"sourceUrl\": string, \"credibility\": \
\"regulatory\"|\"peer_reviewed\"|\"medical\"|\"industry\"|\"news\"|\"unverified\", \"claim\": \
string, \"stance\": \"approved\"|\"generally_safe\"|\"neutral\"|\"under_review\"|\"restricted\"|\
\"prohibited\", \"region\": string, \"datePublished\": string, \"confidence\": number 0-1}], \
\"conflictDetected\": bool (genuine conflicts only), \"conflictType\": \"regional\"|\
\"scientific\"|\"dosage\"|\"population\"|\"temporal\"|\"methodological\", \"conflictSummary\": \
string, \"ambiguityLevel\": \"low\"|\"medium\"|\"high\", \"overallConfidence\": number 0-1}.";

const SYNTHESIS_SYSTEM: &str = "You write a short, plain-language analysis of researched food \
ingredients for a shopper. Ground every statement in the provided claims; do not invent \
sources.";

const NO_SEARCH_ANALYSIS: &str = "External ingredient research was unavailable for this scan, so \
this analysis is based on the label alone. Treat it as a starting point rather than a verdict.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResearchBudget {
    pub max_ingredients: usize,
    pub results_per_ingredient: usize,
}

/// Fewer ingredients get deeper per-ingredient research; a long list gets
/// breadth capped at three or four depending on the risk mix.
pub fn derive_budget(count: usize, has_high_risk: bool) -> ResearchBudget {
    match count {
        0 | 1 | 2 => ResearchBudget {
            max_ingredients: count.max(1),
            results_per_ingredient: 5,
        },
        3 | 4 => ResearchBudget {
            max_ingredients: count,
            results_per_ingredient: 4,
        },
        _ => ResearchBudget {
            max_ingredients: if has_high_risk { 4 } else { 3 },
            results_per_ingredient: 3,
        },
    }
}

/// The upstream risk assessment picks the set; without one, small scans
/// research everything and large scans research nothing.
pub fn select_ingredients(
    ingredients: &IndexSet<String>,
    assessment: Option<&RiskAssessment>,
) -> Vec<String> {
    if let Some(assessment) = assessment {
        if !assessment.ingredients_to_research.is_empty() {
            return assessment.ingredients_to_research.clone();
        }
    }
    if ingredients.len() <= 5 {
        return ingredients.iter().cloned().collect();
    }
    Vec::new()
}

pub fn risk_for(ingredient: &str, assessment: Option<&RiskAssessment>) -> RiskLevel {
    assessment
        .and_then(|assessment| assessment.risk_details.get(ingredient))
        .map(|detail| detail.risk_level)
        .unwrap_or(RiskLevel::LowRisk)
}

/// Highest scrutiny first; stable for equal priorities.
pub fn sort_by_risk(selected: &mut [String], assessment: Option<&RiskAssessment>) {
    selected.sort_by_key(|ingredient| {
        std::cmp::Reverse(risk_for(ingredient, assessment).priority())
    });
}

/// Everything one classification call produced for one ingredient.
#[derive(Debug, Clone, Default)]
struct Classified {
    claims: Vec<SourceClaim>,
    conflict_detected: bool,
    conflict_type: Option<ConflictType>,
    conflict_summary: Option<String>,
    ambiguity_level: Option<AmbiguityLevel>,
    overall_confidence: Option<f64>,
}

fn parse_classification(value: &Value) -> Classified {
    let claims = value
        .get("claims")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(SourceClaim::from_model_value).collect())
        .unwrap_or_default();
    Classified {
        claims,
        conflict_detected: value_as_bool(
            value
                .get("conflictDetected")
                .or_else(|| value.get("conflict_detected")),
        )
        .unwrap_or(false),
        conflict_type: string_field(value, &["conflictType", "conflict_type"])
            .and_then(|raw| ConflictType::from_loose(&raw)),
        conflict_summary: string_field(value, &["conflictSummary", "conflict_summary"]),
        ambiguity_level: string_field(value, &["ambiguityLevel", "ambiguity_level"])
            .and_then(|raw| AmbiguityLevel::from_loose(&raw)),
        overall_confidence: value
            .get("overallConfidence")
            .or_else(|| value.get("overall_confidence"))
            .map(|raw| value_as_f64(Some(raw), 0.5, 0.0, 1.0)),
    }
}

async fn searched_documents(
    ctx: &StageContext,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchDocument>> {
    let client = ctx
        .search
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("search client not configured"))?;
    let client = client.as_ref();
    let retried = with_retry(&ctx.retry, || async move {
        client.search(query, limit).await
    });
    match timeout(ctx.config.search_call_timeout, retried).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("search call exceeded its budget"),
    }
}

async fn classify_documents(
    ctx: &StageContext,
    ingredient: &str,
    documents: &[SearchDocument],
) -> Result<Option<Classified>> {
    let rows: Vec<Value> = documents
        .iter()
        .map(|document| {
            json!({
                "title": document.title,
                "url": document.url,
                "snippet": document.snippet,
                "published": document.published,
            })
        })
        .collect();
    let user = format!(
        "Ingredient: {ingredient}\nSearch results:\n{}",
        serde_json::to_string_pretty(&Value::Array(rows)).unwrap_or_default()
    );
    let mut request = ModelRequest::json(CLASSIFICATION_SYSTEM, user);
    request.max_tokens = Some(1200);

    let reply = ctx.text_call(&request).await?;
    Ok(json_object_from_text(&reply).map(|value| parse_classification(&value)))
}

fn empty_research(ingredient: &str, risk_level: RiskLevel) -> IngredientResearch {
    IngredientResearch {
        ingredient: ingredient.to_string(),
        risk_level,
        claims: Vec::new(),
        conflict_detected: false,
        conflict_type: None,
        conflict_summary: None,
        confidence_score: 0.0,
        ambiguity_level: AmbiguityLevel::High,
    }
}

/// Researches one ingredient: primary neural search, joint classification,
/// and (for risky ingredients with thin results) one supplemental
/// regulatory query whose conflict verdict supersedes the primary one.
/// Failures degrade to an empty-claims entry; siblings never notice.
async fn research_ingredient(
    ctx: &StageContext,
    ingredient: &str,
    intent: &IntentProfile,
    risk_level: RiskLevel,
    results_per_ingredient: usize,
) -> (IngredientResearch, Vec<String>) {
    let mut warnings = Vec::new();

    let query = format!(
        "{} ({}): safety and regulation of {} in food",
        intent.persona, intent.context_bias, ingredient
    );
    let documents = match searched_documents(ctx, &query, results_per_ingredient).await {
        Ok(documents) => documents,
        Err(err) => {
            push_unique_warning(
                &mut warnings,
                format!("search failed for {ingredient}: {err:#}"),
            );
            return (empty_research(ingredient, risk_level), warnings);
        }
    };
    if documents.is_empty() {
        push_unique_warning(&mut warnings, format!("no sources found for {ingredient}"));
        return (empty_research(ingredient, risk_level), warnings);
    }

    let mut classified = match classify_documents(ctx, ingredient, &documents).await {
        Ok(Some(classified)) => classified,
        Ok(None) => {
            push_unique_warning(
                &mut warnings,
                format!("source classification unreadable for {ingredient}"),
            );
            return (empty_research(ingredient, risk_level), warnings);
        }
        Err(err) => {
            push_unique_warning(
                &mut warnings,
                format!("source classification failed for {ingredient}: {err:#}"),
            );
            return (empty_research(ingredient, risk_level), warnings);
        }
    };

    let risky = matches!(
        risk_level,
        RiskLevel::HighScrutiny | RiskLevel::ModerateConcern
    );
    if risky && classified.claims.len() < 3 {
        let regulatory_query =
            format!("{ingredient} regulatory status FDA EFSA restrictions prohibited");
        match searched_documents(ctx, &regulatory_query, results_per_ingredient).await {
            Ok(extra_documents) if !extra_documents.is_empty() => {
                match classify_documents(ctx, ingredient, &extra_documents).await {
                    Ok(Some(supplemental)) => {
                        // The regulatory pass sees the sharper sources, so
                        // its conflict verdict wins.
                        classified.claims.extend(supplemental.claims);
                        classified.conflict_detected = supplemental.conflict_detected;
                        classified.conflict_type = supplemental.conflict_type;
                        classified.conflict_summary = supplemental.conflict_summary;
                        classified.ambiguity_level = supplemental.ambiguity_level;
                        if supplemental.overall_confidence.is_some() {
                            classified.overall_confidence = supplemental.overall_confidence;
                        }
                    }
                    Ok(None) | Err(_) => push_unique_warning(
                        &mut warnings,
                        format!("regulatory follow-up unusable for {ingredient}"),
                    ),
                }
            }
            Ok(_) => {}
            Err(err) => push_unique_warning(
                &mut warnings,
                format!("regulatory follow-up failed for {ingredient}: {err:#}"),
            ),
        }
    }

    let mean_claim_confidence = if classified.claims.is_empty() {
        0.0
    } else {
        classified
            .claims
            .iter()
            .map(|claim| claim.classification_confidence)
            .sum::<f64>()
            / classified.claims.len() as f64
    };
    let research = IngredientResearch {
        ingredient: ingredient.to_string(),
        risk_level,
        conflict_detected: classified.conflict_detected,
        conflict_type: classified.conflict_type,
        conflict_summary: classified.conflict_summary,
        confidence_score: classified.overall_confidence.unwrap_or(mean_claim_confidence),
        ambiguity_level: classified.ambiguity_level.unwrap_or(AmbiguityLevel::Medium),
        claims: classified.claims,
    };
    (research, warnings)
}

/// A genuine conflict with at least one settled claim becomes a neutral
/// trade-off presentation, capped at four positions.
pub fn extract_trade_offs(researched: &[IngredientResearch]) -> Vec<TradeOffContext> {
    researched
        .iter()
        .filter(|entry| entry.conflict_detected)
        .filter_map(|entry| {
            let has_settled_claim = entry
                .claims
                .iter()
                .any(|claim| claim.stance != Stance::UnderReview);
            if !has_settled_claim {
                return None;
            }
            let positions: Vec<TradeOffPosition> = entry
                .claims
                .iter()
                .take(4)
                .map(|claim| TradeOffPosition {
                    source: claim.source.clone(),
                    credibility: claim.credibility,
                    region: claim.region,
                    stance: claim.stance,
                    rationale: claim.claim.clone(),
                })
                .collect();
            Some(TradeOffContext {
                ingredient: entry.ingredient.clone(),
                conflict_type: entry.conflict_type.unwrap_or(ConflictType::Scientific),
                summary: entry.conflict_summary.clone().unwrap_or_else(|| {
                    format!("Sources disagree about {}", entry.ingredient)
                }),
                positions,
                user_guidance: format!(
                    "Credible sources take different positions on {}. The positions below are \
                     presented side by side; weigh them against your own priorities.",
                    entry.ingredient
                ),
            })
        })
        .collect()
}

fn stance_digest(researched: &[IngredientResearch]) -> String {
    researched
        .iter()
        .map(|entry| {
            let stances: Vec<&str> = entry
                .claims
                .iter()
                .map(|claim| claim.stance.as_str())
                .collect();
            format!(
                "{} ({} sources: {})",
                entry.ingredient,
                entry.claims.len(),
                if stances.is_empty() {
                    "none".to_string()
                } else {
                    stances.join(", ")
                }
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn build_synthesis_prompt(
    researched: &[IngredientResearch],
    trade_offs: &[TradeOffContext],
    consensus: ConsensusStatus,
    overall_confidence: f64,
    intent: &IntentProfile,
) -> String {
    let mut user = format!(
        "Persona: {} (bias: {}).\nFindings:\n{}\n",
        intent.persona,
        intent.context_bias,
        serde_json::to_string(researched).unwrap_or_default()
    );
    match consensus {
        ConsensusStatus::ConflictingEvidence => user.push_str(
            "\nThe evidence genuinely conflicts. Present every position neutrally and do not \
             recommend a side; never write that the user should avoid or should choose \
             anything.\n",
        ),
        ConsensusStatus::InsufficientData => {
            user.push_str("\nEvidence is thin. Say so explicitly.\n")
        }
        ConsensusStatus::ClearConsensus => {}
    }
    if overall_confidence < 0.6 {
        user.push_str("State clearly that confidence in this analysis is limited.\n");
    }
    if !trade_offs.is_empty() {
        user.push_str(&format!(
            "Trade-offs to cover: {}\n",
            serde_json::to_string(trade_offs).unwrap_or_default()
        ));
    }
    user
}

async fn synthesize_analysis(
    ctx: &StageContext,
    researched: &[IngredientResearch],
    trade_offs: &[TradeOffContext],
    consensus: ConsensusStatus,
    overall_confidence: f64,
    intent: &IntentProfile,
) -> String {
    let user =
        build_synthesis_prompt(researched, trade_offs, consensus, overall_confidence, intent);
    let mut request = ModelRequest::json(SYNTHESIS_SYSTEM, user);
    request.json_mode = false;
    request.max_tokens = Some(700);
    request.temperature = 0.4;

    match ctx.text_call(&request).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => format!(
            "Research summary for {} ingredient(s): {}.",
            researched.len(),
            stance_digest(researched)
        ),
    }
}

fn metadata_footer(consensus: ConsensusStatus, metadata: &ResearchMetadata) -> String {
    format!(
        "---\nconsensus: {}\nsources: {}\nconfidence: {:.0}%\nunresolved_conflicts: {}\nwarnings: {}",
        consensus.as_str(),
        metadata.sources_consulted,
        metadata.overall_confidence * 100.0,
        metadata.unresolved_conflicts,
        metadata.data_warnings.len()
    )
}

/// Drives the whole research stage. Degrades, never fails: every error is
/// folded into warnings and lower-confidence output.
pub async fn run_research(
    ctx: &StageContext,
    ingredients: &IndexSet<String>,
    intent: &IntentProfile,
) -> ResearchResult {
    let mut warnings: Vec<String> = Vec::new();

    if ctx.search.is_none() {
        push_unique_warning(
            &mut warnings,
            "external search unavailable; ingredient research skipped".to_string(),
        );
        let metadata = ResearchMetadata {
            sources_consulted: 0,
            overall_confidence: 0.5,
            unresolved_conflicts: 0,
            data_warnings: warnings,
        };
        let consensus = ConsensusStatus::InsufficientData;
        return ResearchResult {
            analysis_text: format!(
                "{NO_SEARCH_ANALYSIS}\n\n{}",
                metadata_footer(consensus, &metadata)
            ),
            consensus_status: consensus,
            ingredient_research: Vec::new(),
            trade_off_contexts: Vec::new(),
            metadata,
        };
    }

    let assessment = intent.risk_assessment.as_ref();
    let mut selected = select_ingredients(ingredients, assessment);
    if selected.is_empty() && !ingredients.is_empty() {
        push_unique_warning(
            &mut warnings,
            format!(
                "no risk triage available for {} ingredients; research skipped",
                ingredients.len()
            ),
        );
    }
    sort_by_risk(&mut selected, assessment);
    let has_high_risk = selected
        .iter()
        .any(|ingredient| risk_for(ingredient, assessment) == RiskLevel::HighScrutiny);
    let budget = derive_budget(selected.len(), has_high_risk);
    selected.truncate(budget.max_ingredients);

    let window = ctx.config.research_timeout.saturating_sub(WINDOW_MARGIN);
    let started = Instant::now();
    let mut researched: Vec<IngredientResearch> = Vec::new();
    let total_batches = selected.chunks(BATCH_SIZE).count();

    for (batch_index, batch) in selected.chunks(BATCH_SIZE).enumerate() {
        if started.elapsed() >= window {
            push_unique_warning(
                &mut warnings,
                format!(
                    "research window closed after {} of {} ingredients",
                    researched.len(),
                    selected.len()
                ),
            );
            break;
        }
        // Siblings within a batch complete or fail independently; results
        // are folded in ingredient order, not completion order.
        let outcomes = join_all(batch.iter().map(|ingredient| {
            research_ingredient(
                ctx,
                ingredient,
                intent,
                risk_for(ingredient, assessment),
                budget.results_per_ingredient,
            )
        }))
        .await;
        for (research, ingredient_warnings) in outcomes {
            researched.push(research);
            for warning in ingredient_warnings {
                push_unique_warning(&mut warnings, warning);
            }
        }
        if batch_index + 1 < total_batches {
            sleep(INTER_BATCH_DELAY).await;
        }
    }

    let consensus = determine_consensus_status(&researched);
    let trade_offs = extract_trade_offs(&researched);
    let sources_consulted: usize = researched.iter().map(|entry| entry.claims.len()).sum();
    let overall_confidence = if researched.is_empty() {
        0.5
    } else {
        researched
            .iter()
            .map(|entry| entry.confidence_score)
            .sum::<f64>()
            / researched.len() as f64
    };
    let unresolved_conflicts = researched
        .iter()
        .filter(|entry| entry.conflict_detected)
        .count();

    let analysis_body = synthesize_analysis(
        ctx,
        &researched,
        &trade_offs,
        consensus,
        overall_confidence,
        intent,
    )
    .await;

    let metadata = ResearchMetadata {
        sources_consulted,
        overall_confidence,
        unresolved_conflicts,
        data_warnings: warnings,
    };
    ResearchResult {
        analysis_text: format!("{analysis_body}\n\n{}", metadata_footer(consensus, &metadata)),
        consensus_status: consensus,
        ingredient_research: researched,
        trade_off_contexts: trade_offs,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use labelens_contracts::intent::IntentProfile;

    use super::*;
    use crate::config::EngineConfig;
    use crate::providers::model::{ScriptedModelClient, ScriptedReply};
    use crate::providers::search::{ScriptedSearch, ScriptedSearchClient};

    fn ingredients(names: &[&str]) -> IndexSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn classification_reply(claims: usize, conflict: bool) -> String {
        let rows: Vec<serde_json::Value> = (0..claims)
            .map(|idx| {
                json!({
                    "source": format!("Source {idx}"),
                    "credibility": if idx == 0 { "regulatory" } else { "news" },
                    "claim": "discussion of the ingredient",
                    "stance": if conflict && idx == 0 { "restricted" } else { "generally_safe" },
                    "region": if idx == 0 { "eu" } else { "us" },
                    "confidence": 0.8
                })
            })
            .collect();
        json!({
            "claims": rows,
            "conflictDetected": conflict,
            "conflictType": "regional",
            "conflictSummary": "EU restricts what the US permits",
            "ambiguityLevel": "low",
            "overallConfidence": 0.8
        })
        .to_string()
    }

    #[test]
    fn budget_trades_depth_for_breadth() {
        assert_eq!(
            derive_budget(2, false),
            ResearchBudget { max_ingredients: 2, results_per_ingredient: 5 }
        );
        assert_eq!(
            derive_budget(4, false),
            ResearchBudget { max_ingredients: 4, results_per_ingredient: 4 }
        );
        assert_eq!(
            derive_budget(9, false),
            ResearchBudget { max_ingredients: 3, results_per_ingredient: 3 }
        );
        assert_eq!(
            derive_budget(9, true),
            ResearchBudget { max_ingredients: 4, results_per_ingredient: 3 }
        );
    }

    #[test]
    fn selection_prefers_assessment_then_small_scans() {
        let all = ingredients(&["a", "b", "c"]);
        assert_eq!(select_ingredients(&all, None), vec!["a", "b", "c"]);

        let many = ingredients(&["a", "b", "c", "d", "e", "f"]);
        assert!(select_ingredients(&many, None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn three_ingredients_run_in_two_batches_and_sum_sources() {
        let reply = classification_reply(2, false);
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            reply.as_str(),
            reply.as_str(),
            reply.as_str(),
            "All three ingredients look uncontroversial.",
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
        ]));
        let ctx = StageContext::scripted(model, Some(search));

        let started = Instant::now();
        let result = run_research(
            &ctx,
            &ingredients(&["sugar", "palm oil", "msg"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert_eq!(result.ingredient_research.len(), 3);
        // sources_consulted is the sum of per-ingredient claim counts.
        assert_eq!(result.metadata.sources_consulted, 6);
        assert_eq!(result.consensus_status, ConsensusStatus::ClearConsensus);
        // Two batches (2 + 1) with exactly one inter-batch pause.
        assert!(started.elapsed() >= Duration::from_millis(500));
        // Results come back in ingredient order.
        let order: Vec<&str> = result
            .ingredient_research
            .iter()
            .map(|entry| entry.ingredient.as_str())
            .collect();
        assert_eq!(order, vec!["sugar", "palm oil", "msg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn genuine_conflict_produces_trade_offs() {
        let reply = classification_reply(3, true);
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            reply.as_str(),
            "Positions differ by region; both are presented.",
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![ScriptedSearch::Documents(
            ScriptedSearchClient::canned_documents(3),
        )]));
        let ctx = StageContext::scripted(model, Some(search));

        let result = run_research(
            &ctx,
            &ingredients(&["titanium dioxide"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert_eq!(result.consensus_status, ConsensusStatus::ConflictingEvidence);
        assert!(!result.trade_off_contexts.is_empty());
        let context = &result.trade_off_contexts[0];
        assert_eq!(context.conflict_type, ConflictType::Regional);
        assert!(context.positions.len() <= 4);
        assert_eq!(result.metadata.unresolved_conflicts, 1);
        // Conflicted output must not take a side.
        let analysis = result.analysis_text.to_lowercase();
        assert!(!analysis.contains("you should avoid"));
        assert!(!analysis.contains("you should choose"));
    }

    #[test]
    fn conflicted_synthesis_prompt_carries_the_neutrality_constraint() {
        let mut entry = empty_research("titanium dioxide", RiskLevel::HighScrutiny);
        entry.conflict_detected = true;
        let intent = IntentProfile::general_default();

        let conflicted = build_synthesis_prompt(
            &[entry.clone()],
            &[],
            ConsensusStatus::ConflictingEvidence,
            0.8,
            &intent,
        );
        assert!(conflicted.contains("Present every position neutrally"));
        assert!(conflicted.contains("never write that the user should avoid"));

        let settled = build_synthesis_prompt(
            &[entry],
            &[],
            ConsensusStatus::ClearConsensus,
            0.8,
            &intent,
        );
        assert!(!settled.contains("neutrally"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_search_degrades_only_that_ingredient() {
        let reply = classification_reply(2, false);
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            reply.as_str(),
            "Partial research completed.",
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Failure("provider down".to_string()),
        ]));
        let mut config = EngineConfig::offline();
        config.retries = 0;
        let ctx = StageContext::scripted_with(model, Some(search), config);

        let result = run_research(
            &ctx,
            &ingredients(&["sugar", "aspartame"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert_eq!(result.ingredient_research.len(), 2);
        // The scripted queue is popped concurrently, so either sibling may
        // have drawn the failure; exactly one of them is empty.
        let empty_count = result
            .ingredient_research
            .iter()
            .filter(|entry| entry.claims.is_empty())
            .count();
        assert_eq!(empty_count, 1);
        assert!(result
            .metadata
            .data_warnings
            .iter()
            .any(|warning| warning.contains("search failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_search_loses_its_private_timeout_race() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            "No research completed.",
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![ScriptedSearch::Hang]));
        let mut config = EngineConfig::offline();
        config.retries = 0;
        let ctx = StageContext::scripted_with(model, Some(search), config);

        let result = run_research(
            &ctx,
            &ingredients(&["sugar"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert_eq!(result.ingredient_research.len(), 1);
        assert!(result.ingredient_research[0].claims.is_empty());
        assert_eq!(result.consensus_status, ConsensusStatus::InsufficientData);
    }

    #[tokio::test]
    async fn missing_search_key_degrades_with_one_warning() {
        let model = Arc::new(ScriptedModelClient::with_texts(vec![]));
        let ctx = StageContext::scripted(model, None);

        let result = run_research(
            &ctx,
            &ingredients(&["sugar"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert!(result.ingredient_research.is_empty());
        assert_eq!(result.metadata.overall_confidence, 0.5);
        assert_eq!(result.metadata.data_warnings.len(), 1);
        assert_eq!(result.consensus_status, ConsensusStatus::InsufficientData);
        assert!(result.analysis_text.contains("consensus: INSUFFICIENT_DATA"));
    }

    #[tokio::test]
    async fn untriaged_large_scans_warn_instead_of_silently_skipping() {
        // Six ingredients and no risk assessment: nothing is selected, but
        // the skip must be visible in the warnings.
        let model = Arc::new(ScriptedModelClient::with_texts(vec![
            "Nothing was researched for this scan.",
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![]));
        let ctx = StageContext::scripted(model, Some(search));

        let result = run_research(
            &ctx,
            &ingredients(&["a", "b", "c", "d", "e", "f"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert!(result.ingredient_research.is_empty());
        assert_eq!(result.consensus_status, ConsensusStatus::InsufficientData);
        assert!(result
            .metadata
            .data_warnings
            .iter()
            .any(|warning| warning.contains("no risk triage available for 6 ingredients")));
    }

    #[tokio::test(start_paused = true)]
    async fn window_exhaustion_abandons_later_batches_with_a_warning() {
        // Classification for the first batch takes 7s; the window is
        // research_timeout (15s) - 10s margin = 5s, so the second batch
        // never starts.
        let model = Arc::new(ScriptedModelClient::new(vec![
            ScriptedReply::Slow(Duration::from_secs(7), classification_reply(2, false)),
            ScriptedReply::Slow(Duration::from_secs(7), classification_reply(2, false)),
            ScriptedReply::Text("Partial analysis.".to_string()),
        ]));
        let search = Arc::new(ScriptedSearchClient::new(vec![
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
        ]));
        let mut config = EngineConfig::offline();
        config.research_timeout = Duration::from_secs(15);
        let ctx = StageContext::scripted_with(model, Some(search), config);

        let result = run_research(
            &ctx,
            &ingredients(&["sugar", "palm oil", "msg"]),
            &IntentProfile::general_default(),
        )
        .await;

        assert_eq!(result.ingredient_research.len(), 2);
        assert!(result
            .metadata
            .data_warnings
            .iter()
            .any(|warning| warning.contains("research window closed after 2 of 3")));
    }

    #[test]
    fn trade_offs_skip_all_under_review_ingredients() {
        let mut entry = empty_research("sugar", RiskLevel::LowRisk);
        entry.conflict_detected = true;
        entry.claims = vec![SourceClaim {
            source: "EFSA".to_string(),
            source_url: None,
            credibility: labelens_contracts::research::Credibility::Regulatory,
            claim: "being re-evaluated".to_string(),
            stance: Stance::UnderReview,
            region: labelens_contracts::research::Region::EuropeanUnion,
            date_published: None,
            classification_confidence: 0.7,
        }];
        assert!(extract_trade_offs(&[entry]).is_empty());
    }
}
