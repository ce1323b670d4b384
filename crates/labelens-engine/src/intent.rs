use indexmap::IndexSet;

use labelens_contracts::coerce::json_object_from_text;
use labelens_contracts::history::HistoryEntry;
use labelens_contracts::intent::IntentProfile;

use crate::pipeline::StageContext;
use crate::providers::model::ModelRequest;

const INTENT_SYSTEM: &str = "You infer what a shopper cares about from their current scan and \
recent scans. Reply with one JSON object: {\"persona\": string, \"contextBias\": string, \
\"confidence\": \"high\"|\"medium\"|\"low\", \"riskAssessment\": {\"ingredientsToResearch\": \
[string], \"riskDetails\": {ingredient: {\"riskLevel\": \"high_scrutiny\"|\"moderate_concern\"|\
\"low_risk\"|\"generally_recognized_safe\", \"reasoning\": string, \"requiresDeepResearch\": \
bool}}}}. CRITICAL: riskDetails keys must repeat the ingredient strings below exactly as \
written: same casing, same spacing, no translation.";

/// Hard-coded nudges blended into the inference prompt.
const INFERENCE_HEURISTICS: [&str; 6] = [
    "A fitness-heavy history plus a high-carbohydrate product today suggests Carb Loading.",
    "Two or more recent low-sugar scans suggest Sugar Avoidance regardless of today's product.",
    "Baby food or lunchbox snacks in the history suggest Shopping For Kids.",
    "A history clustered around protein products and supplements suggests Muscle Building.",
    "A scan location mentioning a pharmacy biases toward Ingredient Sensitivity checks.",
    "No history and a mainstream snack suggests General Health with a curiosity bias.",
];

#[derive(Debug, Clone, Default)]
pub struct HistoryDigest {
    pub recent_products: Vec<String>,
    pub recent_intents: Vec<String>,
    /// Persona repeated at least twice across the window.
    pub dominant_category: Option<String>,
}

pub fn digest_history(entries: &[HistoryEntry]) -> HistoryDigest {
    let recent_products: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.product_name.clone())
        .collect();
    let recent_intents: Vec<String> = entries
        .iter()
        .map(|entry| entry.persona.clone())
        .collect();

    let mut dominant_category = None;
    for persona in &recent_intents {
        let repeats = recent_intents.iter().filter(|other| *other == persona).count();
        if repeats >= 2 {
            dominant_category = Some(persona.clone());
            break;
        }
    }

    HistoryDigest {
        recent_products,
        recent_intents,
        dominant_category,
    }
}

/// Single constrained inference call. Degrades to the general default
/// profile on any failure; intent is never worth failing a scan over.
pub async fn infer_intent(
    ctx: &StageContext,
    ingredients: &IndexSet<String>,
    product_name: Option<&str>,
    scan_location: Option<&str>,
    history: &[HistoryEntry],
) -> IntentProfile {
    let digest = digest_history(history);
    let had_history = !history.is_empty();

    let ingredient_lines: Vec<String> = ingredients
        .iter()
        .map(|ingredient| format!("- {ingredient}"))
        .collect();
    let mut user = format!(
        "Current scan{}{}:\nIngredients (repeat these exactly as riskDetails keys):\n{}\n",
        product_name
            .map(|name| format!(": {name}"))
            .unwrap_or_default(),
        scan_location
            .map(|location| format!(" (scanned at {location})"))
            .unwrap_or_default(),
        ingredient_lines.join("\n"),
    );
    if had_history {
        user.push_str(&format!(
            "\nRecent products: {}\nRecent intents: {}\nDominant category: {}\n",
            digest.recent_products.join(", "),
            digest.recent_intents.join(", "),
            digest.dominant_category.as_deref().unwrap_or("none"),
        ));
    } else {
        user.push_str("\nNo scan history for this session.\n");
    }
    user.push_str("\nHeuristics:\n");
    for heuristic in INFERENCE_HEURISTICS {
        user.push_str("- ");
        user.push_str(heuristic);
        user.push('\n');
    }

    let mut request = ModelRequest::json(INTENT_SYSTEM, user);
    request.max_tokens = Some(200);

    match ctx.text_call(&request).await {
        Ok(reply) => match json_object_from_text(&reply) {
            Some(value) => IntentProfile::from_model_value(&value, had_history),
            None => {
                ctx.warn("intent reply was not parseable; using general profile");
                IntentProfile::general_default()
            }
        },
        Err(err) => {
            ctx.warn(&format!("intent inference failed: {err:#}"));
            IntentProfile::general_default()
        }
    }
}
