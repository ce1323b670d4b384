use anyhow::Result;
use serde_json::json;

use labelens_contracts::coerce::{
    json_object_from_text, string_field, string_list, value_as_bool, value_as_f64,
};
use labelens_contracts::vision::{
    ExtractionQuality, RawExtraction, VisionExtraction, VisionFailure, VisionFailureReason,
    VisionOutcome,
};

use crate::pipeline::StageContext;
use crate::providers::model::{ImageAttachment, ModelRequest};

const EXTRACTION_SYSTEM: &str = "You read photographs of food product labels. Reply with one JSON \
object: {\"readable\": bool, \"ingredients\": [string], \"nutrition\": {name: string|number}, \
\"confidence\": number 0-1, \"productType\": string}. List ingredients exactly as printed, in \
label order, without translating or rewording them. If the label cannot be read, set readable \
to false and say why in \"productType\".";

const EXTRACTION_USER: &str = "Extract the ingredient list and nutrition facts from this photo.";

const ASSESSMENT_SYSTEM: &str = "You audit a label-extraction attempt. Given the extractor's raw \
JSON, decide independently whether it is usable for ingredient analysis. Do not trust the \
extractor's own confidence number. Reply with one JSON object: {\"usable\": bool, \
\"confidence\": number 0-1, \"quality\": \"high\"|\"medium\"|\"low\", \"failureReason\": string, \
\"productTypeGuess\": string}.";

const FAILURE_MESSAGE_SYSTEM: &str = "A food-label photo could not be read well enough to \
analyze. Write a short, friendly message telling the user what went wrong and what to try, plus \
three follow-up questions they could tap. Reply with one JSON object: {\"message\": string, \
\"suggestedQuestions\": [string, string, string]}.";

const FALLBACK_MESSAGE: &str = "I couldn't read that label clearly enough to analyze it. A \
sharper, well-lit photo of the ingredient list usually does the trick.";

const FALLBACK_QUESTIONS: [&str; 3] = [
    "Can you retake the photo closer to the ingredient list?",
    "Does the product have a barcode I could scan instead?",
    "Do you want to type the ingredients in by hand?",
];

#[derive(Debug, Clone)]
struct Assessment {
    usable: bool,
    confidence: f64,
    quality: ExtractionQuality,
    reason: VisionFailureReason,
    product_type_guess: Option<String>,
}

/// Runs the extraction call and the two-tier quality gate. Never fails for
/// model-content reasons; only transport errors (already retried) escape.
pub async fn extract_from_image(
    ctx: &StageContext,
    image: &ImageAttachment,
) -> Result<VisionOutcome> {
    let mut request = ModelRequest::json(EXTRACTION_SYSTEM, EXTRACTION_USER);
    request.image = Some(image.clone());
    request.temperature = 0.1;
    request.max_tokens = Some(900);

    let raw_text = ctx.vision_call(&request).await?;
    let raw = json_object_from_text(&raw_text)
        .map(|value| RawExtraction::from_value(&value))
        .unwrap_or_else(|| RawExtraction::from_value(&json!({})));

    // Tier one: a self-reported clean read with enough ingredients skips
    // the secondary assessment entirely.
    if raw.readable && raw.ingredients.len() >= 3 && raw.confidence > 0.7 {
        return Ok(VisionOutcome::Success(VisionExtraction {
            ingredients: raw.ingredients,
            nutrition: raw.nutrition,
            confidence: raw.confidence,
            quality: ExtractionQuality::High,
        }));
    }

    // Tier two: an independent assessment of the same raw data. The first
    // model's confidence claim is never trusted on its own.
    let assessment = assess_extraction(ctx, &raw_text, &raw).await?;
    if assessment.usable && !raw.ingredients.is_empty() {
        return Ok(VisionOutcome::Success(VisionExtraction {
            ingredients: raw.ingredients,
            nutrition: raw.nutrition,
            confidence: assessment.confidence,
            quality: assessment.quality,
        }));
    }

    Ok(VisionOutcome::Failure(
        failure_payload(ctx, &raw, &assessment).await,
    ))
}

async fn assess_extraction(
    ctx: &StageContext,
    raw_text: &str,
    raw: &RawExtraction,
) -> Result<Assessment> {
    let user = format!("Raw extractor output:\n{raw_text}");
    let mut request = ModelRequest::json(ASSESSMENT_SYSTEM, user);
    request.max_tokens = Some(250);
    let reply = ctx.text_call(&request).await?;

    let Some(value) = json_object_from_text(&reply) else {
        // Unparseable assessment: fall back to a conservative structural
        // read of the extraction itself.
        return Ok(Assessment {
            usable: !raw.ingredients.is_empty(),
            confidence: raw.confidence.min(0.5),
            quality: ExtractionQuality::Low,
            reason: VisionFailureReason::Unreadable,
            product_type_guess: raw.product_type_guess.clone(),
        });
    };

    let quality = string_field(&value, &["quality"])
        .and_then(|raw_quality| ExtractionQuality::from_loose(&raw_quality))
        .unwrap_or(ExtractionQuality::Medium);
    Ok(Assessment {
        usable: value_as_bool(value.get("usable")).unwrap_or(false),
        confidence: value_as_f64(value.get("confidence"), 0.3, 0.0, 1.0),
        quality,
        reason: string_field(&value, &["failureReason", "failure_reason", "reason"])
            .map(|raw_reason| VisionFailureReason::from_loose(&raw_reason))
            .unwrap_or(VisionFailureReason::Unreadable),
        product_type_guess: string_field(&value, &["productTypeGuess", "product_type_guess"])
            .or_else(|| raw.product_type_guess.clone()),
    })
}

/// Builds the conversational failure. The message itself is model-written;
/// if that call fails for any reason the static fallback takes over, so
/// this path can never error.
async fn failure_payload(
    ctx: &StageContext,
    raw: &RawExtraction,
    assessment: &Assessment,
) -> VisionFailure {
    let context_line = assessment
        .product_type_guess
        .as_deref()
        .map(|guess| format!("The photo appears to show: {guess}."))
        .unwrap_or_default();
    let user = format!(
        "Failure reason: {}. {} Ingredients recognized so far: {}.",
        assessment.reason.as_str(),
        context_line,
        raw.ingredients.len()
    );
    let mut request = ModelRequest::json(FAILURE_MESSAGE_SYSTEM, user);
    request.max_tokens = Some(300);
    request.temperature = 0.7;

    let (message, suggested_questions) = match ctx.text_call(&request).await {
        Ok(reply) => match json_object_from_text(&reply) {
            Some(value) => {
                let message = string_field(&value, &["message"])
                    .unwrap_or_else(|| FALLBACK_MESSAGE.to_string());
                let mut questions = string_list(
                    value
                        .get("suggestedQuestions")
                        .or_else(|| value.get("suggested_questions")),
                );
                questions.truncate(3);
                while questions.len() < 3 {
                    questions.push(FALLBACK_QUESTIONS[questions.len()].to_string());
                }
                (message, questions)
            }
            None => static_failure_content(),
        },
        Err(_) => static_failure_content(),
    };

    VisionFailure {
        reason: assessment.reason,
        message,
        suggested_questions,
        product_type_guess: assessment.product_type_guess.clone(),
        confidence: assessment.confidence,
    }
}

fn static_failure_content() -> (String, Vec<String>) {
    (
        FALLBACK_MESSAGE.to_string(),
        FALLBACK_QUESTIONS.iter().map(|q| q.to_string()).collect(),
    )
}
