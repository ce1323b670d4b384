use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce::{
    clamp_unit, normalize_token, string_field, string_list, value_as_bool, value_as_f64,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionQuality {
    High,
    Medium,
    Low,
}

impl ExtractionQuality {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "high" | "good" | "excellent" => Some(Self::High),
            "medium" | "moderate" | "partial" | "fair" => Some(Self::Medium),
            "low" | "poor" | "bad" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionFailureReason {
    BlurryImage,
    NoLabelVisible,
    PartialLabel,
    NotFoodProduct,
    LowLight,
    Unreadable,
}

impl VisionFailureReason {
    pub fn from_loose(raw: &str) -> Self {
        let token = normalize_token(raw);
        match token.as_str() {
            "blurry" | "blurryimage" | "blur" | "outoffocus" => Self::BlurryImage,
            "nolabel" | "nolabelvisible" | "missinglabel" | "noingredients"
            | "noingredientsvisible" => Self::NoLabelVisible,
            "partial" | "partiallabel" | "cropped" | "cutoff" => Self::PartialLabel,
            "notfood" | "notfoodproduct" | "notaproduct" | "nonfood" => Self::NotFoodProduct,
            "lowlight" | "dark" | "toodark" | "glare" => Self::LowLight,
            _ => Self::Unreadable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlurryImage => "blurry_image",
            Self::NoLabelVisible => "no_label_visible",
            Self::PartialLabel => "partial_label",
            Self::NotFoodProduct => "not_food_product",
            Self::LowLight => "low_light",
            Self::Unreadable => "unreadable",
        }
    }
}

/// Result of the vision stage. Created once per scan, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VisionOutcome {
    Success(VisionExtraction),
    Failure(VisionFailure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionExtraction {
    pub ingredients: IndexSet<String>,
    pub nutrition: IndexMap<String, Value>,
    pub confidence: f64,
    pub quality: ExtractionQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionFailure {
    pub reason: VisionFailureReason,
    pub message: String,
    pub suggested_questions: Vec<String>,
    pub product_type_guess: Option<String>,
    pub confidence: f64,
}

/// What the extraction model actually returned, before the quality gate has
/// decided anything. Every field is coerced defensively; a missing field is
/// a degraded value, never a parse error.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    pub ingredients: IndexSet<String>,
    pub nutrition: IndexMap<String, Value>,
    pub confidence: f64,
    pub readable: bool,
    pub product_type_guess: Option<String>,
}

impl RawExtraction {
    pub fn from_value(value: &Value) -> Self {
        let ingredients: IndexSet<String> = string_list(value.get("ingredients"))
            .into_iter()
            .map(|entry| entry.trim().trim_end_matches('.').to_string())
            .filter(|entry| !entry.is_empty())
            .collect();

        let mut nutrition = IndexMap::new();
        if let Some(object) = value.get("nutrition").and_then(Value::as_object) {
            for (key, entry) in object {
                match entry {
                    Value::String(_) | Value::Number(_) => {
                        nutrition.insert(key.clone(), entry.clone());
                    }
                    _ => {}
                }
            }
        }

        Self {
            ingredients,
            nutrition,
            confidence: clamp_unit(value_as_f64(value.get("confidence"), 0.0, 0.0, 1.0)),
            readable: value_as_bool(value.get("readable")).unwrap_or(false),
            product_type_guess: string_field(value, &["productType", "product_type", "product"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn raw_extraction_coerces_defensively() {
        let value = json!({
            "ingredients": ["Sugar.", "  Palm Oil ", "", "MSG"],
            "nutrition": { "calories": 120, "serving": "30g", "junk": { "x": 1 } },
            "confidence": "0.88",
            "readable": "yes",
            "productType": "granola bar"
        });
        let raw = RawExtraction::from_value(&value);
        assert_eq!(
            raw.ingredients.iter().cloned().collect::<Vec<_>>(),
            vec!["Sugar", "Palm Oil", "MSG"]
        );
        assert_eq!(raw.nutrition.len(), 2);
        assert!((raw.confidence - 0.88).abs() < 1e-9);
        assert!(raw.readable);
        assert_eq!(raw.product_type_guess.as_deref(), Some("granola bar"));
    }

    #[test]
    fn raw_extraction_survives_an_empty_object() {
        let raw = RawExtraction::from_value(&json!({}));
        assert!(raw.ingredients.is_empty());
        assert!(raw.nutrition.is_empty());
        assert_eq!(raw.confidence, 0.0);
        assert!(!raw.readable);
    }

    #[test]
    fn failure_reason_fuzzy_matches_model_variants() {
        assert_eq!(
            VisionFailureReason::from_loose("BLURRY_IMAGE"),
            VisionFailureReason::BlurryImage
        );
        assert_eq!(
            VisionFailureReason::from_loose("no ingredients visible"),
            VisionFailureReason::NoLabelVisible
        );
        assert_eq!(
            VisionFailureReason::from_loose("something else entirely"),
            VisionFailureReason::Unreadable
        );
    }

    #[test]
    fn quality_fuzzy_matches() {
        assert_eq!(
            ExtractionQuality::from_loose("Good"),
            Some(ExtractionQuality::High)
        );
        assert_eq!(ExtractionQuality::from_loose("weird"), None);
    }
}
