use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce::{normalize_token, string_field, string_list, value_as_bool};

pub const DEFAULT_PERSONA: &str = "General Health";
pub const DEFAULT_CONTEXT_BIAS: &str = "balanced overview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "high" | "strong" | "certain" => Some(Self::High),
            "medium" | "moderate" => Some(Self::Medium),
            "low" | "weak" | "uncertain" => Some(Self::Low),
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

/// Four-tier scrutiny classification driving how much external research an
/// ingredient receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    HighScrutiny,
    ModerateConcern,
    LowRisk,
    GenerallyRecognizedSafe,
}

impl RiskLevel {
    pub fn priority(self) -> u8 {
        match self {
            Self::HighScrutiny => 3,
            Self::ModerateConcern => 2,
            Self::LowRisk => 1,
            Self::GenerallyRecognizedSafe => 0,
        }
    }

    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "highscrutiny" | "high" | "highrisk" | "severe" => Some(Self::HighScrutiny),
            "moderateconcern" | "moderate" | "medium" | "moderaterisk" => {
                Some(Self::ModerateConcern)
            }
            "lowrisk" | "low" | "minor" => Some(Self::LowRisk),
            "generallyrecognizedsafe" | "gras" | "safe" | "generallysafe" => {
                Some(Self::GenerallyRecognizedSafe)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighScrutiny => "high_scrutiny",
            Self::ModerateConcern => "moderate_concern",
            Self::LowRisk => "low_risk",
            Self::GenerallyRecognizedSafe => "generally_recognized_safe",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDetail {
    pub risk_level: RiskLevel,
    pub reasoning: String,
    pub requires_deep_research: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub ingredients_to_research: Vec<String>,
    /// Keyed by the ingredient string exactly as it appeared in the scan.
    /// Downstream joins are exact-string; a key the model rewrote (casing,
    /// translation, trimming) silently loses that ingredient's detail.
    pub risk_details: IndexMap<String, RiskDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentProfile {
    pub persona: String,
    pub context_bias: String,
    pub confidence: ConfidenceBand,
    pub history_influenced: bool,
    pub risk_assessment: Option<RiskAssessment>,
}

impl IntentProfile {
    pub fn general_default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            context_bias: DEFAULT_CONTEXT_BIAS.to_string(),
            confidence: ConfidenceBand::Medium,
            history_influenced: false,
            risk_assessment: None,
        }
    }

    /// Field-by-field defensive parse of the inference model's output.
    /// Risk-detail keys are carried over verbatim, never normalized.
    pub fn from_model_value(value: &Value, had_history: bool) -> Self {
        let persona = string_field(value, &["persona"]).unwrap_or_else(|| {
            DEFAULT_PERSONA.to_string()
        });
        let context_bias = string_field(value, &["contextBias", "context_bias", "bias"])
            .unwrap_or_else(|| DEFAULT_CONTEXT_BIAS.to_string());
        let confidence = string_field(value, &["confidence"])
            .and_then(|raw| ConfidenceBand::from_loose(&raw))
            .unwrap_or(ConfidenceBand::Medium);

        let risk_assessment = value
            .get("riskAssessment")
            .or_else(|| value.get("risk_assessment"))
            .and_then(parse_risk_assessment);

        Self {
            persona,
            context_bias,
            confidence,
            history_influenced: had_history && confidence != ConfidenceBand::Low,
            risk_assessment,
        }
    }
}

fn parse_risk_assessment(value: &Value) -> Option<RiskAssessment> {
    let object = value.as_object()?;
    let ingredients_to_research = string_list(
        object
            .get("ingredientsToResearch")
            .or_else(|| object.get("ingredients_to_research")),
    );

    let mut risk_details = IndexMap::new();
    if let Some(details) = object
        .get("riskDetails")
        .or_else(|| object.get("risk_details"))
        .and_then(Value::as_object)
    {
        for (ingredient, detail) in details {
            let Some(risk_level) = string_field(detail, &["riskLevel", "risk_level", "level"])
                .and_then(|raw| RiskLevel::from_loose(&raw))
            else {
                continue;
            };
            risk_details.insert(
                ingredient.clone(),
                RiskDetail {
                    risk_level,
                    reasoning: string_field(detail, &["reasoning", "reason"])
                        .unwrap_or_default(),
                    requires_deep_research: value_as_bool(
                        detail
                            .get("requiresDeepResearch")
                            .or_else(|| detail.get("requires_deep_research")),
                    )
                    .unwrap_or(false),
                },
            );
        }
    }

    if ingredients_to_research.is_empty() && risk_details.is_empty() {
        return None;
    }
    Some(RiskAssessment {
        ingredients_to_research,
        risk_details,
    })
}
