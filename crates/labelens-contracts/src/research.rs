use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce::{clamp_unit, normalize_token, string_field, value_as_f64};
use crate::intent::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credibility {
    Regulatory,
    PeerReviewed,
    Medical,
    Industry,
    News,
    Unverified,
}

impl Credibility {
    pub fn from_loose(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "regulatory" | "government" | "agency" | "official" => Self::Regulatory,
            "peerreviewed" | "academic" | "scientific" | "journal" | "research" => {
                Self::PeerReviewed
            }
            "medical" | "clinical" | "health" => Self::Medical,
            "industry" | "trade" | "manufacturer" | "commercial" => Self::Industry,
            "news" | "media" | "press" | "journalism" => Self::News,
            _ => Self::Unverified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regulatory => "regulatory",
            Self::PeerReviewed => "peer_reviewed",
            Self::Medical => "medical",
            Self::Industry => "industry",
            Self::News => "news",
            Self::Unverified => "unverified",
        }
    }

    /// Higher ranks outweigh lower ones when deciding whether a
    /// disagreement is genuine or merely apparent.
    pub fn rank(self) -> u8 {
        match self {
            Self::Regulatory => 5,
            Self::PeerReviewed => 4,
            Self::Medical => 3,
            Self::Industry => 2,
            Self::News => 1,
            Self::Unverified => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Approved,
    GenerallySafe,
    Neutral,
    UnderReview,
    Restricted,
    Prohibited,
}

impl Stance {
    pub fn from_loose(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "approved" | "endorsed" | "permitted" => Self::Approved,
            "generallysafe" | "safe" | "gras" | "acceptable" => Self::GenerallySafe,
            "underreview" | "pending" | "reevaluating" | "reevaluation" | "understudy" => {
                Self::UnderReview
            }
            "restricted" | "limited" | "caution" | "warning" | "conditional" => Self::Restricted,
            "prohibited" | "banned" | "forbidden" | "illegal" => Self::Prohibited,
            _ => Self::Neutral,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::GenerallySafe => "generally_safe",
            Self::Neutral => "neutral",
            Self::UnderReview => "under_review",
            Self::Restricted => "restricted",
            Self::Prohibited => "prohibited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Global,
    UnitedStates,
    EuropeanUnion,
    UnitedKingdom,
    Canada,
    Australia,
    Japan,
    China,
    India,
    LatinAmerica,
}

impl Region {
    pub fn from_loose(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "us" | "usa" | "unitedstates" | "america" | "fda" => Self::UnitedStates,
            "eu" | "europe" | "europeanunion" | "efsa" => Self::EuropeanUnion,
            "uk" | "unitedkingdom" | "britain" | "greatbritain" => Self::UnitedKingdom,
            "canada" | "ca" => Self::Canada,
            "australia" | "au" | "australianewzealand" | "fsanz" => Self::Australia,
            "japan" | "jp" => Self::Japan,
            "china" | "cn" | "prc" => Self::China,
            "india" | "in" | "fssai" => Self::India,
            "latinamerica" | "latam" | "southamerica" | "mexico" | "brazil" => Self::LatinAmerica,
            _ => Self::Global,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::UnitedStates => "united_states",
            Self::EuropeanUnion => "european_union",
            Self::UnitedKingdom => "united_kingdom",
            Self::Canada => "canada",
            Self::Australia => "australia",
            Self::Japan => "japan",
            Self::China => "china",
            Self::India => "india",
            Self::LatinAmerica => "latin_america",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Regional,
    Scientific,
    Dosage,
    Population,
    Temporal,
    Methodological,
}

impl ConflictType {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "regional" | "jurisdictional" | "geographic" => Some(Self::Regional),
            "scientific" | "evidence" | "research" => Some(Self::Scientific),
            "dosage" | "dose" | "quantity" | "threshold" => Some(Self::Dosage),
            "population" | "demographic" | "subgroup" => Some(Self::Population),
            "temporal" | "outdated" | "historical" => Some(Self::Temporal),
            "methodological" | "methodology" | "studydesign" => Some(Self::Methodological),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regional => "regional",
            Self::Scientific => "scientific",
            Self::Dosage => "dosage",
            Self::Population => "population",
            Self::Temporal => "temporal",
            Self::Methodological => "methodological",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    Low,
    Medium,
    High,
}

impl AmbiguityLevel {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "low" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Aggregate verdict over all researched ingredients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
    ClearConsensus,
    ConflictingEvidence,
    InsufficientData,
}

impl ConsensusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClearConsensus => "CLEAR_CONSENSUS",
            Self::ConflictingEvidence => "CONFLICTING_EVIDENCE",
            Self::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

/// One external document, classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceClaim {
    pub source: String,
    pub source_url: Option<String>,
    pub credibility: Credibility,
    pub claim: String,
    pub stance: Stance,
    pub region: Region,
    pub date_published: Option<String>,
    pub classification_confidence: f64,
}

impl SourceClaim {
    /// Coerces one classified-source object; returns None when there is no
    /// usable claim text, which drops the entry rather than failing the
    /// whole classification.
    pub fn from_model_value(value: &Value) -> Option<Self> {
        let claim = string_field(value, &["claim", "claimText", "claim_text", "summary"])?;
        let source = string_field(value, &["source", "sourceName", "source_name", "title"])
            .unwrap_or_else(|| "Unnamed source".to_string());
        Some(Self {
            source,
            source_url: string_field(value, &["sourceUrl", "source_url", "url"]),
            credibility: string_field(value, &["credibility"])
                .map(|raw| Credibility::from_loose(&raw))
                .unwrap_or(Credibility::Unverified),
            claim,
            stance: string_field(value, &["stance", "position", "verdict"])
                .map(|raw| Stance::from_loose(&raw))
                .unwrap_or(Stance::Neutral),
            region: string_field(value, &["region", "jurisdiction"])
                .map(|raw| Region::from_loose(&raw))
                .unwrap_or(Region::Global),
            date_published: string_field(value, &["datePublished", "date_published", "date"]),
            classification_confidence: clamp_unit(value_as_f64(
                value
                    .get("classificationConfidence")
                    .or_else(|| value.get("classification_confidence"))
                    .or_else(|| value.get("confidence")),
                0.5,
                0.0,
                1.0,
            )),
        })
    }
}

/// Aggregated findings for one ingredient under research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientResearch {
    pub ingredient: String,
    pub risk_level: RiskLevel,
    pub claims: Vec<SourceClaim>,
    pub conflict_detected: bool,
    pub conflict_type: Option<ConflictType>,
    pub conflict_summary: Option<String>,
    pub confidence_score: f64,
    pub ambiguity_level: AmbiguityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOffPosition {
    pub source: String,
    pub credibility: Credibility,
    pub region: Region,
    pub stance: Stance,
    pub rationale: String,
}

/// Neutral presentation of disagreeing positions on one ingredient.
/// Only exists for genuine (not merely apparent) conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOffContext {
    pub ingredient: String,
    pub conflict_type: ConflictType,
    pub summary: String,
    pub positions: Vec<TradeOffPosition>,
    pub user_guidance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchMetadata {
    pub sources_consulted: usize,
    pub overall_confidence: f64,
    pub unresolved_conflicts: usize,
    pub data_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub analysis_text: String,
    pub consensus_status: ConsensusStatus,
    pub ingredient_research: Vec<IngredientResearch>,
    pub trade_off_contexts: Vec<TradeOffContext>,
    pub metadata: ResearchMetadata,
}

/// Pure consensus decision over a finished research batch. Idempotent:
/// identical input always yields the same status.
pub fn determine_consensus_status(researched: &[IngredientResearch]) -> ConsensusStatus {
    let total_claims: usize = researched.iter().map(|entry| entry.claims.len()).sum();
    if researched.is_empty() || total_claims < 2 {
        return ConsensusStatus::InsufficientData;
    }
    if researched.iter().any(|entry| entry.conflict_detected) {
        return ConsensusStatus::ConflictingEvidence;
    }
    let mean_confidence: f64 = researched
        .iter()
        .map(|entry| entry.confidence_score)
        .sum::<f64>()
        / researched.len() as f64;
    if mean_confidence >= 0.7 {
        ConsensusStatus::ClearConsensus
    } else {
        ConsensusStatus::InsufficientData
    }
}
