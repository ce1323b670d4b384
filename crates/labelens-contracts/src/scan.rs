use anyhow::{bail, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::research::ResearchMetadata;
use crate::ui::DynamicUiResponse;
use crate::vision::VisionFailureReason;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Base64(String),
}

/// One inbound scan. Exactly one of image/barcode must be resolvable to an
/// ingredient list; the pipeline never proceeds with zero ingredients and no
/// fallback path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    pub image: Option<ImageSource>,
    pub barcode: Option<String>,
    pub scan_location: Option<String>,
    pub session_id: Option<String>,
}

impl ScanRequest {
    /// Input-error gate, applied before any model call.
    pub fn validate(&self) -> Result<()> {
        let has_barcode = self
            .barcode
            .as_deref()
            .map(str::trim)
            .is_some_and(|code| !code.is_empty());
        if self.image.is_none() && !has_barcode {
            bail!("scan request needs an image or a barcode");
        }
        Ok(())
    }
}

/// What the barcode lookup collaborator returns for a known product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub barcode: String,
    pub product_name: Option<String>,
    pub ingredients_text: Option<String>,
}

/// Splits a raw label ingredient string into the ordered, de-duplicated set
/// the pipeline works with. Casing is preserved; downstream joins are
/// exact-string.
pub fn parse_ingredient_list(raw: &str) -> IndexSet<String> {
    raw.split(|ch| matches!(ch, ',' | ';' | '\n'))
        .map(|part| part.trim().trim_end_matches('.').trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPrompt {
    pub message: String,
    pub suggested_questions: Vec<String>,
}

/// The response envelope. An explicit sum type: every consumer matches
/// exhaustively, there is no status-string sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanResponse {
    VisionFailed {
        message: String,
        detected_context: Option<String>,
        failure_reason: VisionFailureReason,
        confidence: f64,
        components: Vec<ConversationPrompt>,
    },
    Success {
        ui: DynamicUiResponse,
        research_metadata: ResearchMetadata,
    },
    TimedOut {
        elapsed_ms: u64,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_requests() {
        assert!(ScanRequest::default().validate().is_err());
        assert!(ScanRequest {
            barcode: Some("   ".to_string()),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ScanRequest {
            barcode: Some("4006381333931".to_string()),
            ..Default::default()
        }
        .validate()
        .is_ok());
        assert!(ScanRequest {
            image: Some(ImageSource::Bytes(vec![1, 2, 3])),
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn ingredient_parsing_splits_and_deduplicates_in_order() {
        let set = parse_ingredient_list(
            "Sugar, Palm Oil; MSG,\nSugar , Cocoa Butter (processed with alkali).",
        );
        let items: Vec<&str> = set.iter().map(String::as_str).collect();
        assert_eq!(
            items,
            vec![
                "Sugar",
                "Palm Oil",
                "MSG",
                "Cocoa Butter (processed with alkali)"
            ]
        );
    }

    #[test]
    fn ingredient_parsing_preserves_casing() {
        let set = parse_ingredient_list("MSG, msg");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn scan_response_serializes_with_status_tag() {
        let response = ScanResponse::TimedOut {
            elapsed_ms: 31000,
            message: "scan timed out".to_string(),
        };
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["status"], "timed_out");
        assert_eq!(value["elapsed_ms"], 31000);
    }
}
