use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coerce::{
    clamp_unit, normalize_token, string_field, string_list, value_as_f64,
};

/// Semantic type of a component prop, used by renderers to pick a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropType {
    Text,
    Number,
    Percentage,
    Rating,
    Badge,
    List,
    KeyValue,
    Link,
    ImageUrl,
    Boolean,
    Timeline,
}

impl PropType {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "text" | "string" | "paragraph" => Some(Self::Text),
            "number" | "numeric" | "int" | "integer" | "float" => Some(Self::Number),
            "percentage" | "percent" | "ratio" | "score" => Some(Self::Percentage),
            "rating" | "stars" => Some(Self::Rating),
            "badge" | "tag" | "label" | "chip" => Some(Self::Badge),
            "list" | "array" | "items" | "bullets" => Some(Self::List),
            "keyvalue" | "map" | "table" | "dict" | "object" => Some(Self::KeyValue),
            "link" | "url" | "href" => Some(Self::Link),
            "imageurl" | "image" | "img" => Some(Self::ImageUrl),
            "boolean" | "bool" | "flag" | "toggle" => Some(Self::Boolean),
            "timeline" | "chronology" | "dates" => Some(Self::Timeline),
            _ => None,
        }
    }

    /// Structural fallback when no semantic classification is available:
    /// 0–1 / 0–100 numerics read as percentages, arrays of keyed objects as
    /// key-value data, otherwise the primitive type decides.
    pub fn infer_from_value(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(number) => {
                let parsed = number.as_f64().unwrap_or(0.0);
                if (0.0..=1.0).contains(&parsed) || (0.0..=100.0).contains(&parsed) {
                    Self::Percentage
                } else {
                    Self::Number
                }
            }
            Value::Array(rows) => {
                if rows.iter().any(Value::is_object) {
                    Self::KeyValue
                } else {
                    Self::List
                }
            }
            Value::Object(_) => Self::KeyValue,
            Value::String(raw) => {
                if raw.starts_with("http://") || raw.starts_with("https://") {
                    Self::Link
                } else {
                    Self::Text
                }
            }
            Value::Null => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayoutVariant {
    Card,
    Banner,
    InlineList,
    Table,
    Comparison,
    Timeline,
    Accordion,
}

impl LayoutVariant {
    pub fn from_loose(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "card" | "panel" | "tile" => Some(Self::Card),
            "banner" | "hero" | "alert" => Some(Self::Banner),
            "inlinelist" | "inline" | "list" | "row" => Some(Self::InlineList),
            "table" | "grid" => Some(Self::Table),
            "comparison" | "compare" | "versus" | "sidebyside" => Some(Self::Comparison),
            "timeline" | "chronology" => Some(Self::Timeline),
            "accordion" | "collapsible" | "expandable" => Some(Self::Accordion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropSpec {
    pub name: String,
    pub prop_type: PropType,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSchema {
    pub name: String,
    pub description: String,
    pub required_props: Vec<PropSpec>,
}

impl ComponentSchema {
    pub fn from_model_value(value: &Value) -> Option<Self> {
        let name = string_field(value, &["name", "component", "componentName"])?;
        let mut required_props = Vec::new();
        if let Some(rows) = value
            .get("requiredProps")
            .or_else(|| value.get("required_props"))
            .or_else(|| value.get("props"))
            .and_then(Value::as_array)
        {
            for row in rows {
                let Some(prop_name) = string_field(row, &["name", "prop"]) else {
                    continue;
                };
                required_props.push(PropSpec {
                    name: prop_name,
                    prop_type: string_field(row, &["type", "propType", "prop_type"])
                        .and_then(|raw| PropType::from_loose(&raw))
                        .unwrap_or(PropType::Text),
                    description: string_field(row, &["description", "desc"]).unwrap_or_default(),
                });
            }
        }
        Some(Self {
            name,
            description: string_field(value, &["description", "desc", "purpose"])
                .unwrap_or_default(),
            required_props,
        })
    }

    /// Builds a schema entry for an instance that arrived without one, by
    /// structural inference over the instance's props.
    pub fn inferred_from_props(name: &str, props: &Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Inferred schema for {name}"),
            required_props: props
                .iter()
                .map(|(prop_name, prop_value)| PropSpec {
                    name: prop_name.clone(),
                    prop_type: PropType::infer_from_value(prop_value),
                    description: String::new(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub intent: String,
    pub confidence: f64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInstance {
    /// Must reference a [`ComponentSchema::name`] in the owning response;
    /// the UI stage synthesizes missing entries before the response leaves.
    pub component: String,
    pub variant: LayoutVariant,
    pub priority: u8,
    pub props: Map<String, Value>,
    pub metadata: InstanceMetadata,
}

impl ComponentInstance {
    pub fn from_model_value(value: &Value) -> Option<Self> {
        let component = string_field(value, &["component", "name", "componentName"])?;
        let props = value
            .get("props")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let metadata_value = value.get("metadata").cloned().unwrap_or(Value::Null);
        Some(Self {
            component,
            variant: string_field(value, &["variant", "layout"])
                .and_then(|raw| LayoutVariant::from_loose(&raw))
                .unwrap_or(LayoutVariant::Card),
            priority: value_as_f64(value.get("priority"), 5.0, 1.0, 10.0).round() as u8,
            props,
            metadata: InstanceMetadata {
                intent: string_field(&metadata_value, &["intent", "purpose"])
                    .unwrap_or_default(),
                confidence: clamp_unit(value_as_f64(
                    metadata_value.get("confidence"),
                    0.5,
                    0.0,
                    1.0,
                )),
                sources: string_list(metadata_value.get("sources")),
            },
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiSchema {
    pub generated_components: Vec<ComponentSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicUiResponse {
    pub schema: UiSchema,
    pub components: Vec<ComponentInstance>,
    pub layout_hints: Option<Value>,
}

impl DynamicUiResponse {
    /// Instance component names with no matching schema entry.
    pub fn missing_schema_names(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for instance in &self.components {
            let known = self
                .schema
                .generated_components
                .iter()
                .any(|schema| schema.name == instance.component);
            if !known && !missing.contains(&instance.component) {
                missing.push(instance.component.clone());
            }
        }
        missing
    }

    /// Structural self-heal: synthesizes schema entries for orphaned
    /// instances so the schema-coverage invariant holds on exit.
    pub fn heal_schema_coverage(&mut self) -> usize {
        let missing = self.missing_schema_names();
        for name in &missing {
            let props = self
                .components
                .iter()
                .find(|instance| &instance.component == name)
                .map(|instance| instance.props.clone())
                .unwrap_or_default();
            self.schema
                .generated_components
                .push(ComponentSchema::inferred_from_props(name, &props));
        }
        missing.len()
    }

    /// Last-resort payload: one static analysis component carrying the raw
    /// text. The pipeline never returns an empty or malformed UI payload.
    pub fn fallback_analysis(analysis_text: &str) -> Self {
        let mut props = Map::new();
        props.insert(
            "analysis".to_string(),
            Value::String(analysis_text.to_string()),
        );
        Self {
            schema: UiSchema {
                generated_components: vec![ComponentSchema {
                    name: "AnalysisResult".to_string(),
                    description: "Plain rendering of the research analysis".to_string(),
                    required_props: vec![PropSpec {
                        name: "analysis".to_string(),
                        prop_type: PropType::Text,
                        description: "Full analysis text".to_string(),
                    }],
                }],
            },
            components: vec![ComponentInstance {
                component: "AnalysisResult".to_string(),
                variant: LayoutVariant::Card,
                priority: 5,
                props,
                metadata: InstanceMetadata {
                    intent: "fallback".to_string(),
                    confidence: 0.3,
                    sources: Vec::new(),
                },
            }],
            layout_hints: None,
        }
    }
}
