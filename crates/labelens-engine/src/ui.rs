use serde_json::Value;

use labelens_contracts::coerce::{json_object_from_text, string_field};
use labelens_contracts::intent::IntentProfile;
use labelens_contracts::research::{ConsensusStatus, ResearchResult};
use labelens_contracts::ui::{
    ComponentInstance, ComponentSchema, DynamicUiResponse, PropType, UiSchema,
};

use crate::pipeline::StageContext;
use crate::providers::model::ModelRequest;

const INVENTION_SYSTEM: &str = "You design the presentation layer for a food-scan analysis. \
Invent between 2 and 5 UI components named after what this specific analysis found, then \
instantiate them with real data from the findings. Generic names are forbidden: never use \
Card, Container, Wrapper, Box, Panel, View, Section, or Component as a name. Reply with one \
JSON object: {\"schema\": {\"generatedComponents\": [{\"name\": string, \"description\": \
string, \"requiredProps\": [{\"name\": string, \"type\": \"text\"|\"number\"|\"percentage\"|\
\"rating\"|\"badge\"|\"list\"|\"keyValue\"|\"link\"|\"imageUrl\"|\"boolean\"|\"timeline\", \
\"description\": string}]}]}, \"components\": [{\"component\": string, \"variant\": \"card\"|\
\"banner\"|\"inlineList\"|\"table\"|\"comparison\"|\"timeline\"|\"accordion\", \"priority\": \
number 1-10, \"props\": object, \"metadata\": {\"intent\": string, \"confidence\": number 0-1, \
\"sources\": [string]}}], \"layoutHints\": object}. Every instance's component name must match \
a generatedComponents entry.";

const PROP_CLASSIFICATION_SYSTEM: &str = "You map UI prop declarations to semantic prop types. \
For each listed \"Component.prop\" key, pick one of: text, number, percentage, rating, badge, \
list, keyValue, link, imageUrl, boolean, timeline. Reply with one JSON object mapping each key \
to its type.";

/// A declared prop type the strict vocabulary rejected, kept aside for the
/// recovery pass.
#[derive(Debug, Clone)]
struct UnknownProp {
    component: String,
    prop: String,
    declared: String,
}

pub fn build_invention_prompt(research: &ResearchResult, intent: &IntentProfile) -> String {
    let mut user = format!(
        "Persona: {} (bias: {}).\n\nAnalysis:\n{}\n\nPer-ingredient findings:\n{}\n",
        intent.persona,
        intent.context_bias,
        research.analysis_text,
        serde_json::to_string(&research.ingredient_research).unwrap_or_default(),
    );
    if !research.trade_off_contexts.is_empty() {
        user.push_str(&format!(
            "\nTrade-offs:\n{}\n",
            serde_json::to_string(&research.trade_off_contexts).unwrap_or_default()
        ));
    }
    if research.consensus_status == ConsensusStatus::ConflictingEvidence {
        user.push_str(
            "\nThe evidence conflicts. One component MUST present every position neutrally, \
             side by side, without recommending any of them.\n",
        );
    }
    user
}

fn parse_schemas(value: &Value) -> (Vec<ComponentSchema>, Vec<UnknownProp>) {
    let rows = value
        .get("schema")
        .and_then(|schema| {
            schema
                .get("generatedComponents")
                .or_else(|| schema.get("generated_components"))
        })
        .or_else(|| value.get("generatedComponents"))
        .or_else(|| value.get("schemas"))
        .and_then(Value::as_array);

    let mut schemas = Vec::new();
    let mut unknown = Vec::new();
    for row in rows.into_iter().flatten() {
        let Some(schema) = ComponentSchema::from_model_value(row) else {
            continue;
        };
        // The strict coercion silently defaults unknown types to text;
        // remember which ones it rejected so the recovery pass can do
        // better than that.
        if let Some(prop_rows) = row
            .get("requiredProps")
            .or_else(|| row.get("required_props"))
            .or_else(|| row.get("props"))
            .and_then(Value::as_array)
        {
            for prop_row in prop_rows {
                let Some(prop_name) = string_field(prop_row, &["name", "prop"]) else {
                    continue;
                };
                if let Some(declared) = string_field(prop_row, &["type", "propType", "prop_type"])
                {
                    if PropType::from_loose(&declared).is_none() {
                        unknown.push(UnknownProp {
                            component: schema.name.clone(),
                            prop: prop_name,
                            declared,
                        });
                    }
                }
            }
        }
        schemas.push(schema);
    }
    (schemas, unknown)
}

fn parse_instances(value: &Value) -> Vec<ComponentInstance> {
    value
        .get("components")
        .or_else(|| value.get("instances"))
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(ComponentInstance::from_model_value)
                .collect()
        })
        .unwrap_or_default()
}

fn instance_prop_value<'a>(
    instances: &'a [ComponentInstance],
    component: &str,
    prop: &str,
) -> Option<&'a Value> {
    instances
        .iter()
        .find(|instance| instance.component == component)
        .and_then(|instance| instance.props.get(prop))
}

fn apply_prop_type(response: &mut DynamicUiResponse, component: &str, prop: &str, ty: PropType) {
    if let Some(spec) = response
        .schema
        .generated_components
        .iter_mut()
        .find(|schema| schema.name == component)
        .and_then(|schema| {
            schema
                .required_props
                .iter_mut()
                .find(|candidate| candidate.name == prop)
        })
    {
        spec.prop_type = ty;
    }
}

/// Two-step recovery for prop types outside the vocabulary: one model call
/// classifying all of them at once, then structural inference over the
/// matching instance value for anything the call could not settle.
async fn recover_prop_types(
    ctx: &StageContext,
    response: &mut DynamicUiResponse,
    unknown: Vec<UnknownProp>,
) {
    if unknown.is_empty() {
        return;
    }
    let listing: Vec<String> = unknown
        .iter()
        .map(|entry| {
            format!(
                "{}.{} (declared: {})",
                entry.component, entry.prop, entry.declared
            )
        })
        .collect();
    let mut request = ModelRequest::json(PROP_CLASSIFICATION_SYSTEM, listing.join("\n"));
    request.max_tokens = Some(300);

    let classified = match ctx.text_call(&request).await {
        Ok(reply) => json_object_from_text(&reply),
        Err(_) => None,
    };

    for entry in unknown {
        let key = format!("{}.{}", entry.component, entry.prop);
        let from_model = classified
            .as_ref()
            .and_then(|value| value.get(&key))
            .and_then(Value::as_str)
            .and_then(PropType::from_loose);
        let resolved = from_model.unwrap_or_else(|| {
            instance_prop_value(&response.components, &entry.component, &entry.prop)
                .map(PropType::infer_from_value)
                .unwrap_or(PropType::Text)
        });
        apply_prop_type(response, &entry.component, &entry.prop, resolved);
    }
}

/// Turns the research result into a renderable UI payload. Every failure
/// mode lands on the static analysis fallback; the caller always gets
/// something it can render, with full schema coverage.
pub async fn synthesize_ui(
    ctx: &StageContext,
    research: &ResearchResult,
    intent: &IntentProfile,
) -> DynamicUiResponse {
    let mut request = ModelRequest::json(
        INVENTION_SYSTEM,
        build_invention_prompt(research, intent),
    );
    request.max_tokens = Some(1800);
    request.temperature = 0.5;

    let reply = match ctx.text_call(&request).await {
        Ok(reply) => reply,
        Err(err) => {
            ctx.warn(&format!("ui synthesis call failed: {err:#}"));
            return DynamicUiResponse::fallback_analysis(&research.analysis_text);
        }
    };
    let Some(value) = json_object_from_text(&reply) else {
        ctx.warn("ui synthesis reply was not parseable");
        return DynamicUiResponse::fallback_analysis(&research.analysis_text);
    };

    let (schemas, unknown) = parse_schemas(&value);
    let components = parse_instances(&value);
    if components.is_empty() {
        ctx.warn("ui synthesis produced no component instances");
        return DynamicUiResponse::fallback_analysis(&research.analysis_text);
    }

    let mut response = DynamicUiResponse {
        schema: UiSchema {
            generated_components: schemas,
        },
        components,
        layout_hints: value
            .get("layoutHints")
            .or_else(|| value.get("layout_hints"))
            .filter(|hints| hints.is_object())
            .cloned(),
    };

    // Orphaned components get the same semantic classification as
    // declared-but-unknown prop types; healing first gives them schema
    // entries for the recovered types to land in.
    let mut unknown = unknown;
    for name in response.missing_schema_names() {
        if let Some(instance) = response
            .components
            .iter()
            .find(|instance| instance.component == name)
        {
            for prop in instance.props.keys() {
                unknown.push(UnknownProp {
                    component: name.clone(),
                    prop: prop.clone(),
                    declared: "undeclared".to_string(),
                });
            }
        }
    }
    let healed = response.heal_schema_coverage();
    if healed > 0 {
        ctx.warn(&format!("synthesized {healed} missing component schema(s)"));
    }
    recover_prop_types(ctx, &mut response, unknown).await;
    response
}
