use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use labelens_contracts::coerce::string_field;
use labelens_contracts::scan::ProductRecord;

use crate::config::EngineConfig;
use crate::providers::{response_json_or_status_error, HttpStatusError};

#[async_trait]
pub trait ProductLookup: Send + Sync {
    /// `None` means "unknown barcode", which is an input condition, not an
    /// error.
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>>;
}

/// Open Food Facts-style product lookup (`/api/v2/product/{code}.json`).
pub struct ProductLookupClient {
    api_base: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl ProductLookupClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.barcode_api_base.clone(),
            request_timeout: config.search_call_timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProductLookup for ProductLookupClient {
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>> {
        let code = barcode.trim();
        let endpoint = format!("{}/api/v2/product/{}.json", self.api_base, code);
        let response = self
            .http
            .get(&endpoint)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("barcode lookup failed ({endpoint})"))?;

        let payload = match response_json_or_status_error("barcode", response).await {
            Ok(payload) => payload,
            Err(err) => {
                if err
                    .downcast_ref::<HttpStatusError>()
                    .is_some_and(|status| status.status == 404)
                {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        if payload.get("status").and_then(Value::as_i64) == Some(0) {
            return Ok(None);
        }
        let Some(product) = payload.get("product") else {
            return Ok(None);
        };
        Ok(Some(ProductRecord {
            barcode: code.to_string(),
            product_name: string_field(product, &["product_name", "product_name_en", "name"]),
            ingredients_text: string_field(
                product,
                &["ingredients_text", "ingredients_text_en"],
            ),
        }))
    }
}

/// Fixed barcode table for offline runs and tests.
#[derive(Default)]
pub struct ScriptedProductLookup {
    records: Mutex<HashMap<String, ProductRecord>>,
}

impl ScriptedProductLookup {
    pub fn new(records: Vec<ProductRecord>) -> Self {
        Self {
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.barcode.clone(), record))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ProductLookup for ScriptedProductLookup {
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted lookup table poisoned"))?;
        Ok(records.get(barcode.trim()).cloned())
    }
}
