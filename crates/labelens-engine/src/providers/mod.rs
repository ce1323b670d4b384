pub mod barcode;
pub mod model;
pub mod search;

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use labelens_contracts::coerce::truncate_text;
use serde_json::Value;

/// An HTTP response the provider refused. Carried through `anyhow::Error`
/// and recovered by `downcast_ref` in the retry executor, which needs the
/// status code and the rate-limit hint.
#[derive(Debug)]
pub struct HttpStatusError {
    pub provider: String,
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} request failed ({}): {}",
            self.provider,
            self.status,
            truncate_text(&self.body, 512)
        )
    }
}

impl std::error::Error for HttpStatusError {}

/// Reads the body, converting non-2xx statuses into [`HttpStatusError`]
/// (keeping any `Retry-After` hint) and everything else into parsed JSON.
pub(crate) async fn response_json_or_status_error(
    provider: &str,
    response: reqwest::Response,
) -> Result<Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response
        .text()
        .await
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        return Err(HttpStatusError {
            provider: provider.to_string(),
            status: status.as_u16(),
            retry_after,
            body,
        }
        .into());
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_round_trips_through_anyhow() {
        let err: anyhow::Error = HttpStatusError {
            provider: "model".to_string(),
            status: 429,
            retry_after: Some(Duration::from_secs(4)),
            body: "slow down".to_string(),
        }
        .into();

        let recovered = err.downcast_ref::<HttpStatusError>().expect("downcast");
        assert_eq!(recovered.status, 429);
        assert_eq!(recovered.retry_after, Some(Duration::from_secs(4)));
        assert!(err.to_string().contains("429"));
    }
}
