use reqwest::header::{ACCEPT, CONTENT_TYPE, ORIGIN, REFERER};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::collector::{CollectContext, Flavor, RateCollector};
use crate::error::CollectError;
use crate::util::parse_rate;

/// Rate published through a JSON endpoint (POST with a fixed payload).
///
/// The response layout is not versioned, so several dotted paths are
/// probed in order; the first one holding a positive number wins.
pub struct JsonApiCollector {
    pub bank: &'static str,
    /// Raw JSON request body
    pub payload: &'static str,
    pub paths: &'static [&'static str],
    pub referer: Option<&'static str>,
    pub origin: Option<&'static str>,
}

#[async_trait::async_trait]
impl RateCollector for JsonApiCollector {
    fn bank_name(&self) -> &'static str {
        self.bank
    }

    fn flavor(&self) -> Flavor {
        Flavor::Stateless
    }

    async fn collect(&self, ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
        let mut req = ctx
            .http
            .post(ctx.endpoint)
            .header(ACCEPT, "application/json, text/plain, */*")
            .header(CONTENT_TYPE, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .body(self.payload);
        if let Some(r) = self.referer {
            req = req.header(REFERER, r);
        }
        if let Some(o) = self.origin {
            req = req.header(ORIGIN, o);
        }

        let text = req.send().await?.error_for_status()?.text().await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            CollectError::StructureNotRecognized(format!("response is not JSON: {e}"))
        })?;

        probe(&body, self.paths)
    }
}

/// Walks `paths` ("data.rates.buy") and returns the first positive rate.
pub fn probe(body: &Value, paths: &[&str]) -> Result<Decimal, CollectError> {
    let mut unparsable: Option<String> = None;

    for path in paths {
        let Some(found) = lookup(body, path) else { continue };

        let parsed = match found {
            Value::Number(n) => parse_rate(&n.to_string()),
            Value::String(s) => parse_rate(s),
            Value::Null => continue,
            _ => None,
        };
        match parsed {
            Some(v) => return Ok(v),
            None => unparsable = Some(found.to_string()),
        }
    }

    match unparsable {
        Some(raw) => Err(CollectError::ValueUnparsable(raw)),
        None => Err(CollectError::StructureNotRecognized(format!(
            "none of {paths:?} present in response"
        ))),
    }
}

fn lookup<'v>(body: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(body, |v, key| v.get(key))
}
