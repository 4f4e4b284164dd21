//! Authenticated HTTP feed adapter.
//!
//! The remote endpoint is an opaque byte contract: a JSON object of numeric
//! fields, optionally carrying its own capture timestamp. Anything else is
//! `Malformed`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{MarketSource, SourceError};
use crate::types::MarketSnapshot;

pub struct HttpSource {
    id: String,
    url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSource {
    pub fn new(id: &str, base: &str, api_key: Option<String>, client: Client) -> Self {
        Self {
            id: id.to_string(),
            url: format!("{}/{}", base.trim_end_matches('/'), id),
            api_key,
            client,
        }
    }

    fn classify_status(status: u16) -> SourceError {
        match status {
            401 | 403 => SourceError::AuthFailure,
            429 => SourceError::RateLimited,
            408 | 504 => SourceError::Timeout,
            other => SourceError::Malformed(format!("unexpected status {}", other)),
        }
    }

    fn parse_body(&self, body: Value, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
        let map = body
            .as_object()
            .ok_or_else(|| SourceError::Malformed("payload is not an object".to_string()))?;

        let captured_at = map
            .get("captured_at")
            .and_then(Value::as_u64)
            .unwrap_or(now_ts);

        let mut fields = BTreeMap::new();
        for (name, value) in map {
            if name == "captured_at" {
                continue;
            }
            if let Some(num) = value.as_f64() {
                fields.insert(name.clone(), num);
            }
        }
        if fields.is_empty() {
            return Err(SourceError::Malformed("no numeric fields".to_string()));
        }

        Ok(MarketSnapshot {
            source_id: self.id.clone(),
            captured_at,
            fields,
            stale: false,
        })
    }
}

#[async_trait]
impl MarketSource for HttpSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
        let mut req = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key.as_str());
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                SourceError::Timeout
            } else {
                SourceError::Malformed(err.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if status != 200 {
            return Err(Self::classify_status(status));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| SourceError::Malformed(err.to_string()))?;
        self.parse_body(body, now_ts)
    }
}
