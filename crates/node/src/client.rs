//! HTTP client for the hub API.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::settings::PumpMode;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ENROLL_SECRET_HEADER: &str = "x-enroll-secret";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The hub rejected our api key (or enrollment secret).
    #[error("unauthorized")]
    Unauthorized,

    #[error("hub returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReport {
    pub pump_on: bool,
    pub pump_mode: PumpMode,
    pub note: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingReport {
    pub device_id: String,
    pub moisture: f64,
    pub payload: ReadingPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPayload {
    pub raw: i64,
    pub pump_on: bool,
    pub note: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuedKey {
    api_key: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HubClient {
    http: reqwest::Client,
    /// No overall timeout: the push stream stays open indefinitely.
    stream_http: reqwest::Client,
    base_url: String,
    device_id: String,
}

impl HubClient {
    pub fn new(base_url: &str, device_id: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let stream_http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            stream_http,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_url(&self, suffix: &str) -> String {
        format!("{}/api/devices/{}/{suffix}", self.base_url, self.device_id)
    }

    /// Asks the hub for a fresh api key. Invalidates any previous key.
    pub async fn rotate_key(&self, enroll_secret: Option<&str>) -> Result<String, ClientError> {
        let mut req = self.http.post(self.device_url("rotate-key"));
        if let Some(secret) = enroll_secret {
            req = req.header(ENROLL_SECRET_HEADER, secret);
        }
        let issued: IssuedKey = send(req).await?.json().await?;
        Ok(issued.api_key)
    }

    /// Raw settings body; the caller merges it field by field.
    pub async fn fetch_settings(&self, api_key: &str) -> Result<Value, ClientError> {
        let req = self
            .http
            .get(self.device_url("settings"))
            .header(API_KEY_HEADER, api_key);
        Ok(send(req).await?.json().await?)
    }

    /// Opens the server-sent event stream. The caller reads it chunk by chunk.
    pub async fn open_stream(&self, api_key: &str) -> Result<Response, ClientError> {
        let req = self
            .stream_http
            .get(self.device_url("stream"))
            .header(API_KEY_HEADER, api_key)
            .header("accept", "text/event-stream");
        send(req).await
    }

    pub async fn post_ack(&self, api_key: &str, ack: &AckReport) -> Result<(), ClientError> {
        let req = self
            .http
            .post(self.device_url("ack"))
            .header(API_KEY_HEADER, api_key)
            .json(ack);
        send(req).await?;
        Ok(())
    }

    pub async fn post_reading(&self, api_key: &str, reading: &ReadingReport) -> Result<(), ClientError> {
        let req = self
            .http
            .post(format!("{}/api/readings", self.base_url))
            .header(API_KEY_HEADER, api_key)
            .json(reading);
        send(req).await?;
        Ok(())
    }
}

async fn send(req: RequestBuilder) -> Result<Response, ClientError> {
    let resp = req.send().await?;
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized),
        s => Err(ClientError::Status(s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_uses_hub_field_names() {
        let ack = AckReport {
            pump_on: true,
            pump_mode: PumpMode::Manual,
            note: "state changed",
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "pumpOn": true, "pumpMode": "manual", "note": "state changed" })
        );
    }

    #[test]
    fn reading_uses_hub_field_names() {
        let r = ReadingReport {
            device_id: "esp32-001".into(),
            moisture: 41.5,
            payload: ReadingPayload {
                raw: 20190,
                pump_on: false,
                note: "sim drying".into(),
            },
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["deviceId"], "esp32-001");
        assert_eq!(json["moisture"], 41.5);
        assert_eq!(json["payload"]["raw"], 20190);
        assert_eq!(json["payload"]["pumpOn"], false);
    }

    #[test]
    fn urls_tolerate_trailing_slash() {
        let c = HubClient::new("http://hub.local:8080/", "d1", Duration::from_secs(1)).unwrap();
        assert_eq!(c.device_url("settings"), "http://hub.local:8080/api/devices/d1/settings");
        assert_eq!(c.device_url("stream"), "http://hub.local:8080/api/devices/d1/stream");
    }
}
