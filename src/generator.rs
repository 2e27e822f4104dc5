use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone)]
pub struct GeneratorConfig {
    pub api_base: String, // e.g. "https://api.gramhands.app/v1"
    pub api_key: String,  // env GRAMHANDS_API_KEY
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GRAMHANDS_API_BASE")
                .unwrap_or_else(|_| "https://api.gramhands.app/v1".into()),
            api_key: env::var("GRAMHANDS_API_KEY").unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>, // base64 png
    pub content: String,
    pub min_length: usize,
    pub max_length: usize,
    pub prompt: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generated {
    Allowed { comment: String },
    Declined { reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    is_allowed: bool,
    comment: Option<String>,
    reason: Option<String>,
}

// The generation service is an opaque, possibly-slow, possibly-failing
// remote call. No retry happens here; failures propagate to the caller.
#[async_trait]
pub trait CommentGenerator: Send + Sync {
    async fn comment(&self, req: &GenerateRequest) -> Result<Generated>;
    async fn reply(&self, req: &GenerateRequest) -> Result<Generated>;
}

#[derive(Clone)]
pub struct GeneratorClient {
    http: Client,
    cfg: GeneratorConfig,
}

impl GeneratorClient {
    pub fn new(cfg: GeneratorConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("GRAMHANDS_API_KEY missing");
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    async fn post(&self, path: &str, req: &GenerateRequest) -> Result<Generated> {
        let url = format!("{}/{}", self.cfg.api_base, path);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("generation service error {}: {}", status, text);
        }
        let parsed: GenerateResponse =
            serde_json::from_str(&text).context("failed to parse generation response JSON")?;
        into_generated(parsed)
    }
}

fn into_generated(resp: GenerateResponse) -> Result<Generated> {
    if resp.is_allowed {
        let comment = resp
            .comment
            .filter(|c| !c.trim().is_empty())
            .context("allowed response carried no comment")?;
        Ok(Generated::Allowed { comment })
    } else {
        Ok(Generated::Declined {
            reason: resp.reason.unwrap_or_else(|| "not allowed".into()),
        })
    }
}

#[async_trait]
impl CommentGenerator for GeneratorClient {
    async fn comment(&self, req: &GenerateRequest) -> Result<Generated> {
        self.post("comments", req).await
    }

    async fn reply(&self, req: &GenerateRequest) -> Result<Generated> {
        self.post("replies", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_response_maps_to_comment() {
        let resp: GenerateResponse =
            serde_json::from_str(r#"{"isAllowed":true,"comment":"great colors!"}"#).unwrap();
        assert_eq!(
            into_generated(resp).unwrap(),
            Generated::Allowed {
                comment: "great colors!".into()
            }
        );
    }

    #[test]
    fn declined_response_keeps_reason() {
        let resp: GenerateResponse =
            serde_json::from_str(r#"{"isAllowed":false,"reason":"sensitive content"}"#).unwrap();
        assert_eq!(
            into_generated(resp).unwrap(),
            Generated::Declined {
                reason: "sensitive content".into()
            }
        );
    }

    #[test]
    fn allowed_without_comment_is_an_error() {
        let resp: GenerateResponse = serde_json::from_str(r#"{"isAllowed":true}"#).unwrap();
        assert!(into_generated(resp).is_err());
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = GenerateRequest {
            image: None,
            content: "a sunset".into(),
            min_length: 10,
            max_length: 80,
            prompt: "be friendly".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["minLength"], 10);
        assert_eq!(json["maxLength"], 80);
        assert!(json.get("image").is_none());
    }

    #[test]
    fn client_requires_api_key() {
        let cfg = GeneratorConfig {
            api_base: "https://example.test".into(),
            api_key: String::new(),
        };
        assert!(GeneratorClient::new(cfg).is_err());
    }
}
