//! Control-plane client.

use async_trait::async_trait;
use deck_core::stats::SystemStats;
use deck_core::wire::{CopyRequest, DeleteOptions, ErrorDetail, InstancePatch, LogChunk};
use deck_core::Entity;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{reason}")]
    Rejected { status: u16, reason: String },
    /// The target already exists; the command has to be repeated with overwrite.
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("logs unavailable for instance {id}")]
    LogsUnavailable { id: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(String),
}

impl ApiError {
    /// Reason string suitable for a transient notice.
    pub fn reason(&self) -> String {
        match self {
            ApiError::Rejected { reason, .. } | ApiError::Conflict { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Everything the dashboard needs from the control plane.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Raw snapshot records, normalized by the caller.
    async fn list_instances(&self) -> Result<Vec<Value>, ApiError>;
    async fn start(&self, id: &str) -> Result<(), ApiError>;
    async fn stop(&self, id: &str) -> Result<(), ApiError>;
    async fn delete(&self, id: &str, options: DeleteOptions) -> Result<(), ApiError>;
    async fn update(&self, id: &str, patch: &InstancePatch) -> Result<Entity, ApiError>;
    async fn create(&self, draft: &InstancePatch) -> Result<Entity, ApiError>;
    async fn rebuild(&self, id: &str) -> Result<(), ApiError>;
    async fn clone_instance(&self, id: &str, new_name: &str) -> Result<(), ApiError>;
    async fn instantiate(&self, id: &str, new_name: &str) -> Result<(), ApiError>;
    async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError>;
    async fn system_stats(&self) -> Result<SystemStats, ApiError>;
    async fn list_blueprints(&self) -> Result<Vec<String>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct BlueprintList {
    #[serde(default)]
    blueprints: Vec<String>,
}

#[derive(Clone)]
pub struct HttpApi {
    http: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url).map_err(|err| ApiError::Url(format!("{base_url}: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::Url(format!("{path}: {err}")))
    }

    /// Streaming endpoint on the same host, with `http` mapped to `ws`.
    pub fn ws_endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let mut url = self.endpoint(path)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::Url(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    pub fn terminal_url(&self, id: &str) -> Result<Url, ApiError> {
        self.ws_endpoint(&format!("api/instances/{id}/terminal"))
    }

    pub fn build_url(&self) -> Result<Url, ApiError> {
        self.ws_endpoint("api/builder/build")
    }

    async fn post_action(&self, id: &str, action: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/instances/{id}/{action}"))?;
        let res = self.http.post(url).send().await?;
        check(res).await.map(|_| ())
    }

    async fn post_copy(&self, id: &str, action: &str, new_name: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/instances/{id}/{action}"))?;
        let body = CopyRequest {
            new_name: new_name.to_string(),
        };
        let res = self.http.post(url).json(&body).send().await?;
        check(res).await.map(|_| ())
    }
}

async fn check(res: Response) -> Result<Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ErrorDetail>(&body)
        .ok()
        .and_then(|detail| detail.detail)
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));
    if status == StatusCode::CONFLICT {
        return Err(ApiError::Conflict { reason });
    }
    Err(ApiError::Rejected {
        status: status.as_u16(),
        reason,
    })
}

async fn decode_entity(res: Response) -> Result<Entity, ApiError> {
    let value: Value = res.json().await?;
    Entity::from_record(0, value).map_err(|err| ApiError::Decode(err.to_string()))
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn list_instances(&self) -> Result<Vec<Value>, ApiError> {
        let res = self.http.get(self.endpoint("api/instances/")?).send().await?;
        let value: Value = check(res).await?.json().await?;
        match value {
            Value::Array(records) => Ok(records),
            other => Err(ApiError::Decode(format!(
                "expected an array of instances, got {}",
                kind_of(&other)
            ))),
        }
    }

    async fn start(&self, id: &str) -> Result<(), ApiError> {
        self.post_action(id, "start").await
    }

    async fn stop(&self, id: &str) -> Result<(), ApiError> {
        self.post_action(id, "stop").await
    }

    async fn delete(&self, id: &str, options: DeleteOptions) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/instances/{id}"))?;
        let res = self.http.delete(url).json(&options).send().await?;
        check(res).await.map(|_| ())
    }

    async fn update(&self, id: &str, patch: &InstancePatch) -> Result<Entity, ApiError> {
        let url = self.endpoint(&format!("api/instances/{id}"))?;
        let res = self.http.put(url).json(patch).send().await?;
        decode_entity(check(res).await?).await
    }

    async fn create(&self, draft: &InstancePatch) -> Result<Entity, ApiError> {
        let res = self
            .http
            .post(self.endpoint("api/instances/")?)
            .json(draft)
            .send()
            .await?;
        decode_entity(check(res).await?).await
    }

    async fn rebuild(&self, id: &str) -> Result<(), ApiError> {
        self.post_action(id, "rebuild").await
    }

    async fn clone_instance(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        self.post_copy(id, "copy", new_name).await
    }

    async fn instantiate(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        self.post_copy(id, "instantiate", new_name).await
    }

    async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError> {
        let mut url = self.endpoint(&format!("api/instances/{id}/logs"))?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            return Err(ApiError::LogsUnavailable { id: id.to_string() });
        }
        Ok(res.json().await?)
    }

    async fn system_stats(&self) -> Result<SystemStats, ApiError> {
        let res = self.http.get(self.endpoint("api/system/stats")?).send().await?;
        Ok(check(res).await?.json().await?)
    }

    async fn list_blueprints(&self) -> Result<Vec<String>, ApiError> {
        let res = self
            .http
            .get(self.endpoint("api/system/blueprints")?)
            .send()
            .await?;
        let list: BlueprintList = check(res).await?.json().await?;
        Ok(list.blueprints)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_against_base() {
        let api = HttpApi::new("http://deck.lan:8000").expect("api");
        assert_eq!(
            api.endpoint("/api/instances/").expect("url").as_str(),
            "http://deck.lan:8000/api/instances/"
        );
        let nested = HttpApi::new("http://deck.lan/panel").expect("api");
        assert_eq!(
            nested.endpoint("api/system/stats").expect("url").as_str(),
            "http://deck.lan/panel/api/system/stats"
        );
    }

    #[test]
    fn streaming_urls_switch_scheme() {
        let api = HttpApi::new("http://deck.lan:8000/").expect("api");
        assert_eq!(
            api.terminal_url("7").expect("url").as_str(),
            "ws://deck.lan:8000/api/instances/7/terminal"
        );
        let secure = HttpApi::new("https://deck.example").expect("api");
        assert_eq!(
            secure.build_url().expect("url").as_str(),
            "wss://deck.example/api/builder/build"
        );
    }

    #[test]
    fn invalid_base_is_a_url_error() {
        assert!(matches!(HttpApi::new("not a url"), Err(ApiError::Url(_))));
    }

    #[test]
    fn rejection_reason_is_the_server_detail() {
        let err = ApiError::Rejected {
            status: 400,
            reason: "Instance name already exists".to_string(),
        };
        assert_eq!(err.reason(), "Instance name already exists");
        assert_eq!(err.to_string(), "Instance name already exists");
        let missing = ApiError::LogsUnavailable { id: "3".to_string() };
        assert_eq!(missing.reason(), "logs unavailable for instance 3");
    }
}
