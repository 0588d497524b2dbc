use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, warn};

use crate::model::normalize_phone;
use crate::provider::model::{
    phone_from_wire_id, InstanceStatus, SendMedia, SendMessageResp, SendReceipt, SendText,
    SessionState, SessionStatusResp,
};

pub mod model;

/// Everything the engine asks of the WhatsApp provider. Sessions are
/// addressed by their provider-side name (`instances.provider_ref`).
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn create_instance(&self, name: &str) -> Result<()>;
    async fn delete_instance(&self, name: &str) -> Result<()>;
    async fn connect(&self, name: &str) -> Result<()>;
    async fn disconnect(&self, name: &str) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    async fn reconnect(&self, name: &str) -> Result<()>;
    async fn get_status(&self, name: &str) -> Result<InstanceStatus>;
    async fn send_text(&self, name: &str, req: &SendText) -> Result<SendReceipt>;
    async fn send_media(&self, name: &str, req: &SendMedia) -> Result<SendReceipt>;
}

/// HTTP adapter for the provider API.
#[derive(Clone)]
pub struct HttpProvider {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid provider base URL")?;
        Ok(Self::with_base_url(base_url, api_key))
    }

    pub fn with_base_url(base_url: Url, api_key: String) -> Self {
        let http = Client::builder()
            .user_agent("wa-courier/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid provider base URL")?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if let Some(body) = body {
            builder = builder.header("Content-Type", "application/json").json(body);
        }
        builder.build().context("failed to build provider request")
    }

    async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let request = self.build_request(method, path, body)?;
        debug!(method = %request.method(), url = %request.url(), "provider request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach provider")?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by provider: {}", body);
            return Err(anyhow!("received 429 from provider: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("provider error {}: {}", status, body);
            return Err(anyhow!("provider error {}: {}", status, body));
        }
        Ok(res)
    }

    async fn command(&self, path: &str, body: Option<&Value>) -> Result<()> {
        self.execute(Method::POST, path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderGateway for HttpProvider {
    async fn create_instance(&self, name: &str) -> Result<()> {
        self.command("api/sessions", Some(&json!({ "name": name })))
            .await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.execute(Method::DELETE, &format!("api/sessions/{name}"), None)
            .await?;
        Ok(())
    }

    async fn connect(&self, name: &str) -> Result<()> {
        self.command(&format!("api/sessions/{name}/start"), None).await
    }

    async fn disconnect(&self, name: &str) -> Result<()> {
        self.command(&format!("api/sessions/{name}/stop"), None).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.command(&format!("api/sessions/{name}/restart"), None)
            .await
    }

    async fn reconnect(&self, name: &str) -> Result<()> {
        self.command(&format!("api/sessions/{name}/reconnect"), None)
            .await
    }

    async fn get_status(&self, name: &str) -> Result<InstanceStatus> {
        let res = self
            .execute(Method::GET, &format!("api/sessions/{name}/status"), None)
            .await?;
        let resp: SessionStatusResp = res
            .json()
            .await
            .context("invalid provider status response")?;
        let phone_number = resp
            .me
            .and_then(|me| me.id)
            .and_then(|id| phone_from_wire_id(&id));
        Ok(InstanceStatus {
            state: SessionState::parse(&resp.status),
            phone_number,
        })
    }

    async fn send_text(&self, name: &str, req: &SendText) -> Result<SendReceipt> {
        let body = build_send_text_body(req);
        let res = self
            .execute(
                Method::POST,
                &format!("api/sessions/{name}/messages/text"),
                Some(&body),
            )
            .await?;
        let resp: SendMessageResp = res.json().await.context("invalid provider send response")?;
        debug!(message_id = %resp.id, "provider accepted text message");
        Ok(SendReceipt {
            message_id: resp.id,
        })
    }

    async fn send_media(&self, name: &str, req: &SendMedia) -> Result<SendReceipt> {
        let body = build_send_media_body(req);
        let res = self
            .execute(
                Method::POST,
                &format!("api/sessions/{name}/messages/media"),
                Some(&body),
            )
            .await?;
        let resp: SendMessageResp = res.json().await.context("invalid provider send response")?;
        debug!(message_id = %resp.id, "provider accepted media message");
        Ok(SendReceipt {
            message_id: resp.id,
        })
    }
}

pub fn build_send_text_body(req: &SendText) -> Value {
    json!({
        "phone": normalize_phone(&req.phone),
        "message": req.body,
    })
}

pub fn build_send_media_body(req: &SendMedia) -> Value {
    let mut body = json!({
        "phone": normalize_phone(&req.phone),
        "media_url": req.media_url,
        "media_type": req.media_kind,
    });
    if let Some(caption) = req.caption.as_deref().filter(|c| !c.is_empty()) {
        body["caption"] = json!(caption);
    }
    body
}
