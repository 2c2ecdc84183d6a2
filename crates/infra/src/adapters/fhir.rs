//! FHIR resource server adapter.
//!
//! | operation | remote id known | request |
//! |-----------|-----------------|---------|
//! | create / update | no  | `POST {base}/{type}` |
//! | create / update | yes | `PUT {base}/{type}/{id}` |
//! | delete | yes | `DELETE {base}/{type}/{id}` |
//! | delete | no  | nothing to do |
//!
//! 5xx, 408, 429, 401 and network failures are transient; any other 4xx is
//! fatal. A 2xx without a resource id is a malformed response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use clinsync_core::{Operation, TargetSystem};

use super::{DeliveryError, DeliveryReceipt, DeliveryRequest, TargetAdapter};
use crate::credentials::{CredentialCache, CredentialError};

const FHIR_JSON: &str = "application/fhir+json";

#[derive(Debug, Clone)]
pub struct FhirServerAdapter {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    credentials: Option<Arc<CredentialCache>>,
}

impl FhirServerAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialCache>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The token fetch shares the request timeout; a slow or failing token
    /// endpoint never holds up the delivery itself.
    async fn bearer_token(&self) -> Option<String> {
        let cache = self.credentials.as_ref()?;
        let fetch = cache.get_token(TargetSystem::FhirServer);
        match tokio::time::timeout(self.request_timeout, fetch).await {
            Ok(Ok(token)) => Some(token),
            Ok(Err(CredentialError::NotConfigured(_))) => None,
            Ok(Err(err)) => {
                warn!(error = %err, "could not obtain access token; sending unauthenticated request");
                None
            }
            Err(_) => {
                warn!(
                    timeout = ?self.request_timeout,
                    "access token request timed out; sending unauthenticated request"
                );
                None
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<&JsonValue>,
    ) -> Result<(StatusCode, String), DeliveryError> {
        let mut builder = self
            .client
            .request(method, &url)
            .timeout(self.request_timeout)
            .header(ACCEPT, FHIR_JSON);
        if let Some(token) = self.bearer_token().await {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| DeliveryError::InvalidPayload(e.to_string()))?;
            builder = builder.header(CONTENT_TYPE, FHIR_JSON).body(bytes);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(format!("{url}: {e}"))
            } else {
                DeliveryError::Network(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(format!("{url}: {e}"))
            } else {
                DeliveryError::Network(format!("{url}: {e}"))
            }
        })?;

        if status == StatusCode::UNAUTHORIZED {
            if let Some(cache) = &self.credentials {
                cache.invalidate(TargetSystem::FhirServer).await;
            }
        }
        Ok((status, text))
    }

    /// `POST {base}/{resource}`; returns the server-assigned id.
    pub async fn create_resource(&self, resource: &str, body: &JsonValue) -> Result<String, DeliveryError> {
        let url = format!("{}/{resource}", self.base_url);
        let (status, text) = self.send(Method::POST, url, Some(body)).await?;
        if !status.is_success() {
            return Err(classify(status, text));
        }
        resource_id(&text)
    }

    /// `PUT {base}/{resource}/{id}` with the id stamped into the body.
    pub async fn update_resource(
        &self,
        resource: &str,
        id: &str,
        body: &JsonValue,
    ) -> Result<String, DeliveryError> {
        let mut body = body.clone();
        if let Some(fields) = body.as_object_mut() {
            fields.insert("id".into(), JsonValue::String(id.to_string()));
        }
        let url = format!("{}/{resource}/{id}", self.base_url);
        let (status, text) = self.send(Method::PUT, url, Some(&body)).await?;
        if !status.is_success() {
            return Err(classify(status, text));
        }
        resource_id(&text)
    }

    pub async fn delete_resource(&self, resource: &str, id: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/{resource}/{id}", self.base_url);
        let (status, body) = self.send(Method::DELETE, url, None).await?;
        // Already gone counts as deleted.
        if status.is_success() || matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(());
        }
        Err(classify(status, body))
    }
}

/// Map a non-success status to a delivery error.
fn classify(status: StatusCode, body: String) -> DeliveryError {
    let transient = status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED
        );
    if transient {
        DeliveryError::Unavailable {
            status: status.as_u16(),
            body,
        }
    } else {
        DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

fn resource_id(body: &str) -> Result<String, DeliveryError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| DeliveryError::MalformedResponse(format!("response is not JSON: {e}")))?;
    value
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DeliveryError::MalformedResponse("response has no resource id".into()))
}

#[async_trait]
impl TargetAdapter for FhirServerAdapter {
    fn target(&self) -> TargetSystem {
        TargetSystem::FhirServer
    }

    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let resource = request.payload.resource;
        let body = &request.payload.body;

        let external_id = match (request.operation, request.external_id.as_deref()) {
            (Operation::Delete, None) => {
                debug!(
                    entry_id = %request.entry_id,
                    entity_id = %request.entity_id,
                    "resource was never delivered; nothing to delete"
                );
                return Ok(DeliveryReceipt::unlinked());
            }
            (Operation::Delete, Some(id)) => {
                self.delete_resource(resource, id).await?;
                id.to_string()
            }
            (_, Some(id)) => self.update_resource(resource, id, body).await?,
            (_, None) => self.create_resource(resource, body).await?,
        };
        Ok(DeliveryReceipt::linked(external_id))
    }
}
