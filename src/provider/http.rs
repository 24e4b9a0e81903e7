//! REST provider.
//!
//! Binds the [`Provider`] interface to a JSON-over-HTTP resource API:
//!
//! | Call     | Request                                  |
//! |----------|------------------------------------------|
//! | create   | `POST /resources/{type}`                 |
//! | read     | `GET /resources/{type}/{provider_id}`    |
//! | update   | `PATCH /resources/{type}/{provider_id}`  |
//! | delete   | `DELETE /resources/{type}/{provider_id}` |
//! | poll     | `GET /operations/{token}`                |
//!
//! A `202 Accepted` response carries an operation token and means the call
//! continues asynchronously.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result};
use crate::graph::{AttributeValue, ResourceId};
use crate::planner::AttributeChange;

use super::types::{
    Completion, PendingOperation, Provider, ProviderResult, ProvisionedResource, ResolvedResource,
};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry delay assumed when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// REST provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    attributes: &'a BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a BTreeMap<String, AttributeValue>,
    changed: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResourceBody {
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    operation: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum OperationBody {
    Pending,
    Done {
        #[serde(default)]
        resource: Option<ResourceBody>,
    },
    Failed {
        error: String,
    },
}

impl HttpProvider {
    /// Creates a new REST provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.endpoint);
        trace!("{method} {url}");
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> ProviderResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &url, body))
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("Failed to parse response: {e}")))
    }

    async fn completion(response: Response) -> ProviderResult<Completion<ProvisionedResource>> {
        if response.status() == StatusCode::ACCEPTED {
            let accepted: AcceptedBody = Self::parse(response).await?;
            return Ok(Completion::Pending(PendingOperation::new(
                accepted.operation,
                accepted.id,
            )));
        }
        let body: ResourceBody = Self::parse(response).await?;
        Ok(Completion::Done(body.into()))
    }
}

/// Maps an unsuccessful status to a provider error.
fn classify(status: StatusCode, path: &str, body: String) -> ProviderError {
    if status == StatusCode::NOT_FOUND {
        let provider_id = path.rsplit('/').next().unwrap_or_default().to_string();
        return ProviderError::NotFound { provider_id };
    }
    let message = format!("HTTP {}: {body}", status.as_u16());
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

impl From<ResourceBody> for ProvisionedResource {
    fn from(body: ResourceBody) -> Self {
        Self::new(body.id, body.attributes)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, resource: &ResolvedResource) -> ProviderResult<Completion<ProvisionedResource>> {
        debug!("Creating {}", resource.id);
        let body = CreateRequest {
            name: &resource.id.name,
            attributes: &resource.attributes,
        };
        let path = format!("/resources/{}", resource.id.resource_type);
        let response = self.send(self.request(Method::POST, &path).json(&body)).await?;
        Self::completion(response).await
    }

    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProvisionedResource> {
        let path = format!("/resources/{}/{provider_id}", id.resource_type);
        let response = self.send(self.request(Method::GET, &path)).await?;
        let body: ResourceBody = Self::parse(response).await?;
        Ok(body.into())
    }

    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        resource: &ResolvedResource,
        changes: &[AttributeChange],
    ) -> ProviderResult<Completion<ProvisionedResource>> {
        debug!("Updating {id} ({provider_id})");
        let body = UpdateRequest {
            attributes: &resource.attributes,
            changed: changes.iter().map(|c| c.attribute.as_str()).collect(),
        };
        let path = format!("/resources/{}/{provider_id}", id.resource_type);
        let response = self.send(self.request(Method::PATCH, &path).json(&body)).await?;
        Self::completion(response).await
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<Completion<()>> {
        debug!("Deleting {id} ({provider_id})");
        let path = format!("/resources/{}/{provider_id}", id.resource_type);
        let response = self.send(self.request(Method::DELETE, &path)).await?;
        if response.status() == StatusCode::ACCEPTED {
            let accepted: AcceptedBody = Self::parse(response).await?;
            return Ok(Completion::Pending(PendingOperation::new(
                accepted.operation,
                accepted.id.or_else(|| Some(provider_id.to_string())),
            )));
        }
        Ok(Completion::Done(()))
    }

    async fn poll(
        &self,
        operation: &PendingOperation,
    ) -> ProviderResult<Completion<Option<ProvisionedResource>>> {
        let path = format!("/operations/{}", operation.token);
        let response = self.send(self.request(Method::GET, &path)).await?;
        match Self::parse::<OperationBody>(response).await? {
            OperationBody::Pending => Ok(Completion::Pending(operation.clone())),
            OperationBody::Done { resource } => Ok(Completion::Done(resource.map(Into::into))),
            OperationBody::Failed { error } => Err(ProviderError::permanent(format!(
                "operation {} failed: {error}",
                operation.token
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(
            &server.uri(),
            Some(String::from("secret")),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    fn subnet() -> ResolvedResource {
        ResolvedResource {
            id: ResourceId::new("subnet", "a"),
            attributes: BTreeMap::from([
                (String::from("cidr_block"), AttributeValue::from("10.0.1.0/24")),
                (String::from("vpc_id"), AttributeValue::from("vpc-1")),
            ]),
        }
    }

    #[tokio::test]
    async fn test_create_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/subnet"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"name": "a", "attributes": {"vpc_id": "vpc-1"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "subnet-9",
                "attributes": {"id": "subnet-9", "cidr_block": "10.0.1.0/24"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server).create(&subnet()).await.expect("create");
        let Completion::Done(created) = result else {
            panic!("expected done");
        };
        assert_eq!(created.provider_id, "subnet-9");
        assert_eq!(
            created.attributes.get("id"),
            Some(&AttributeValue::from("subnet-9"))
        );
    }

    #[tokio::test]
    async fn test_accepted_returns_pending_and_poll_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/subnet"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"operation": "op-1", "id": "subnet-9"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/op-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "done",
                "resource": {"id": "subnet-9", "attributes": {}}
            })))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let Completion::Pending(op) = provider.create(&subnet()).await.expect("create") else {
            panic!("expected pending");
        };
        assert_eq!(op.provider_id.as_deref(), Some("subnet-9"));

        match provider.poll(&op).await.expect("poll") {
            Completion::Done(Some(resource)) => assert_eq!(resource.provider_id, "subnet-9"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/subnet/subnet-9"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .read(&ResourceId::new("subnet", "a"), "subnet-9")
            .await
            .expect_err("rate limited");
        assert_eq!(err, ProviderError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/subnet/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/subnet/flaky"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/subnet/bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid cidr"))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let id = ResourceId::new("subnet", "a");

        assert_eq!(
            provider.read(&id, "gone").await.expect_err("404"),
            ProviderError::NotFound {
                provider_id: String::from("gone")
            }
        );
        let transient = provider.read(&id, "flaky").await.expect_err("503");
        assert!(matches!(transient, ProviderError::Transient { .. }));
        let permanent = provider.read(&id, "bad").await.expect_err("400");
        assert!(matches!(permanent, ProviderError::Permanent { ref message } if message.contains("invalid cidr")));
    }

    #[tokio::test]
    async fn test_update_sends_changed_names_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/resources/subnet/subnet-9"))
            .and(body_partial_json(json!({"changed": ["map_public_ip"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "subnet-9",
                "attributes": {"map_public_ip": true}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/subnet/subnet-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let id = ResourceId::new("subnet", "a");
        let changes = vec![AttributeChange::new(
            "map_public_ip",
            Some(AttributeValue::Bool(false)),
            Some(AttributeValue::Bool(true)),
        )];

        let updated = provider
            .update(&id, "subnet-9", &subnet(), &changes)
            .await
            .expect("update");
        assert!(updated.is_done());

        let deleted = provider.delete(&id, "subnet-9").await.expect("delete");
        assert_eq!(deleted, Completion::Done(()));
    }

    #[tokio::test]
    async fn test_failed_operation_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/operations/op-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "failed", "error": "capacity"})),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .poll(&PendingOperation::new("op-2", None))
            .await
            .expect_err("failed operation");
        assert!(matches!(err, ProviderError::Permanent { .. }));
        assert!(!err.is_retryable());
    }
}
