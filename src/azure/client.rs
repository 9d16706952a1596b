use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{VirtualMachine, VmListPage};
use super::{
    ControlPlane, ExtensionDescriptor, ExtensionStatusRecord, PutResponse, Scope,
    VM_API_VERSION, VM_LIST_API_VERSION,
};
use crate::error::RotatorError;

#[derive(Debug, Clone)]
pub struct ArmClientConfig {
    pub endpoint: String,
    pub bearer_token: String,
    pub request_timeout: Duration,
    pub insecure_skip_tls_verify: bool,
}

/// Azure Resource Manager client authenticated with a bearer token.
pub struct ArmClient {
    client: Client,
    endpoint: String,
    base_url: Url,
    bearer_token: String,
}

impl ArmClient {
    pub fn new(config: ArmClientConfig) -> Result<Self> {
        if config.insecure_skip_tls_verify {
            warn!("TLS certificate validation disabled for management endpoint");
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .context("Failed to create HTTP client")?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let base_url = Url::parse(&endpoint)
            .with_context(|| format!("Invalid management endpoint: {endpoint}"))?;
        info!(
            endpoint = %endpoint,
            request_timeout_seconds = config.request_timeout.as_secs(),
            "Management API client initialized"
        );

        Ok(Self {
            client,
            endpoint,
            base_url,
            bearer_token: config.bearer_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), RotatorError> {
        let start_time = std::time::Instant::now();

        let response = request
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| RotatorError::from_reqwest(operation, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RotatorError::from_reqwest(operation, &e))?;

        debug!(
            operation,
            status = status.as_u16(),
            response_time_ms = start_time.elapsed().as_millis() as u64,
            "Management API call completed"
        );

        Ok((status, body))
    }

    /// Continuation links carry the bearer token, so they must stay on the
    /// management endpoint's origin.
    fn continuation_url(&self, operation: &str, link: &str) -> Result<Url, RotatorError> {
        let url = Url::parse(link).map_err(|e| {
            RotatorError::decode(operation, format!("invalid nextLink '{link}': {e}"))
        })?;
        if url.origin() != self.base_url.origin() {
            return Err(RotatorError::decode(
                operation,
                format!("nextLink '{link}' points outside {}", self.endpoint),
            ));
        }
        Ok(url)
    }

    fn decode<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, RotatorError> {
        serde_json::from_str(body).map_err(|e| RotatorError::decode(operation, e.to_string()))
    }
}

#[async_trait]
impl ControlPlane for ArmClient {
    async fn list_vms(&self, scope: &Scope) -> Result<Vec<String>, RotatorError> {
        const OP: &str = "list_vms";

        let mut names = Vec::new();
        let mut seen_links = HashSet::new();
        let mut request = self
            .client
            .get(self.url(&scope.vm_collection_path()))
            .query(&[("api-version", VM_LIST_API_VERSION)]);

        loop {
            let (status, body) = self.send(OP, request).await?;
            if !status.is_success() {
                return Err(RotatorError::api(OP, status.as_u16(), &body));
            }

            let page: VmListPage = Self::decode(OP, &body)?;
            names.extend(page.value.into_iter().map(|vm| vm.name));

            match page.next_link {
                Some(link) if !link.is_empty() => {
                    if !seen_links.insert(link.clone()) {
                        warn!(next_link = %link, "Listing returned a repeated nextLink, stopping");
                        break;
                    }
                    let next = self.continuation_url(OP, &link)?;
                    debug!(next_link = %link, "Following VM listing continuation");
                    request = self.client.get(next);
                }
                _ => break,
            }
        }

        info!(
            subscription_id = %scope.subscription_id,
            resource_group = %scope.resource_group,
            vm_count = names.len(),
            "Listed virtual machines"
        );

        Ok(names)
    }

    async fn delete_extension(&self, scope: &Scope, vm_name: &str) -> Result<u16, RotatorError> {
        const OP: &str = "delete_extension";

        let request = self
            .client
            .delete(self.url(&scope.extension_path(vm_name)))
            .query(&[("api-version", VM_API_VERSION)]);
        let (status, body) = self.send(OP, request).await?;

        if !status.is_success() {
            let err = RotatorError::api(OP, status.as_u16(), &body);
            if !err.is_not_found() {
                return Err(err);
            }
            debug!(vm = vm_name, "Extension already absent");
        }

        Ok(status.as_u16())
    }

    async fn put_extension(
        &self,
        scope: &Scope,
        vm_name: &str,
        descriptor: &ExtensionDescriptor,
    ) -> Result<PutResponse, RotatorError> {
        const OP: &str = "put_extension";

        let request = self
            .client
            .put(self.url(&scope.extension_path(vm_name)))
            .query(&[("api-version", VM_API_VERSION)])
            .json(descriptor);
        let (status, body) = self.send(OP, request).await?;

        if !status.is_success() {
            return Err(RotatorError::api(OP, status.as_u16(), &body));
        }

        Ok(PutResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_extension_status(
        &self,
        scope: &Scope,
        vm_name: &str,
    ) -> Result<ExtensionStatusRecord, RotatorError> {
        const OP: &str = "get_extension_status";

        let request = self
            .client
            .get(self.url(&scope.vm_path(vm_name)))
            .query(&[("api-version", VM_API_VERSION)]);
        let (status, body) = self.send(OP, request).await?;

        if !status.is_success() {
            return Err(RotatorError::api(OP, status.as_u16(), &body));
        }

        let vm: VirtualMachine = Self::decode(OP, &body)?;
        Ok(ExtensionStatusRecord::from(vm))
    }
}
