use crate::azure::types::*;
use crate::cascade::CatalogSource;
use crate::config::Config;
use crate::storage::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ACCOUNTS_URL: &str = "https://app.vssps.visualstudio.com/_apis/accounts";

pub struct AzureClient {
    http: reqwest::Client,
    host: String,
    pub api_version: String,
    pub max_work_items: usize,
    pub timeout_secs: u64,
}

impl AzureClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: config.host.clone(),
            api_version: config.settings.api_version.clone(),
            max_work_items: config.settings.max_work_items,
            timeout_secs: config.settings.api_timeout,
        }
    }

    fn base(&self, organization: &str) -> String {
        format!("https://{}/{}", self.host, urlencoding::encode(organization))
    }

    /// `Basic` header value for a personal access token (empty user name).
    pub fn auth_header(credential: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!(":{credential}")))
    }

    /// Send with auth and timeout, then parse the JSON body.
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        credential: &str,
        what: &str,
    ) -> Result<T> {
        let timeout = Duration::from_secs(self.timeout_secs);
        let future = request
            .query(&[("api-version", self.api_version.as_str())])
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(credential))
            .header(reqwest::header::ACCEPT, "application/json")
            .send();

        let response = tokio::time::timeout(timeout, future)
            .await
            .with_context(|| format!("{what} request timed out"))?
            .with_context(|| format!("{what} request failed"))?;

        let status = response.status();
        // 203 is the sign-in page served instead of JSON for a bad token
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NON_AUTHORITATIVE_INFORMATION {
            anyhow::bail!("{what}: credential rejected, check the PAT and its scopes");
        }
        if status == StatusCode::NOT_FOUND {
            anyhow::bail!("{what}: not found");
        }
        if !status.is_success() {
            anyhow::bail!(
                "{what}: HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {what} response"))
    }

    /// Organizations the credential's owner belongs to.
    pub async fn list_organizations(&self, credential: &str, member_id: Option<&str>) -> Result<Vec<Account>> {
        let mut request = self.http.get(ACCOUNTS_URL);
        if let Some(member_id) = member_id {
            request = request.query(&[("memberId", member_id)]);
        }
        let list: ListResponse<Account> = self.send(request, credential, "Organization list").await?;
        Ok(list.value)
    }

    pub async fn list_projects(&self, organization: &str, credential: &str) -> Result<Vec<Project>> {
        let url = format!("{}/_apis/projects", self.base(organization));
        let list: ListResponse<Project> = self
            .send(self.http.get(url), credential, "Project list")
            .await?;
        debug!(organization, count = list.value.len(), "projects listed");
        Ok(list.value)
    }

    /// Run the filter's WIQL, then fetch details for the first ids it returns.
    pub async fn list_work_items(
        &self,
        organization: &str,
        project_id: &str,
        filter: WorkItemFilter,
        credential: &str,
    ) -> Result<Vec<WorkItem>> {
        let url = format!(
            "{}/{}/_apis/wit/wiql",
            self.base(organization),
            urlencoding::encode(project_id)
        );
        let request = self.http.post(url).json(&WiqlQuery { query: filter.wiql() });
        let result: WiqlResult = self.send(request, credential, "WIQL query").await?;

        let ids: Vec<u32> = result
            .work_items
            .iter()
            .map(|r| r.id)
            .take(self.max_work_items)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/_apis/wit/workitems", self.base(organization));
        let joined = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let request = self.http.get(url).query(&[("ids", joined.as_str())]);
        let details: ListResponse<WorkItem> = self
            .send(request, credential, "Work item details")
            .await?;
        debug!(organization, project_id, ?filter, count = details.value.len(), "work items listed");
        Ok(Self::restore_order(&ids, details.value))
    }

    /// Put details back in query order; the details endpoint does not keep it.
    pub fn restore_order(ids: &[u32], mut items: Vec<WorkItem>) -> Vec<WorkItem> {
        let order_map: HashMap<u32, usize> = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx))
            .collect();
        items.sort_by_key(|item| order_map.get(&item.id).copied().unwrap_or(usize::MAX));
        items
    }
}

/// Dropdown options fetched live, authorized with each organization's stored credential.
pub struct RestCatalog {
    client: AzureClient,
    store: Arc<Store>,
}

impl RestCatalog {
    pub fn new(client: AzureClient, store: Arc<Store>) -> Self {
        Self { client, store }
    }

    fn credential(&self, organization: &str) -> Result<String> {
        let credential = self
            .store
            .credential_for(organization)?
            .with_context(|| format!("Organization \"{organization}\" is not configured"))?;
        if credential.is_expired_at(Utc::now()) {
            anyhow::bail!("credential for {} expired", credential.organization);
        }
        Ok(credential.credential)
    }
}

#[async_trait]
impl CatalogSource for RestCatalog {
    async fn list_projects(&self, organization: &str) -> Result<Vec<Project>> {
        let credential = self.credential(organization)?;
        self.client.list_projects(organization, &credential).await
    }

    async fn list_work_items(
        &self,
        organization: &str,
        project_id: &str,
        filter: WorkItemFilter,
    ) -> Result<Vec<WorkItem>> {
        let credential = self.credential(organization)?;
        self.client
            .list_work_items(organization, project_id, filter, &credential)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Credential;

    #[test]
    fn test_auth_header_has_empty_user() {
        // ":pat" in base64
        assert_eq!(AzureClient::auth_header("pat"), "Basic OnBhdA==");
    }

    #[test]
    fn test_base_url_encodes_organization() {
        let client = AzureClient::new(&Config::default());
        assert_eq!(client.base("Contoso"), "https://dev.azure.com/Contoso");
        assert_eq!(client.base("My Org"), "https://dev.azure.com/My%20Org");
    }

    #[test]
    fn test_restore_order_follows_query() {
        let items = vec![
            WorkItem::new(3, "c", "Task"),
            WorkItem::new(1, "a", "Bug"),
            WorkItem::new(2, "b", "Bug"),
        ];
        let ordered = AzureClient::restore_order(&[2, 3, 1], items);
        let ids: Vec<u32> = ordered.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_catalog_without_credential_fails_before_request() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()));
        let catalog = RestCatalog::new(AzureClient::new(&Config::default()), Arc::clone(&store));

        let err = catalog.list_projects("Contoso").await.unwrap_err();
        assert_eq!(err.to_string(), "Organization \"Contoso\" is not configured");

        store
            .save_credential(Credential::new("Contoso", "pat", Utc::now() - chrono::Duration::hours(1)))
            .unwrap();
        let err = catalog
            .list_work_items("Contoso", "p1", WorkItemFilter::Assigned)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "credential for Contoso expired");
    }
}
