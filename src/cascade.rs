//! Organization → project → work item selection chain.
//!
//! Selecting a level clears every level below it and starts loading the next
//! level's options. The returned future resolves when those options land, so
//! callers can wait on the load itself instead of guessing how long it takes.
//! A load that finishes after its parent selection changed is discarded.

use crate::azure::{Project, WorkItem, WorkItemFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Where dropdown options come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_projects(&self, organization: &str) -> anyhow::Result<Vec<Project>>;

    async fn list_work_items(
        &self,
        organization: &str,
        project_id: &str,
        filter: WorkItemFilter,
    ) -> anyhow::Result<Vec<WorkItem>>;
}

/// Value of a work item option: `wi:{id}` or `backlog:{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItemKey {
    Assigned(u32),
    Backlog(u32),
}

impl WorkItemKey {
    pub fn id(&self) -> u32 {
        match self {
            WorkItemKey::Assigned(id) | WorkItemKey::Backlog(id) => *id,
        }
    }

    pub fn group(&self) -> WorkItemFilter {
        match self {
            WorkItemKey::Assigned(_) => WorkItemFilter::Assigned,
            WorkItemKey::Backlog(_) => WorkItemFilter::Backlog,
        }
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemKey::Assigned(id) => write!(f, "wi:{id}"),
            WorkItemKey::Backlog(id) => write!(f, "backlog:{id}"),
        }
    }
}

impl FromStr for WorkItemKey {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CascadeError::UnknownOption(s.to_string());
        let (prefix, id) = s.split_once(':').ok_or_else(invalid)?;
        let id: u32 = id.parse().map_err(|_| invalid())?;
        match prefix {
            "wi" => Ok(WorkItemKey::Assigned(id)),
            "backlog" => Ok(WorkItemKey::Backlog(id)),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("select an organization first")]
    NoOrganization,
    #[error("select a project first")]
    NoProject,
    #[error("no option {0} at this level")]
    UnknownOption(String),
    #[error("{0:#}")]
    Load(anyhow::Error),
}

/// How a load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    /// Options were populated; the count of options loaded.
    Applied(usize),
    /// The parent selection changed while loading; nothing was written.
    Superseded,
}

/// Point-in-time view of every level.
#[derive(Debug, Clone, Default)]
pub struct CascadeState {
    pub organization: Option<String>,
    pub projects: Vec<Project>,
    pub loading_projects: bool,
    pub project: Option<String>,
    pub assigned: Vec<WorkItem>,
    pub backlog: Vec<WorkItem>,
    pub loading_work_items: bool,
    pub work_item: Option<WorkItemKey>,
    org_epoch: u64,
    project_epoch: u64,
}

impl CascadeState {
    fn clear_projects(&mut self) {
        self.projects.clear();
        self.loading_projects = false;
        self.project = None;
        self.clear_work_items();
    }

    fn clear_work_items(&mut self) {
        self.project_epoch += 1;
        self.assigned.clear();
        self.backlog.clear();
        self.loading_work_items = false;
        self.work_item = None;
    }

    pub fn selected_project(&self) -> Option<&Project> {
        let id = self.project.as_deref()?;
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn selected_work_item(&self) -> Option<&WorkItem> {
        let key = self.work_item?;
        self.option(key)
    }

    pub fn option(&self, key: WorkItemKey) -> Option<&WorkItem> {
        let group = match key {
            WorkItemKey::Assigned(_) => &self.assigned,
            WorkItemKey::Backlog(_) => &self.backlog,
        };
        group.iter().find(|w| w.id == key.id())
    }

    /// Exact, case-insensitive name match. An exact-case match wins a tie.
    pub fn find_project(&self, name: &str) -> Option<&Project> {
        let name = name.trim();
        self.projects
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.projects.iter().find(|p| p.name.to_lowercase() == name.to_lowercase()))
    }

    /// Look for `id` in the assigned group, then the backlog group.
    pub fn find_work_item(&self, id: u32) -> Option<(WorkItemKey, &WorkItem)> {
        let assigned = self
            .assigned
            .iter()
            .find(|w| w.id == id)
            .map(|w| (WorkItemKey::Assigned(id), w));
        assigned.or_else(|| {
            self.backlog
                .iter()
                .find(|w| w.id == id)
                .map(|w| (WorkItemKey::Backlog(id), w))
        })
    }
}

pub struct SelectionCascade {
    source: Arc<dyn CatalogSource>,
    state: Mutex<CascadeState>,
}

impl SelectionCascade {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            state: Mutex::new(CascadeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CascadeState> {
        // State is plain data; a panicked writer cannot leave it half-built.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> CascadeState {
        self.lock().clone()
    }

    /// Select an organization (empty clears it) and load its projects.
    pub async fn select_organization(&self, organization: &str) -> Result<Load, CascadeError> {
        let organization = organization.trim().to_string();
        let epoch = {
            let mut state = self.lock();
            state.org_epoch += 1;
            state.clear_projects();
            state.organization = (!organization.is_empty()).then(|| organization.clone());
            state.loading_projects = state.organization.is_some();
            state.org_epoch
        };
        if organization.is_empty() {
            return Ok(Load::Applied(0));
        }

        debug!(%organization, "loading projects");
        let result = self.source.list_projects(&organization).await;

        let mut state = self.lock();
        if state.org_epoch != epoch {
            debug!(%organization, "project load superseded");
            return Ok(Load::Superseded);
        }
        state.loading_projects = false;
        let projects = result.map_err(CascadeError::Load)?;
        state.projects = projects;
        Ok(Load::Applied(state.projects.len()))
    }

    /// Select a loaded project and load both work item groups.
    pub async fn select_project(&self, project_id: &str) -> Result<Load, CascadeError> {
        let (organization, epoch) = {
            let mut state = self.lock();
            let organization = state.organization.clone().ok_or(CascadeError::NoOrganization)?;
            if !state.projects.iter().any(|p| p.id == project_id) {
                return Err(CascadeError::UnknownOption(project_id.to_string()));
            }
            state.clear_work_items();
            state.project = Some(project_id.to_string());
            state.loading_work_items = true;
            (organization, state.project_epoch)
        };

        debug!(%organization, project_id, "loading work items");
        let (assigned, backlog) = futures::join!(
            self.source
                .list_work_items(&organization, project_id, WorkItemFilter::Assigned),
            self.source
                .list_work_items(&organization, project_id, WorkItemFilter::Backlog),
        );

        let mut state = self.lock();
        if state.project_epoch != epoch {
            debug!(project_id, "work item load superseded");
            return Ok(Load::Superseded);
        }
        state.loading_work_items = false;
        // A group that loaded stays usable even when the other one failed.
        let mut failure = None;
        match assigned {
            Ok(items) => state.assigned = items,
            Err(e) => failure = Some(e.context("assigned work items")),
        }
        match backlog {
            Ok(items) => state.backlog = items,
            Err(e) => failure = failure.or(Some(e.context("backlog items"))),
        }
        if let Some(e) = failure {
            return Err(CascadeError::Load(e));
        }
        Ok(Load::Applied(state.assigned.len() + state.backlog.len()))
    }

    pub fn select_work_item(&self, key: WorkItemKey) -> Result<(), CascadeError> {
        let mut state = self.lock();
        if state.project.is_none() {
            return Err(CascadeError::NoProject);
        }
        if state.option(key).is_none() {
            return Err(CascadeError::UnknownOption(key.to_string()));
        }
        state.work_item = Some(key);
        Ok(())
    }

    pub fn clear_work_item(&self) {
        self.lock().work_item = None;
    }
}

/// Catalog held in memory, for offline use and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    projects: HashMap<String, Vec<Project>>,
    work_items: HashMap<(String, WorkItemFilter), Vec<WorkItem>>,
    latency: Duration,
    failure: Option<String>,
    group_failures: HashMap<WorkItemFilter, String>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(mut self, organization: &str, projects: Vec<Project>) -> Self {
        self.projects.insert(organization.to_lowercase(), projects);
        self
    }

    pub fn with_work_items(mut self, project_id: &str, filter: WorkItemFilter, items: Vec<WorkItem>) -> Self {
        self.work_items.insert((project_id.to_string(), filter), items);
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call fails with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Work item lookups for `filter` fail with `message`; everything else answers.
    pub fn failing_group(mut self, filter: WorkItemFilter, message: &str) -> Self {
        self.group_failures.insert(filter, message.to_string());
        self
    }

    async fn respond<T: Clone>(&self, found: Option<&Vec<T>>) -> anyhow::Result<Vec<T>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        Ok(found.cloned().unwrap_or_default())
    }
}

#[async_trait]
impl CatalogSource for MemoryCatalog {
    async fn list_projects(&self, organization: &str) -> anyhow::Result<Vec<Project>> {
        self.respond(self.projects.get(&organization.to_lowercase())).await
    }

    async fn list_work_items(
        &self,
        _organization: &str,
        project_id: &str,
        filter: WorkItemFilter,
    ) -> anyhow::Result<Vec<WorkItem>> {
        let items = self.respond(self.work_items.get(&(project_id.to_string(), filter))).await?;
        if let Some(message) = self.group_failures.get(&filter) {
            anyhow::bail!("{message}");
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_projects(
                "Contoso",
                vec![Project::new("p1", "WebApp"), Project::new("p2", "WebApp.Api")],
            )
            .with_projects("Fabrikam", vec![Project::new("f1", "Portal")])
            .with_work_items(
                "p1",
                WorkItemFilter::Assigned,
                vec![WorkItem::new(4821, "Fix login bug", "Bug")],
            )
            .with_work_items(
                "p1",
                WorkItemFilter::Backlog,
                vec![WorkItem::new(900, "Checkout flow", "User Story")],
            )
    }

    fn cascade(catalog: MemoryCatalog) -> SelectionCascade {
        SelectionCascade::new(Arc::new(catalog))
    }

    #[test]
    fn test_work_item_key_encoding() {
        assert_eq!(WorkItemKey::Assigned(4821).to_string(), "wi:4821");
        assert_eq!(WorkItemKey::Backlog(7).to_string(), "backlog:7");
        assert_eq!("backlog:7".parse::<WorkItemKey>().unwrap(), WorkItemKey::Backlog(7));
        assert_eq!("wi:4821".parse::<WorkItemKey>().unwrap().group(), WorkItemFilter::Assigned);
        assert!("task:1".parse::<WorkItemKey>().is_err());
        assert!("wi:x".parse::<WorkItemKey>().is_err());
        assert!("4821".parse::<WorkItemKey>().is_err());
    }

    #[tokio::test]
    async fn test_full_cascade() {
        let cascade = cascade(catalog());
        assert_eq!(cascade.select_organization("Contoso").await.unwrap(), Load::Applied(2));
        assert_eq!(cascade.select_project("p1").await.unwrap(), Load::Applied(2));
        cascade.select_work_item(WorkItemKey::Backlog(900)).unwrap();

        let state = cascade.snapshot();
        assert_eq!(state.organization.as_deref(), Some("Contoso"));
        assert_eq!(state.selected_project().unwrap().name, "WebApp");
        assert_eq!(state.selected_work_item().unwrap().fields.title, "Checkout flow");
        assert!(!state.loading_projects && !state.loading_work_items);
    }

    #[tokio::test]
    async fn test_selecting_a_level_clears_below() {
        let cascade = cascade(catalog());
        cascade.select_organization("Contoso").await.unwrap();
        cascade.select_project("p1").await.unwrap();
        cascade.select_work_item(WorkItemKey::Assigned(4821)).unwrap();

        cascade.select_organization("Fabrikam").await.unwrap();
        let state = cascade.snapshot();
        assert_eq!(state.projects, vec![Project::new("f1", "Portal")]);
        assert_eq!(state.project, None);
        assert!(state.assigned.is_empty() && state.backlog.is_empty());
        assert_eq!(state.work_item, None);
    }

    #[tokio::test]
    async fn test_empty_organization_clears_everything() {
        let cascade = cascade(catalog());
        cascade.select_organization("Contoso").await.unwrap();
        assert_eq!(cascade.select_organization("  ").await.unwrap(), Load::Applied(0));
        let state = cascade.snapshot();
        assert_eq!(state.organization, None);
        assert!(state.projects.is_empty());
    }

    #[tokio::test]
    async fn test_selection_requires_loaded_options() {
        let cascade = cascade(catalog());
        assert!(matches!(
            cascade.select_project("p1").await,
            Err(CascadeError::NoOrganization)
        ));
        cascade.select_organization("Contoso").await.unwrap();
        assert!(matches!(
            cascade.select_project("nope").await,
            Err(CascadeError::UnknownOption(_))
        ));
        assert!(matches!(
            cascade.select_work_item(WorkItemKey::Assigned(4821)),
            Err(CascadeError::NoProject)
        ));
        cascade.select_project("p1").await.unwrap();
        // Right id, wrong group.
        assert!(cascade.select_work_item(WorkItemKey::Backlog(4821)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_project_load_is_discarded() {
        let cascade = Arc::new(cascade(catalog().with_latency(Duration::from_secs(1))));

        let slow = {
            let cascade = Arc::clone(&cascade);
            tokio::spawn(async move { cascade.select_organization("Contoso").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let fast = cascade.select_organization("Fabrikam").await.unwrap();

        assert_eq!(slow.await.unwrap().unwrap(), Load::Superseded);
        assert_eq!(fast, Load::Applied(1));
        let state = cascade.snapshot();
        assert_eq!(state.organization.as_deref(), Some("Fabrikam"));
        assert_eq!(state.projects[0].id, "f1");
    }

    #[tokio::test]
    async fn test_failed_load_leaves_level_usable() {
        let cascade = cascade(catalog().failing("HTTP 500: Internal Server Error"));
        let err = cascade.select_organization("Contoso").await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));

        let state = cascade.snapshot();
        assert_eq!(state.organization.as_deref(), Some("Contoso"));
        assert!(!state.loading_projects);
        assert!(state.projects.is_empty());
    }

    #[tokio::test]
    async fn test_find_project_is_exact_not_substring() {
        let cascade = cascade(
            MemoryCatalog::new().with_projects(
                "Contoso",
                vec![
                    Project::new("p2", "WebApp.Api"),
                    Project::new("p3", "webapp"),
                    Project::new("p1", "WebApp"),
                ],
            ),
        );
        cascade.select_organization("Contoso").await.unwrap();
        let state = cascade.snapshot();

        assert_eq!(state.find_project("WebApp").unwrap().id, "p1");
        assert_eq!(state.find_project("WEBAPP").unwrap().id, "p3");
        assert_eq!(state.find_project("webapp.api").unwrap().id, "p2");
        assert!(state.find_project("Web").is_none());
        assert!(state.find_project("WebApp.Api.Tests").is_none());
    }

    #[tokio::test]
    async fn test_find_work_item_spans_both_groups() {
        let cascade = cascade(catalog());
        cascade.select_organization("Contoso").await.unwrap();
        cascade.select_project("p1").await.unwrap();
        let state = cascade.snapshot();

        assert_eq!(state.find_work_item(4821).unwrap().0, WorkItemKey::Assigned(4821));
        assert_eq!(state.find_work_item(900).unwrap().0, WorkItemKey::Backlog(900));
        assert!(state.find_work_item(1).is_none());
    }

    #[tokio::test]
    async fn test_failed_group_keeps_the_other() {
        let cascade = cascade(catalog().failing_group(WorkItemFilter::Backlog, "WIQL query failed: 400"));
        cascade.select_organization("Contoso").await.unwrap();

        let err = cascade.select_project("p1").await.unwrap_err();
        assert!(matches!(err, CascadeError::Load(_)));
        assert_eq!(err.to_string(), "backlog items: WIQL query failed: 400");

        let state = cascade.snapshot();
        assert!(!state.loading_work_items);
        assert_eq!(state.project.as_deref(), Some("p1"));
        assert_eq!(state.assigned.len(), 1);
        assert!(state.backlog.is_empty());
        cascade.select_work_item(WorkItemKey::Assigned(4821)).unwrap();
    }

    #[tokio::test]
    async fn test_both_groups_failing_reports_first() {
        let cascade = cascade(
            catalog()
                .failing_group(WorkItemFilter::Assigned, "HTTP 500")
                .failing_group(WorkItemFilter::Backlog, "HTTP 400"),
        );
        cascade.select_organization("Contoso").await.unwrap();

        let err = cascade.select_project("p1").await.unwrap_err();
        assert_eq!(err.to_string(), "assigned work items: HTTP 500");
        let state = cascade.snapshot();
        assert!(state.assigned.is_empty() && state.backlog.is_empty());
    }
}
