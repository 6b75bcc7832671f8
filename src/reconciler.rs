//! Auto-select: land the popup's dropdowns on the work item in view.
//!
//! The reconciler asks the relay what is in view, then walks the cascade one
//! level at a time, waiting on each level's load before reading its options.
//! Every invocation takes a generation number; once a newer invocation starts,
//! the older one stops at its next suspension point without touching the
//! cascade again.

use crate::cascade::{CascadeError, Load, SelectionCascade, WorkItemKey};
use crate::protocol::WorkItemRef;
use crate::relay::RelayHandle;
use crate::storage::Store;
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Projects,
    WorkItems,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Projects => write!(f, "projects"),
            Stage::WorkItems => write!(f, "work items"),
        }
    }
}

/// How an auto-select attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing (or nothing usable) in view; manual selection as usual.
    NothingObserved,
    OrganizationNotConfigured { organization: String },
    CredentialExpired { organization: String },
    ProjectNotFound { project: String },
    WorkItemNotFound { id: u32 },
    LoadFailed { stage: Stage, message: String },
    /// The load is still running and will fill the dropdown when it lands.
    TimedOut { stage: Stage },
    Selected { key: WorkItemKey, title: String },
    /// A newer attempt took over.
    Superseded,
    /// Retry refused while another attempt is outstanding.
    Busy,
    NoActiveTab,
    NotOnWorkItemPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

/// Transient message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            text: text.into(),
        }
    }
}

impl Outcome {
    pub fn is_selected(&self) -> bool {
        matches!(self, Outcome::Selected { .. })
    }

    /// What the user sees, if anything.
    pub fn notice(&self) -> Option<Notice> {
        let notice = match self {
            Outcome::NothingObserved | Outcome::Superseded | Outcome::Busy => return None,
            Outcome::OrganizationNotConfigured { organization } => Notice::error(format!(
                "Organization \"{organization}\" is not configured"
            )),
            Outcome::CredentialExpired { organization } => {
                Notice::error(format!("credential for {organization} expired"))
            }
            Outcome::ProjectNotFound { project } => {
                Notice::error(format!("Project \"{project}\" not found or not accessible"))
            }
            Outcome::WorkItemNotFound { id } => Notice::error(format!(
                "Work item {id} is not assigned to you or not accessible"
            )),
            Outcome::LoadFailed { stage, message } => {
                Notice::error(format!("Failed to load {stage}: {message}"))
            }
            Outcome::TimedOut { stage } => {
                Notice::error(format!("Loading {stage} is taking too long - select manually"))
            }
            Outcome::Selected { title, .. } => Notice::success(format!("Auto-selected: {title}")),
            Outcome::NoActiveTab => Notice::error("Could not access current tab"),
            Outcome::NotOnWorkItemPage => Notice::error("Not on an Azure DevOps work item page"),
        };
        Some(notice)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Reconciler {
    relay: RelayHandle,
    store: Arc<Store>,
    cascade: Arc<SelectionCascade>,
    load_timeout: Duration,
    generation: AtomicU64,
    in_flight: AtomicUsize,
}

impl Reconciler {
    pub fn new(
        relay: RelayHandle,
        store: Arc<Store>,
        cascade: Arc<SelectionCascade>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            store,
            cascade,
            load_timeout,
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// False while any attempt is still waiting on a load.
    pub fn retry_enabled(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Run one attempt unconditionally.
    pub async fn reconcile(&self) -> Outcome {
        let _in_flight = InFlight::enter(&self.in_flight);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.run(generation).await;
        info!(generation, ?outcome, "auto-select finished");
        outcome
    }

    /// Run an attempt unless one is already outstanding.
    pub async fn retry(&self) -> Outcome {
        if !self.retry_enabled() {
            return Outcome::Busy;
        }
        self.reconcile().await
    }

    /// Run an attempt for `work_item` without asking the relay.
    pub async fn reconcile_with(&self, work_item: WorkItemRef) -> Outcome {
        let _in_flight = InFlight::enter(&self.in_flight);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = if work_item.is_complete() {
            self.select(generation, work_item).await
        } else {
            Outcome::NothingObserved
        };
        info!(generation, ?outcome, "auto-select finished");
        outcome
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    async fn run(&self, generation: u64) -> Outcome {
        let work_item = match self.relay.query_current().await {
            Ok(Some(work_item)) if work_item.is_complete() => work_item,
            Ok(Some(work_item)) => {
                debug!(id = work_item.id, "ignoring incomplete work item");
                return Outcome::NothingObserved;
            }
            Ok(None) => return Outcome::NothingObserved,
            Err(e) => {
                warn!("relay unreachable: {e}");
                return Outcome::NothingObserved;
            }
        };
        if self.superseded(generation) {
            return Outcome::Superseded;
        }
        self.select(generation, work_item).await
    }

    async fn select(&self, generation: u64, work_item: WorkItemRef) -> Outcome {
        debug!(id = work_item.id, organization = %work_item.organization, "auto-selecting");

        let credential = match self.store.credential_for(&work_item.organization) {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return Outcome::OrganizationNotConfigured {
                    organization: work_item.organization,
                }
            }
            Err(e) => {
                return Outcome::LoadFailed {
                    stage: Stage::Projects,
                    message: format!("{e:#}"),
                }
            }
        };
        if credential.is_expired_at(Utc::now()) {
            return Outcome::CredentialExpired {
                organization: credential.organization,
            };
        }

        let cascade = Arc::clone(&self.cascade);
        let organization = credential.organization.clone();
        let load = async move { cascade.select_organization(&organization).await };
        if let Err(outcome) = self.wait_for(Stage::Projects, load).await {
            return outcome;
        }
        if self.superseded(generation) {
            return Outcome::Superseded;
        }

        let project = match self.cascade.snapshot().find_project(&work_item.project) {
            Some(project) => project.clone(),
            None => {
                return Outcome::ProjectNotFound {
                    project: work_item.project,
                }
            }
        };
        debug!(project_id = %project.id, name = %project.name, "project matched");

        let cascade = Arc::clone(&self.cascade);
        let project_id = project.id.clone();
        let load = async move { cascade.select_project(&project_id).await };
        // One group failing still leaves the other group's options to search.
        let partial = match self.wait_for(Stage::WorkItems, load).await {
            Ok(()) => None,
            Err(outcome @ Outcome::LoadFailed { .. }) => Some(outcome),
            Err(outcome) => return outcome,
        };
        if self.superseded(generation) {
            return Outcome::Superseded;
        }

        let state = self.cascade.snapshot();
        let Some((key, option)) = state.find_work_item(work_item.id) else {
            return partial.unwrap_or(Outcome::WorkItemNotFound { id: work_item.id });
        };
        debug!(%key, group = ?key.group(), "work item matched");
        let title = if option.fields.title.trim().is_empty() {
            work_item.display_title()
        } else {
            option.fields.title.clone()
        };
        match self.cascade.select_work_item(key) {
            Ok(()) => Outcome::Selected { key, title },
            // The cascade moved on between the snapshot and the selection.
            Err(_) => Outcome::Superseded,
        }
    }

    /// Wait for a level's load, up to the configured limit.
    ///
    /// The load runs as its own task, so on timeout it keeps going and still
    /// fills the dropdown for manual selection.
    async fn wait_for<F>(&self, stage: Stage, load: F) -> Result<(), Outcome>
    where
        F: Future<Output = Result<Load, CascadeError>> + Send + 'static,
    {
        let task = tokio::spawn(load);
        match tokio::time::timeout(self.load_timeout, task).await {
            Ok(Ok(Ok(Load::Applied(count)))) => {
                debug!(%stage, count, "options loaded");
                Ok(())
            }
            Ok(Ok(Ok(Load::Superseded))) => Err(Outcome::Superseded),
            Ok(Ok(Err(e))) => Err(Outcome::LoadFailed {
                stage,
                message: e.to_string(),
            }),
            Ok(Err(e)) => Err(Outcome::LoadFailed {
                stage,
                message: e.to_string(),
            }),
            Err(_) => {
                warn!(%stage, "load still running after {:?}", self.load_timeout);
                Err(Outcome::TimedOut { stage })
            }
        }
    }
}
