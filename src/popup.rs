//! One popup session: auto-select on open, manual retry, and the time entry form.

use crate::cascade::SelectionCascade;
use crate::detector::parse_work_item_url;
use crate::protocol::WorkItemRef;
use crate::reconciler::{Notice, NoticeKind, Outcome, Reconciler};
use crate::relay::RelayHandle;
use crate::storage::Store;
use crate::timelog::{self, EntryError, EntryFilter, LoggedWorkItem, TimeEntry};
use chrono::{NaiveDate, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a status message stays up.
const STATUS_TTL: Duration = Duration::from_secs(5);

struct Status {
    notice: Notice,
    set_at: Instant,
}

pub struct Popup {
    host: String,
    relay: RelayHandle,
    store: Arc<Store>,
    cascade: Arc<SelectionCascade>,
    reconciler: Reconciler,
    status: Mutex<Option<Status>>,
}

impl Popup {
    pub fn new(
        host: &str,
        relay: RelayHandle,
        store: Arc<Store>,
        cascade: Arc<SelectionCascade>,
        load_timeout: Duration,
    ) -> Self {
        let reconciler = Reconciler::new(
            relay.clone(),
            Arc::clone(&store),
            Arc::clone(&cascade),
            load_timeout,
        );
        Self {
            host: host.to_string(),
            relay,
            store,
            cascade,
            reconciler,
            status: Mutex::new(None),
        }
    }

    pub fn cascade(&self) -> &SelectionCascade {
        &self.cascade
    }

    /// Auto-select whatever the relay last saw.
    pub async fn open(&self) -> Outcome {
        let outcome = self.reconciler.reconcile().await;
        self.show(&outcome);
        outcome
    }

    pub fn retry_enabled(&self) -> bool {
        self.reconciler.retry_enabled()
    }

    /// Re-detect from the active tab's URL and auto-select again.
    pub async fn retry(&self, active_url: Option<&str>) -> Outcome {
        if !self.retry_enabled() {
            return Outcome::Busy;
        }
        let outcome = match active_url {
            None => Outcome::NoActiveTab,
            Some(url) => match parse_work_item_url(url, &self.host) {
                None => Outcome::NotOnWorkItemPage,
                Some(found) => {
                    let mut work_item =
                        WorkItemRef::new(found.id, &found.organization, &found.project);
                    work_item.url = Some(url.to_string());
                    work_item.observed_at = Some(Utc::now());
                    match self.relay.report_observed(work_item.clone()).await {
                        Ok(ack) if ack.success => self.reconciler.retry().await,
                        Ok(_) => self.reconciler.reconcile_with(work_item).await,
                        // The tab itself is the source of truth for a retry.
                        Err(e) => {
                            warn!("could not report active tab to relay: {e}");
                            self.reconciler.reconcile_with(work_item).await
                        }
                    }
                }
            },
        };
        self.show(&outcome);
        outcome
    }

    fn show(&self, outcome: &Outcome) {
        if let Some(notice) = outcome.notice() {
            self.set_notice(notice);
        }
    }

    fn set_notice(&self, notice: Notice) {
        debug!(kind = ?notice.kind, text = %notice.text, "status");
        *self.lock_status() = Some(Status {
            notice,
            set_at: Instant::now(),
        });
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Option<Status>> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, msg: impl Into<String>) {
        self.set_notice(Notice::success(msg));
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        self.set_notice(Notice::error(msg));
    }

    /// Current status message, dropping it once it is older than five seconds.
    pub fn status(&self) -> Option<Notice> {
        let mut status = self.lock_status();
        if status.as_ref().is_some_and(|s| s.set_at.elapsed() > STATUS_TTL) {
            *status = None;
        }
        status.as_ref().map(|s| s.notice.clone())
    }

    /// The selected work item as it would be logged.
    fn selected_work_item(&self) -> Option<LoggedWorkItem> {
        let state = self.cascade.snapshot();
        let organization = state.organization.clone()?;
        let project = state.selected_project()?;
        let key = state.work_item?;
        let option = state.option(key)?;
        Some(LoggedWorkItem {
            id: key.id(),
            title: option.fields.title.clone(),
            work_item_type: option.fields.work_item_type.clone(),
            organization,
            project: project.name.clone(),
            project_id: project.id.clone(),
        })
    }

    /// Log time against the current selection.
    pub fn add_entry(&self, date: NaiveDate, hours: u32, minutes: u32) -> Result<TimeEntry, EntryError> {
        match timelog::add_entry(&self.store, date, self.selected_work_item(), hours, minutes) {
            Ok(entry) => {
                self.cascade.clear_work_item();
                self.set_status("Time log added successfully!");
                Ok(entry)
            }
            Err(e) => {
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Filter matching whatever is currently selected.
    pub fn selection_filter(&self) -> EntryFilter {
        let state = self.cascade.snapshot();
        EntryFilter {
            organization: state.organization.clone(),
            project_id: state.project.clone(),
            work_item_id: state.work_item.map(|key| key.id()),
        }
    }

    pub fn entries(&self, date: NaiveDate, filter: &EntryFilter) -> anyhow::Result<Vec<TimeEntry>> {
        timelog::entries_for_date(&self.store, date, filter)
    }

    pub fn status_is_error(&self) -> bool {
        self.status().is_some_and(|n| n.kind == NoticeKind::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::{Project, WorkItem, WorkItemFilter};
    use crate::cascade::{MemoryCatalog, WorkItemKey};
    use crate::relay::Relay;
    use crate::storage::Credential;
    use tempfile::TempDir;

    const HOST: &str = "dev.azure.example";
    const URL: &str = "https://dev.azure.example/Contoso/WebApp/_workitems/edit/4821";

    fn popup() -> (TempDir, RelayHandle, Popup) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()));
        store
            .save_credential(Credential::new(
                "Contoso",
                "pat",
                Utc::now() + chrono::Duration::days(30),
            ))
            .unwrap();
        let catalog = MemoryCatalog::new()
            .with_projects("Contoso", vec![Project::new("p1", "WebApp")])
            .with_work_items(
                "p1",
                WorkItemFilter::Assigned,
                vec![WorkItem::new(4821, "Fix login bug", "Bug")],
            );
        let (relay, _task) = Relay::new(HOST).spawn();
        let cascade = Arc::new(SelectionCascade::new(Arc::new(catalog)));
        let popup = Popup::new(HOST, relay.clone(), store, cascade, Duration::from_secs(10));
        (dir, relay, popup)
    }

    #[tokio::test]
    async fn test_open_without_observation_shows_nothing() {
        let (_dir, _relay, popup) = popup();
        assert_eq!(popup.open().await, Outcome::NothingObserved);
        assert_eq!(popup.status(), None);
    }

    #[tokio::test]
    async fn test_retry_needs_a_tab() {
        let (_dir, _relay, popup) = popup();
        assert_eq!(popup.retry(None).await, Outcome::NoActiveTab);
        assert_eq!(popup.status().unwrap().text, "Could not access current tab");
    }

    #[tokio::test]
    async fn test_retry_off_work_item_page() {
        let (_dir, relay, popup) = popup();
        let outcome = popup
            .retry(Some("https://dev.azure.example/Contoso/WebApp/_boards"))
            .await;
        assert_eq!(outcome, Outcome::NotOnWorkItemPage);
        assert!(popup.status_is_error());
        assert_eq!(relay.query_current().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retry_reports_tab_and_selects() {
        let (_dir, relay, popup) = popup();
        let outcome = popup.retry(Some(URL)).await;
        assert!(outcome.is_selected());
        assert_eq!(popup.status().unwrap().text, "Auto-selected: Fix login bug");

        let current = relay.query_current().await.unwrap().unwrap();
        assert_eq!(current.id, 4821);
        assert_eq!(current.url.as_deref(), Some(URL));
        assert!(current.observed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_without_relay_uses_tab() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()));
        store
            .save_credential(Credential::new(
                "Contoso",
                "pat",
                Utc::now() + chrono::Duration::days(30),
            ))
            .unwrap();
        let catalog = MemoryCatalog::new()
            .with_projects("Contoso", vec![Project::new("p1", "WebApp")])
            .with_work_items(
                "p1",
                WorkItemFilter::Assigned,
                vec![WorkItem::new(4821, "Fix login bug", "Bug")],
            );
        let (relay, task) = Relay::new(HOST).spawn();
        task.abort();
        let _ = task.await;
        let cascade = Arc::new(SelectionCascade::new(Arc::new(catalog)));
        let popup = Popup::new(HOST, relay, store, cascade, Duration::from_secs(10));

        let outcome = popup.retry(Some(URL)).await;
        assert!(outcome.is_selected());
        assert_eq!(popup.status().unwrap().text, "Auto-selected: Fix login bug");
        assert_eq!(popup.cascade().snapshot().organization.as_deref(), Some("Contoso"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_expires() {
        let (_dir, _relay, popup) = popup();
        popup.set_error("boom");
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(popup.status().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(popup.status(), None);
    }

    #[tokio::test]
    async fn test_add_entry_logs_against_selection() {
        let (_dir, _relay, popup) = popup();
        let day = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();

        assert!(matches!(
            popup.add_entry(day, 1, 0),
            Err(EntryError::MissingSelection)
        ));
        assert_eq!(
            popup.status().unwrap().text,
            "Please fill in all required fields."
        );

        popup.retry(Some(URL)).await;
        let filter = popup.selection_filter();
        assert_eq!(filter.work_item_id, Some(4821));

        let entry = popup.add_entry(day, 0, 45).unwrap();
        assert_eq!(entry.work_item.project, "WebApp");
        assert_eq!(entry.work_item.project_id, "p1");
        assert_eq!(entry.work_item.work_item_type, "Bug");
        assert_eq!(popup.cascade().snapshot().work_item, None);
        assert_eq!(popup.cascade().snapshot().project.as_deref(), Some("p1"));

        let logged = popup.entries(day, &filter).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].task, "Fix login bug");
        assert!(popup.cascade().select_work_item(WorkItemKey::Assigned(4821)).is_ok());
    }
}
