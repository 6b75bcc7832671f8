//! Page-side work item detection.
//!
//! A detector lives in a single page context. It decides from the location
//! alone whether the page is a work item detail view, waits for the page to
//! render the title, and reports to the relay. Navigation events re-run the
//! decision; single-page navigation never reloads the detector.

use crate::protocol::{Ack, Envelope, Message, Port, WorkItemRef};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Organization, project and id parsed from a work item URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMatch {
    pub organization: String,
    pub project: String,
    pub id: u32,
}

/// Match `https://{host}/{organization}/{project}/_workitems/edit/{id}`.
///
/// Query strings, fragments and trailing segments after the id are ignored.
/// Organization and project are percent-decoded.
pub fn parse_work_item_url(url: &str, host: &str) -> Option<UrlMatch> {
    let rest = url.strip_prefix("https://")?;
    let (url_host, path) = rest.split_once('/')?;
    if !url_host.eq_ignore_ascii_case(host) {
        return None;
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/');

    let organization = segments.next().filter(|s| !s.is_empty())?;
    let project = segments.next().filter(|s| !s.is_empty())?;
    if segments.next()? != "_workitems" || segments.next()? != "edit" {
        return None;
    }
    let raw_id = segments.next()?;
    if raw_id.is_empty() || !raw_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Digit runs too long for a work item id are not a work item page.
    let id: u64 = raw_id.parse().ok()?;
    let id = u32::try_from(id).ok().filter(|id| *id > 0)?;

    Some(UrlMatch {
        organization: urlencoding::decode(organization).ok()?.into_owned(),
        project: urlencoding::decode(project).ok()?.into_owned(),
        id,
    })
}

/// True when `url` is an https page on the tracked host.
pub fn is_tracked_url(url: &str, host: &str) -> bool {
    url.strip_prefix("https://")
        .map(|rest| rest.split(['/', '?', '#']).next().unwrap_or_default())
        .is_some_and(|url_host| url_host.eq_ignore_ascii_case(host))
}

/// The parts of a tracked page a detector may look at.
pub trait Page: Send + Sync + 'static {
    fn location(&self) -> String;

    /// Rendered title field, if the page has rendered it yet.
    fn title_field(&self) -> Option<String>;
}

/// In-process page whose location doubles as its navigation event source.
pub struct PageSnapshot {
    location: watch::Sender<String>,
    title: Mutex<Option<String>>,
}

impl PageSnapshot {
    pub fn new(location: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(location.into());
        Self {
            location: tx,
            title: Mutex::new(None),
        }
    }

    /// Client-side navigation: the location changes, the rendered title goes away.
    pub fn navigate(&self, location: impl Into<String>) {
        self.set_title(None);
        self.location.send_replace(location.into());
    }

    pub fn set_title(&self, title: Option<&str>) {
        if let Ok(mut slot) = self.title.lock() {
            *slot = title.map(str::to_string);
        }
    }

    pub fn navigations(&self) -> watch::Receiver<String> {
        self.location.subscribe()
    }
}

impl Page for PageSnapshot {
    fn location(&self) -> String {
        self.location.borrow().clone()
    }

    fn title_field(&self) -> Option<String> {
        self.title.lock().ok().and_then(|t| t.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Observed(UrlMatch),
    Cleared,
}

/// Result of [`Detector::evaluate`]; the report itself is sent in the background.
pub struct Emission {
    pub evaluation: Evaluation,
    handle: JoinHandle<()>,
}

impl Emission {
    /// Wait until the report was handed to the relay, dropped, or failed.
    pub async fn delivered(self) {
        let _ = self.handle.await;
    }
}

pub struct Detector<P: Page> {
    page: Arc<P>,
    relay: Port,
    host: String,
    settle: Duration,
    generation: Arc<AtomicU64>,
    // Held while a report is in flight so reports reach the relay in evaluation order.
    outbound: Arc<AsyncMutex<()>>,
    last_seen: Option<String>,
}

impl<P: Page> Detector<P> {
    pub fn new(page: Arc<P>, relay: Port, host: &str, settle: Duration) -> Self {
        Self {
            page,
            relay,
            host: host.to_string(),
            settle,
            generation: Arc::new(AtomicU64::new(0)),
            outbound: Arc::new(AsyncMutex::new(())),
            last_seen: None,
        }
    }

    /// Decide match/no-match now, report in the background.
    ///
    /// A match is reported after the settle delay so the page can render the
    /// title. A newer evaluation, or a location change during the delay,
    /// drops the pending report.
    pub fn evaluate(&mut self) -> Emission {
        let location = self.page.location();
        self.last_seen = Some(location.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let relay = self.relay.clone();
        let outbound = Arc::clone(&self.outbound);

        match parse_work_item_url(&location, &self.host) {
            Some(found) => {
                let evaluation = Evaluation::Observed(found.clone());
                let page = Arc::clone(&self.page);
                let current = Arc::clone(&self.generation);
                let settle = self.settle;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(settle).await;
                    let _sending = outbound.lock().await;
                    if current.load(Ordering::SeqCst) != generation || page.location() != location {
                        debug!(id = found.id, "superseded before the title settled");
                        return;
                    }
                    let title = page
                        .title_field()
                        .map(|t| t.trim().to_string())
                        .unwrap_or_default();
                    let work_item = WorkItemRef {
                        id: found.id,
                        title,
                        organization: found.organization,
                        project: found.project,
                        url: Some(location),
                        observed_at: Some(Utc::now()),
                    };
                    deliver(&relay, Message::WorkItemDetected { work_item }).await;
                });
                Emission { evaluation, handle }
            }
            None => {
                let handle = tokio::spawn(async move {
                    let _sending = outbound.lock().await;
                    deliver(&relay, Message::ClearWorkItem).await;
                });
                Emission {
                    evaluation: Evaluation::Cleared,
                    handle,
                }
            }
        }
    }

    /// Evaluate once, then again on every navigation and `RUN_DETECTION`.
    ///
    /// Returns when the navigation source is dropped.
    pub async fn run(mut self, mut navigation: watch::Receiver<String>, mut inbox: mpsc::Receiver<Envelope>) {
        self.evaluate();
        let mut inbox_open = true;

        loop {
            tokio::select! {
                changed = navigation.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let location = navigation.borrow_and_update().clone();
                    if self.last_seen.as_deref() != Some(location.as_str()) {
                        self.evaluate();
                    }
                }
                envelope = inbox.recv(), if inbox_open => match envelope {
                    Some(envelope) => self.handle(envelope),
                    None => inbox_open = false,
                },
            }
        }
        debug!("page closed, detector stopped");
    }

    fn handle(&mut self, envelope: Envelope) {
        match envelope.message() {
            Ok(Message::RunDetection) => {
                self.evaluate();
                envelope.respond(&Ack::OK);
            }
            Ok(other) => {
                debug!(kind = other.kind(), "ignoring message not meant for a page");
                envelope.respond(&Ack::REJECTED);
            }
            Err(e) => {
                warn!("malformed message for detector: {e}");
                envelope.respond(&Ack::REJECTED);
            }
        }
    }

    /// Run in the background; the returned port is this page's inbox.
    pub fn spawn(self, navigation: watch::Receiver<String>) -> (Port, JoinHandle<()>) {
        let (port, inbox) = Port::channel(16);
        let handle = tokio::spawn(self.run(navigation, inbox));
        (port, handle)
    }
}

// Fire and forget: a missing relay is logged, never retried.
async fn deliver(relay: &Port, message: Message) {
    let kind = message.kind();
    match relay.request::<Ack>(&message).await {
        Ok(ack) if ack.success => debug!(kind, "delivered to relay"),
        Ok(_) => warn!(kind, "relay rejected report"),
        Err(e) => warn!(kind, "could not reach relay: {e}"),
    }
}
