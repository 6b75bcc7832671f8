//! Background relay: the one place that remembers which work item is in view.
//!
//! The relay runs as its own task and is only reachable through messages.
//! Reports are applied in arrival order and the last one wins.

use crate::detector::is_tracked_url;
use crate::protocol::{Ack, DeliveryError, Envelope, Message, Port, WorkItemRef};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type TabId = u32;

/// Browser-side events about tabs, delivered outside the message protocol.
#[derive(Debug)]
pub enum TabEvent {
    Register { tab: TabId, inbox: Port },
    Updated { tab: TabId, url: String, loaded: bool },
    Removed(TabId),
}

pub struct Relay {
    current: Option<WorkItemRef>,
    host: String,
    tabs: HashMap<TabId, Port>,
}

impl Relay {
    pub fn new(host: &str) -> Self {
        Self {
            current: None,
            host: host.to_string(),
            tabs: HashMap::new(),
        }
    }

    /// Store `work_item` unless it is incomplete.
    pub fn report_observed(&mut self, work_item: WorkItemRef) -> Ack {
        if !work_item.is_complete() {
            warn!(id = work_item.id, "ignoring incomplete work item report");
            return Ack::REJECTED;
        }
        info!(
            id = work_item.id,
            organization = %work_item.organization,
            project = %work_item.project,
            "current work item"
        );
        self.current = Some(work_item);
        Ack::OK
    }

    pub fn report_cleared(&mut self) -> Ack {
        if self.current.take().is_some() {
            info!("current work item cleared");
        }
        Ack::OK
    }

    pub fn query_current(&self) -> Option<WorkItemRef> {
        self.current.clone()
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope.message() {
            Ok(Message::WorkItemDetected { work_item }) => {
                let ack = self.report_observed(work_item);
                envelope.respond(&ack);
            }
            Ok(Message::ClearWorkItem) => {
                let ack = self.report_cleared();
                envelope.respond(&ack);
            }
            Ok(Message::GetCurrentWorkItem) => {
                debug!(present = self.current.is_some(), "current work item requested");
                envelope.respond(&self.query_current());
            }
            Ok(other) => {
                debug!(kind = other.kind(), "message not handled by relay");
                envelope.respond(&Ack::REJECTED);
            }
            Err(e) => {
                warn!("malformed message for relay: {e}");
                envelope.respond(&Ack::REJECTED);
            }
        }
    }

    fn on_tab_event(&mut self, event: TabEvent) {
        match event {
            TabEvent::Register { tab, inbox } => {
                self.tabs.insert(tab, inbox);
            }
            TabEvent::Removed(tab) => {
                self.tabs.remove(&tab);
            }
            TabEvent::Updated { tab, url, loaded } => {
                if !is_tracked_url(&url, &self.host) {
                    if self.current.take().is_some() {
                        info!(tab, "tab left the tracked host, current work item cleared");
                    }
                    return;
                }
                if !loaded {
                    return;
                }
                // Nudge the page; it still reports through the normal path.
                if let Some(inbox) = self.tabs.get(&tab).cloned() {
                    if !inbox.is_connected() {
                        debug!(tab, "page context gone, forgetting tab");
                        self.tabs.remove(&tab);
                        return;
                    }
                    tokio::spawn(async move {
                        if let Err(e) = inbox.request::<Ack>(&Message::RunDetection).await {
                            debug!(tab, "no detector answered RUN_DETECTION: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>, mut tab_events: mpsc::Receiver<TabEvent>) {
        loop {
            // Tab events first: one already queued when a message arrives is applied before it.
            tokio::select! {
                biased;
                Some(event) = tab_events.recv() => self.on_tab_event(event),
                Some(envelope) = inbox.recv() => self.dispatch(envelope),
                else => break,
            }
        }
        debug!("relay stopped");
    }

    pub fn spawn(self) -> (RelayHandle, JoinHandle<()>) {
        let (port, inbox) = Port::channel(64);
        let (tab_tx, tab_rx) = mpsc::channel(64);
        let handle = tokio::spawn(self.run(inbox, tab_rx));
        (RelayHandle { port, tab_events: tab_tx }, handle)
    }
}

/// Cloneable access to a running relay from any other context.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    port: Port,
    tab_events: mpsc::Sender<TabEvent>,
}

impl RelayHandle {
    /// The inbox detectors report to.
    pub fn port(&self) -> Port {
        self.port.clone()
    }

    pub async fn report_observed(&self, work_item: WorkItemRef) -> Result<Ack, DeliveryError> {
        self.port.request(&Message::WorkItemDetected { work_item }).await
    }

    pub async fn report_cleared(&self) -> Result<Ack, DeliveryError> {
        self.port.request(&Message::ClearWorkItem).await
    }

    pub async fn query_current(&self) -> Result<Option<WorkItemRef>, DeliveryError> {
        self.port.request(&Message::GetCurrentWorkItem).await
    }

    pub async fn register_tab(&self, tab: TabId, inbox: Port) -> Result<(), DeliveryError> {
        self.send_tab_event(TabEvent::Register { tab, inbox }).await
    }

    pub async fn tab_updated(&self, tab: TabId, url: &str, loaded: bool) -> Result<(), DeliveryError> {
        self.send_tab_event(TabEvent::Updated {
            tab,
            url: url.to_string(),
            loaded,
        })
        .await
    }

    pub async fn tab_removed(&self, tab: TabId) -> Result<(), DeliveryError> {
        self.send_tab_event(TabEvent::Removed(tab)).await
    }

    async fn send_tab_event(&self, event: TabEvent) -> Result<(), DeliveryError> {
        self.tab_events
            .send(event)
            .await
            .map_err(|_| DeliveryError::NoListener)
    }
}
