//! Time entries logged against work items, one list per day.

use crate::storage::Store;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The work item an entry was logged against, as it was selected at the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedWorkItem {
    #[serde(deserialize_with = "crate::protocol::id_from_number_or_string")]
    pub id: u32,
    pub title: String,
    #[serde(rename = "type", default)]
    pub work_item_type: String,
    pub organization: String,
    pub project: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub task: String,
    #[serde(rename = "workItem")]
    pub work_item: LoggedWorkItem,
    pub hours: u32,
    pub minutes: u32,
    pub timestamp: DateTime<Utc>,
}

impl TimeEntry {
    pub fn total_minutes(&self) -> u32 {
        self.hours * 60 + self.minutes
    }
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("Please fill in all required fields.")]
    MissingSelection,
    #[error("Please enter at least 1 minute.")]
    ZeroDuration,
    #[error("Error saving task: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Narrows a day's entries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub organization: Option<String>,
    pub project_id: Option<String>,
    pub work_item_id: Option<u32>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &TimeEntry) -> bool {
        let item = &entry.work_item;
        self.organization.as_deref().map_or(true, |o| item.organization == o)
            && self.project_id.as_deref().map_or(true, |p| item.project_id == p)
            && self.work_item_id.map_or(true, |id| item.id == id)
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Append an entry to `date`'s list.
pub fn add_entry(
    store: &Store,
    date: NaiveDate,
    work_item: Option<LoggedWorkItem>,
    hours: u32,
    minutes: u32,
) -> Result<TimeEntry, EntryError> {
    let work_item = work_item.ok_or(EntryError::MissingSelection)?;
    if hours == 0 && minutes == 0 {
        return Err(EntryError::ZeroDuration);
    }
    let entry = TimeEntry {
        task: work_item.title.clone(),
        work_item,
        hours,
        minutes,
        timestamp: Utc::now(),
    };
    store.modify(&date_key(date), |entries: &mut Vec<TimeEntry>| {
        entries.push(entry.clone());
    })?;
    tracing::info!(
        %date,
        id = entry.work_item.id,
        time = %format_time(hours, minutes),
        "time logged"
    );
    Ok(entry)
}

pub fn entries_for_date(
    store: &Store,
    date: NaiveDate,
    filter: &EntryFilter,
) -> anyhow::Result<Vec<TimeEntry>> {
    let entries: Vec<TimeEntry> = store.get(&date_key(date))?.unwrap_or_default();
    Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
}

/// Sum of `entries` as `(hours, minutes)` with minutes below 60.
pub fn daily_total(entries: &[TimeEntry]) -> (u32, u32) {
    let minutes: u32 = entries.iter().map(TimeEntry::total_minutes).sum();
    (minutes / 60, minutes % 60)
}

pub fn format_time(hours: u32, minutes: u32) -> String {
    format!("{hours}h {minutes}m")
}
