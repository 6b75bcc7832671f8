//! Work item tracking for Azure DevOps: notice which work item is open,
//! pre-select it in the time entry form, and log time against it.

pub mod azure;
pub mod cascade;
pub mod config;
pub mod detector;
pub mod popup;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod storage;
pub mod timelog;
