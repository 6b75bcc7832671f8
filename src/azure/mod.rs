mod client;
mod types;

pub use client::{AzureClient, RestCatalog};
pub use types::*;
