//! Local key-value persistence: credentials and time entries.
//!
//! Everything lives in one JSON object on disk. `adoSettings` holds the
//! credential records and each `YYYY-MM-DD` key holds that day's time entries.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CREDENTIALS_KEY: &str = "adoSettings";

/// Personal access token for one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub organization: String,
    #[serde(rename = "pat")]
    pub credential: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(organization: &str, credential: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            organization: organization.to_string(),
            credential: credential.to_string(),
            expires_at,
        }
    }

    /// Organization names are case-insensitive on the service.
    pub fn matches(&self, organization: &str) -> bool {
        self.organization.eq_ignore_ascii_case(organization.trim())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct Store {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl Store {
    /// Store file inside `dir`.
    pub fn open(dir: &Path) -> Self {
        Self::at(dir.join("store.json"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Map::new()),
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Corrupt store at {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn write_all(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let mut map = self.read_all()?;
        let result = f(&mut map)?;
        self.write_all(&map)?;
        Ok(result)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let map = self.read_all()?;
        map.get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .with_context(|| format!("Unexpected shape under key {key}"))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.update(|map| {
            map.insert(key.to_string(), value);
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.update(|map| {
            map.remove(key);
            Ok(())
        })
    }

    /// Read-modify-write a single key under the store lock.
    pub fn modify<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        self.update(|map| {
            let mut value: T = match map.get(key) {
                Some(raw) => serde_json::from_value(raw.clone())
                    .with_context(|| format!("Unexpected shape under key {key}"))?,
                None => T::default(),
            };
            let result = f(&mut value);
            map.insert(key.to_string(), serde_json::to_value(&value)?);
            Ok(result)
        })
    }

    pub fn credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.get(CREDENTIALS_KEY)?.unwrap_or_default())
    }

    pub fn credential_for(&self, organization: &str) -> Result<Option<Credential>> {
        Ok(self
            .credentials()?
            .into_iter()
            .find(|c| c.matches(organization)))
    }

    /// Save, replacing any record for the same organization.
    pub fn save_credential(&self, credential: Credential) -> Result<()> {
        self.modify(CREDENTIALS_KEY, |list: &mut Vec<Credential>| {
            list.retain(|c| !c.matches(&credential.organization));
            list.push(credential);
        })
    }

    pub fn remove_credential(&self, organization: &str) -> Result<bool> {
        self.modify(CREDENTIALS_KEY, |list: &mut Vec<Credential>| {
            let before = list.len();
            list.retain(|c| !c.matches(organization));
            list.len() != before
        })
    }

    pub fn clear_credentials(&self) -> Result<()> {
        self.remove(CREDENTIALS_KEY)
    }
}
