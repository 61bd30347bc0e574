//! Local host cache
//!
//! Small key-value store remembering the session this machine is hosting,
//! so a second local instance can find it during development. Optionally
//! persisted as a JSON file.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::JoinCredential;

pub const HOST_ACTIVE_KEY: &str = "HostActive";
pub const HOST_ADDRESS_KEY: &str = "HostIP";
pub const HOST_PORT_KEY: &str = "HostPort";
pub const JOIN_CODE_KEY: &str = "JoinCode";

const HOST_KEYS: [&str; 4] = [HOST_ACTIVE_KEY, HOST_ADDRESS_KEY, HOST_PORT_KEY, JOIN_CODE_KEY];

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: BTreeMap<String, String>,
}

pub struct LocalHostCache {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
    capacity: usize,
}

impl LocalHostCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Open a file-backed cache, loading existing entries if the file exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let file: CacheFile = serde_json::from_str(&text)?;
            debug!("Loaded {} cache entries from {}", file.entries.len(), path.display());
            file.entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            capacity: DEFAULT_CAPACITY,
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(HOST_KEYS.len());
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.lock();
            if !entries.contains_key(key) && entries.len() >= self.capacity {
                return Err(CacheError::Full { capacity: self.capacity });
            }
            entries.insert(key.to_string(), value.into());
        }
        self.flush()
    }

    pub fn remove(&self, key: &str) -> Result<Option<String>, CacheError> {
        let removed = self.entries.lock().remove(key);
        self.flush()?;
        Ok(removed)
    }

    /// Remember that this machine hosts at `address`
    pub fn record_host(&self, address: SocketAddr, code: Option<&JoinCredential>) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.lock();
            let new_keys = HOST_KEYS.iter().filter(|k| !entries.contains_key(**k)).count();
            if entries.len() + new_keys > self.capacity {
                return Err(CacheError::Full { capacity: self.capacity });
            }
            entries.insert(HOST_ACTIVE_KEY.to_string(), "true".to_string());
            entries.insert(HOST_ADDRESS_KEY.to_string(), address.ip().to_string());
            entries.insert(HOST_PORT_KEY.to_string(), address.port().to_string());
            match code {
                Some(code) => entries.insert(JOIN_CODE_KEY.to_string(), code.to_string()),
                None => entries.remove(JOIN_CODE_KEY),
            };
        }
        self.flush()
    }

    /// Forget host details
    pub fn clear_host(&self) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.lock();
            for key in HOST_KEYS {
                entries.remove(key);
            }
        }
        self.flush()
    }

    /// Cached host address, if a host is recorded as active
    pub fn active_host(&self) -> Option<SocketAddr> {
        let entries = self.entries.lock();
        if entries.get(HOST_ACTIVE_KEY).map(String::as_str) != Some("true") {
            return None;
        }
        let ip = entries.get(HOST_ADDRESS_KEY)?.parse().ok()?;
        let port = entries.get(HOST_PORT_KEY)?.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }

    fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CacheFile {
            entries: self.entries.lock().clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache file is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Cache is full ({capacity} entries)")]
    Full { capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn address() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7420)
    }

    #[test]
    fn test_record_and_clear_host() {
        let cache = LocalHostCache::in_memory();
        cache.record_host(address(), Some(&JoinCredential::new("QWERTY"))).unwrap();

        assert_eq!(cache.active_host(), Some(address()));
        assert_eq!(cache.get(JOIN_CODE_KEY).as_deref(), Some("QWERTY"));

        cache.clear_host().unwrap();
        assert_eq!(cache.active_host(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bounded_capacity() {
        let cache = LocalHostCache::in_memory().with_capacity(4);
        for i in 0..4 {
            cache.set(&format!("k{}", i), "v").unwrap();
        }

        assert!(matches!(cache.set("k4", "v"), Err(CacheError::Full { capacity: 4 })));
        // Overwriting an existing key is still allowed
        cache.set("k0", "w").unwrap();
        assert_eq!(cache.get("k0").as_deref(), Some("w"));
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("quickmatch-cache-{}.json", uuid::Uuid::new_v4()));
        {
            let cache = LocalHostCache::open(&path).unwrap();
            cache.record_host(address(), None).unwrap();
        }

        let reopened = LocalHostCache::open(&path).unwrap();
        assert_eq!(reopened.active_host(), Some(address()));
        assert_eq!(reopened.get(JOIN_CODE_KEY), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let path = std::env::temp_dir().join(format!("quickmatch-cache-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, "not json").unwrap();

        assert!(matches!(LocalHostCache::open(&path), Err(CacheError::Format(_))));

        let _ = fs::remove_file(&path);
    }
}
