//! On-disk configuration store: providers, groups, access keys, and the
//! advisory aggregate failure-stats document. All four are flat JSON maps
//! (id -> record) under the configured config directory, loaded once at
//! startup and kept in an in-memory cache that the admin surface mutates
//! and re-persists via a temp-file-then-rename write.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Wire protocol family a provider/group speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// `/v1/chat/completions`-style.
    O,
    /// `/v1/messages`-style.
    A,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::O => write!(f, "O"),
            Protocol::A => write!(f, "A"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub real_model: Option<String>,
    /// Per-provider override of the global 60s attempt timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub protocol: Protocol,
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: String,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    #[serde(default)]
    pub failures: u64,
}

#[derive(Debug, Default)]
struct ConfigData {
    providers: HashMap<String, Provider>,
    groups: HashMap<String, Group>,
    keys: HashMap<String, AccessKey>,
    stats: HashMap<String, ProviderStats>,
}

/// Read-mostly JSON document store, generalizing the teacher crate's single
/// `Config::from_file` wrapper to four independent documents.
pub struct ConfigStore {
    dir: PathBuf,
    data: RwLock<ConfigData>,
}

fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Write `value` to `path` via a sibling temp file + rename, so a crash
/// mid-write never leaves a truncated document on disk.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

impl ConfigStore {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating config dir {}", dir.display()))?;

        let providers = read_map(&dir.join("providers.json"))?;
        let groups = read_map(&dir.join("groups.json"))?;
        let keys = read_map(&dir.join("keys.json"))?;
        let stats = read_map(&dir.join("stats.json"))?;

        Ok(Self {
            dir,
            data: RwLock::new(ConfigData {
                providers,
                groups,
                keys,
                stats,
            }),
        })
    }

    fn providers_path(&self) -> PathBuf {
        self.dir.join("providers.json")
    }
    fn groups_path(&self) -> PathBuf {
        self.dir.join("groups.json")
    }
    fn keys_path(&self) -> PathBuf {
        self.dir.join("keys.json")
    }
    fn stats_path(&self) -> PathBuf {
        self.dir.join("stats.json")
    }

    // -- providers --------------------------------------------------------

    pub fn list_providers(&self) -> Vec<Provider> {
        let data = self.data.read();
        let mut v: Vec<_> = data.providers.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn get_provider(&self, name: &str) -> Option<Provider> {
        self.data.read().providers.get(name).cloned()
    }

    /// Upsert-on-name semantics, matching the admin contract ("PUT-on-POST upsert").
    pub fn upsert_provider(&self, provider: Provider) -> Result<()> {
        let mut data = self.data.write();
        data.providers.insert(provider.name.clone(), provider);
        write_atomic(&self.providers_path(), &data.providers)
    }

    pub fn delete_provider(&self, name: &str) -> Result<bool> {
        let mut data = self.data.write();
        let removed = data.providers.remove(name).is_some();
        if removed {
            write_atomic(&self.providers_path(), &data.providers)?;
        }
        Ok(removed)
    }

    // -- groups -------------------------------------------------------------

    pub fn list_groups(&self) -> Vec<Group> {
        let data = self.data.read();
        let mut v: Vec<_> = data.groups.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn get_group(&self, name: &str) -> Option<Group> {
        self.data.read().groups.get(name).cloned()
    }

    pub fn upsert_group(&self, group: Group) -> Result<()> {
        let mut data = self.data.write();
        data.groups.insert(group.name.clone(), group);
        write_atomic(&self.groups_path(), &data.groups)
    }

    pub fn delete_group(&self, name: &str) -> Result<bool> {
        let mut data = self.data.write();
        let removed = data.groups.remove(name).is_some();
        if removed {
            write_atomic(&self.groups_path(), &data.groups)?;
        }
        Ok(removed)
    }

    // -- access keys --------------------------------------------------------

    pub fn list_keys(&self) -> Vec<AccessKey> {
        let data = self.data.read();
        let mut v: Vec<_> = data.keys.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// Create a key, generating an id if absent and synthesizing a token
    /// (`sk-<9 random chars>`) if the client supplied none.
    pub fn create_key(&self, name: String, token: Option<String>) -> Result<AccessKey> {
        let key = AccessKey {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            token: token.unwrap_or_else(generate_token),
        };
        let mut data = self.data.write();
        data.keys.insert(key.id.clone(), key.clone());
        write_atomic(&self.keys_path(), &data.keys)?;
        Ok(key)
    }

    pub fn delete_key(&self, id: &str) -> Result<bool> {
        let mut data = self.data.write();
        let removed = data.keys.remove(id).is_some();
        if removed {
            write_atomic(&self.keys_path(), &data.keys)?;
        }
        Ok(removed)
    }

    /// Authenticate a bearer token, returning the key's display name.
    pub fn authenticate(&self, token: &str) -> Option<String> {
        self.data
            .read()
            .keys
            .values()
            .find(|k| k.token == token)
            .map(|k| k.name.clone())
    }

    // -- aggregate stats ------------------------------------------------------

    /// Read-modify-write increment. Lost updates under concurrency are
    /// tolerated; the counter is advisory only.
    pub fn record_failure(&self, provider: &str) {
        let mut data = self.data.write();
        data.stats.entry(provider.to_string()).or_default().failures += 1;
        if let Err(e) = write_atomic(&self.stats_path(), &data.stats) {
            tracing::error!(provider, error = %e, "failed to persist aggregate stats");
        }
    }

    pub fn stats_snapshot(&self) -> HashMap<String, ProviderStats> {
        self.data.read().stats.clone()
    }
}

fn generate_token() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("sk-{}", suffix)
}
