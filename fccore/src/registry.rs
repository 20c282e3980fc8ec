//! Process-wide tenant registry: CRC32-C name hash to tenant instance.
//! Written once during startup configuration, read from every request
//! thread afterwards. Iteration order is the hash order, which keeps
//! status output deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info};

use crate::error::LoadError;
use crate::loader;
use crate::tenant::{self, ManifestError};
use crate::tenant_instance::TenantInstance;
use crate::util::crc32c_hash;

#[derive(Default)]
pub struct TenantRegistry {
    tenants: BTreeMap<u32, Arc<TenantInstance>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        TenantRegistry::default()
    }

    /// Parse a manifest and admit its tenants. With `initialize`, every
    /// tenant's program starts booting in parallel and this call blocks
    /// until all of them settled; a failed program is logged and left
    /// unloaded (its requests answer 503), the tenant itself stays.
    pub fn load_str(&mut self, json: &str, source: &str, initialize: bool) -> Result<usize, ManifestError> {
        let configs = tenant::parse_manifest(json)?;
        let mut added = Vec::new();
        for config in configs {
            let hash = config.hash;
            if self.tenants.contains_key(&hash) {
                error!("tenant already existed: {} (from {})", config.name, source);
                continue;
            }
            let instance = Arc::new(TenantInstance::new(config));
            if initialize {
                instance.begin_initialize(false);
            }
            self.tenants.insert(hash, instance.clone());
            added.push(instance);
        }
        if initialize {
            for instance in &added {
                if let Err(e) = instance.wait_for_initialization() {
                    error!(
                        "exception when creating machine '{}' from source '{}': {}",
                        instance.config.name, instance.config.filename, e
                    );
                }
            }
        }
        info!("registry loaded {} tenants from {}", added.len(), source);
        Ok(added.len())
    }

    pub fn load_file(&mut self, path: &str, initialize: bool) -> Result<usize, ManifestError> {
        let bytes = std::fs::read(path).map_err(|e| ManifestError::Invalid {
            name: path.to_string(),
            reason: e.to_string(),
        })?;
        let json = String::from_utf8_lossy(&bytes);
        self.load_str(&json, path, initialize)
    }

    pub fn load_uri(&mut self, uri: &str, initialize: bool) -> Result<usize, ManifestError> {
        let fetched = loader::fetch_bytes(uri, None).map_err(|e: LoadError| ManifestError::Invalid {
            name: uri.to_string(),
            reason: e.to_string(),
        })?;
        let json = String::from_utf8_lossy(&fetched.body);
        self.load_str(&json, uri, initialize)
    }

    pub fn find(&self, name: &str) -> Option<Arc<TenantInstance>> {
        self.tenants.get(&crc32c_hash(name.as_bytes())).cloned()
    }

    /// Lookup gated on the tenant's live-update access key.
    pub fn find_key(&self, name: &str, key: &str) -> Option<Arc<TenantInstance>> {
        self.find(name).filter(|t| !t.config.key.is_empty() && t.config.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TenantInstance>> {
        self.tenants.values()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn status_report(&self) -> serde_json::Value {
        serde_json::Value::Array(self.iter().map(|t| t.status_summary()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "grp": { "concurrency": 3 },
        "alpha": { "group": "grp", "filename": "/tmp/alpha.elf", "key": "k1" },
        "beta": { "filename": "/tmp/beta.elf" }
    }"#;

    #[test]
    fn lookup_by_name_and_key() {
        let mut reg = TenantRegistry::new();
        assert_eq!(reg.load_str(MANIFEST, "test", false).unwrap(), 2);
        assert!(reg.find("alpha").is_some());
        assert!(reg.find("gamma").is_none());
        assert!(reg.find_key("alpha", "k1").is_some());
        assert!(reg.find_key("alpha", "nope").is_none());
        // beta has no key: live-update endpoints stay closed
        assert!(reg.find_key("beta", "").is_none());
    }

    #[test]
    fn duplicate_tenants_keep_first() {
        let mut reg = TenantRegistry::new();
        reg.load_str(MANIFEST, "one", false).unwrap();
        let n = reg.load_str(r#"{ "alpha": { "filename": "/other" } }"#, "two", false).unwrap();
        assert_eq!(n, 0);
        assert_eq!(reg.find("alpha").unwrap().config.filename, "/tmp/alpha.elf");
    }

    #[test]
    fn deterministic_iteration() {
        let mut reg = TenantRegistry::new();
        reg.load_str(MANIFEST, "test", false).unwrap();
        let a: Vec<String> = reg.iter().map(|t| t.config.name.clone()).collect();
        let mut reg2 = TenantRegistry::new();
        reg2.load_str(MANIFEST, "test", false).unwrap();
        let b: Vec<String> = reg2.iter().map(|t| t.config.name.clone()).collect();
        assert_eq!(a, b);
    }
}
