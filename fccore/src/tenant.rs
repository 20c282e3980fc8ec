//! Tenant configuration and the JSON manifest.
//!
//! The manifest is one object whose keys are either groups or tenants. An
//! entry is a tenant iff it carries any of `group`, `filename`, `uri`;
//! everything else is a group definition. Group keys may be repeated inside
//! a tenant entry to override the group's values for that tenant alone. The
//! `test` group always exists with defaults. Unknown keys are logged, never
//! fatal.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::warn;
use serde_json::Value;
use thiserror::Error;

use fcvm::VirtualRemapping;

use crate::settings;
use crate::util::crc32c_hash;

#[derive(Debug, Clone)]
pub struct WarmupSpec {
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
    pub num_requests: usize,
}

#[derive(Debug, Clone)]
pub struct PathMapping {
    pub virtual_path: String,
    pub real_path: String,
    pub writable: bool,
}

/// Per-group resource policy. Tenants reference a group and may override any
/// of it inline.
pub struct TenantGroup {
    pub name: String,
    pub max_boot_time: std::time::Duration,
    pub max_req_time: std::time::Duration,
    pub max_storage_time: std::time::Duration,
    pub max_queue_time: std::time::Duration,
    // All memory figures in bytes.
    pub max_address_space: u64,
    pub max_main_memory: u64,
    pub max_req_memory: u64,
    pub limit_req_memory: u64,
    pub shared_memory: u64,
    pub max_concurrency: usize,
    pub max_smp: usize,
    pub max_fd: usize,
    pub max_regex: usize,
    pub has_storage: bool,
    pub hugepages: bool,
    pub ephemeral_hugepages: bool,
    pub split_hugepages: bool,
    pub transparent_hugepages: bool,
    pub relocate_fixed_mmap: bool,
    pub allow_debug: bool,
    pub control_ephemeral: bool,
    pub ephemeral: bool,
    pub ephemeral_keep_working_memory: bool,
    pub print_stdout: bool,
    pub verbose: bool,
    pub environ: Vec<String>,
    pub main_arguments: ArcSwapOption<Vec<String>>,
    pub vmem_remappings: Vec<VirtualRemapping>,
    pub vmem_heap_executable: bool,
    pub allowed_paths: Vec<PathMapping>,
    pub warmup: Option<WarmupSpec>,
}

impl TenantGroup {
    pub fn new(name: impl Into<String>) -> Self {
        TenantGroup {
            name: name.into(),
            max_boot_time: settings::STARTUP_TIMEOUT,
            max_req_time: settings::REQUEST_VM_TIMEOUT,
            max_storage_time: settings::STORAGE_TIMEOUT,
            max_queue_time: settings::RESV_QUEUE_TIMEOUT,
            max_address_space: settings::MAIN_MEMORY_MB << 20,
            max_main_memory: settings::MAIN_MEMORY_MB << 20,
            max_req_memory: settings::REQUEST_MEMORY_MB << 20,
            limit_req_memory: settings::REQUEST_MEMORY_AFTER_RESET_MB << 20,
            shared_memory: settings::SHARED_MEMORY_MB << 20,
            max_concurrency: settings::DEFAULT_MAX_CONCURRENCY,
            max_smp: 0,
            max_fd: settings::DEFAULT_MAX_FD,
            max_regex: settings::DEFAULT_MAX_REGEX,
            has_storage: false,
            hugepages: false,
            ephemeral_hugepages: false,
            split_hugepages: true,
            transparent_hugepages: false,
            relocate_fixed_mmap: true,
            allow_debug: false,
            control_ephemeral: false,
            ephemeral: true,
            ephemeral_keep_working_memory: false,
            print_stdout: false,
            verbose: false,
            environ: vec!["LC_TYPE=C".into(), "LC_ALL=C".into(), "USER=root".into()],
            main_arguments: ArcSwapOption::empty(),
            vmem_remappings: Vec::new(),
            vmem_heap_executable: false,
            allowed_paths: Vec::new(),
            warmup: None,
        }
    }

    pub fn set_max_memory(&mut self, mb: u64) {
        self.max_main_memory = mb << 20;
        // the address space must cover main memory
        self.max_address_space = self.max_address_space.max(self.max_main_memory);
    }

    /// Sanity-check resource caps before a tenant is admitted.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency < 1 {
            return Err("concurrency must be at least 1".into());
        }
        if self.max_address_space < self.max_main_memory {
            return Err("max_address_space must cover max_main_memory".into());
        }
        if self.max_smp > settings::SMP_MAX_CPUS {
            return Err(format!("smp is limited to {} extra vCPUs", settings::SMP_MAX_CPUS));
        }
        if self.shared_memory > self.max_address_space / 2 {
            return Err("shared_memory cannot exceed half the address space".into());
        }
        if self.shared_memory > 0 && !self.vmem_remappings.is_empty() {
            return Err("shared memory is incompatible with vmem remappings".into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for TenantGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantGroup")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_main_memory", &self.max_main_memory)
            .field("max_req_memory", &self.max_req_memory)
            .field("has_storage", &self.has_storage)
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

impl Clone for TenantGroup {
    fn clone(&self) -> Self {
        TenantGroup {
            name: self.name.clone(),
            max_boot_time: self.max_boot_time,
            max_req_time: self.max_req_time,
            max_storage_time: self.max_storage_time,
            max_queue_time: self.max_queue_time,
            max_address_space: self.max_address_space,
            max_main_memory: self.max_main_memory,
            max_req_memory: self.max_req_memory,
            limit_req_memory: self.limit_req_memory,
            shared_memory: self.shared_memory,
            max_concurrency: self.max_concurrency,
            max_smp: self.max_smp,
            max_fd: self.max_fd,
            max_regex: self.max_regex,
            has_storage: self.has_storage,
            hugepages: self.hugepages,
            ephemeral_hugepages: self.ephemeral_hugepages,
            split_hugepages: self.split_hugepages,
            transparent_hugepages: self.transparent_hugepages,
            relocate_fixed_mmap: self.relocate_fixed_mmap,
            allow_debug: self.allow_debug,
            control_ephemeral: self.control_ephemeral,
            ephemeral: self.ephemeral,
            ephemeral_keep_working_memory: self.ephemeral_keep_working_memory,
            print_stdout: self.print_stdout,
            verbose: self.verbose,
            environ: self.environ.clone(),
            main_arguments: ArcSwapOption::new(self.main_arguments.load_full()),
            vmem_remappings: self.vmem_remappings.clone(),
            vmem_heap_executable: self.vmem_heap_executable,
            allowed_paths: self.allowed_paths.clone(),
            warmup: self.warmup.clone(),
        }
    }
}

/// Immutable per-tenant policy. Only `group.main_arguments` may change after
/// load (atomic swap).
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub name: String,
    /// CRC32-C of the name; the registry key.
    pub hash: u32,
    pub group: TenantGroup,
    pub filename: String,
    pub key: String,
    pub uri: String,
    pub sha256: String,
    pub md5: String,
    /// Real path behind the guest-visible "state" file.
    pub allowed_file: String,
}

impl TenantConfig {
    pub fn new(name: String, filename: String, key: String, group: TenantGroup, uri: String) -> Self {
        let hash = crc32c_hash(name.as_bytes());
        let allowed_file = format!("{}.state", filename);
        TenantConfig { name, hash, group, filename, key, uri, sha256: String::new(), md5: String::new(), allowed_file }
    }

    pub fn request_program_filename(&self) -> &str {
        &self.filename
    }

    pub fn storage_program_filename(&self) -> String {
        format!("{}_storage", self.filename)
    }

    /// A tenant is reachable iff a program can come from somewhere.
    pub fn reachable(&self) -> bool {
        !self.filename.is_empty() || !self.uri.is_empty()
    }

    pub fn max_req_time(&self, debug: bool) -> std::time::Duration {
        if debug {
            settings::DEBUG_TIMEOUT
        } else {
            self.group.max_req_time
        }
    }

    pub fn has_storage(&self) -> bool {
        self.group.has_storage
    }

    /// Resolve a guest-visible path to a host path, honoring the special
    /// "state" file and the allow-list. Returns `(real_path, writable)`.
    pub fn resolve_guest_path(&self, path: &str) -> Option<(String, bool)> {
        if path == settings::GUEST_STATE_FILE {
            return Some((self.allowed_file.clone(), true));
        }
        self.group
            .allowed_paths
            .iter()
            .find(|m| m.virtual_path == path)
            .map(|m| (m.real_path.clone(), m.writable))
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest must be a JSON object")]
    NotAnObject,
    #[error("could not find group {group} for '{tenant}'")]
    MissingGroup { tenant: String, group: String },
    #[error("unreachable program {0} has no URI or filename")]
    Unreachable(String),
    #[error("invalid configuration for '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

fn is_tenant(obj: &serde_json::Map<String, Value>) -> bool {
    obj.contains_key("group") || obj.contains_key("filename") || obj.contains_key("uri")
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_f64().map(|f| f as u64))
}

fn duration_secs(v: &Value) -> Option<std::time::Duration> {
    v.as_f64().map(std::time::Duration::from_secs_f64)
}

fn parse_allowed_path(v: &Value) -> Option<PathMapping> {
    if let Some(s) = v.as_str() {
        return Some(PathMapping { virtual_path: s.to_string(), real_path: s.to_string(), writable: false });
    }
    let obj = v.as_object()?;
    let virt = obj.get("virtual")?.as_str()?.to_string();
    let real = obj.get("real").and_then(|r| r.as_str()).unwrap_or(&virt).to_string();
    let writable = obj.get("writable").and_then(|w| w.as_bool()).unwrap_or(false);
    Some(PathMapping { virtual_path: virt, real_path: real, writable })
}

fn parse_warmup(name: &str, v: &Value) -> Option<WarmupSpec> {
    let obj = v.as_object()?;
    let spec = WarmupSpec {
        method: obj.get("method").and_then(|m| m.as_str()).unwrap_or("GET").to_string(),
        url: obj.get("url").and_then(|u| u.as_str()).unwrap_or("/").to_string(),
        headers: obj
            .get("headers")
            .and_then(|h| h.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        num_requests: obj.get("num_requests").and_then(|n| n.as_u64()).unwrap_or(1) as usize,
    };
    if spec.headers.iter().any(|h| !h.contains(':')) {
        warn!("{}: warmup header without colon, warmup disabled", name);
        return None;
    }
    Some(spec)
}

/// Apply one manifest key to a group. Unknown keys are logged and ignored so
/// old engines keep accepting newer manifests.
pub fn configure_group(name: &str, group: &mut TenantGroup, key: &str, value: &Value) -> Result<(), ManifestError> {
    let invalid = |reason: &str| ManifestError::Invalid { name: name.to_string(), reason: reason.to_string() };
    match key {
        "max_boot_time" => group.max_boot_time = duration_secs(value).ok_or_else(|| invalid("max_boot_time"))?,
        "max_request_time" => group.max_req_time = duration_secs(value).ok_or_else(|| invalid("max_request_time"))?,
        "max_storage_time" => {
            group.max_storage_time = duration_secs(value).ok_or_else(|| invalid("max_storage_time"))?
        }
        "max_queue_time" => group.max_queue_time = duration_secs(value).ok_or_else(|| invalid("max_queue_time"))?,
        "max_memory" => group.set_max_memory(as_u64(value).ok_or_else(|| invalid("max_memory"))?),
        "address_space" => {
            group.max_address_space = as_u64(value).ok_or_else(|| invalid("address_space"))? << 20;
        }
        "max_request_memory" => {
            group.max_req_memory = as_u64(value).ok_or_else(|| invalid("max_request_memory"))? << 20;
        }
        "req_mem_limit_after_reset" => {
            group.limit_req_memory = as_u64(value).ok_or_else(|| invalid("req_mem_limit_after_reset"))? << 20;
        }
        "shared_memory" => group.shared_memory = as_u64(value).ok_or_else(|| invalid("shared_memory"))? << 20,
        "concurrency" => group.max_concurrency = as_u64(value).ok_or_else(|| invalid("concurrency"))? as usize,
        "smp" => {
            let smp = as_u64(value).ok_or_else(|| invalid("smp"))? as usize;
            group.max_smp = smp.min(settings::SMP_MAX_CPUS);
        }
        "max_regex" => group.max_regex = as_u64(value).ok_or_else(|| invalid("max_regex"))? as usize,
        "max_fd" => group.max_fd = as_u64(value).ok_or_else(|| invalid("max_fd"))? as usize,
        "storage" => group.has_storage = value.as_bool().ok_or_else(|| invalid("storage"))?,
        "hugepages" => group.hugepages = value.as_bool().ok_or_else(|| invalid("hugepages"))?,
        "request_hugepages" => {
            group.ephemeral_hugepages = value.as_bool().ok_or_else(|| invalid("request_hugepages"))?
        }
        "split_hugepages" => group.split_hugepages = value.as_bool().ok_or_else(|| invalid("split_hugepages"))?,
        "transparent_hugepages" => {
            group.transparent_hugepages = value.as_bool().ok_or_else(|| invalid("transparent_hugepages"))?
        }
        "relocate_fixed_mmap" => {
            group.relocate_fixed_mmap = value.as_bool().ok_or_else(|| invalid("relocate_fixed_mmap"))?
        }
        "stdout" => group.print_stdout = value.as_bool().ok_or_else(|| invalid("stdout"))?,
        "allow_debug" => group.allow_debug = value.as_bool().ok_or_else(|| invalid("allow_debug"))?,
        "control_ephemeral" => {
            group.control_ephemeral = value.as_bool().ok_or_else(|| invalid("control_ephemeral"))?
        }
        "ephemeral" => group.ephemeral = value.as_bool().ok_or_else(|| invalid("ephemeral"))?,
        "ephemeral_keep_working_memory" => {
            group.ephemeral_keep_working_memory =
                value.as_bool().ok_or_else(|| invalid("ephemeral_keep_working_memory"))?
        }
        "verbose" => group.verbose = value.as_bool().ok_or_else(|| invalid("verbose"))?,
        "environment" => {
            // appended after the defaults; defaults cannot be overwritten
            let vals = value.as_array().ok_or_else(|| invalid("environment"))?;
            for v in vals {
                group.environ.push(v.as_str().ok_or_else(|| invalid("environment"))?.to_string());
            }
        }
        "remapping" | "executable_remapping" => {
            // pair of [hex-address, MiB]
            let arr = value.as_array().ok_or_else(|| invalid("remapping"))?;
            if arr.len() != 2 {
                return Err(invalid("remapping needs [address, size-mb]"));
            }
            let addr_str = arr[0].as_str().ok_or_else(|| invalid("remapping address"))?;
            let addr = u64::from_str_radix(addr_str.trim_start_matches("0x"), 16)
                .map_err(|_| invalid("remapping address was not a number"))?;
            if addr < 0x20000 {
                return Err(invalid("remapping address was not a number, or invalid"));
            }
            let size_mb = as_u64(&arr[1]).ok_or_else(|| invalid("remapping size"))?;
            group.vmem_remappings.push(VirtualRemapping {
                virt: addr,
                size: size_mb << 20,
                writable: true,
                executable: key == "executable_remapping",
            });
        }
        "executable_heap" => {
            group.vmem_heap_executable = value.as_bool().ok_or_else(|| invalid("executable_heap"))?
        }
        "allowed_paths" => {
            let vals = value.as_array().ok_or_else(|| invalid("allowed_paths"))?;
            group.allowed_paths = vals.iter().filter_map(parse_allowed_path).collect();
        }
        "warmup" => group.warmup = parse_warmup(name, value),
        // tenant-level keys handled by the caller
        "group" | "key" | "uri" | "filename" | "sha256" | "md5" => {}
        _ => {
            warn!("unknown configuration key for '{}': {}", name, key);
        }
    }
    Ok(())
}

/// Parse a full manifest into tenant configurations. Groups first, then
/// tenants (a tenant clones its group and applies its own overrides).
pub fn parse_manifest(json: &str) -> Result<Vec<TenantConfig>, ManifestError> {
    let root: Value = serde_json::from_str(json)?;
    let root = root.as_object().ok_or(ManifestError::NotAnObject)?;

    let mut groups: std::collections::BTreeMap<String, TenantGroup> = Default::default();
    groups.insert("test".to_string(), TenantGroup::new("test"));

    for (name, value) in root {
        let Some(obj) = value.as_object() else { continue };
        if is_tenant(obj) {
            continue;
        }
        let group = groups.entry(name.clone()).or_insert_with(|| TenantGroup::new(name.clone()));
        for (k, v) in obj {
            configure_group(name, group, k, v)?;
        }
    }

    let mut out = Vec::new();
    for (name, value) in root {
        let Some(obj) = value.as_object() else { continue };
        if !is_tenant(obj) {
            continue;
        }
        let group_name = obj.get("group").and_then(|g| g.as_str()).unwrap_or("test");
        let base = groups.get(group_name).ok_or_else(|| ManifestError::MissingGroup {
            tenant: name.clone(),
            group: group_name.to_string(),
        })?;
        let mut group = base.clone();
        for (k, v) in obj {
            configure_group(name, &mut group, k, v)?;
        }
        let filename = obj.get("filename").and_then(|f| f.as_str()).unwrap_or("").to_string();
        let key = obj.get("key").and_then(|k| k.as_str()).unwrap_or("").to_string();
        let uri = obj.get("uri").and_then(|u| u.as_str()).unwrap_or("").to_string();
        if filename.is_empty() && uri.is_empty() {
            return Err(ManifestError::Unreachable(name.clone()));
        }
        let mut config = TenantConfig::new(name.clone(), filename, key, group, uri);
        config.sha256 = obj.get("sha256").and_then(|s| s.as_str()).unwrap_or("").to_lowercase();
        config.md5 = obj.get("md5").and_then(|s| s.as_str()).unwrap_or("").to_lowercase();
        config
            .group
            .validate()
            .map_err(|reason| ManifestError::Invalid { name: name.clone(), reason })?;
        out.push(config);
    }
    Ok(out)
}

/// Atomically replace a tenant's main() arguments.
pub fn set_main_arguments(config: &TenantConfig, args: Vec<String>) {
    config.group.main_arguments.store(Some(Arc::new(args)));
}
