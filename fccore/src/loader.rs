//! Program loading: pick the source (conditional remote fetch vs. local
//! file), decode the payload (raw ELF or a tar archive, optionally gzip or
//! xz compressed, carrying a request binary and an optional `*storage`
//! sibling), and write fresh downloads back to the disk cache.

use std::io::Read;

use log::{info, warn};

use fcvm::image;

use crate::binary::BinaryStorage;
use crate::error::LoadError;
use crate::program::ProgramSource;
use crate::tenant::TenantConfig;

pub struct LoadedProgram {
    pub request: BinaryStorage,
    pub storage: BinaryStorage,
    pub was_local: bool,
    pub was_cached: bool,
    pub fetched_fresh: bool,
}

enum FetchOutcome {
    Fresh(Vec<u8>),
    NotModified,
}

/// Fetch raw bytes from a URI. `file://` is handled locally, which also
/// keeps air-gapped setups working.
pub fn fetch_bytes(uri: &str, if_modified_since: Option<&str>) -> Result<FetchedBytes, LoadError> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(FetchedBytes { status: 200, body: std::fs::read(path)? });
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| LoadError::NetworkFailed(e.to_string()))?;
    let mut req = client.get(uri);
    if let Some(ims) = if_modified_since {
        req = req.header(reqwest::header::IF_MODIFIED_SINCE, ims);
    }
    let resp = req.send().map_err(|e| LoadError::NetworkFailed(e.to_string()))?;
    let status = resp.status().as_u16();
    let body = resp.bytes().map_err(|e| LoadError::NetworkFailed(e.to_string()))?.to_vec();
    Ok(FetchedBytes { status, body })
}

pub struct FetchedBytes {
    pub status: u16,
    pub body: Vec<u8>,
}

fn fetch_program(uri: &str, if_modified_since: Option<&str>) -> Result<FetchOutcome, LoadError> {
    if uri.len() < 5 {
        return Err(LoadError::NetworkFailed("invalid URI (too short)".into()));
    }
    let fetched = fetch_bytes(uri, if_modified_since)?;
    match fetched.status {
        200 => Ok(FetchOutcome::Fresh(fetched.body)),
        304 => Ok(FetchOutcome::NotModified),
        other => Err(LoadError::NetworkFailed(format!("unexpected HTTP status {} for {}", other, uri))),
    }
}

fn load_local(cfg: &TenantConfig, was_cached: bool) -> Result<LoadedProgram, LoadError> {
    let request = BinaryStorage::map(cfg.request_program_filename())?;
    if request.is_empty() {
        return Err(LoadError::EmptyPayload);
    }
    let storage_file = cfg.storage_program_filename();
    let storage = match BinaryStorage::map(&storage_file) {
        Ok(b) => b,
        Err(_) => BinaryStorage::empty(),
    };
    Ok(LoadedProgram { request, storage, was_local: true, was_cached, fetched_fresh: false })
}

/// Resolve a program source into binaries, per the source-selection policy.
pub fn resolve(cfg: &TenantConfig, source: ProgramSource) -> Result<LoadedProgram, LoadError> {
    match source {
        ProgramSource::Binaries { request, storage } => {
            if request.is_empty() {
                return Err(LoadError::EmptyPayload);
            }
            Ok(LoadedProgram { request, storage, was_local: true, was_cached: false, fetched_fresh: false })
        }
        ProgramSource::Uri { uri, if_modified_since } => {
            let outcome = match fetch_program(&uri, if_modified_since.as_deref()) {
                Ok(o) => o,
                Err(e) => {
                    // a usable local copy rescues a failed fetch
                    if !cfg.filename.is_empty()
                        && std::path::Path::new(cfg.request_program_filename()).exists()
                    {
                        warn!("{}: fetch failed ({}), falling back to local file", cfg.name, e);
                        return load_local(cfg, true);
                    }
                    return Err(e);
                }
            };
            match outcome {
                FetchOutcome::NotModified => {
                    info!("{}: program not modified, loading from disk", cfg.name);
                    load_local(cfg, true)
                }
                FetchOutcome::Fresh(payload) => {
                    info!("{}: loading program from {}", cfg.name, uri);
                    let (request, storage) = extract_programs(&payload)?;
                    Ok(LoadedProgram {
                        request: BinaryStorage::from_bytes(request),
                        storage: storage.map(BinaryStorage::from_bytes).unwrap_or_default(),
                        was_local: uri.starts_with("file"),
                        was_cached: false,
                        fetched_fresh: true,
                    })
                }
            }
        }
    }
}

/// Write freshly fetched binaries back to the tenant's local filenames.
/// Failures are logged; a missing cache only costs a re-download.
pub fn write_back_cache(cfg: &TenantConfig, loaded: &LoadedProgram) {
    if !loaded.fetched_fresh || loaded.was_local || cfg.filename.is_empty() {
        return;
    }
    if !crate::util::file_writer(cfg.request_program_filename(), loaded.request.data()) {
        warn!("{}: could not cache program to {}", cfg.name, cfg.request_program_filename());
    }
    if !loaded.storage.is_empty()
        && !crate::util::file_writer(cfg.storage_program_filename(), loaded.storage.data())
    {
        warn!("{}: could not cache storage program to {}", cfg.name, cfg.storage_program_filename());
    }
}

const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const GZ_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Split a payload into `(request_binary, storage_binary)`. A payload that
/// starts with an ELF header is a single-binary program serving both
/// roles' defaults; anything else must be a tar archive (optionally .xz or
/// .gz) holding exactly one program binary plus an optional entry whose
/// name ends in `storage`.
pub fn extract_programs(payload: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>), LoadError> {
    if payload.is_empty() {
        return Err(LoadError::EmptyPayload);
    }
    if image::is_elf(payload) {
        return Ok((payload.to_vec(), None));
    }

    let tar_bytes: Vec<u8> = if payload.starts_with(&XZ_MAGIC) {
        let mut out = Vec::new();
        lzma_rs::xz_decompress(&mut &payload[..], &mut out)
            .map_err(|e| LoadError::ArchiveDecode(format!("xz: {:?}", e)))?;
        out
    } else if payload.starts_with(&GZ_MAGIC) {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(payload)
            .read_to_end(&mut out)
            .map_err(|e| LoadError::ArchiveDecode(format!("gzip: {}", e)))?;
        out
    } else {
        payload.to_vec()
    };

    let mut archive = tar::Archive::new(&tar_bytes[..]);
    let mut request: Option<Vec<u8>> = None;
    let mut storage: Option<Vec<u8>> = None;
    let entries = archive.entries().map_err(|e| LoadError::ArchiveDecode(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| LoadError::ArchiveDecode(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| LoadError::ArchiveDecode(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(|e| LoadError::ArchiveDecode(e.to_string()))?;
        if name.ends_with("storage") {
            if storage.replace(data).is_some() {
                warn!("archive has multiple storage entries; keeping the last");
            }
        } else if request.replace(data).is_some() {
            return Err(LoadError::ArchiveDecode("more than one program binary in archive".into()));
        }
    }
    match request {
        Some(r) if !r.is_empty() => Ok((r, storage)),
        _ => Err(LoadError::ArchiveDecode("no program binary in archive".into())),
    }
}
