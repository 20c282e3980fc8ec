//! A live tenant: immutable configuration plus the hot-swappable program
//! handle. Both the regular and the debug program can be replaced at any
//! time; in-flight requests hold their own `Arc` snapshot and finish
//! against the program they started with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use log::{error, info, warn};

use crate::binary::BinaryStorage;
use crate::error::CallError;
use crate::program::{ProgramInstance, ProgramSource};
use crate::storage;
use crate::tenant::TenantConfig;
use crate::util;

pub struct TenantInstance {
    pub config: Arc<TenantConfig>,
    program: ArcSwapOption<ProgramInstance>,
    debug_program: ArcSwapOption<ProgramInstance>,
    started_init: AtomicBool,
    init_mtx: Mutex<()>,
}

/// Outcome of a live update, reported back to the uploader.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Stored,
    NotStored,
}

impl TenantInstance {
    pub fn new(config: TenantConfig) -> Self {
        TenantInstance {
            config: Arc::new(config),
            program: ArcSwapOption::empty(),
            debug_program: ArcSwapOption::empty(),
            started_init: AtomicBool::new(false),
            init_mtx: Mutex::new(()),
        }
    }

    pub fn has_program(&self) -> bool {
        self.program.load().is_some()
    }

    fn slot(&self, debug: bool) -> &ArcSwapOption<ProgramInstance> {
        if debug {
            &self.debug_program
        } else {
            &self.program
        }
    }

    /// Begin program initialization once. Source selection: a verified (or
    /// hash-free) local file wins; otherwise the URI with a conditional GET
    /// keyed on the local file's mtime; otherwise the tenant stays empty
    /// until a program is uploaded.
    pub fn begin_initialize(&self, debug: bool) {
        if self.started_init.swap(true, Ordering::SeqCst) {
            warn!("program '{}' has already been initialized", self.config.name);
            return;
        }
        let cfg = &self.config;

        let mut filename_accessible = false;
        let mut file_verified = false;
        if !cfg.filename.is_empty() && std::path::Path::new(&cfg.filename).exists() {
            filename_accessible = true;
            // SHA-256 wins when both hashes are configured
            if !cfg.sha256.is_empty() {
                match util::file_sha256_hex(&cfg.filename) {
                    Ok(hex) if hex == cfg.sha256 => file_verified = true,
                    Ok(hex) => info!(
                        "{}: local file hash mismatch ({} vs {}), will re-download if URI is given",
                        cfg.name, hex, cfg.sha256
                    ),
                    Err(e) => warn!("{}: could not hash local file: {}", cfg.name, e),
                }
            } else if !cfg.md5.is_empty() {
                match util::file_md5_hex(&cfg.filename) {
                    Ok(hex) if hex == cfg.md5 => file_verified = true,
                    Ok(hex) => info!(
                        "{}: local file MD5 mismatch ({} vs {}), will re-download if URI is given",
                        cfg.name, hex, cfg.md5
                    ),
                    Err(e) => warn!("{}: could not hash local file: {}", cfg.name, e),
                }
            }
        }

        if !cfg.uri.is_empty() && !file_verified {
            let if_modified_since = std::fs::metadata(&cfg.filename)
                .and_then(|m| m.modified())
                .ok()
                .map(util::http_date);
            let source = ProgramSource::Uri { uri: cfg.uri.clone(), if_modified_since };
            self.slot(debug).store(Some(ProgramInstance::launch(self.config.clone(), source, debug)));
            return;
        }
        if cfg.filename.is_empty() {
            error!("no filename specified for '{}'. Send new program.", cfg.name);
            return;
        }
        if !filename_accessible {
            error!("missing program or invalid path for '{}'. Send new program.", cfg.name);
            return;
        }
        if (!cfg.sha256.is_empty() || !cfg.md5.is_empty()) && !file_verified {
            error!("{}: local program failed integrity check and no URI is configured", cfg.name);
            return;
        }

        match self.load_local_source() {
            Ok(source) => {
                self.slot(debug).store(Some(ProgramInstance::launch(self.config.clone(), source, debug)));
            }
            Err(e) => {
                error!("exception when creating machine '{}': {}", cfg.name, e);
            }
        }
    }

    fn load_local_source(&self) -> Result<ProgramSource, std::io::Error> {
        let cfg = &self.config;
        let request = BinaryStorage::map(cfg.request_program_filename())?;
        let storage_file = cfg.storage_program_filename();
        let storage = if std::path::Path::new(&storage_file).exists() {
            BinaryStorage::map(&storage_file)?
        } else {
            BinaryStorage::empty()
        };
        Ok(ProgramSource::Binaries { request, storage })
    }

    /// Take a reference to the current program, lazily initializing it on
    /// first use. Blocks until initialization settles.
    pub fn ref_program(&self, debug: bool) -> Result<Arc<ProgramInstance>, CallError> {
        let mut prog = self.slot(debug).load_full();
        if prog.is_none() {
            if debug {
                return Err(CallError::NoProgram("no debug program loaded".into()));
            }
            // one initializer; racing requests wait on the gate below
            let _guard = self.init_mtx.lock().unwrap();
            if !self.started_init.load(Ordering::SeqCst) {
                self.begin_initialize(false);
            }
            prog = self.slot(debug).load_full();
        }
        let prog = prog.ok_or_else(|| {
            CallError::NoProgram(format!("missing program for {}. Not uploaded?", self.config.name))
        })?;
        prog.wait_for_initialization().map_err(CallError::NoProgram)?;
        Ok(prog)
    }

    pub fn wait_for_initialization(&self) -> Result<(), String> {
        match self.program.load_full() {
            Some(prog) => {
                let r = prog.wait_for_initialization();
                if r.is_err() {
                    // failed programs are unloaded; requests answer 503
                    self.program.store(None);
                }
                r
            }
            None => Ok(()),
        }
    }

    /// Transfer storage state between two programs when both sides carry
    /// the live-update callbacks.
    pub fn serialize_storage_state(old: &Arc<ProgramInstance>, new: &Arc<ProgramInstance>) {
        if !old.tenant.has_storage() || !new.tenant.has_storage() {
            return;
        }
        match storage::live_update_call(old, new) {
            Ok(n) => info!("{}: live-update transferred {} bytes", new.tenant.name, n),
            Err(e) => info!("{}: live-update state transfer skipped: {}", new.tenant.name, e),
        }
    }

    /// Swap in a freshly initialized program, transferring storage state
    /// from the current one. In-flight requests keep the old program alive
    /// until they complete.
    pub fn commit_program_live(&self, new_prog: &Arc<ProgramInstance>) {
        let slot = self.slot(new_prog.is_debug);
        if let Some(current) = slot.load_full() {
            Self::serialize_storage_state(&current, new_prog);
            let prior = current.core.stats.live_updates.load(Ordering::Relaxed);
            new_prog.core.stats.live_updates.store(prior + 1, Ordering::Relaxed);
        }
        self.started_init.store(true, Ordering::SeqCst);
        slot.store(Some(new_prog.clone()));
    }

    /// Unload the current program and let the next request reload it from
    /// its source, carrying storage state over when possible.
    pub fn reload_program_live(&self, debug: bool) {
        let old = self.slot(debug).swap(None);
        self.started_init.store(false, Ordering::SeqCst);
        let Some(old) = old else { return };
        if !old.tenant.has_storage() {
            return;
        }
        match self.ref_program(debug) {
            Ok(new_prog) => Self::serialize_storage_state(&old, &new_prog),
            Err(e) => warn!("{}: reload failed: {}", self.config.name, e),
        }
    }

    /// Full live update: boot the uploaded ELF as a new program, transfer
    /// storage state, swap it in, and cache it to disk when the tenant has
    /// a plain local filename.
    pub fn live_update(&self, elf: Vec<u8>, debug: bool) -> Result<UpdateOutcome, String> {
        if elf.is_empty() {
            return Err("empty file received".to_string());
        }
        let binary = BinaryStorage::from_bytes(elf);
        let source = ProgramSource::Binaries { request: binary.clone(), storage: binary.clone() };
        let prog = ProgramInstance::launch(self.config.clone(), source, debug);
        prog.wait_for_initialization()?;
        self.commit_program_live(&prog);

        let filename = &self.config.filename;
        if debug || filename.is_empty() {
            return Ok(UpdateOutcome::NotStored);
        }
        if !filename.starts_with('/') || filename.contains("://") {
            // not an absolute path (or a URI): a success, just not cached
            return Ok(UpdateOutcome::NotStored);
        }
        if !util::file_writer(filename, binary.data()) {
            return Err(format!("could not write '{}'", filename));
        }
        Ok(UpdateOutcome::Stored)
    }

    pub fn set_main_arguments(&self, args: Vec<String>) {
        crate::tenant::set_main_arguments(&self.config, args);
    }

    pub fn status_summary(&self) -> serde_json::Value {
        let prog = self.program.load_full();
        serde_json::json!({
            "name": self.config.name,
            "group": self.config.group.name,
            "loaded": prog.is_some(),
            "program": prog.map(|p| p.status_summary()),
        })
    }
}
