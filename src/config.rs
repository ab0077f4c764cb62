// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide temp-file configuration.
//!
//! Everything in this module is global and is meant to be set once, early in
//! a process's life, by the host pipeline/runtime. Per-decoder behaviour
//! (storage policy, size limits, charset) is *not* here — see
//! [`crate::factory::FactoryConfig`], which is passed explicitly at
//! construction.

use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Prefix/suffix and base-directory policy for temp files, plus whether
/// outstanding files should be swept up at process teardown.
#[derive(Clone, Debug)]
pub struct TempFileConfig {
    /// Overrides the OS temp directory when set.
    pub base_dir: Option<PathBuf>,
    /// Filename prefix for file-upload temp files (`FUp_` by default).
    pub file_prefix: String,
    /// Filename suffix for file-upload temp files (`.tmp` by default).
    pub file_suffix: String,
    /// Filename prefix for disk-backed attribute temp files (`Attr_` by default).
    pub attribute_prefix: String,
    /// Filename suffix for disk-backed attribute temp files (`.att` by default).
    pub attribute_suffix: String,
    /// If true, [`teardown`] deletes every temp file still tracked as
    /// outstanding.
    pub delete_on_exit: bool,
}

impl Default for TempFileConfig {
    fn default() -> Self {
        TempFileConfig {
            base_dir: None,
            file_prefix: "FUp_".to_string(),
            file_suffix: ".tmp".to_string(),
            attribute_prefix: "Attr_".to_string(),
            attribute_suffix: ".att".to_string(),
            delete_on_exit: true,
        }
    }
}

struct Global {
    config: TempFileConfig,
    outstanding: Vec<PathBuf>,
}

static GLOBAL: OnceLock<Mutex<Global>> = OnceLock::new();

fn global() -> &'static Mutex<Global> {
    GLOBAL.get_or_init(|| {
        Mutex::new(Global {
            config: TempFileConfig::default(),
            outstanding: Vec::new(),
        })
    })
}

/// Install a process-wide temp-file configuration, replacing any previous
/// one. Call this once, before any decoder/encoder is constructed.
pub fn configure(config: TempFileConfig) {
    global().lock().config = config;
}

/// The current process-wide temp-file configuration.
pub fn current() -> TempFileConfig {
    global().lock().config.clone()
}

/// Record a temp file as outstanding so [`teardown`] can sweep it up if the
/// configuration asks for delete-on-exit. Disk-backed parts call this when
/// they create their backing file, and remove the entry again once they
/// unlink it normally.
pub fn register_for_cleanup(path: PathBuf) {
    global().lock().outstanding.push(path);
}

/// Stop tracking `path` for teardown cleanup, typically because it was
/// already unlinked through the normal `Delete` path.
pub fn unregister_for_cleanup(path: &std::path::Path) {
    let mut guard = global().lock();
    if let Some(pos) = guard.outstanding.iter().position(|p| p == path) {
        guard.outstanding.swap_remove(pos);
    }
}

/// Delete every temp file still tracked as outstanding, if the
/// configuration's `delete_on_exit` is set. Intended to run once at process
/// shutdown.
pub fn teardown() {
    let mut guard = global().lock();
    if !guard.config.delete_on_exit {
        guard.outstanding.clear();
        return;
    }
    for path in guard.outstanding.drain(..) {
        let _ = std::fs::remove_file(path);
    }
}
