// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The part factory: creates parts per a configured [`StoragePolicy`] and
//! tracks them per request for bulk cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use encoding_rs::Encoding;
use log::debug;
use mime::Mime;
use parking_lot::Mutex;

use crate::config;
use crate::error::Error;
use crate::part::{ContentTransferEncoding, Part};
use crate::part::{temp_name_token, ContentStore, DEFAULT_MIXED_LIMIT};

/// Where a newly created part's content is stored.
#[derive(Clone, Copy, Debug)]
pub enum StoragePolicy {
    /// Every part is memory-backed.
    AlwaysMemory,
    /// Every part is disk-backed from the first byte.
    AlwaysDisk,
    /// Parts start memory-backed and migrate to disk once their content
    /// crosses `limit_size` (default [`crate::part::DEFAULT_MIXED_LIMIT`]).
    Mixed { limit_size: u64 },
}

impl Default for StoragePolicy {
    fn default() -> Self {
        StoragePolicy::Mixed {
            limit_size: DEFAULT_MIXED_LIMIT,
        }
    }
}

/// Per-decoder/encoder configuration for part creation. Explicit and passed
/// at construction — not process-wide state; see [`crate::config`] for the
/// genuinely process-wide temp-file settings.
#[derive(Clone, Debug)]
pub struct FactoryConfig {
    pub storage: StoragePolicy,
    /// -1 means unlimited.
    pub max_size: i64,
    pub charset: &'static Encoding,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            storage: StoragePolicy::default(),
            max_size: -1,
            charset: encoding_rs::UTF_8,
        }
    }
}

/// An opaque identity for a single request, used as the registry key.
/// Distinct `RequestId`s are never equal even if constructed identically:
/// equality here tracks which handle you hold, not what it contains.
#[derive(Clone)]
pub struct RequestId(Arc<()>);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Arc::new(()))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::new()
    }
}

/// The factory's per-request bookkeeping: `request -> parts in creation
/// order`, keyed by request identity.
struct Registry {
    entries: Mutex<HashMap<usize, (RequestId, Vec<Part>)>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, request: &RequestId, part: Part) {
        let mut guard = self.entries.lock();
        guard
            .entry(request.key())
            .or_insert_with(|| (request.clone(), Vec::new()))
            .1
            .push(part);
    }

    fn remove(&self, request: &RequestId, part: &Part) {
        let mut guard = self.entries.lock();
        let mut prune = false;
        if let Some((_, parts)) = guard.get_mut(&request.key()) {
            if let Some(pos) = parts.iter().position(|p| p.is_same_instance(part)) {
                parts.remove(pos);
            }
            prune = parts.is_empty();
        }
        if prune {
            guard.remove(&request.key());
        }
    }

    fn clean_request(&self, request: &RequestId) {
        let parts = {
            let mut guard = self.entries.lock();
            guard.remove(&request.key()).map(|(_, parts)| parts)
        };
        if let Some(parts) = parts {
            for part in parts {
                part.release(1);
            }
        }
    }

    /// Drains every registered request, releasing every part exactly once,
    /// tolerating concurrent `register` calls by re-snapshotting the key
    /// set until the map is empty.
    fn clean_all(&self) {
        loop {
            let batch: Vec<usize> = {
                let guard = self.entries.lock();
                if guard.is_empty() {
                    break;
                }
                guard.keys().copied().collect()
            };
            for key in batch {
                let parts = {
                    let mut guard = self.entries.lock();
                    guard.remove(&key).map(|(_, parts)| parts)
                };
                if let Some(parts) = parts {
                    for part in parts {
                        part.release(1);
                    }
                }
            }
        }
    }
}

/// Creates [`Part`]s per a [`FactoryConfig`] and tracks them by request for
/// bulk release.
pub struct PartFactory {
    config: FactoryConfig,
    registry: Registry,
}

impl PartFactory {
    pub fn new(config: FactoryConfig) -> Self {
        PartFactory {
            config,
            registry: Registry::new(),
        }
    }

    fn new_store(&self, prefix: &str, suffix: &str) -> Result<ContentStore, Error> {
        Ok(match self.config.storage {
            StoragePolicy::AlwaysMemory => ContentStore::new_memory(),
            StoragePolicy::AlwaysDisk => ContentStore::new_disk(prefix, suffix)?,
            StoragePolicy::Mixed { limit_size } => ContentStore::new_mixed(limit_size, prefix, suffix),
        })
    }

    fn trimmed_name(raw: &str) -> String {
        raw.trim()
            .chars()
            .filter(|c| !matches!(c, '\r' | '\t' | '\n'))
            .collect()
    }

    /// Create an `Attribute` part with a declared (possibly zero/unknown)
    /// size, registered for bulk cleanup under `request`.
    pub fn create_attribute(&self, request: &RequestId, name: &str) -> Result<Part, Error> {
        let cfg = config::current();
        let store = self.new_store(&cfg.attribute_prefix, &cfg.attribute_suffix)?;
        let part = Part::new_attribute(
            Self::trimmed_name(name),
            self.config.charset,
            self.config.max_size,
            store,
        );
        debug!("created attribute part {:?}", part.name());
        self.registry.register(request, part.clone());
        Ok(part)
    }

    /// Create an `Attribute` part with a declared size (from a part's
    /// `Content-Length` header, when present).
    pub fn create_attribute_sized(
        &self,
        request: &RequestId,
        name: &str,
        defined_size: u64,
    ) -> Result<Part, Error> {
        let part = self.create_attribute(request, name)?;
        part.set_defined_size(defined_size);
        Ok(part)
    }

    /// Create an `Attribute` part already populated with `value` (used by
    /// the encoder and by callers building a request to send).
    pub fn create_attribute_with_value(
        &self,
        request: &RequestId,
        name: &str,
        value: &str,
    ) -> Result<Part, Error> {
        let part = self.create_attribute(request, name)?;
        part.set_content(value.as_bytes())?;
        Ok(part)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_file_upload(
        &self,
        request: &RequestId,
        name: &str,
        file_name: &str,
        content_type: Option<Mime>,
        cte: Option<ContentTransferEncoding>,
        charset: &'static Encoding,
        defined_size: u64,
    ) -> Result<Part, Error> {
        let cfg = config::current();
        let token = temp_name_token();
        let prefix = format!("{}{}", cfg.file_prefix, token);
        let store = self.new_store(&prefix, &cfg.file_suffix)?;
        let part = Part::new_file_upload(
            Self::trimmed_name(name),
            file_name.to_string(),
            content_type,
            cte,
            charset,
            defined_size,
            self.config.max_size,
            store,
        );
        debug!("created file upload part {:?} ({})", part.name(), file_name);
        self.registry.register(request, part.clone());
        Ok(part)
    }

    /// Detach `part` from `request`'s cleanup list; it is no longer
    /// released by [`PartFactory::clean_request`] or
    /// [`PartFactory::clean_all`] (the caller has taken ownership of its
    /// lifetime).
    pub fn remove_from_cleanup(&self, request: &RequestId, part: &Part) {
        self.registry.remove(request, part);
    }

    /// Release every part registered to `request`.
    pub fn clean_request(&self, request: &RequestId) {
        debug!("cleaning all parts for one request");
        self.registry.clean_request(request);
    }

    /// Release every part registered to any request.
    pub fn clean_all(&self) {
        debug!("cleaning all parts for every tracked request");
        self.registry.clean_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_request_releases_every_part_exactly_once() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let a = factory.create_attribute(&request, "a").unwrap();
        let b = factory.create_attribute(&request, "b").unwrap();
        factory.clean_request(&request);
        assert_eq!(a.reference_count(), 0);
        assert_eq!(b.reference_count(), 0);
    }

    #[test]
    fn remove_from_cleanup_excludes_part_from_bulk_release() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let kept = factory.create_attribute(&request, "kept").unwrap();
        factory.remove_from_cleanup(&request, &kept);
        factory.clean_request(&request);
        assert_eq!(kept.reference_count(), 1);
    }

    #[test]
    fn creation_order_is_preserved() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let _ = factory.create_attribute(&request, "first").unwrap();
        let _ = factory.create_attribute(&request, "second").unwrap();
        let names: Vec<String> = factory
            .registry
            .entries
            .lock()
            .get(&request.key())
            .unwrap()
            .1
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }
}
