// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The part model: a reference-counted handle over either an `Attribute`
//! or a `FileUpload`, backed by a tiered content store.

mod storage;

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;

use encoding_rs::Encoding;
use mime::Mime;
use parking_lot::Mutex;

use crate::error::Error;
pub(crate) use storage::{temp_name_token, ContentStore, DEFAULT_MIXED_LIMIT};

/// `Content-Transfer-Encoding` labels this crate recognises. Recognition
/// only: the bytes of a `quoted-printable`/`base64` part are never
/// transcoded here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentTransferEncoding {
    SevenBit,
    EightBit,
    Binary,
}

impl ContentTransferEncoding {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "7bit" => Some(ContentTransferEncoding::SevenBit),
            "8bit" => Some(ContentTransferEncoding::EightBit),
            "binary" => Some(ContentTransferEncoding::Binary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentTransferEncoding::SevenBit => "7bit",
            ContentTransferEncoding::EightBit => "8bit",
            ContentTransferEncoding::Binary => "binary",
        }
    }
}

#[derive(Clone)]
enum Kind {
    Attribute,
    FileUpload {
        file_name: String,
        content_type: Option<Mime>,
        cte: Option<ContentTransferEncoding>,
    },
}

struct PartMeta {
    name: String,
    charset: &'static Encoding,
    defined_size: u64,
    size: u64,
    max_size: i64,
    is_completed: bool,
    kind: Kind,
}

struct PartCore {
    meta: Mutex<PartMeta>,
    store: Mutex<ContentStore>,
    /// Explicit reference count, independent of `Arc`'s own strong count:
    /// callers `retain`/`release` this directly, so a part is not released
    /// just because one of several collaborators dropped its clone.
    refs: AtomicIsize,
    deleted: AtomicBool,
}

/// A single decoded (or to-be-encoded) attribute or file upload.
///
/// Cloning a `Part` clones the handle, not the content — all clones share
/// one [`PartCore`] via `Arc`. Lifetime is governed by the explicit
/// reference count (`retain`/`release`), not by how many handles are
/// dropped.
#[derive(Clone)]
pub struct Part(Arc<PartCore>);

impl Part {
    pub(crate) fn new_attribute(
        name: String,
        charset: &'static Encoding,
        max_size: i64,
        store: ContentStore,
    ) -> Self {
        Part(Arc::new(PartCore {
            meta: Mutex::new(PartMeta {
                name,
                charset,
                defined_size: 0,
                size: 0,
                max_size,
                is_completed: false,
                kind: Kind::Attribute,
            }),
            store: Mutex::new(store),
            refs: AtomicIsize::new(1),
            deleted: AtomicBool::new(false),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_file_upload(
        name: String,
        file_name: String,
        content_type: Option<Mime>,
        cte: Option<ContentTransferEncoding>,
        charset: &'static Encoding,
        defined_size: u64,
        max_size: i64,
        store: ContentStore,
    ) -> Self {
        Part(Arc::new(PartCore {
            meta: Mutex::new(PartMeta {
                name,
                charset,
                defined_size,
                size: 0,
                max_size,
                is_completed: false,
                kind: Kind::FileUpload {
                    file_name,
                    content_type,
                    cte,
                },
            }),
            store: Mutex::new(store),
            refs: AtomicIsize::new(1),
            deleted: AtomicBool::new(false),
        }))
    }

    /// Two handles refer to the exact same `PartCore` (used by the
    /// registry, which tracks parts by identity, not value).
    pub fn is_same_instance(&self, other: &Part) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn name(&self) -> String {
        self.0.meta.lock().name.clone()
    }

    pub fn charset(&self) -> &'static Encoding {
        self.0.meta.lock().charset
    }

    pub fn set_charset(&self, charset: &'static Encoding) {
        self.0.meta.lock().charset = charset;
    }

    pub fn defined_size(&self) -> u64 {
        self.0.meta.lock().defined_size
    }

    pub fn set_defined_size(&self, defined_size: u64) {
        self.0.meta.lock().defined_size = defined_size;
    }

    pub fn size(&self) -> u64 {
        self.0.meta.lock().size
    }

    pub fn max_size(&self) -> i64 {
        self.0.meta.lock().max_size
    }

    pub fn set_max_size(&self, max_size: i64) {
        self.0.meta.lock().max_size = max_size;
    }

    pub fn is_completed(&self) -> bool {
        self.0.meta.lock().is_completed
    }

    pub fn is_file_upload(&self) -> bool {
        matches!(self.0.meta.lock().kind, Kind::FileUpload { .. })
    }

    pub fn file_name(&self) -> Option<String> {
        match &self.0.meta.lock().kind {
            Kind::FileUpload { file_name, .. } => Some(file_name.clone()),
            Kind::Attribute => None,
        }
    }

    pub fn set_file_name(&self, new_name: String) {
        if let Kind::FileUpload { file_name, .. } = &mut self.0.meta.lock().kind {
            *file_name = new_name;
        }
    }

    pub fn content_type(&self) -> Option<Mime> {
        match &self.0.meta.lock().kind {
            Kind::FileUpload { content_type, .. } => content_type.clone(),
            Kind::Attribute => None,
        }
    }

    pub fn content_transfer_encoding(&self) -> Option<ContentTransferEncoding> {
        match &self.0.meta.lock().kind {
            Kind::FileUpload { cte, .. } => *cte,
            Kind::Attribute => None,
        }
    }

    /// Validate a prospective total size against `max_size` and `defined_size`.
    fn check_size(meta: &PartMeta, new_size: u64) -> Result<(), Error> {
        if meta.max_size >= 0 && new_size > meta.max_size as u64 {
            return Err(Error::SizeExceeded {
                limit: meta.max_size,
                attempted: new_size,
            });
        }
        Ok(())
    }

    /// Replace the part's entire content. Also marks the part completed.
    pub fn set_content(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut meta = self.0.meta.lock();
        let new_size = bytes.len() as u64;
        Self::check_size(&meta, new_size)?;
        if meta.defined_size > 0 && new_size > meta.defined_size {
            return Err(Error::SizeExceeded {
                limit: meta.defined_size as i64,
                attempted: new_size,
            });
        }
        self.0.store.lock().replace(bytes)?;
        meta.size = new_size;
        meta.is_completed = true;
        Ok(())
    }

    /// Append bytes to the part's content. On `last = true`, marks the part
    /// completed and enforces the write against `defined_size`. On failure
    /// the part is left exactly as it was before the call.
    pub fn add_content(&self, bytes: &[u8], last: bool) -> Result<(), Error> {
        let mut meta = self.0.meta.lock();
        if meta.is_completed {
            return Err(Error::State(crate::error::StateError::Destroyed));
        }
        let new_size = meta.size + bytes.len() as u64;
        Self::check_size(&meta, new_size)?;
        if last && meta.defined_size > 0 && new_size > meta.defined_size {
            return Err(Error::SizeExceeded {
                limit: meta.defined_size as i64,
                attempted: new_size,
            });
        }
        self.0.store.lock().append(bytes)?;
        meta.size = new_size;
        if last {
            meta.is_completed = true;
        }
        Ok(())
    }

    /// Up to `n` bytes from the internal read cursor; empty once drained,
    /// after which the cursor resets.
    pub fn get_chunk(&self, n: usize) -> Result<Vec<u8>, Error> {
        Ok(self.0.store.lock().get_chunk(n)?)
    }

    pub fn get_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.0.store.lock().get_bytes()?)
    }

    pub fn get_string(&self) -> Result<String, Error> {
        let charset = self.charset();
        let bytes = self.get_bytes()?;
        let (decoded, _, had_errors) = charset.decode(&bytes);
        if had_errors {
            return Err(Error::Encoding {
                input: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(decoded.into_owned())
    }

    /// Stream all content to `target`: for disk-backed parts this may move
    /// the file; for memory-backed parts the bytes are copied.
    pub fn rename_to(&self, target: &Path) -> Result<(), Error> {
        Ok(self.0.store.lock().rename_to(target)?)
    }

    pub fn is_disk_backed(&self) -> bool {
        self.0.store.lock().is_disk_backed()
    }

    /// Diagnostics no-op, forwarded to the underlying store.
    pub fn touch(&self, hint: &str) {
        self.0.store.lock().touch(hint);
    }

    /// Increment the explicit reference count by `n`.
    pub fn retain(&self, n: isize) {
        self.0.refs.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement the explicit reference count by `n`. Returns `true` if
    /// this call was the one that crossed zero and therefore ran delete
    /// (guaranteed to happen exactly once no matter how many callers race
    /// to release the last reference).
    pub fn release(&self, n: isize) -> bool {
        let prev = self.0.refs.fetch_sub(n, Ordering::AcqRel);
        if prev - n <= 0 && !self.0.deleted.swap(true, Ordering::AcqRel) {
            let _ = self.0.store.lock().delete();
            return true;
        }
        false
    }

    pub fn reference_count(&self) -> isize {
        self.0.refs.load(Ordering::Acquire)
    }
}

impl PartialEq for Part {
    /// Two attributes are equal iff their names match case-insensitively;
    /// file uploads likewise; an attribute never equals a file upload even
    /// with a matching name.
    fn eq(&self, other: &Self) -> bool {
        let a = self.0.meta.lock();
        let b = other.0.meta.lock();
        match (&a.kind, &b.kind) {
            (Kind::Attribute, Kind::Attribute) => a.name.eq_ignore_ascii_case(&b.name),
            (Kind::FileUpload { .. }, Kind::FileUpload { .. }) => a.name.eq_ignore_ascii_case(&b.name),
            _ => false,
        }
    }
}
impl Eq for Part {}

impl Hash for Part {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let meta = self.0.meta.lock();
        let is_file = matches!(meta.kind, Kind::FileUpload { .. });
        is_file.hash(state);
        for b in meta.name.bytes() {
            b.to_ascii_lowercase().hash(state);
        }
    }
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.0.meta.lock();
        match &meta.kind {
            Kind::Attribute => f
                .debug_struct("Attribute")
                .field("name", &meta.name)
                .field("size", &meta.size)
                .finish(),
            Kind::FileUpload { file_name, content_type, .. } => f
                .debug_struct("FileUpload")
                .field("name", &meta.name)
                .field("file_name", file_name)
                .field("content_type", content_type)
                .field("size", &meta.size)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_part(name: &str) -> Part {
        Part::new_attribute(name.to_string(), encoding_rs::UTF_8, -1, ContentStore::new_memory())
    }

    #[test]
    fn equality_is_case_insensitive_by_name_and_kind() {
        let a = mem_part("Field");
        let b = mem_part("field");
        assert_eq!(a, b);
    }

    #[test]
    fn add_content_enforces_max_size() {
        let p = Part::new_attribute("f".into(), encoding_rs::UTF_8, 4, ContentStore::new_memory());
        assert!(p.add_content(b"abcd", false).is_ok());
        let err = p.add_content(b"e", true).unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { .. }));
        // failed write must not have mutated size
        assert_eq!(p.size(), 4);
    }

    #[test]
    fn release_to_zero_deletes_exactly_once() {
        let p = mem_part("f");
        p.retain(2); // refs: 1 -> 3
        assert!(!p.release(1)); // 3 -> 2
        assert!(!p.release(1)); // 2 -> 1
        assert!(p.release(1)); // 1 -> 0, crosses zero: deletes
        assert!(!p.release(1)); // already deleted, no second Delete
    }

    #[test]
    fn get_chunk_drains_then_resets_cursor() {
        let p = mem_part("f");
        p.set_content(b"abcdef").unwrap();
        assert_eq!(p.get_chunk(3).unwrap(), b"abc");
        assert_eq!(p.get_chunk(3).unwrap(), b"def");
        assert_eq!(p.get_chunk(3).unwrap(), b"");
        // cursor reset: draining again yields the content from the start
        assert_eq!(p.get_chunk(6).unwrap(), b"abcdef");
    }
}
