// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The content store: Memory, Disk, and Mixed backing for a single part's
//! bytes.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use textnonce::TextNonce;

use crate::config;

/// In-memory backing: a composite of appended segments, never copied on
/// append, with a read cursor over the segment list for chunked draining.
#[derive(Default)]
pub(crate) struct MemoryStore {
    segments: Vec<Bytes>,
    total: u64,
    read_segment: usize,
    read_offset: usize,
}

impl MemoryStore {
    fn append(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        self.segments.push(Bytes::copy_from_slice(bytes));
    }

    fn replace(&mut self, bytes: &[u8]) {
        self.segments.clear();
        self.read_segment = 0;
        self.read_offset = 0;
        self.total = 0;
        self.append(bytes);
    }

    fn len(&self) -> u64 {
        self.total
    }

    fn get_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total as usize);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Returns up to `n` bytes from the read cursor, advancing it. Once
    /// drained, returns empty and resets the cursor to the start so a
    /// subsequent `GetBytes`/another drain pass starts fresh.
    fn get_chunk(&mut self, n: usize) -> Vec<u8> {
        if self.read_segment >= self.segments.len() {
            self.read_segment = 0;
            self.read_offset = 0;
            return Vec::new();
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n && self.read_segment < self.segments.len() {
            let seg = &self.segments[self.read_segment];
            let avail = &seg[self.read_offset..];
            let take = avail.len().min(n - out.len());
            out.extend_from_slice(&avail[..take]);
            self.read_offset += take;
            if self.read_offset >= seg.len() {
                self.read_segment += 1;
                self.read_offset = 0;
            }
        }
        out
    }

    fn rename_to(&self, target: &Path) -> io::Result<()> {
        let mut f = File::create(target)?;
        for seg in &self.segments {
            f.write_all(seg)?;
        }
        f.flush()
    }
}

/// Disk backing: a temp file opened on first write and streamed through.
pub(crate) struct DiskStore {
    path: PathBuf,
    write_file: Option<File>,
    read_file: Option<File>,
    len: u64,
    /// False once the file has been unlinked (by `delete` or `rename_to`
    /// moving it away), so `delete` does not double-unlink.
    present: bool,
}

impl DiskStore {
    fn create(prefix: &str, suffix: &str) -> io::Result<Self> {
        let cfg = config::current();
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let dir = cfg.base_dir.clone().unwrap_or_else(std::env::temp_dir);
        let named = builder.tempfile_in(&dir)?;
        let (file, path) = named.keep().map_err(|e| e.error)?;
        config::register_for_cleanup(path.clone());
        Ok(DiskStore {
            path,
            write_file: Some(file),
            read_file: None,
            len: 0,
            present: true,
        })
    }

    /// Build a Disk store pre-seeded with `initial` bytes, used when a
    /// Mixed part migrates.
    fn from_memory(prefix: &str, suffix: &str, initial: &[u8]) -> io::Result<Self> {
        let mut store = DiskStore::create(prefix, suffix)?;
        store.append(initial)?;
        Ok(store)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let f = self
            .write_file
            .as_mut()
            .expect("disk store written to after being renamed away");
        f.write_all(bytes)?;
        f.flush()?;
        self.len += bytes.len() as u64;
        self.read_file = None;
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        let f = self
            .write_file
            .as_mut()
            .expect("disk store written to after being renamed away");
        f.set_len(0)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(bytes)?;
        f.flush()?;
        self.len = bytes.len() as u64;
        self.read_file = None;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn get_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut f = File::open(&self.path)?;
        let mut buf = Vec::with_capacity(self.len as usize);
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn get_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if self.read_file.is_none() {
            self.read_file = Some(File::open(&self.path)?);
        }
        let f = self.read_file.as_mut().unwrap();
        let mut buf = vec![0u8; n];
        let read = f.read(&mut buf)?;
        buf.truncate(read);
        if read == 0 {
            self.read_file = None;
        }
        Ok(buf)
    }

    fn rename_to(&mut self, target: &Path) -> io::Result<()> {
        self.write_file = None;
        self.read_file = None;
        fs::rename(&self.path, target)?;
        config::unregister_for_cleanup(&self.path);
        self.present = false;
        self.path = target.to_path_buf();
        self.present = true;
        config::register_for_cleanup(self.path.clone());
        Ok(())
    }

    fn delete(&mut self) -> io::Result<()> {
        self.write_file = None;
        self.read_file = None;
        if self.present {
            fs::remove_file(&self.path)?;
            config::unregister_for_cleanup(&self.path);
            self.present = false;
        }
        Ok(())
    }
}

/// Default promotion threshold for Mixed storage: 16 KiB.
pub const DEFAULT_MIXED_LIMIT: u64 = 16 * 1024;

enum MixedInner {
    Memory(MemoryStore),
    Disk(DiskStore),
}

/// Mixed backing: starts in memory, migrates in place to disk the moment a
/// write would cross `limit`.
pub(crate) struct MixedStore {
    limit: u64,
    inner: MixedInner,
    file_prefix: String,
    file_suffix: String,
}

impl MixedStore {
    fn new(limit: u64, file_prefix: String, file_suffix: String) -> Self {
        MixedStore {
            limit,
            inner: MixedInner::Memory(MemoryStore::default()),
            file_prefix,
            file_suffix,
        }
    }

    fn current_len(&self) -> u64 {
        match &self.inner {
            MixedInner::Memory(m) => m.len(),
            MixedInner::Disk(d) => d.len(),
        }
    }

    fn maybe_promote(&mut self, incoming: u64) -> io::Result<()> {
        if let MixedInner::Memory(mem) = &self.inner {
            if mem.len() + incoming > self.limit {
                let bytes = mem.get_bytes();
                let disk = DiskStore::from_memory(&self.file_prefix, &self.file_suffix, &bytes)?;
                self.inner = MixedInner::Disk(disk);
            }
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.maybe_promote(bytes.len() as u64)?;
        match &mut self.inner {
            MixedInner::Memory(m) => m.append(bytes),
            MixedInner::Disk(d) => d.append(bytes)?,
        }
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        // A SetContent always starts over, so re-evaluate from zero.
        if bytes.len() as u64 > self.limit {
            let disk = DiskStore::from_memory(&self.file_prefix, &self.file_suffix, bytes)?;
            self.inner = MixedInner::Disk(disk);
        } else {
            match &mut self.inner {
                MixedInner::Memory(m) => m.replace(bytes),
                MixedInner::Disk(_) => {
                    let mut m = MemoryStore::default();
                    m.replace(bytes);
                    self.inner = MixedInner::Memory(m);
                }
            }
        }
        Ok(())
    }

    fn is_disk_backed(&self) -> bool {
        matches!(self.inner, MixedInner::Disk(_))
    }

    fn get_bytes(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.inner {
            MixedInner::Memory(m) => Ok(m.get_bytes()),
            MixedInner::Disk(d) => d.get_bytes(),
        }
    }

    fn get_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        match &mut self.inner {
            MixedInner::Memory(m) => Ok(m.get_chunk(n)),
            MixedInner::Disk(d) => d.get_chunk(n),
        }
    }

    fn rename_to(&mut self, target: &Path) -> io::Result<()> {
        match &mut self.inner {
            MixedInner::Memory(m) => m.rename_to(target),
            MixedInner::Disk(d) => d.rename_to(target),
        }
    }

    fn delete(&mut self) -> io::Result<()> {
        match &mut self.inner {
            MixedInner::Memory(_) => Ok(()),
            MixedInner::Disk(d) => d.delete(),
        }
    }
}

/// The backing store for a single part's content: a sum type, not an
/// inheritance tree, so tiering is a variant swap rather than a subclass
/// substitution.
pub(crate) enum ContentStore {
    Memory(MemoryStore),
    Disk(DiskStore),
    Mixed(MixedStore),
}

impl ContentStore {
    pub(crate) fn new_memory() -> Self {
        ContentStore::Memory(MemoryStore::default())
    }

    pub(crate) fn new_disk(file_prefix: &str, file_suffix: &str) -> io::Result<Self> {
        Ok(ContentStore::Disk(DiskStore::create(file_prefix, file_suffix)?))
    }

    pub(crate) fn new_mixed(limit: u64, file_prefix: &str, file_suffix: &str) -> Self {
        ContentStore::Mixed(MixedStore::new(limit, file_prefix.to_string(), file_suffix.to_string()))
    }

    pub(crate) fn len(&self) -> u64 {
        match self {
            ContentStore::Memory(m) => m.len(),
            ContentStore::Disk(d) => d.len(),
            ContentStore::Mixed(m) => m.current_len(),
        }
    }

    pub(crate) fn is_disk_backed(&self) -> bool {
        match self {
            ContentStore::Memory(_) => false,
            ContentStore::Disk(_) => true,
            ContentStore::Mixed(m) => m.is_disk_backed(),
        }
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            ContentStore::Memory(m) => {
                m.append(bytes);
                Ok(())
            }
            ContentStore::Disk(d) => d.append(bytes),
            ContentStore::Mixed(m) => m.append(bytes),
        }
    }

    pub(crate) fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            ContentStore::Memory(m) => {
                m.replace(bytes);
                Ok(())
            }
            ContentStore::Disk(d) => d.replace(bytes),
            ContentStore::Mixed(m) => m.replace(bytes),
        }
    }

    pub(crate) fn get_bytes(&mut self) -> io::Result<Vec<u8>> {
        match self {
            ContentStore::Memory(m) => Ok(m.get_bytes()),
            ContentStore::Disk(d) => d.get_bytes(),
            ContentStore::Mixed(m) => m.get_bytes(),
        }
    }

    pub(crate) fn get_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        match self {
            ContentStore::Memory(m) => Ok(m.get_chunk(n)),
            ContentStore::Disk(d) => d.get_chunk(n),
            ContentStore::Mixed(m) => m.get_chunk(n),
        }
    }

    pub(crate) fn rename_to(&mut self, target: &Path) -> io::Result<()> {
        match self {
            ContentStore::Memory(m) => m.rename_to(target),
            ContentStore::Disk(d) => d.rename_to(target),
            ContentStore::Mixed(m) => m.rename_to(target),
        }
    }

    pub(crate) fn delete(&mut self) -> io::Result<()> {
        match self {
            ContentStore::Memory(_) => Ok(()),
            ContentStore::Disk(d) => d.delete(),
            ContentStore::Mixed(m) => m.delete(),
        }
    }

    /// Diagnostics no-op, forwarded here so a future backing store with
    /// real use for a hint has somewhere to receive it.
    pub(crate) fn touch(&self, _hint: &str) {}
}

/// A short random token suitable for temp filenames.
pub(crate) fn temp_name_token() -> String {
    TextNonce::sized_urlsafe(32)
        .map(|n| n.into_string())
        .unwrap_or_else(|_| "part".to_string())
}
