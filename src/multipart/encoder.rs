// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builds a `multipart/form-data` body from a list of [`Part`]s, pulled in
//! bounded chunks via [`MultipartEncoder::next_chunk`].
//!
//! Two file uploads added back to back under the same field name are
//! grouped into a nested `multipart/mixed` part (the legacy RFC 1867 §3.3
//! convention for multi-file fields) the moment the second one is added,
//! rather than as a later rewrite of already-rendered bytes: nothing is
//! rendered until the first [`MultipartEncoder::next_chunk`] call, so
//! "promoting" a single file entry into a two-member group is just
//! replacing that entry in `entries` before the wire plan is built.

use std::cell::Cell;
use std::collections::VecDeque;

use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use textnonce::TextNonce;

use crate::error::{Error, StateError};
use crate::part::Part;

/// Size of a single streamed content chunk pulled from a part's backing
/// store.
const CHUNK_SIZE: usize = 8096;

fn generate_boundary() -> Vec<u8> {
    TextNonce::sized(68)
        .unwrap()
        .into_string()
        .into_bytes()
        .iter()
        .map(|&ch| match ch {
            b'=' => b'-',
            b'/' => b'.',
            other => other,
        })
        .collect()
}

fn hex_nibble(n: u8) -> u8 {
    if n < 10 {
        b'0' + n
    } else {
        b'a' + (n - 10)
    }
}

/// A shorter boundary for an inner `multipart/mixed` group, distinct from
/// the outer boundary so the two delimiters can never collide.
fn generate_inner_boundary() -> Vec<u8> {
    let bytes: [u8; 16] = rand::random();
    let mut out = Vec::with_capacity(32);
    for b in bytes {
        out.push(hex_nibble(b >> 4));
        out.push(hex_nibble(b & 0xf));
    }
    out
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `filename="plain"` for an ASCII, control-character-free name; otherwise
/// the RFC 5987 extended form, `filename*=UTF-8''pct-encoded`.
fn render_filename_param(name: &str) -> String {
    if name.is_ascii() && !name.contains('"') && !name.chars().any(|c| c.is_control()) {
        format!("filename=\"{name}\"")
    } else {
        let encoded = percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC);
        format!("filename*=UTF-8''{encoded}")
    }
}

fn build_attribute_headers(part: &Part) -> Vec<(String, String)> {
    vec![(
        "Content-Disposition".to_string(),
        format!("form-data; name=\"{}\"", escape_quoted(&part.name())),
    )]
}

fn build_file_headers(part: &Part, in_group: bool) -> Vec<(String, String)> {
    let file_name = part.file_name().unwrap_or_default();
    let cd_value = if in_group {
        format!("attachment; {}", render_filename_param(&file_name))
    } else {
        format!(
            "form-data; name=\"{}\"; {}",
            escape_quoted(&part.name()),
            render_filename_param(&file_name)
        )
    };
    let mut headers = vec![("Content-Disposition".to_string(), cd_value)];
    if let Some(ct) = part.content_type() {
        headers.push(("Content-Type".to_string(), ct.to_string()));
    }
    if let Some(cte) = part.content_transfer_encoding() {
        headers.push(("Content-Transfer-Encoding".to_string(), cte.as_str().to_string()));
    }
    headers
}

fn build_group_headers(name: &str, inner_boundary: &[u8]) -> Vec<(String, String)> {
    vec![
        (
            "Content-Disposition".to_string(),
            format!("form-data; name=\"{}\"", escape_quoted(name)),
        ),
        (
            "Content-Type".to_string(),
            format!("multipart/mixed; boundary={}", String::from_utf8_lossy(inner_boundary)),
        ),
    ]
}

enum EntryBody {
    Single(Part),
    Group { boundary: Vec<u8>, members: Vec<Entry> },
}

struct Entry {
    name: String,
    headers: Vec<(String, String)>,
    body: EntryBody,
}

enum PlanItem {
    Bytes(Vec<u8>),
    Part(Part),
}

fn render_boundary_open(boundary: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + boundary.len());
    v.extend_from_slice(b"--");
    v.extend_from_slice(boundary);
    v.extend_from_slice(b"\r\n");
    v
}

fn render_boundary_close(boundary: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + boundary.len());
    v.extend_from_slice(b"--");
    v.extend_from_slice(boundary);
    v.extend_from_slice(b"--");
    v
}

fn render_headers(headers: &[(String, String)]) -> Vec<u8> {
    let mut v = Vec::new();
    for (k, val) in headers {
        v.extend_from_slice(k.as_bytes());
        v.extend_from_slice(b": ");
        v.extend_from_slice(val.as_bytes());
        v.extend_from_slice(b"\r\n");
    }
    v.extend_from_slice(b"\r\n");
    v
}

fn build_plan(entries: Vec<Entry>, boundary: &[u8]) -> Vec<PlanItem> {
    let mut plan = Vec::new();
    for entry in entries {
        plan.push(PlanItem::Bytes(render_boundary_open(boundary)));
        plan.push(PlanItem::Bytes(render_headers(&entry.headers)));
        match entry.body {
            EntryBody::Single(part) => plan.push(PlanItem::Part(part)),
            EntryBody::Group { boundary: inner, members } => {
                plan.extend(build_plan(members, &inner));
            }
        }
        plan.push(PlanItem::Bytes(b"\r\n".to_vec()));
    }
    plan.push(PlanItem::Bytes(render_boundary_close(boundary)));
    plan
}

fn header_block_len(headers: &[(String, String)]) -> u64 {
    let mut total = 2u64;
    for (k, v) in headers {
        total += k.len() as u64 + 2 + v.len() as u64 + 2;
    }
    total
}

fn entries_len(entries: &[Entry], boundary: &[u8]) -> u64 {
    let mut total = 0u64;
    for entry in entries {
        total += 2 + boundary.len() as u64 + 2; // "--" boundary "\r\n"
        total += header_block_len(&entry.headers);
        total += match &entry.body {
            EntryBody::Single(part) => part.size(),
            EntryBody::Group { boundary: inner, members } => entries_len(members, inner),
        };
        total += 2; // trailing "\r\n"
    }
    total + 2 + boundary.len() as u64 + 2 // closing "--" boundary "--"
}

/// A streaming `multipart/form-data` encoder.
pub struct MultipartEncoder {
    boundary_token: Vec<u8>,
    entries: Vec<Entry>,
    plan: Option<VecDeque<PlanItem>>,
    streaming_part: Option<Part>,
    finished: bool,
    declared_length: Cell<Option<u64>>,
    emitted: Cell<u64>,
}

impl MultipartEncoder {
    pub fn new() -> Self {
        MultipartEncoder {
            boundary_token: generate_boundary(),
            entries: Vec::new(),
            plan: None,
            streaming_part: None,
            finished: false,
            declared_length: Cell::new(None),
            emitted: Cell::new(0),
        }
    }

    /// The `Content-Type` header value the caller should send alongside
    /// the encoded body.
    pub fn content_type_header(&self) -> String {
        format!("multipart/form-data; boundary={}", String::from_utf8_lossy(&self.boundary_token))
    }

    /// Add a part to the body. A second file upload added under the same
    /// field name as the previous entry is grouped with it into a nested
    /// `multipart/mixed` part rather than appearing as a sibling field.
    pub fn add_part(&mut self, part: Part) -> Result<(), Error> {
        if self.plan.is_some() {
            return Err(StateError::AlreadyFinalized.into());
        }
        self.push_entry(part);
        Ok(())
    }

    fn push_entry(&mut self, part: Part) {
        let name = part.name();
        if part.is_file_upload() {
            if let Some(last) = self.entries.last_mut() {
                if last.name == name {
                    match &mut last.body {
                        EntryBody::Single(existing) if existing.is_file_upload() => {
                            let existing_part = existing.clone();
                            let existing_headers = std::mem::take(&mut last.headers);
                            let inner_boundary = generate_inner_boundary();
                            let member1 = Entry {
                                name: name.clone(),
                                headers: existing_headers,
                                body: EntryBody::Single(existing_part),
                            };
                            let member2 = Entry {
                                name: name.clone(),
                                headers: build_file_headers(&part, true),
                                body: EntryBody::Single(part),
                            };
                            last.headers = build_group_headers(&name, &inner_boundary);
                            last.body = EntryBody::Group {
                                boundary: inner_boundary,
                                members: vec![member1, member2],
                            };
                            return;
                        }
                        EntryBody::Group { members, .. } => {
                            members.push(Entry {
                                name: name.clone(),
                                headers: build_file_headers(&part, true),
                                body: EntryBody::Single(part),
                            });
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }

        let headers = if part.is_file_upload() {
            build_file_headers(&part, false)
        } else {
            build_attribute_headers(&part)
        };
        self.entries.push(Entry { name, headers, body: EntryBody::Single(part) });
    }

    fn finalize_internal(&mut self) {
        if self.plan.is_none() {
            if self.declared_length.get().is_none() {
                self.declared_length
                    .set(Some(entries_len(&self.entries, &self.boundary_token)));
            }
            let entries = std::mem::take(&mut self.entries);
            self.plan = Some(build_plan(entries, &self.boundary_token).into());
        }
    }

    /// Lock in the part list and compute the declared content length. Safe
    /// to call more than once; implied by the first [`Self::next_chunk`]
    /// call if not called explicitly.
    pub fn finalize(&mut self) {
        self.finalize_internal();
    }

    /// Lock in the part list (as [`Self::finalize`]) and set/override the
    /// outgoing request's `Content-Type` and `Content-Length` on the
    /// caller's header map — the "head request" side of encoding, for a
    /// caller driving an actual `http::Request`.
    pub fn finalize_headers(&mut self, headers: &mut HeaderMap) {
        self.finalize_internal();
        if let Ok(ct) = HeaderValue::from_str(&self.content_type_header()) {
            headers.insert(CONTENT_TYPE, ct);
        }
        if let Some(len) = self.length() {
            if let Ok(cl) = HeaderValue::from_str(&len.to_string()) {
                headers.insert(CONTENT_LENGTH, cl);
            }
        }
    }

    /// The total encoded length, if it can still be computed (before or
    /// after finalizing — not available mid-stream is never the case here,
    /// since part sizes are already known once every part is completed).
    pub fn length(&self) -> Option<u64> {
        if self.declared_length.get().is_none() {
            self.declared_length.set(Some(entries_len(&self.entries, &self.boundary_token)));
        }
        self.declared_length.get()
    }

    /// `(bytes emitted so far, total length if known)`.
    pub fn progress(&self) -> (u64, Option<u64>) {
        (self.emitted.get(), self.length())
    }

    /// Pull the next chunk of the encoded body, or `None` once the closing
    /// boundary has been fully emitted.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.finished {
            return Ok(None);
        }
        self.finalize_internal();
        loop {
            if let Some(part) = &self.streaming_part {
                let chunk = part.get_chunk(CHUNK_SIZE)?;
                if chunk.is_empty() {
                    self.streaming_part = None;
                    continue;
                }
                self.emitted.set(self.emitted.get() + chunk.len() as u64);
                return Ok(Some(chunk));
            }
            let plan = self.plan.as_mut().expect("finalize_internal always builds a plan");
            match plan.pop_front() {
                Some(PlanItem::Bytes(b)) => {
                    if b.is_empty() {
                        continue;
                    }
                    self.emitted.set(self.emitted.get() + b.len() as u64);
                    return Ok(Some(b));
                }
                Some(PlanItem::Part(part)) => {
                    self.streaming_part = Some(part);
                    continue;
                }
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        MultipartEncoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryConfig, PartFactory, RequestId, StoragePolicy};

    fn factory() -> PartFactory {
        PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        })
    }

    fn drain(enc: &mut MultipartEncoder) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = enc.next_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn encodes_a_single_attribute() {
        let f = factory();
        let request = RequestId::new();
        let part = f.create_attribute_with_value(&request, "title", "hello").unwrap();
        let mut enc = MultipartEncoder::new();
        enc.add_part(part).unwrap();
        let body = drain(&mut enc);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{}\r\n", String::from_utf8_lossy(&enc.boundary_token))));
        assert!(text.contains("Content-Disposition: form-data; name=\"title\"\r\n"));
        assert!(text.contains("\r\n\r\nhello\r\n"));
        assert!(text.trim_end().ends_with(&format!("--{}--", String::from_utf8_lossy(&enc.boundary_token))));
    }

    #[test]
    fn two_same_named_files_are_grouped_into_mixed() {
        let f = factory();
        let request = RequestId::new();
        let a = f
            .create_file_upload(&request, "pics", "a.txt", None, None, encoding_rs::UTF_8, 0)
            .unwrap();
        a.set_content(b"AAA").unwrap();
        let b = f
            .create_file_upload(&request, "pics", "b.txt", None, None, encoding_rs::UTF_8, 0)
            .unwrap();
        b.set_content(b"BBB").unwrap();

        let mut enc = MultipartEncoder::new();
        enc.add_part(a).unwrap();
        enc.add_part(b).unwrap();
        let body = drain(&mut enc);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Content-Type: multipart/mixed; boundary="));
        assert!(text.contains("a.txt"));
        assert!(text.contains("b.txt"));
        assert_eq!(text.matches("name=\"pics\"").count(), 1);
    }

    #[test]
    fn length_matches_emitted_total() {
        let f = factory();
        let request = RequestId::new();
        let part = f.create_attribute_with_value(&request, "a", "value").unwrap();
        let mut enc = MultipartEncoder::new();
        enc.add_part(part).unwrap();
        let expected = enc.length().unwrap();
        let body = drain(&mut enc);
        assert_eq!(body.len() as u64, expected);
        assert_eq!(enc.progress(), (expected, Some(expected)));
    }

    #[test]
    fn adding_a_part_after_finalize_is_rejected() {
        let f = factory();
        let request = RequestId::new();
        let part = f.create_attribute_with_value(&request, "a", "value").unwrap();
        let mut enc = MultipartEncoder::new();
        enc.finalize();
        let err = enc.add_part(part).unwrap_err();
        assert!(matches!(err, Error::State(StateError::AlreadyFinalized)));
        let _ = request;
    }

    #[test]
    fn finalize_headers_sets_content_type_and_length() {
        let f = factory();
        let request = RequestId::new();
        let part = f.create_attribute_with_value(&request, "a", "value").unwrap();
        let mut enc = MultipartEncoder::new();
        enc.add_part(part).unwrap();
        let mut headers = http::HeaderMap::new();
        enc.finalize_headers(&mut headers);
        let ct = headers.get(http::header::CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(ct.starts_with("multipart/form-data; boundary="));
        let cl: u64 = headers
            .get(http::header::CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(cl, enc.length().unwrap());
    }
}
