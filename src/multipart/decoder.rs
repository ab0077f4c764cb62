// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The resumable `multipart/form-data` decoder.
//!
//! Bytes are offered incrementally via [`MultipartDecoder::offer`]; the
//! decoder advances its internal cursor as far as the buffered bytes allow
//! and stops cleanly (restoring the cursor to where the current routine
//! started) the moment it needs more input. Nothing about a partially
//! buffered chunk is ever committed: every routine either fully succeeds or
//! leaves the accumulator exactly as it found it.
//!
//! A legacy `multipart/mixed` group nested one level inside a `form-data`
//! field (RFC 1867 §3.3, grouping several files under one field name) is
//! supported; a second level of nesting is rejected.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use encoding_rs::Encoding;
use log::{debug, trace, warn};
use mime::Mime;

use crate::buffer::Accumulator;
use crate::charset;
use crate::error::{Error, FormatError, StateError};
use crate::factory::{PartFactory, RequestId};
use crate::multipart::header::parse_content_disposition;
use crate::part::{ContentTransferEncoding, Part};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NotStarted,
    HeaderDelimiter,
    Disposition,
    PartBody,
    MixedDelimiter,
    MixedDisposition,
    MixedPartBody,
    Epilogue,
}

/// Parses the `boundary=` (and, if present, `charset=`) parameters off a
/// `multipart/*` `Content-Type` header value.
fn parse_boundary(content_type: &str) -> Result<(Vec<u8>, &'static Encoding), Error> {
    let mime = Mime::from_str(content_type).map_err(|_| Error::HeaderValueNotMime)?;
    if mime.type_() != mime::MULTIPART {
        return Err(FormatError::MissingContentType.into());
    }
    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or(FormatError::MissingBoundary)?;
    let mut full = Vec::with_capacity(2 + boundary.as_str().len());
    full.extend_from_slice(b"--");
    full.extend_from_slice(boundary.as_str().as_bytes());
    let cs = mime
        .get_param(mime::CHARSET)
        .map(|c| charset::resolve(c.as_str()))
        .unwrap_or(encoding_rs::UTF_8);
    Ok((full, cs))
}

/// Find the first position of `needle` in `haystack`, or `None`.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Where the header block ends: the length of `data` up to and including
/// the blank-line terminator (`\r\n\r\n`, or a bare `\n\n`), whichever
/// occurs first.
fn find_header_terminator(data: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' && data.get(i + 1) == Some(&b'\n') {
            return Some(i + 2);
        }
        if data[i] == b'\r'
            && data.get(i + 1) == Some(&b'\n')
            && data.get(i + 2) == Some(&b'\r')
            && data.get(i + 3) == Some(&b'\n')
        {
            return Some(i + 4);
        }
        i += 1;
    }
    None
}

enum DelimiterScan {
    /// The full `\n--BOUND` pattern starts at this offset from the cursor.
    Found(usize),
    /// No full match; this many bytes from the cursor are safe to commit
    /// as content without risking they are a truncated match.
    NotFound(usize),
}

/// Scan `haystack` for `pattern`, reporting how many leading bytes are safe
/// to treat as ordinary content when no full match is present yet (the
/// trailing bytes that could be the start of a split-across-chunks match
/// are held back).
fn scan_for_delimiter(haystack: &[u8], pattern: &[u8]) -> DelimiterScan {
    if let Some(pos) = find_subslice(haystack, pattern) {
        return DelimiterScan::Found(pos);
    }
    let max_k = pattern.len().saturating_sub(1).min(haystack.len());
    let mut k = max_k;
    while k > 0 {
        if haystack[haystack.len() - k..] == pattern[..k] {
            break;
        }
        k -= 1;
    }
    let mut safe_len = haystack.len() - k;
    // A trailing lone `\r` might still turn into `\r\n--BOUND`; never commit
    // it, even though `pattern` itself starts with `\n` and so would not
    // otherwise hold it back.
    if safe_len > 0 && haystack[safe_len - 1] == b'\r' {
        safe_len -= 1;
    }
    DelimiterScan::NotFound(safe_len)
}

/// A streaming decoder for one `multipart/form-data` (or nested
/// `multipart/mixed`) request body.
pub struct MultipartDecoder {
    acc: Accumulator,
    factory: Arc<PartFactory>,
    request: RequestId,
    default_charset: &'static Encoding,
    outer_boundary: Vec<u8>,
    mixed_boundary: Option<Vec<u8>>,
    mixed_field_name: Option<String>,
    state: State,
    current: Option<Part>,
    completed: VecDeque<Part>,
    last_chunk_seen: bool,
    destroyed: bool,
}

impl MultipartDecoder {
    pub fn new(content_type: &str, factory: Arc<PartFactory>, request: RequestId) -> Result<Self, Error> {
        let (outer_boundary, default_charset) = parse_boundary(content_type)?;
        Ok(MultipartDecoder {
            acc: Accumulator::new(),
            factory,
            request,
            default_charset,
            outer_boundary,
            mixed_boundary: None,
            mixed_field_name: None,
            state: State::NotStarted,
            current: None,
            completed: VecDeque::new(),
            last_chunk_seen: false,
            destroyed: false,
        })
    }

    /// Offer the next chunk of the body. `is_last` marks the final chunk;
    /// once seen, a body that never reaches the epilogue is a format error
    /// rather than something to keep waiting on.
    pub fn offer(&mut self, chunk: &[u8], is_last: bool) -> Result<(), Error> {
        if self.destroyed {
            return Err(StateError::Destroyed.into());
        }
        self.acc.append(chunk);
        if is_last {
            self.last_chunk_seen = true;
        }
        loop {
            let snapshot = self.acc.snapshot();
            match self.step() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(Error::NotEnoughData) => {
                    trace!("not enough data buffered in state {:?}, backtracking", self.state);
                    self.acc.restore(snapshot);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.acc.discard_consumed();
        Ok(())
    }

    fn step(&mut self) -> Result<bool, Error> {
        let before = self.state;
        let progressed = self.step_inner()?;
        if self.state != before {
            trace!("{:?} -> {:?}", before, self.state);
        }
        Ok(progressed)
    }

    fn step_inner(&mut self) -> Result<bool, Error> {
        match self.state {
            State::NotStarted => self.consume_preamble(),
            State::HeaderDelimiter => self.consume_delimiter(false),
            State::Disposition => self.consume_headers(false),
            State::PartBody => self.consume_part_body(false),
            State::MixedDelimiter => self.consume_delimiter(true),
            State::MixedDisposition => self.consume_headers(true),
            State::MixedPartBody => self.consume_part_body(true),
            State::Epilogue => self.consume_epilogue(),
        }
    }

    fn consume_preamble(&mut self) -> Result<bool, Error> {
        let slice = self.acc.as_contiguous();
        match find_subslice(slice, &self.outer_boundary) {
            Some(pos) => {
                let new_cursor = self.acc.cursor() + pos;
                self.acc.set_cursor(new_cursor);
                self.state = State::HeaderDelimiter;
                Ok(true)
            }
            None => {
                if self.last_chunk_seen {
                    return Err(FormatError::InvalidDelimiter.into());
                }
                Err(Error::NotEnoughData)
            }
        }
    }

    fn consume_delimiter(&mut self, mixed: bool) -> Result<bool, Error> {
        let boundary = if mixed {
            self.mixed_boundary.clone().expect("mixed delimiter without an active group")
        } else {
            self.outer_boundary.clone()
        };
        let prefix_len = boundary.len();
        if self.acc.remaining() < prefix_len {
            return self.not_enough_or_truncated();
        }
        let slice = self.acc.as_contiguous();
        if &slice[..prefix_len] != boundary.as_slice() {
            return Err(FormatError::InvalidDelimiter.into());
        }
        let mut pos = prefix_len;
        let is_close = slice.len() >= pos + 2 && &slice[pos..pos + 2] == b"--";
        if is_close {
            pos += 2;
        }
        if slice.len() <= pos {
            return self.not_enough_or_truncated();
        }
        let consumed_terminator = if slice[pos] == b'\r' {
            if slice.len() <= pos + 1 {
                return self.not_enough_or_truncated();
            }
            if slice[pos + 1] != b'\n' {
                return Err(FormatError::BareCarriageReturn.into());
            }
            2
        } else if slice[pos] == b'\n' {
            warn!("delimiter terminated by a bare \\n rather than \\r\\n");
            1
        } else {
            return Err(FormatError::InvalidDelimiter.into());
        };

        let total = pos + consumed_terminator;
        let new_cursor = self.acc.cursor() + total;
        self.acc.set_cursor(new_cursor);

        if is_close {
            if mixed {
                self.mixed_boundary = None;
                self.mixed_field_name = None;
                self.state = State::HeaderDelimiter;
            } else {
                self.state = State::Epilogue;
            }
        } else {
            self.state = if mixed { State::MixedDisposition } else { State::Disposition };
        }
        Ok(true)
    }

    fn not_enough_or_truncated(&self) -> Result<bool, Error> {
        if self.last_chunk_seen {
            Err(FormatError::InvalidDelimiter.into())
        } else {
            Err(Error::NotEnoughData)
        }
    }

    fn consume_headers(&mut self, mixed: bool) -> Result<bool, Error> {
        let slice = self.acc.as_contiguous();
        let Some(hdr_len) = find_header_terminator(slice) else {
            if self.last_chunk_seen {
                return Err(FormatError::TruncatedHeaders.into());
            }
            return Err(Error::NotEnoughData);
        };
        let header_bytes = slice[..hdr_len].to_vec();

        let mut header_memory = [httparse::EMPTY_HEADER; 32];
        let raw_headers = match httparse::parse_headers(&header_bytes, &mut header_memory) {
            Ok(httparse::Status::Complete((_, raw))) => raw,
            Ok(httparse::Status::Partial) => return Err(Error::PartialHeaders),
            Err(e) => return Err(Error::from(e)),
        };

        let mut content_disposition = None;
        let mut content_type = None;
        let mut content_length = None;
        let mut cte = None;
        for h in raw_headers {
            if h.value.is_empty() {
                break;
            }
            let value = String::from_utf8_lossy(h.value).trim().to_string();
            match h.name.to_ascii_lowercase().as_str() {
                "content-disposition" => content_disposition = Some(value),
                "content-type" => content_type = Some(value),
                "content-length" => content_length = value.parse::<u64>().ok(),
                "content-transfer-encoding" => {
                    cte = Some(
                        ContentTransferEncoding::parse(&value)
                            .ok_or_else(|| FormatError::UnknownTransferEncoding(value.clone()))?,
                    )
                }
                _ => {}
            }
        }

        let disposition = parse_content_disposition(content_disposition.as_deref().unwrap_or(""))?;
        // A part inside a mixed group names itself only via `filename`; the
        // field name comes from the outer `form-data` entry that opened the
        // group, so a missing `name` here is only fatal at the outer level.
        let name = if mixed {
            disposition.name.clone().unwrap_or_default()
        } else {
            disposition.name.clone().ok_or(FormatError::MissingName)?
        };

        let new_cursor = self.acc.cursor() + hdr_len;
        self.acc.set_cursor(new_cursor);

        if mixed && disposition.file_name.is_none() {
            return Err(FormatError::MissingFilename.into());
        }

        let mime_parsed = content_type.as_deref().and_then(|ct| Mime::from_str(ct).ok());
        let is_mixed_container = !mixed
            && mime_parsed
                .as_ref()
                .map(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::MIXED)
                .unwrap_or(false);

        if is_mixed_container {
            let (inner_boundary, _) = parse_boundary(content_type.as_deref().unwrap())?;
            self.mixed_boundary = Some(inner_boundary);
            self.mixed_field_name = Some(name);
            self.state = State::MixedDelimiter;
            return Ok(true);
        }

        if mixed && mime_parsed.as_ref().map(|m| m.type_() == mime::MULTIPART).unwrap_or(false) {
            return Err(FormatError::NestedMixedTooDeep.into());
        }

        let charset = if cte == Some(ContentTransferEncoding::SevenBit) {
            // `7bit` forces ASCII regardless of any declared charset; `8bit`/
            // `binary` fall through to the Content-Type charset param or the
            // part's default.
            charset::resolve("us-ascii")
        } else {
            mime_parsed
                .as_ref()
                .and_then(|m| m.get_param(mime::CHARSET).map(|c| charset::resolve(c.as_str())))
                .unwrap_or(self.default_charset)
        };

        let field_name = if mixed {
            self.mixed_field_name.clone().unwrap_or(name)
        } else {
            name
        };
        let is_file = mixed || disposition.file_name.is_some();

        let part = if is_file {
            self.factory.create_file_upload(
                &self.request,
                &field_name,
                disposition.file_name.as_deref().unwrap_or(""),
                mime_parsed,
                cte,
                charset,
                content_length.unwrap_or(0),
            )?
        } else if let Some(len) = content_length {
            self.factory.create_attribute_sized(&self.request, &field_name, len)?
        } else {
            self.factory.create_attribute(&self.request, &field_name)?
        };

        self.current = Some(part);
        self.state = if mixed { State::MixedPartBody } else { State::PartBody };
        Ok(true)
    }

    fn consume_part_body(&mut self, mixed: bool) -> Result<bool, Error> {
        let boundary = if mixed {
            self.mixed_boundary.clone().expect("mixed body without an active group")
        } else {
            self.outer_boundary.clone()
        };
        let mut pattern = Vec::with_capacity(1 + boundary.len());
        pattern.push(b'\n');
        pattern.extend_from_slice(&boundary);

        let scan = {
            let slice = self.acc.as_contiguous();
            scan_for_delimiter(slice, &pattern)
        };

        match scan {
            DelimiterScan::Found(pos) => {
                let content = {
                    let slice = self.acc.as_contiguous();
                    let mut end = pos;
                    if end > 0 && slice[end - 1] == b'\r' {
                        end -= 1;
                    }
                    slice[..end].to_vec()
                };
                let part = self.current.take().expect("part body state without a current part");
                part.add_content(&content, true)?;
                self.completed.push_back(part);
                let new_cursor = self.acc.cursor() + pos + 1;
                self.acc.set_cursor(new_cursor);
                self.state = if mixed { State::MixedDelimiter } else { State::HeaderDelimiter };
                Ok(true)
            }
            DelimiterScan::NotFound(safe_len) => {
                if safe_len > 0 {
                    let content = {
                        let slice = self.acc.as_contiguous();
                        slice[..safe_len].to_vec()
                    };
                    let part = self.current.as_ref().expect("part body state without a current part");
                    part.add_content(&content, false)?;
                    let new_cursor = self.acc.cursor() + safe_len;
                    self.acc.set_cursor(new_cursor);
                }
                // Bytes that could straddle a split delimiter are held back
                // rather than committed; this is genuine "need more input",
                // not a failed routine, so the cursor advance above must
                // stick rather than be rolled back by the caller.
                Ok(false)
            }
        }
    }

    fn consume_epilogue(&mut self) -> Result<bool, Error> {
        let remaining = self.acc.remaining();
        if remaining > 0 {
            let new_cursor = self.acc.cursor() + remaining;
            self.acc.set_cursor(new_cursor);
        }
        Ok(false)
    }

    /// `true` once a part's headers and body have both been fully read and
    /// [`MultipartDecoder::next`] will return it.
    pub fn has_next(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Take the next completed part, in the order its closing delimiter was
    /// seen.
    pub fn next(&mut self) -> Option<Part> {
        self.completed.pop_front()
    }

    /// The part currently being written to, if any — readable before it
    /// completes (e.g. to report upload progress).
    pub fn current_partial_part(&self) -> Option<Part> {
        self.current.clone()
    }

    /// `true` once the closing `--BOUND--` delimiter has been seen and any
    /// trailing epilogue bytes are being silently discarded.
    pub fn is_complete(&self) -> bool {
        self.state == State::Epilogue
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryConfig, StoragePolicy};

    fn decoder(content_type: &str) -> MultipartDecoder {
        let factory = Arc::new(PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        }));
        MultipartDecoder::new(content_type, factory, RequestId::new()).unwrap()
    }

    fn collect_all(dec: &mut MultipartDecoder) -> Vec<Part> {
        let mut out = Vec::new();
        while dec.has_next() {
            out.push(dec.next().unwrap());
        }
        out
    }

    #[test]
    fn decodes_a_single_attribute_field() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--XBOUND--\r\n";
        dec.offer(body, true).unwrap();
        let parts = collect_all(&mut dec);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name(), "title");
        assert_eq!(parts[0].get_string().unwrap(), "hello");
        assert!(dec.is_complete());
    }

    #[test]
    fn decodes_a_file_upload_field() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nfile body\r\n--XBOUND--\r\n";
        dec.offer(body, true).unwrap();
        let parts = collect_all(&mut dec);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_file_upload());
        assert_eq!(parts[0].file_name().as_deref(), Some("a.txt"));
        assert_eq!(parts[0].get_bytes().unwrap(), b"file body");
    }

    #[test]
    fn splits_body_across_many_small_offers() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello world\r\n--XBOUND--\r\n";
        for (i, byte) in body.iter().enumerate() {
            dec.offer(std::slice::from_ref(byte), i + 1 == body.len()).unwrap();
        }
        let parts = collect_all(&mut dec);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].get_string().unwrap(), "hello world");
    }

    #[test]
    fn mixed_group_surfaces_each_file_as_its_own_part() {
        let mut dec = decoder("multipart/form-data; boundary=OUTER");
        let body = concat!(
            "--OUTER\r\n",
            "Content-Disposition: form-data; name=\"pics\"\r\n",
            "Content-Type: multipart/mixed; boundary=INNER\r\n",
            "\r\n",
            "--INNER\r\n",
            "Content-Disposition: attachment; filename=\"a.txt\"\r\n",
            "\r\n",
            "AAA\r\n",
            "--INNER\r\n",
            "Content-Disposition: attachment; filename=\"b.txt\"\r\n",
            "\r\n",
            "BBB\r\n",
            "--INNER--\r\n",
            "--OUTER--\r\n",
        );
        dec.offer(body.as_bytes(), true).unwrap();
        let parts = collect_all(&mut dec);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.name() == "pics"));
        assert_eq!(parts[0].file_name().as_deref(), Some("a.txt"));
        assert_eq!(parts[0].get_bytes().unwrap(), b"AAA");
        assert_eq!(parts[1].file_name().as_deref(), Some("b.txt"));
        assert_eq!(parts[1].get_bytes().unwrap(), b"BBB");
    }

    #[test]
    fn missing_name_is_a_format_error() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data\r\n\r\nhello\r\n--XBOUND--\r\n";
        let err = dec.offer(body, true).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::MissingName)));
    }

    #[test]
    fn unknown_transfer_encoding_is_a_format_error() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"a\"\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\nhi\r\n--XBOUND--\r\n";
        let err = dec.offer(body, true).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::UnknownTransferEncoding(_))));
    }

    #[test]
    fn bare_carriage_return_in_delimiter_is_rejected() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let mut body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhi\r\n--XBOUND".to_vec();
        body.push(b'\r');
        body.push(b'x');
        let err = dec.offer(&body, true).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::BareCarriageReturn)));
    }

    #[test]
    fn seven_bit_transfer_encoding_forces_ascii_charset() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"a\"\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Transfer-Encoding: 7bit\r\n\r\nhi\r\n--XBOUND--\r\n";
        dec.offer(body, true).unwrap();
        let parts = collect_all(&mut dec);
        assert_eq!(parts[0].charset().name(), charset::resolve("us-ascii").name());
    }

    #[test]
    fn eight_bit_transfer_encoding_keeps_declared_charset() {
        let mut dec = decoder("multipart/form-data; boundary=XBOUND");
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"a\"\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\nhi\r\n--XBOUND--\r\n";
        dec.offer(body, true).unwrap();
        let parts = collect_all(&mut dec);
        assert_eq!(parts[0].charset().name(), encoding_rs::UTF_8.name());
    }
}
