// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The resumable `application/x-www-form-urlencoded` decoder and its
//! matching encoder.
//!
//! The decoder has no wire preamble to skip (unlike multipart's boundary
//! scan), so it starts directly in the key-scanning state; there is no
//! separate "not started" state to speak of.

use std::collections::VecDeque;
use std::sync::Arc;

use encoding_rs::Encoding;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};

use crate::buffer::Accumulator;
use crate::charset;
use crate::error::{Error, StateError};
use crate::factory::{PartFactory, RequestId};
use crate::part::Part;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Scanning a percent-encoded key, looking for `=` or `&`.
    Disposition,
    /// Scanning a percent-encoded value, looking for `&` or a line ending.
    Field,
    /// Body fully parsed; remaining bytes (if any) are silently discarded.
    Epilogue,
}

/// A streaming decoder for one `application/x-www-form-urlencoded` body.
pub struct UrlEncodedDecoder {
    acc: Accumulator,
    factory: Arc<PartFactory>,
    request: RequestId,
    charset: &'static Encoding,
    state: State,
    current_name: Option<String>,
    completed: VecDeque<Part>,
    last_chunk_seen: bool,
    destroyed: bool,
}

impl UrlEncodedDecoder {
    pub fn new(charset: &'static Encoding, factory: Arc<PartFactory>, request: RequestId) -> Self {
        UrlEncodedDecoder {
            acc: Accumulator::new(),
            factory,
            request,
            charset,
            state: State::Disposition,
            current_name: None,
            completed: VecDeque::new(),
            last_chunk_seen: false,
            destroyed: false,
        }
    }

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
        match self.state {
            State::Disposition => self.consume_key(),
            State::Field => self.consume_value(),
            State::Epilogue => self.consume_epilogue(),
        }
    }

    fn commit_attribute(&mut self, name: &str, raw_value: &[u8]) -> Result<(), Error> {
        let value = decode_raw(raw_value, self.charset)?;
        let part = self.factory.create_attribute(&self.request, name)?;
        part.set_content(value.as_bytes())?;
        self.completed.push_back(part);
        Ok(())
    }

    fn consume_key(&mut self) -> Result<bool, Error> {
        let slice = self.acc.as_contiguous();
        for (i, &b) in slice.iter().enumerate() {
            match b {
                b'=' => {
                    let name = decode_raw(&slice[..i], self.charset)?;
                    self.current_name = Some(name);
                    let new_cursor = self.acc.cursor() + i + 1;
                    self.acc.set_cursor(new_cursor);
                    self.state = State::Field;
                    return Ok(true);
                }
                b'&' => {
                    let name = decode_raw(&slice[..i], self.charset)?;
                    let new_cursor = self.acc.cursor() + i + 1;
                    self.commit_attribute(&name, b"")?;
                    self.acc.set_cursor(new_cursor);
                    return Ok(true);
                }
                b'\r' | b'\n' => {
                    return self.terminate_body(slice, i);
                }
                _ => {}
            }
        }
        if self.last_chunk_seen {
            if !slice.is_empty() {
                let name = decode_raw(slice, self.charset)?;
                let new_cursor = self.acc.cursor() + slice.len();
                self.commit_attribute(&name, b"")?;
                self.acc.set_cursor(new_cursor);
            }
            self.state = State::Epilogue;
            return Ok(!slice.is_empty());
        }
        Err(Error::NotEnoughData)
    }

    fn consume_value(&mut self) -> Result<bool, Error> {
        let slice = self.acc.as_contiguous();
        let mut i = 0;
        while i < slice.len() {
            match slice[i] {
                b'&' => {
                    let name = self.current_name.take().expect("field state without a pending key");
                    self.commit_attribute(&name, &slice[..i])?;
                    let new_cursor = self.acc.cursor() + i + 1;
                    self.acc.set_cursor(new_cursor);
                    self.state = State::Disposition;
                    return Ok(true);
                }
                b'\r' => {
                    if i + 1 >= slice.len() {
                        if self.last_chunk_seen {
                            return self.finish_value_at_eof(slice, i);
                        }
                        return Err(Error::NotEnoughData);
                    }
                    if slice[i + 1] == b'\n' {
                        let name = self.current_name.take().expect("field state without a pending key");
                        self.commit_attribute(&name, &slice[..i])?;
                        let new_cursor = self.acc.cursor() + i + 2;
                        self.acc.set_cursor(new_cursor);
                        self.state = State::Epilogue;
                        return Ok(true);
                    }
                    i += 1;
                }
                b'\n' => {
                    let name = self.current_name.take().expect("field state without a pending key");
                    self.commit_attribute(&name, &slice[..i])?;
                    let new_cursor = self.acc.cursor() + i + 1;
                    self.acc.set_cursor(new_cursor);
                    self.state = State::Epilogue;
                    return Ok(true);
                }
                _ => i += 1,
            }
        }
        if self.last_chunk_seen {
            return self.finish_value_at_eof(slice, slice.len());
        }
        Err(Error::NotEnoughData)
    }

    fn finish_value_at_eof(&mut self, slice: &[u8], len: usize) -> Result<bool, Error> {
        let name = self.current_name.take().expect("field state without a pending key");
        self.commit_attribute(&name, &slice[..len])?;
        let new_cursor = self.acc.cursor() + len;
        self.acc.set_cursor(new_cursor);
        self.state = State::Epilogue;
        Ok(true)
    }

    /// Reached `\r` or `\n` while still scanning a key (i.e. the body ends
    /// with a bare token that never got an `=` or `&`). A nonempty token is
    /// committed as an attribute with an empty value; an empty one (the
    /// terminator sits at the very start) just ends the body.
    fn terminate_body(&mut self, slice: &[u8], i: usize) -> Result<bool, Error> {
        let term_len = if slice[i] == b'\r' {
            if i + 1 >= slice.len() {
                if self.last_chunk_seen {
                    1
                } else {
                    return Err(Error::NotEnoughData);
                }
            } else if slice[i + 1] == b'\n' {
                2
            } else {
                1
            }
        } else {
            1
        };
        if i > 0 {
            let name = decode_raw(&slice[..i], self.charset)?;
            self.commit_attribute(&name, b"")?;
        }
        let new_cursor = self.acc.cursor() + i + term_len;
        self.acc.set_cursor(new_cursor);
        self.state = State::Epilogue;
        Ok(true)
    }

    fn consume_epilogue(&mut self) -> Result<bool, Error> {
        let remaining = self.acc.remaining();
        if remaining > 0 {
            let new_cursor = self.acc.cursor() + remaining;
            self.acc.set_cursor(new_cursor);
        }
        Ok(false)
    }

    pub fn has_next(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn next(&mut self) -> Option<Part> {
        self.completed.pop_front()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Epilogue
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
    }
}

fn decode_raw(raw: &[u8], charset: &'static Encoding) -> Result<String, Error> {
    let as_str = String::from_utf8_lossy(raw);
    charset::decode_component(&as_str, charset)
}

/// Which characters an [`UrlEncodedEncoder`] leaves unescaped, and how it
/// represents a literal space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlEncodeMode {
    /// The classic `application/x-www-form-urlencoded` behaviour: space as
    /// `+`, `*` left literal.
    Rfc1738,
    /// Stricter escaping: space, `+`, and `*` all percent-escaped
    /// (`%20`/`%20`/`%2A`), `~` escaped as `%7E`.
    Rfc3986,
    /// The WHATWG form-urlencoded serialiser: equivalent to [`Rfc1738`] for
    /// the characters this crate treats specially.
    ///
    /// [`Rfc1738`]: UrlEncodeMode::Rfc1738
    Html5,
}

impl Default for UrlEncodeMode {
    fn default() -> Self {
        UrlEncodeMode::Rfc1738
    }
}

fn is_always_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

fn push_percent(out: &mut String, b: u8) {
    out.push('%');
    out.push(char::from_digit((b >> 4) as u32, 16).unwrap().to_ascii_uppercase());
    out.push(char::from_digit((b & 0xf) as u32, 16).unwrap().to_ascii_uppercase());
}

fn encode_component(s: &str, mode: UrlEncodeMode) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b' ' if mode != UrlEncodeMode::Rfc3986 => out.push('+'),
            b' ' => push_percent(&mut out, b),
            b'*' if mode == UrlEncodeMode::Rfc1738 || mode == UrlEncodeMode::Html5 => out.push('*'),
            b'+' if mode == UrlEncodeMode::Rfc3986 => push_percent(&mut out, b' '),
            _ if is_always_unreserved(b) => out.push(b as char),
            _ => push_percent(&mut out, b),
        }
    }
    out
}

/// Size of a single emitted body chunk.
const CHUNK_SIZE: usize = 8096;

/// Serialises a list of attribute parts into an
/// `application/x-www-form-urlencoded` body, streamed out in bounded
/// chunks.
pub struct UrlEncodedEncoder {
    mode: UrlEncodeMode,
    parts: Vec<Part>,
    rendered: Option<Vec<u8>>,
    cursor: usize,
    finished: bool,
}

impl UrlEncodedEncoder {
    pub fn new(mode: UrlEncodeMode) -> Self {
        UrlEncodedEncoder {
            mode,
            parts: Vec::new(),
            rendered: None,
            cursor: 0,
            finished: false,
        }
    }

    pub fn content_type_header(&self) -> &'static str {
        "application/x-www-form-urlencoded"
    }

    pub fn add_part(&mut self, part: Part) -> Result<(), Error> {
        if self.rendered.is_some() {
            return Err(StateError::AlreadyFinalized.into());
        }
        self.parts.push(part);
        Ok(())
    }

    fn finalize_internal(&mut self) -> Result<(), Error> {
        if self.rendered.is_some() {
            return Ok(());
        }
        let mut pairs = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let value = part.get_string()?;
            pairs.push(format!(
                "{}={}",
                encode_component(&part.name(), self.mode),
                encode_component(&value, self.mode)
            ));
        }
        self.rendered = Some(pairs.join("&").into_bytes());
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), Error> {
        self.finalize_internal()
    }

    /// As [`Self::finalize`], and also set/override `Content-Type` and
    /// `Content-Length` on the caller's header map.
    pub fn finalize_headers(&mut self, headers: &mut HeaderMap) -> Result<(), Error> {
        self.finalize_internal()?;
        if let Ok(ct) = HeaderValue::from_str(self.content_type_header()) {
            headers.insert(CONTENT_TYPE, ct);
        }
        let len = self.rendered.as_ref().unwrap().len() as u64;
        if let Ok(cl) = HeaderValue::from_str(&len.to_string()) {
            headers.insert(CONTENT_LENGTH, cl);
        }
        Ok(())
    }

    pub fn length(&mut self) -> Result<u64, Error> {
        self.finalize_internal()?;
        Ok(self.rendered.as_ref().unwrap().len() as u64)
    }

    pub fn progress(&self) -> (u64, Option<u64>) {
        (self.cursor as u64, self.rendered.as_ref().map(|r| r.len() as u64))
    }

    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.finished {
            return Ok(None);
        }
        self.finalize_internal()?;
        let body = self.rendered.as_ref().unwrap();
        if self.cursor >= body.len() {
            self.finished = true;
            return Ok(None);
        }
        let end = (self.cursor + CHUNK_SIZE).min(body.len());
        let chunk = body[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryConfig, StoragePolicy};

    fn decoder() -> UrlEncodedDecoder {
        let factory = Arc::new(PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        }));
        UrlEncodedDecoder::new(encoding_rs::UTF_8, factory, RequestId::new())
    }

    fn collect_all(dec: &mut UrlEncodedDecoder) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while dec.has_next() {
            let p = dec.next().unwrap();
            out.push((p.name(), p.get_string().unwrap()));
        }
        out
    }

    #[test]
    fn decodes_simple_pairs() {
        let mut dec = decoder();
        dec.offer(b"a=1&b=2", true).unwrap();
        let pairs = collect_all(&mut dec);
        assert_eq!(pairs, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
        assert!(dec.is_complete());
    }

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let mut dec = decoder();
        dec.offer(b"name=hello+world%21", true).unwrap();
        let pairs = collect_all(&mut dec);
        assert_eq!(pairs, vec![("name".to_string(), "hello world!".to_string())]);
    }

    #[test]
    fn key_with_no_equals_commits_empty_value() {
        let mut dec = decoder();
        dec.offer(b"flag&b=2", true).unwrap();
        let pairs = collect_all(&mut dec);
        assert_eq!(pairs, vec![("flag".to_string(), "".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn splits_across_many_small_offers() {
        let mut dec = decoder();
        let body = b"alpha=one&beta=two";
        for (i, byte) in body.iter().enumerate() {
            dec.offer(std::slice::from_ref(byte), i + 1 == body.len()).unwrap();
        }
        let pairs = collect_all(&mut dec);
        assert_eq!(
            pairs,
            vec![("alpha".to_string(), "one".to_string()), ("beta".to_string(), "two".to_string())]
        );
    }

    #[test]
    fn encodes_round_trip_with_default_mode() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let a = factory.create_attribute_with_value(&request, "hello world", "a b").unwrap();
        let mut enc = UrlEncodedEncoder::new(UrlEncodeMode::Rfc1738);
        enc.add_part(a).unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = enc.next_chunk().unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8(body).unwrap(), "hello+world=a+b");
    }

    #[test]
    fn rfc3986_mode_escapes_star_plus_and_tilde() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let a = factory.create_attribute_with_value(&request, "k", "a*b+c~d e").unwrap();
        let mut enc = UrlEncodedEncoder::new(UrlEncodeMode::Rfc3986);
        enc.add_part(a).unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = enc.next_chunk().unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8(body).unwrap(), "k=a%2Ab%20c%7Ed%20e");
    }

    #[test]
    fn finalize_headers_sets_content_type_and_length() {
        let factory = PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        });
        let request = RequestId::new();
        let a = factory.create_attribute_with_value(&request, "a", "1").unwrap();
        let mut enc = UrlEncodedEncoder::new(UrlEncodeMode::Rfc1738);
        enc.add_part(a).unwrap();
        let mut headers = HeaderMap::new();
        enc.finalize_headers(&mut headers).unwrap();
        assert_eq!(
            headers.get(CONTENT_TYPE).unwrap().to_str().unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(), "3");
    }
}
