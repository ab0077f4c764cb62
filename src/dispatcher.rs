// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Picks `multipart/form-data` or `application/x-www-form-urlencoded`
//! decoding based on the request's `Content-Type` and presents both
//! decoders through one surface.

use std::str::FromStr;
use std::sync::Arc;

use mime::Mime;

use crate::charset;
use crate::error::{Error, FormatError, StateError};
use crate::factory::{PartFactory, RequestId};
use crate::multipart::MultipartDecoder;
use crate::part::Part;
use crate::urlencoded::UrlEncodedDecoder;

enum Inner {
    Multipart(MultipartDecoder),
    UrlEncoded(UrlEncodedDecoder),
}

/// A decoder that dispatches to whichever body codec the request's
/// `Content-Type` calls for.
pub struct Dispatcher {
    inner: Inner,
    destroyed: bool,
}

impl Dispatcher {
    /// Inspect `content_type` and construct the matching decoder.
    /// `multipart/form-data` with a parseable `boundary=` goes to the
    /// multipart decoder; everything else (including a bare, absent, or
    /// malformed `Content-Type`) falls back to the urlencoded decoder, same
    /// as a browser's default form submission.
    pub fn new(content_type: Option<&str>, factory: Arc<PartFactory>, request: RequestId) -> Result<Self, Error> {
        let content_type = content_type.ok_or(FormatError::MissingContentType)?;
        let mime = Mime::from_str(content_type).ok();
        let is_multipart_form_data = mime
            .as_ref()
            .map(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA)
            .unwrap_or(false);

        let inner = if is_multipart_form_data {
            Inner::Multipart(MultipartDecoder::new(content_type, factory, request)?)
        } else {
            let cs = mime
                .as_ref()
                .and_then(|m| m.get_param(mime::CHARSET))
                .map(|c| charset::resolve(c.as_str()))
                .unwrap_or(encoding_rs::UTF_8);
            Inner::UrlEncoded(UrlEncodedDecoder::new(cs, factory, request))
        };
        Ok(Dispatcher { inner, destroyed: false })
    }

    pub fn offer(&mut self, chunk: &[u8], is_last: bool) -> Result<(), Error> {
        if self.destroyed {
            return Err(StateError::Destroyed.into());
        }
        match &mut self.inner {
            Inner::Multipart(d) => d.offer(chunk, is_last),
            Inner::UrlEncoded(d) => d.offer(chunk, is_last),
        }
    }

    pub fn has_next(&self) -> bool {
        match &self.inner {
            Inner::Multipart(d) => d.has_next(),
            Inner::UrlEncoded(d) => d.has_next(),
        }
    }

    pub fn next(&mut self) -> Option<Part> {
        match &mut self.inner {
            Inner::Multipart(d) => d.next(),
            Inner::UrlEncoded(d) => d.next(),
        }
    }

    /// The part currently receiving bytes, if any. Only meaningful for
    /// multipart bodies, since urlencoded fields commit atomically once
    /// their terminating `&`/line-ending is seen.
    pub fn current_partial_part(&self) -> Option<Part> {
        match &self.inner {
            Inner::Multipart(d) => d.current_partial_part(),
            Inner::UrlEncoded(_) => None,
        }
    }

    /// Drain every remaining completed part and return the first one named
    /// `name`, ASCII case-insensitively as the data model's equality does.
    pub fn get_by_name(&mut self, name: &str) -> Option<Part> {
        self.drain_all().into_iter().find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Drain every remaining completed part and return every one named
    /// `name` — the counterpart to [`Self::get_by_name`] for fields that
    /// legitimately repeat (checkboxes, multi-select, several files under
    /// one field name outside a mixed group).
    pub fn get_all(&mut self, name: &str) -> Vec<Part> {
        self.drain_all()
            .into_iter()
            .filter(|p| p.name().eq_ignore_ascii_case(name))
            .collect()
    }

    /// Drain every remaining completed part, in wire order, regardless of
    /// name.
    pub fn drain_all(&mut self) -> Vec<Part> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next().unwrap());
        }
        out
    }

    /// `true` once the body has been fully consumed: the closing multipart
    /// delimiter was seen, or the urlencoded body reached its terminator or
    /// last chunk.
    pub fn is_complete(&self) -> bool {
        match &self.inner {
            Inner::Multipart(d) => d.is_complete(),
            Inner::UrlEncoded(d) => d.is_complete(),
        }
    }

    /// Release every disk/mixed-spilled temp file among the parts yielded
    /// so far, leaving memory-backed parts and the factory registry entry
    /// untouched. Distinct from [`PartFactory::clean_request`], which
    /// releases every part registered to the request outright.
    pub fn clean_files(&self, parts: &[Part]) {
        for part in parts {
            if part.is_disk_backed() {
                part.release(1);
            }
        }
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
        match &mut self.inner {
            Inner::Multipart(d) => d.destroy(),
            Inner::UrlEncoded(d) => d.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryConfig, StoragePolicy};

    fn factory() -> Arc<PartFactory> {
        Arc::new(PartFactory::new(FactoryConfig {
            storage: StoragePolicy::AlwaysMemory,
            ..Default::default()
        }))
    }

    #[test]
    fn routes_multipart_content_type_to_multipart_decoder() {
        let mut d = Dispatcher::new(
            Some("multipart/form-data; boundary=XBOUND"),
            factory(),
            RequestId::new(),
        )
        .unwrap();
        let body = b"--XBOUND\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhi\r\n--XBOUND--\r\n";
        d.offer(body, true).unwrap();
        let parts = d.drain_all();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].get_string().unwrap(), "hi");
    }

    #[test]
    fn routes_other_content_types_to_urlencoded_decoder() {
        let mut d = Dispatcher::new(
            Some("application/x-www-form-urlencoded"),
            factory(),
            RequestId::new(),
        )
        .unwrap();
        d.offer(b"a=1&b=2", true).unwrap();
        let parts = d.drain_all();
        assert_eq!(parts.len(), 2);
        assert_eq!(d.get_by_name("a"), None);
    }

    #[test]
    fn get_all_filters_by_name_for_repeated_fields() {
        let mut d = Dispatcher::new(
            Some("application/x-www-form-urlencoded"),
            factory(),
            RequestId::new(),
        )
        .unwrap();
        d.offer(b"tag=a&tag=b&title=x", true).unwrap();
        let tags = d.get_all("TAG");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].get_string().unwrap(), "a");
        assert_eq!(tags[1].get_string().unwrap(), "b");
    }

    #[test]
    fn get_by_name_is_case_insensitive() {
        let mut d = Dispatcher::new(
            Some("application/x-www-form-urlencoded"),
            factory(),
            RequestId::new(),
        )
        .unwrap();
        d.offer(b"Name=hi", true).unwrap();
        let found = d.get_by_name("name").unwrap();
        assert_eq!(found.get_string().unwrap(), "hi");
    }

    #[test]
    fn missing_content_type_is_a_format_error() {
        let err = Dispatcher::new(None, factory(), RequestId::new()).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::MissingContentType)));
    }
}
