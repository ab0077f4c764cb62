// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Percent-decoding and charset resolution. The percent-decoding
//! *primitive* comes from the `percent-encoding` crate, and charset
//! *conversion* from `encoding_rs`; this module's own job is resolving
//! charset names, strict escape validation, and surfacing `Error::Encoding`
//! with the original string, none of which the primitives provide on their
//! own.

use encoding_rs::Encoding;
use percent_encoding::percent_decode as pe_percent_decode;

use crate::error::Error;

/// Resolve an IANA/WHATWG charset label to an [`Encoding`], falling back to
/// UTF-8 for unrecognised labels (matching the data model's "charset
/// defaults to UTF-8").
pub fn resolve(label: &str) -> &'static Encoding {
    Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::UTF_8)
}

/// Percent-decode `input` (an `application/x-www-form-urlencoded` key or
/// value) using `charset`, and strictly validate every `%XX` escape first: a
/// malformed escape is an [`Error::Encoding`] carrying the untouched
/// original string.
///
/// `+` is treated as an encoded space, the `application/x-www-form-urlencoded`
/// convention — not applicable outside form bodies; see
/// [`decode_header_param`] for header parameter values (RFC 5987), where a
/// literal `+` is just a `+`.
pub fn decode_component(input: &str, charset: &'static Encoding) -> Result<String, Error> {
    decode(input, charset, true)
}

/// Percent-decode an HTTP header parameter value (RFC 5987's
/// `filename*=charset'lang'pct-encoded`) using `charset`. Unlike
/// [`decode_component`], `+` is left as a literal plus — RFC 5987 has no
/// form-encoding convention for space.
pub fn decode_header_param(input: &str, charset: &'static Encoding) -> Result<String, Error> {
    decode(input, charset, false)
}

fn decode(input: &str, charset: &'static Encoding, fold_plus: bool) -> Result<String, Error> {
    let raw = validate_and_unescape(input, fold_plus)?;
    let (decoded, _, had_errors) = charset.decode(&raw);
    if had_errors {
        return Err(Error::Encoding {
            input: input.to_string(),
        });
    }
    Ok(decoded.into_owned())
}

/// Validate that every `%` in `input` is followed by two hex digits, then
/// hand the (now known-valid) bytes to the `percent-encoding` crate to do
/// the actual unescaping, returning raw (not yet charset-decoded) bytes.
fn validate_and_unescape(input: &str, fold_plus: bool) -> Result<Vec<u8>, Error> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1);
            let lo = bytes.get(i + 2);
            match (hi, lo) {
                (Some(&h), Some(&l)) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => {
                    i += 3;
                }
                _ => {
                    return Err(Error::Encoding {
                        input: input.to_string(),
                    });
                }
            }
        } else {
            i += 1;
        }
    }
    if fold_plus {
        // `+` means encoded space in form bodies; percent_decode itself
        // leaves it untouched, so swap it in before handing off to the
        // primitive.
        let plus_folded: Vec<u8> = bytes
            .iter()
            .map(|&b| if b == b'+' { b' ' } else { b })
            .collect();
        Ok(pe_percent_decode(&plus_folded).collect())
    } else {
        Ok(pe_percent_decode(bytes).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_as_space_and_percent_escapes() {
        let out = decode_component("hello+world%21", encoding_rs::UTF_8).unwrap();
        assert_eq!(out, "hello world!");
    }

    #[test]
    fn malformed_escape_is_recoverable_encoding_error() {
        let err = decode_component("bad%2gvalue", encoding_rs::UTF_8).unwrap_err();
        match err {
            Error::Encoding { input } => assert_eq!(input, "bad%2gvalue"),
            _ => panic!("expected Encoding error"),
        }
    }

    #[test]
    fn resolve_unknown_label_falls_back_to_utf8() {
        assert_eq!(resolve("not-a-real-charset").name(), "UTF-8");
        assert_eq!(resolve("utf-8").name(), "UTF-8");
    }

    #[test]
    fn header_param_decoding_leaves_plus_literal() {
        let out = decode_header_param("a+b%2Bc", encoding_rs::UTF_8).unwrap();
        assert_eq!(out, "a+b+c");
    }
}
