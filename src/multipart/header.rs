// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Header-line splitting, parameter extraction, and RFC 5987 filename
//! decoding for multipart part headers.

use std::collections::HashMap;

use encoding_rs::Encoding;

use crate::charset;
use crate::error::Error;

/// Split a header value into its top-level segments: on `;` (respecting
/// double-quoted spans with `\`-escapes) for headers with multiple
/// parameters, or on `,` otherwise.
pub fn split_header_value(value: &str, respect_quotes: bool) -> Vec<String> {
    let sep = if respect_quotes { ';' } else { ',' };
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if respect_quotes && c == '\\' && in_quotes {
            current.push(c);
            if let Some(&next) = chars.peek() {
                current.push(next);
                chars.next();
            }
            continue;
        }
        if respect_quotes && c == '"' {
            in_quotes = !in_quotes;
            current.push(c);
            continue;
        }
        if c == sep && !in_quotes {
            out.push(current.clone());
            current.clear();
            continue;
        }
        current.push(c);
    }
    if !current.is_empty() || out.is_empty() {
        out.push(current);
    }
    out
}

/// "Clean" a parameter value: replace each of `: , = ; \t` with a single
/// space, strip surrounding `"`, then trim.
pub fn clean_value(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            ':' | ',' | '=' | ';' | '\t' => ' ',
            other => other,
        })
        .collect();
    replaced.trim().trim_matches('"').trim().to_string()
}

/// Parse the `key=value` parameters out of a split header segment list
/// (the first segment is the "bare" value, e.g. `form-data` or
/// `multipart/mixed`, and is not itself a parameter).
pub fn parse_params(segments: &[String]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for segment in segments.iter().skip(1) {
        let trimmed = segment.trim();
        if let Some(eq) = find_unquoted_eq(trimmed) {
            let key = trimmed[..eq].trim().to_ascii_lowercase();
            let value = clean_raw_param_value(trimmed[eq + 1..].trim());
            params.insert(key, value);
        }
    }
    params
}

fn find_unquoted_eq(s: &str) -> Option<usize> {
    let mut in_quotes = false;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'=' if !in_quotes => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Like [`clean_value`] but preserves `*=` RFC 5987 triplets untouched
/// (those are decoded separately by [`decode_rfc5987`]); plain values still
/// go through the `: , = ; \t` / quote-stripping clean.
fn clean_raw_param_value(raw: &str) -> String {
    clean_value(raw)
}

/// The outer disposition kind named in `Content-Disposition`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DispositionType {
    FormData,
    Attachment,
    File,
}

pub struct ContentDisposition {
    pub disposition_type: DispositionType,
    pub name: Option<String>,
    pub file_name: Option<String>,
}

/// Parse a `Content-Disposition` header value.
///
/// `filename*=charset'lang'pct-encoded` (RFC 5987) takes precedence over a
/// plain `filename=` on the same header, matching the data model's note
/// that it is the general form of the filename parameter.
pub fn parse_content_disposition(value: &str) -> Result<ContentDisposition, Error> {
    let segments = split_header_value(value, true);
    let bare = segments
        .first()
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let disposition_type = match bare.as_str() {
        "form-data" => DispositionType::FormData,
        "attachment" => DispositionType::Attachment,
        "file" => DispositionType::File,
        _ => DispositionType::FormData,
    };

    let mut name = None;
    let mut file_name = None;
    for segment in segments.iter().skip(1) {
        let trimmed = segment.trim();
        let Some(eq) = find_unquoted_eq(trimmed) else {
            continue;
        };
        let key = trimmed[..eq].trim().to_ascii_lowercase();
        let raw_value = trimmed[eq + 1..].trim();
        match key.as_str() {
            "name" => name = Some(clean_value(raw_value)),
            "filename*" => {
                file_name = Some(decode_rfc5987(raw_value)?);
            }
            "filename" if file_name.is_none() => {
                file_name = Some(clean_value(raw_value));
            }
            _ => {}
        }
    }

    Ok(ContentDisposition {
        disposition_type,
        name,
        file_name,
    })
}

/// Decode an RFC 5987 extended value: `charset'lang'pct-encoded`.
pub fn decode_rfc5987(raw: &str) -> Result<String, Error> {
    let unquoted = clean_value(raw);
    let mut parts = unquoted.splitn(3, '\'');
    let charset_label = parts.next().unwrap_or("utf-8");
    let _lang = parts.next().unwrap_or("");
    let encoded = parts.next().unwrap_or(&unquoted);
    let encoding = charset::resolve(charset_label);
    charset::decode_header_param(encoded, encoding)
}

/// `Content-Type` parsed into its MIME value and parameters (boundary,
/// charset, …), using the same splitting/cleaning rules as
/// `Content-Disposition`.
pub fn parse_content_type_params(value: &str) -> HashMap<String, String> {
    let segments = split_header_value(value, true);
    parse_params(&segments)
}
