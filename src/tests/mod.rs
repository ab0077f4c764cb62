// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the dispatcher, both decoders, and both
//! encoders together, as opposed to the unit tests living alongside each
//! module.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::factory::{FactoryConfig, PartFactory, RequestId, StoragePolicy};
use crate::multipart::MultipartEncoder;

fn memory_factory() -> Arc<PartFactory> {
    Arc::new(PartFactory::new(FactoryConfig {
        storage: StoragePolicy::AlwaysMemory,
        ..Default::default()
    }))
}

/// A plain form submission, the everyday urlencoded path.
#[test]
fn simple_urlencoded_form() {
    let mut d = Dispatcher::new(
        Some("application/x-www-form-urlencoded"),
        memory_factory(),
        RequestId::new(),
    )
    .unwrap();
    d.offer(b"username=alice&remember=on", true).unwrap();
    let parts = d.drain_all();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name(), "username");
    assert_eq!(parts[0].get_string().unwrap(), "alice");
    assert_eq!(parts[1].name(), "remember");
    assert_eq!(parts[1].get_string().unwrap(), "on");
    assert!(d.is_complete());
}

/// A text field alongside a single file upload in one multipart body.
#[test]
fn multipart_field_and_file() {
    let mut d = Dispatcher::new(
        Some("multipart/form-data; boundary=BOUND"),
        memory_factory(),
        RequestId::new(),
    )
    .unwrap();
    let body = concat!(
        "--BOUND\r\n",
        "Content-Disposition: form-data; name=\"caption\"\r\n",
        "\r\n",
        "a sunset\r\n",
        "--BOUND\r\n",
        "Content-Disposition: form-data; name=\"photo\"; filename=\"sunset.jpg\"\r\n",
        "Content-Type: image/jpeg\r\n",
        "\r\n",
        "\x89PNGfakebytes\r\n",
        "--BOUND--\r\n",
    );
    d.offer(body.as_bytes(), true).unwrap();
    let parts = d.drain_all();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name(), "caption");
    assert!(!parts[0].is_file_upload());
    assert_eq!(parts[1].name(), "photo");
    assert!(parts[1].is_file_upload());
    assert_eq!(parts[1].file_name().as_deref(), Some("sunset.jpg"));
    assert_eq!(parts[1].get_bytes().unwrap(), b"\x89PNGfakebytes");
}

/// Two files under one field name, the legacy RFC 1867 `multipart/mixed`
/// grouping.
#[test]
fn mixed_group_of_two_files() {
    let mut d = Dispatcher::new(
        Some("multipart/form-data; boundary=OUTER"),
        memory_factory(),
        RequestId::new(),
    )
    .unwrap();
    let body = concat!(
        "--OUTER\r\n",
        "Content-Disposition: form-data; name=\"attachments\"\r\n",
        "Content-Type: multipart/mixed; boundary=INNER\r\n",
        "\r\n",
        "--INNER\r\n",
        "Content-Disposition: attachment; filename=\"one.txt\"\r\n",
        "\r\n",
        "one\r\n",
        "--INNER\r\n",
        "Content-Disposition: attachment; filename=\"two.txt\"\r\n",
        "\r\n",
        "two\r\n",
        "--INNER--\r\n",
        "--OUTER--\r\n",
    );
    d.offer(body.as_bytes(), true).unwrap();
    let parts = d.drain_all();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| p.name() == "attachments"));
    assert_eq!(parts[0].file_name().as_deref(), Some("one.txt"));
    assert_eq!(parts[1].file_name().as_deref(), Some("two.txt"));
}

/// A part large enough to spill from memory to disk under a tight mixed
/// storage limit.
#[test]
fn spills_to_disk_under_mixed_storage_policy() {
    let factory = Arc::new(PartFactory::new(FactoryConfig {
        storage: StoragePolicy::Mixed { limit_size: 4 },
        ..Default::default()
    }));
    let mut d = Dispatcher::new(
        Some("multipart/form-data; boundary=BOUND"),
        factory,
        RequestId::new(),
    )
    .unwrap();
    let body = concat!(
        "--BOUND\r\n",
        "Content-Disposition: form-data; name=\"f\"; filename=\"big.bin\"\r\n",
        "\r\n",
        "0123456789\r\n",
        "--BOUND--\r\n",
    );
    d.offer(body.as_bytes(), true).unwrap();
    let parts = d.drain_all();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].is_disk_backed());
    assert_eq!(parts[0].get_bytes().unwrap(), b"0123456789");
    d.clean_files(&parts);
}

/// A non-ASCII filename carried as an RFC 5987 extended parameter.
#[test]
fn rfc5987_filename_decodes_to_unicode() {
    let mut d = Dispatcher::new(
        Some("multipart/form-data; boundary=BOUND"),
        memory_factory(),
        RequestId::new(),
    )
    .unwrap();
    let body = concat!(
        "--BOUND\r\n",
        "Content-Disposition: form-data; name=\"f\"; filename*=UTF-8''%E4%B8%AD%E6%96%87.txt\r\n",
        "\r\n",
        "body\r\n",
        "--BOUND--\r\n",
    );
    d.offer(body.as_bytes(), true).unwrap();
    let parts = d.drain_all();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].file_name().as_deref(), Some("中文.txt"));
}

/// A part whose `Content-Length` declares a size smaller than what actually
/// arrives is rejected once the overrun write happens.
#[test]
fn oversized_part_is_rejected() {
    let mut d = Dispatcher::new(
        Some("multipart/form-data; boundary=BOUND"),
        memory_factory(),
        RequestId::new(),
    )
    .unwrap();
    let body = concat!(
        "--BOUND\r\n",
        "Content-Disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n",
        "Content-Length: 2\r\n",
        "\r\n",
        "far too much data\r\n",
        "--BOUND--\r\n",
    );
    let err = d.offer(body.as_bytes(), true).unwrap_err();
    assert!(matches!(err, crate::error::Error::SizeExceeded { .. }));
}

/// Decoding what the encoder just produced yields the same parts back.
#[test]
fn multipart_round_trips_through_encoder_and_decoder() {
    let factory = memory_factory();
    let request = RequestId::new();
    let title = factory.create_attribute_with_value(&request, "title", "my upload").unwrap();
    let file = factory
        .create_file_upload(&request, "doc", "notes.txt", None, None, encoding_rs::UTF_8, 0)
        .unwrap();
    file.set_content(b"line one\nline two").unwrap();

    let mut enc = MultipartEncoder::new();
    let content_type = enc.content_type_header();
    enc.add_part(title).unwrap();
    enc.add_part(file).unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = enc.next_chunk().unwrap() {
        body.extend_from_slice(&chunk);
    }

    let mut dec = Dispatcher::new(Some(&content_type), memory_factory(), RequestId::new()).unwrap();
    dec.offer(&body, true).unwrap();
    let parts = dec.drain_all();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name(), "title");
    assert_eq!(parts[0].get_string().unwrap(), "my upload");
    assert_eq!(parts[1].name(), "doc");
    assert!(parts[1].is_file_upload());
    assert_eq!(parts[1].get_bytes().unwrap(), b"line one\nline two");
}

/// `CleanRequest` releases every part registered to a request, whether or
/// not the caller still holds a handle to each one.
#[test]
fn clean_request_releases_every_decoded_part() {
    let factory = memory_factory();
    let request = RequestId::new();
    let mut d = Dispatcher::new(
        Some("application/x-www-form-urlencoded"),
        factory.clone(),
        request.clone(),
    )
    .unwrap();
    d.offer(b"a=1&b=2", true).unwrap();
    let parts = d.drain_all();
    factory.clean_request(&request);
    assert!(parts.iter().all(|p| p.reference_count() == 0));
}
