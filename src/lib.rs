// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A streaming codec for HTTP POST bodies: `application/x-www-form-urlencoded`
//! and `multipart/form-data` (including nested `multipart/mixed` file
//! groups, RFC 1867/2388/7578).
//!
//! Body bytes arrive in arbitrarily sized chunks through [`Dispatcher::offer`]
//! and are decoded incrementally into [`Part`]s, each backed by a
//! memory/disk/mixed content store chosen by [`factory::StoragePolicy`]. The
//! [`multipart::MultipartEncoder`] and [`urlencoded::UrlEncodedEncoder`] run
//! the same parts back into wire bytes for the outbound direction.

pub mod buffer;
pub mod charset;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod multipart;
pub mod part;
pub mod urlencoded;

#[cfg(test)]
mod tests;

pub use dispatcher::Dispatcher;
pub use error::Error;
pub use factory::{FactoryConfig, PartFactory, RequestId, StoragePolicy};
pub use part::Part;
