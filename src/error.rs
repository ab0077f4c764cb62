// Copyright 2016-2020 mime-multipart Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::io;
use std::string::FromUtf8Error;

use http::header::ToStrError;

/// The reason a decode session cannot continue.
///
/// Unlike [`Error::NotEnoughData`], every variant here is unrecoverable:
/// the decoder or encoder that raised it should be destroyed.
#[derive(Debug)]
pub enum FormatError {
    /// `Content-Type` did not carry a `boundary=` parameter.
    MissingBoundary,
    /// A delimiter line had `\r` with no following `\n`.
    BareCarriageReturn,
    /// A `multipart/mixed` part was found nested inside another mixed group.
    NestedMixedTooDeep,
    /// `Content-Transfer-Encoding` was present but not `7bit`/`8bit`/`binary`.
    UnknownTransferEncoding(String),
    /// `Content-Disposition` had no `name` parameter.
    MissingName,
    /// A part inside a mixed group had no `filename` parameter.
    MissingFilename,
    /// A delimiter line did not match `--BOUND\r\n` or `--BOUND--\r\n`.
    InvalidDelimiter,
    /// The body ended before a part's headers reached a blank line.
    TruncatedHeaders,
    /// The request had no usable `Content-Type` header at all.
    MissingContentType,
}

impl Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::MissingBoundary => write!(f, "Content-Type had no boundary parameter"),
            FormatError::BareCarriageReturn => write!(f, "bare CR without LF in delimiter line"),
            FormatError::NestedMixedTooDeep => write!(f, "multipart/mixed nested beyond one level"),
            FormatError::UnknownTransferEncoding(v) => {
                write!(f, "unsupported Content-Transfer-Encoding: {v}")
            }
            FormatError::MissingName => write!(f, "Content-Disposition missing name parameter"),
            FormatError::MissingFilename => {
                write!(f, "mixed-mode part missing filename parameter")
            }
            FormatError::InvalidDelimiter => write!(f, "malformed boundary delimiter line"),
            FormatError::TruncatedHeaders => write!(f, "body ended before part headers completed"),
            FormatError::MissingContentType => write!(f, "no Content-Type header present"),
        }
    }
}

/// Why an operation was refused because the decoder/encoder has already
/// finished its work.
#[derive(Debug)]
pub enum StateError {
    /// `Destroy` was already called; no further operations are valid.
    Destroyed,
    /// The caller asked for something only valid once `is_last_chunk` has
    /// been observed (e.g. `GetBodyHttpDatas`), but it has not been yet.
    NotYetComplete,
    /// An encoder's part list was already finalized into a wire plan; no
    /// more parts can be added.
    AlreadyFinalized,
}

impl Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Destroyed => write!(f, "operation invoked after Destroy"),
            StateError::NotYetComplete => write!(f, "operation requires the last chunk to have been seen"),
            StateError::AlreadyFinalized => write!(f, "no more parts can be added once encoding has started"),
        }
    }
}

/// An error type for the form-body codec.
pub enum Error {
    /// The accumulator does not yet hold enough bytes to make progress.
    /// Recoverable: the read cursor has been restored to its position at
    /// the start of the failed routine. Offer more bytes and retry.
    NotEnoughData,
    /// The body violates the wire format in a way this session cannot
    /// recover from.
    Format(FormatError),
    /// A write would have pushed a part's size past `max_size` or
    /// `defined_size`. The part is left exactly as it was before the call.
    SizeExceeded {
        /// The limit that was about to be crossed (-1 meant unlimited, so
        /// this variant is never raised for those parts).
        limit: i64,
        /// The size the write would have produced.
        attempted: u64,
    },
    /// Percent-decoding or charset conversion failed.
    Encoding {
        /// The original (still percent-encoded) string that failed to
        /// decode.
        input: String,
    },
    /// The operation is invalid given the current lifecycle state.
    State(StateError),
    /// A multipart section contained only partial headers.
    PartialHeaders,
    HeaderMissing,
    InvalidHeaderNameOrValue,
    HeaderValueNotMime,
    ToStr(ToStrError),
    /// An HTTP header-line parsing error from a part's headers.
    Httparse(httparse::Error),
    /// An I/O error from a disk-backed part.
    Io(io::Error),
    /// An error was returned while building an HTTP header value.
    Http(http::Error),
    /// A UTF-8 conversion error while materialising a part's content.
    Utf8(FromUtf8Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        Error::Httparse(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Error {
        Error::Http(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Error {
        Error::Utf8(err)
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Error {
        Error::Format(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Error {
        Error::State(err)
    }
}

impl Error {
    /// `true` for [`Error::NotEnoughData`], the only kind a caller should
    /// treat as "try again after the next `Offer`".
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotEnoughData)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotEnoughData => "not enough data buffered yet".to_string().fmt(f),
            Error::Format(e) => format!("format error: {e}").fmt(f),
            Error::SizeExceeded { limit, attempted } => {
                format!("size {attempted} exceeds limit {limit}").fmt(f)
            }
            Error::Encoding { input } => format!("encoding error decoding {input:?}").fmt(f),
            Error::State(e) => format!("state error: {e}").fmt(f),
            Error::PartialHeaders => "A multipart section contained only partial headers.".to_string().fmt(f),
            Error::HeaderMissing => "The requested header could not be found in the HeaderMap".to_string().fmt(f),
            Error::InvalidHeaderNameOrValue => "Parsing to HeaderName or HeaderValue failed".to_string().fmt(f),
            Error::HeaderValueNotMime => "HeaderValue could not be parsed to Mime".to_string().fmt(f),
            Error::ToStr(e) => format!("ToStr: {e}").fmt(f),
            Error::Httparse(e) => format!("Httparse: {e:?}").fmt(f),
            Error::Io(e) => format!("Io: {e}").fmt(f),
            Error::Http(e) => format!("Http: {e}").fmt(f),
            Error::Utf8(e) => format!("Utf8: {e}").fmt(f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")?;
        if let Some(source) = self.source() {
            write!(f, ": {source:?}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Httparse(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Utf8(e) => Some(e),
            Error::ToStr(e) => Some(e),
            _ => None,
        }
    }
}
