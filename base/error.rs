// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::error::Error as StdError;
use std::fmt;

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for descriptions of
/// each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    #[rustfmt::skip]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Cancelled          => "Cancelled",
            ErrorKind::Unknown            => "Unknown",
            ErrorKind::InvalidArgument    => "Invalid argument",
            ErrorKind::DeadlineExceeded   => "Deadline exceeded",
            ErrorKind::NotFound           => "Not found",
            ErrorKind::AlreadyExists      => "Already exists",
            ErrorKind::PermissionDenied   => "Permission denied",
            ErrorKind::Unauthenticated    => "Unauthenticated",
            ErrorKind::ResourceExhausted  => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted            => "Aborted",
            ErrorKind::OutOfRange         => "Out of range",
            ErrorKind::Unimplemented      => "Unimplemented",
            ErrorKind::Internal           => "Internal",
            ErrorKind::Unavailable        => "Unavailable",
            ErrorKind::DataLoss           => "Data loss",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(k: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as I;
        match k {
            I::NotFound => ErrorKind::NotFound,
            I::PermissionDenied => ErrorKind::PermissionDenied,
            I::AlreadyExists => ErrorKind::AlreadyExists,
            I::InvalidInput | I::InvalidData => ErrorKind::InvalidArgument,
            I::TimedOut => ErrorKind::DeadlineExceeded,
            I::Interrupted => ErrorKind::Cancelled,
            I::UnexpectedEof => ErrorKind::OutOfRange,
            I::OutOfMemory => ErrorKind::ResourceExhausted,
            I::ConnectionRefused
            | I::ConnectionReset
            | I::ConnectionAborted
            | I::NotConnected
            | I::BrokenPipe => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

/// An error with a kind, an optional human-readable message, and an optional cause.
///
/// Usually built with [`err!`](crate::err) or returned via [`bail!`](crate::bail).
pub struct Error(Box<Inner>);

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedSource>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(Inner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn with_msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn with_source<S: Into<BoxedSource>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` which includes the full chain of causes.
    ///
    /// Used when logging, as in `warn!(err = %e.chain(), "...")`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.0.msg, &self.0.source) {
            (Some(m), _) => write!(f, "{}: {}", self.0.kind, m),
            (None, Some(s)) => write!(f, "{}: {}", self.0.kind, s),
            (None, None) => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|s| s as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(e.kind().into()).with_source(e)
    }
}

/// See [`Error::chain`].
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;

        // With no message, `Display` already printed the immediate source.
        let mut cause = StdError::source(self.0);
        if self.0.msg().is_none() {
            cause = cause.and_then(StdError::source);
        }
        while let Some(c) = cause {
            f.write_str("\ncaused by: ")?;
            f.write_fmt(format_args!("{c}"))?;
            cause = c.source();
        }
        Ok(())
    }
}

/// Converts the first argument of [`err!`](crate::err) into an [`Error`].
///
/// An [`ErrorKind`] starts a fresh error; an existing error becomes the source
/// of a new one with the same kind.
#[doc(hidden)]
pub trait Wrap {
    fn wrap(self) -> Error;
}

impl Wrap for ErrorKind {
    fn wrap(self) -> Error {
        Error::new(self)
    }
}

impl Wrap for Error {
    fn wrap(self) -> Error {
        Error::new(self.kind()).with_source(self)
    }
}

impl Wrap for std::io::Error {
    fn wrap(self) -> Error {
        Error::new(self.kind().into()).with_source(self)
    }
}

/// Builds an [`Error`] from a kind or an existing error.
///
/// ```
/// use weaponwatch_base::{err, ErrorKind};
/// let e = err!(Unavailable, msg("camera {} went away", "front"));
/// assert_eq!(e.kind(), ErrorKind::Unavailable);
/// assert_eq!(e.to_string(), "Unavailable: camera front went away");
///
/// let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
/// let e = err!(io, msg("unable to open footage"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// ```
#[macro_export]
macro_rules! err {
    ($src:expr $(, msg($($msg:tt)+))? $(, source($source:expr))? $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::Wrap::wrap($src)
            $(.with_msg(::std::format!($($msg)+)))?
            $(.with_source($source))?
    }};
}

/// Returns early with an [`Error`] built as in [`err!`](crate::err).
///
/// ```
/// use weaponwatch_base::{bail, Error, ErrorKind};
/// let e = || -> Result<(), Error> {
///     bail!(NotFound, msg("no status file at {}", "/tmp/x"));
/// }().unwrap_err();
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// ```
#[macro_export]
macro_rules! bail {
    ($($t:tt)+) => {
        return ::std::result::Result::Err($crate::err!($($t)+).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_msg() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = crate::err!(Unknown, msg("unable to write frame"), source(io));
        assert_eq!(e.to_string(), "Unknown: unable to write frame");
        assert_eq!(
            e.chain().to_string(),
            "Unknown: unable to write frame\ncaused by: disk on fire"
        );
    }

    #[test]
    fn source_only() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found: gone");
        assert_eq!(e.chain().to_string(), "Not found: gone");
    }

    #[test]
    fn nested_chain() {
        let inner = crate::err!(DataLoss, msg("truncated header"));
        let outer = crate::err!(Unavailable, msg("unable to open source"), source(inner));
        assert_eq!(
            outer.chain().to_string(),
            "Unavailable: unable to open source\ncaused by: Data loss: truncated header"
        );
    }

    #[test]
    fn wrap_keeps_kind() {
        let inner = crate::err!(DataLoss, msg("truncated header"));
        let e = crate::err!(inner, msg("unable to read frame"));
        assert_eq!(e.kind(), ErrorKind::DataLoss);
        assert_eq!(
            e.chain().to_string(),
            "Data loss: unable to read frame\ncaused by: Data loss: truncated header"
        );
    }
}
