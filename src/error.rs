// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use crate::channel::ChannelError;
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Undecodable frame, payload or configuration.
    MalformedData,
    /// Bind, connect or send failure.
    BadNetwork,
    /// Inbound message for a broadcast group without a listener.
    UnknownBroadcastGroup,
    /// Log append attempted by a node that is not the leader.
    NotLeader,
    /// Block does not extend the last committed block.
    BrokenIntegrity,
    /// Block storage failure.
    DatabaseFault,
    /// Transaction execution failure.
    ExecutionFault,
    ResourceNotFound,
    /// A request was not answered in time.
    Timeout,
    NotImplemented,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const BAD_NETWORK: &str = "bad network";
    pub const UNKNOWN_BROADCAST_GROUP: &str = "unknown broadcast group";
    pub const NOT_LEADER: &str = "not leader";
    pub const BROKEN_INTEGRITY: &str = "broken integrity";
    pub const DATABASE_FAULT: &str = "database fault";
    pub const EXECUTION_FAULT: &str = "execution fault";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const TIMEOUT: &str = "timeout";
    pub const NOT_IMPLEMENTED: &str = "not implemented";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            BadNetwork => error_kind_str::BAD_NETWORK,
            UnknownBroadcastGroup => error_kind_str::UNKNOWN_BROADCAST_GROUP,
            NotLeader => error_kind_str::NOT_LEADER,
            BrokenIntegrity => error_kind_str::BROKEN_INTEGRITY,
            DatabaseFault => error_kind_str::DATABASE_FAULT,
            ExecutionFault => error_kind_str::EXECUTION_FAULT,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            Timeout => error_kind_str::TIMEOUT,
            NotImplemented => error_kind_str::NOT_IMPLEMENTED,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propagated the error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Underlying cause, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::RecvTimeout => Error::new_ext(ErrorKind::Timeout, err),
            _ => Error::new_ext(ErrorKind::Other, err),
        }
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let mut max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            while !detail.is_char_boundary(max_len) {
                max_len -= 1;
            }
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.source, &other.source) {
            (None, None) => true,
            (Some(a), Some(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}
