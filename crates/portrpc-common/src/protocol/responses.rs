use std::fmt;

use crate::protocol::body::Body;
use crate::protocol::metadata::Metadata;

/// Outcome of a call.
///
/// The numeric values are part of the wire format and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    ErrorFromService = 1,
    InvalidServiceMethod = 2,
    ServiceNotFound = 3,
    MethodNotFound = 4,
    BadRequest = 5,
    InternalError = 6,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::ErrorFromService,
            2 => StatusCode::InvalidServiceMethod,
            3 => StatusCode::ServiceNotFound,
            4 => StatusCode::MethodNotFound,
            5 => StatusCode::BadRequest,
            6 => StatusCode::InternalError,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "StatusOK",
            StatusCode::ErrorFromService => "StatusErrorFromService",
            StatusCode::InvalidServiceMethod => "StatusInvalidServiceMethod",
            StatusCode::ServiceNotFound => "StatusServiceNotFound",
            StatusCode::MethodNotFound => "StatusMethodNotFound",
            StatusCode::BadRequest => "StatusBadRequest",
            StatusCode::InternalError => "StatusInternalError",
        };
        f.write_str(name)
    }
}

/// Reply to a [`Request`](crate::protocol::Request).
///
/// `error` is set iff `status` is not [`StatusCode::Ok`]; `body` is only
/// meaningful for successful responses.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub metadata: Metadata,
    pub error: Option<String>,
    pub body: Body,
}

impl Response {
    /// A successful response carrying an encoded payload.
    pub fn ok(body: Body) -> Self {
        Response {
            status: StatusCode::Ok,
            metadata: Metadata::new(),
            error: None,
            body,
        }
    }

    /// A failed response with a human-readable reason and an empty body.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Response {
            status,
            metadata: Metadata::new(),
            error: Some(message.into()),
            body: Body::empty(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The error text, or an empty string when there is none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}
