//! Per-call envelope.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Sequence number that never identifies a call.
pub const INVALID_SEQ: u64 = 0;

/// Header frame sent ahead of every body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// `"Service.Method"`.
    pub method: String,
    /// Correlates a response with its request. Unique per connection.
    pub seq: u64,
    /// Empty on requests and successful responses.
    pub error: String,
}

impl Header {
    /// Header for an outgoing request.
    pub fn request(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the peer reported an application failure.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Split `method` on the last `.` into `(service, method)`.
    pub fn split_method(&self) -> Result<(&str, &str)> {
        match self.method.rsplit_once('.') {
            Some((svc, m)) if !svc.is_empty() && !m.is_empty() => Ok((svc, m)),
            _ => Err(RpcError::InvalidMethodName(self.method.clone())),
        }
    }
}
