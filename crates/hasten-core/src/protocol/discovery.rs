//! Discovery registry messages (newline-delimited JSON).

use serde::{Deserialize, Serialize};

/// Endpoint registered; also used to ack heartbeats.
pub const STATUS_REGISTERED: &str = "200";
/// Discovery found live endpoints; `data` holds them.
pub const STATUS_FOUND: &str = "201";
/// Malformed request or unknown operation.
pub const STATUS_BAD_REQUEST: &str = "400";
/// Discovery found no live endpoint.
pub const STATUS_NOT_FOUND: &str = "404";

/// Upper bound for one registry message line.
pub const MAX_REGISTRY_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Register,
    Discovery,
    HeartBeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRequest {
    pub service_name: String,
    pub op_type: OpType,
    /// Address to advertise on `Register`. Falls back to the observed peer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl RegistryRequest {
    pub fn register(service_name: impl Into<String>, addr: Option<String>) -> Self {
        Self {
            service_name: service_name.into(),
            op_type: OpType::Register,
            addr,
        }
    }

    pub fn discovery(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            op_type: OpType::Discovery,
            addr: None,
        }
    }

    pub fn heartbeat(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            op_type: OpType::HeartBeat,
            addr: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<Vec<String>>,
}

impl RegistryResponse {
    pub fn status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            data: None,
        }
    }

    pub fn found(addrs: Vec<String>) -> Self {
        Self {
            status: STATUS_FOUND.to_string(),
            data: Some(addrs),
        }
    }
}
