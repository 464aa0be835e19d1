//! Producer-side payload encoding.
//!
//! The queue treats payloads as opaque bytes; this is the format used by the
//! `push_job` helpers and the CLI.

use super::error::QueueResult;
use super::models::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named job and its input data, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job: String,
    #[serde(default)]
    pub data: Value,
}

impl JobPayload {
    pub fn new(job: impl Into<String>, data: Value) -> Self {
        Self {
            job: job.into(),
            data,
        }
    }

    pub fn encode(&self) -> QueueResult<Payload> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> QueueResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
