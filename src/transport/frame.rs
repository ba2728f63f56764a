// =============================================================================
// Frames — decoding feed responses into queued events
// =============================================================================
//
// Acknowledgements echo the request GUID (`requestGuid`) and become System
// events. Market payloads carry the subscription GUID (`guid`) and become
// Data events. The opcode is recovered from the GUID itself.
// =============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::types::{Guid, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Subscription acknowledgement or rejection.
    System,
    /// Market payload for a subscription.
    Data,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Always present for Data events.
    pub opcode: Option<Opcode>,
    pub guid: Guid,
    pub http_code: Option<u16>,
    pub message: Option<String>,
    pub data: Value,
}

impl Event {
    /// A Data event for `guid`, as the reader would produce it.
    pub fn data(guid: Guid, data: Value) -> Result<Self> {
        let opcode = guid.opcode()?;
        Ok(Self {
            kind: EventKind::Data,
            opcode: Some(opcode),
            guid,
            http_code: None,
            message: None,
            data,
        })
    }

    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let response: WsResponse = serde_json::from_str(text)
            .map_err(|e| FeedError::Protocol(format!("malformed frame: {e}")))?;

        if let Some(request_guid) = response.request_guid.filter(|g| !g.is_empty()) {
            let guid = Guid::new(request_guid);
            return Ok(Self {
                kind: EventKind::System,
                opcode: guid.opcode().ok(),
                guid,
                http_code: response.http_code,
                message: response.message,
                data: response.data.unwrap_or(Value::Null),
            });
        }

        match response.guid.filter(|g| !g.is_empty()) {
            Some(guid) => {
                let data = response
                    .data
                    .ok_or_else(|| FeedError::Protocol(format!("frame for {guid} has no data")))?;
                Self::data(Guid::new(guid), data)
            }
            None => Err(FeedError::Protocol("guid is empty".to_string())),
        }
    }

    /// Acknowledgements carry 200; anything else is a rejection.
    pub fn is_rejection(&self) -> bool {
        self.kind == EventKind::System && self.http_code.is_some_and(|code| code != 200)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    http_code: Option<u16>,
    #[serde(default)]
    request_guid: Option<String>,
    #[serde(default)]
    guid: Option<String>,
}
