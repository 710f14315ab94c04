//! Zabbix sender protocol framing.
//!
//! Every frame is `MAGIC(5) | LEN_LE(4) | RESERVED(4) | PAYLOAD(LEN)`, where the
//! payload is UTF-8 JSON. Requests carry `{"request":"sender data","data":[..]}`
//! and responses carry an acknowledgement object.

use serde::{Deserialize, Serialize};

use crate::errors::TrapperError;
use crate::item::TrapperItem;

/// `"ZBXD"` followed by protocol version 1.
pub const MAGIC: [u8; 5] = [0x5A, 0x42, 0x58, 0x44, 0x01];
pub const HEADER_LEN: usize = MAGIC.len() + 8;

const SENDER_DATA: &str = "sender data";

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: Vec<SenderData<'a>>,
}

#[derive(Serialize)]
struct SenderData<'a> {
    host: &'a str,
    key: &'a str,
    value: &'a str,
}

/// Build the JSON payload for `items` reported under `host`.
pub fn encode_payload(host: &str, items: &[TrapperItem]) -> Result<Vec<u8>, TrapperError> {
    if items.is_empty() {
        return Err(TrapperError::EmptyBatch);
    }

    let request = SenderRequest {
        request: SENDER_DATA,
        data: items
            .iter()
            .map(|item| SenderData {
                host,
                key: item.key(),
                value: item.value(),
            })
            .collect(),
    };
    Ok(serde_json::to_vec(&request)?)
}

/// Prefix `payload` with the protocol header.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, TrapperError> {
    let len = frame_length(payload.len())?;

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(&[0u8; 4]);
    packet.extend_from_slice(payload);
    Ok(packet)
}

fn frame_length(len: usize) -> Result<u32, TrapperError> {
    u32::try_from(len).map_err(|_| TrapperError::PayloadTooLarge(len))
}

/// Encode a full request frame.
pub fn encode(host: &str, items: &[TrapperItem]) -> Result<Vec<u8>, TrapperError> {
    frame(&encode_payload(host, items)?)
}

/// Payload length declared in a frame header, if the header is present and valid.
pub fn declared_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < HEADER_LEN || buffer[..MAGIC.len()] != MAGIC {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&buffer[MAGIC.len()..MAGIC.len() + 4]);
    Some(u32::from_le_bytes(len) as usize)
}

/// True once `buffer` holds a header and at least the payload it declares.
pub fn is_complete(buffer: &[u8]) -> bool {
    declared_len(buffer).is_some_and(|len| buffer.len() >= HEADER_LEN + len)
}

/// Decode a response frame into its acknowledgement text.
///
/// Returns `None` when fewer than [`HEADER_LEN`] bytes were read or the magic
/// prefix does not match. Everything after the header up to the end of
/// `buffer` is returned, decoded lossily as UTF-8.
pub fn decode(buffer: &[u8]) -> Option<String> {
    declared_len(buffer)?;
    Some(String::from_utf8_lossy(&buffer[HEADER_LEN..]).into_owned())
}

/// Acknowledgement returned by the server for a sender-data request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Acknowledgement {
    pub response: String,
    #[serde(default)]
    pub info: Option<String>,
}

/// Counters reported in the acknowledgement `info` string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingSummary {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    pub seconds_spent: f64,
}

impl Acknowledgement {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn is_success(&self) -> bool {
        self.response == "success"
    }

    /// Parse `"processed: 1; failed: 0; total: 1; seconds spent: 0.000055"`.
    pub fn summary(&self) -> Option<ProcessingSummary> {
        let info = self.info.as_deref()?;
        let mut processed = None;
        let mut failed = None;
        let mut total = None;
        let mut seconds_spent = None;

        for field in info.split(';') {
            let (name, value) = field.split_once(':')?;
            let value = value.trim();
            match name.trim() {
                "processed" => processed = value.parse().ok(),
                "failed" => failed = value.parse().ok(),
                "total" => total = value.parse().ok(),
                "seconds spent" => seconds_spent = value.parse().ok(),
                _ => {}
            }
        }

        Some(ProcessingSummary {
            processed: processed?,
            failed: failed?,
            total: total?,
            seconds_spent: seconds_spent?,
        })
    }
}
