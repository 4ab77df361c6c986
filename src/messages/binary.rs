//! BinaryDataTransfer
//!
//! Vendor-specific bulk transfer whose payload rides the binary tag
//! encoding instead of JSON. When one of these is rendered as JSON
//! anyway (events, logs), the data field shows up base64-encoded.

use serde::{Deserialize, Serialize};

use crate::routing::codec::{BinaryMessage, OcppRequest, OcppResponse};
use crate::wire::binary::{BinaryError, BinaryTags};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryDataTransferStatus {
    Accepted,
    Rejected,
    UnknownVendorId,
    UnknownMessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDataTransferResponse {
    pub status: BinaryDataTransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_base64_bytes")]
    pub data: Option<Vec<u8>>,
}

impl OcppRequest for BinaryDataTransferRequest {
    const ACTION: &'static str = "BinaryDataTransfer";
    type Response = BinaryDataTransferResponse;

    fn failed_response(&self) -> Option<BinaryDataTransferResponse> {
        Some(BinaryDataTransferResponse {
            status: BinaryDataTransferStatus::Rejected,
            data: None,
        })
    }
}
impl OcppResponse for BinaryDataTransferResponse {}

impl BinaryMessage for BinaryDataTransferRequest {
    fn from_tags(tags: BinaryTags) -> Result<Self, BinaryError> {
        Ok(Self {
            vendor_id: tags.vendor_id,
            message_id: tags.message_id,
            data: tags.data,
        })
    }

    fn to_tags(&self) -> BinaryTags {
        let mut tags = BinaryTags::compact(self.vendor_id.clone(), self.data.clone());
        if let Some(message_id) = &self.message_id {
            tags = tags.with_message_id(message_id.clone());
        }
        tags
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

mod optional_base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::binary::BinaryFormat;

    #[test]
    fn tags_roundtrip_preserves_everything() {
        let request = BinaryDataTransferRequest {
            vendor_id: "com.vendor.fw".into(),
            message_id: Some("chunk-17".into()),
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let tags = request.to_tags();
        assert_eq!(tags.format, BinaryFormat::Compact);

        let decoded = BinaryTags::decode(&tags.encode()).unwrap();
        let back = BinaryDataTransferRequest::from_tags(decoded).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn json_rendering_is_base64() {
        let request = BinaryDataTransferRequest {
            vendor_id: "com.vendor.fw".into(),
            message_id: None,
            data: vec![1, 2, 3],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["data"], "AQID");
        assert_eq!(value["vendorId"], "com.vendor.fw");
    }

    #[test]
    fn unanswered_transfer_is_rejected() {
        let request = BinaryDataTransferRequest {
            vendor_id: "com.vendor.fw".into(),
            message_id: None,
            data: Vec::new(),
        };
        let response = request.failed_response().unwrap();
        assert_eq!(response.status, BinaryDataTransferStatus::Rejected);
    }
}
