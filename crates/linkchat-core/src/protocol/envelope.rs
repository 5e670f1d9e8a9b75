//! Envelope codec
//!
//! An envelope is `"<version>|<typeTag>|<json>"`. The version gate runs before
//! the payload is touched, so a peer speaking another protocol version is
//! reported as [`Decoded::IncompatibleProtocols`] even when its payloads would
//! not parse.

use crate::errors::CodecError;
use crate::protocol::messages::ProtocolMessage;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Separator between the envelope fields
pub const DIVIDER: char = '|';

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Borrowed view of a raw envelope, payload still unparsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub protocol_version: u32,
    pub type_tag: &'a str,
    pub payload: &'a str,
}

impl<'a> Envelope<'a> {
    /// Split raw envelope text into its three fields
    pub fn parse(raw: &'a str) -> Result<Self, CodecError> {
        let mut parts = raw.splitn(3, DIVIDER);
        let (Some(version), Some(type_tag), Some(payload)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(CodecError::MalformedEnvelope {
                reason: format!("expected 3 fields in {} bytes", raw.len()),
            });
        };

        let protocol_version =
            version
                .trim()
                .parse::<u32>()
                .map_err(|_| CodecError::MalformedEnvelope {
                    reason: format!("invalid protocol version {version:?}"),
                })?;

        Ok(Self {
            protocol_version,
            type_tag,
            payload,
        })
    }
}

/// Result of decoding an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(ProtocolMessage),
    /// The peer speaks another protocol version; recoverable, ends the connection
    IncompatibleProtocols { mine: u32, theirs: u32 },
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Assemble envelope text from a type tag and an already serialized payload
pub fn encode_parts(type_tag: &str, payload_json: &str) -> String {
    format!("{PROTOCOL_VERSION}{DIVIDER}{type_tag}{DIVIDER}{payload_json}")
}

/// Encode a protocol message into envelope text
pub fn encode(message: &ProtocolMessage) -> Result<String, CodecError> {
    let payload = message.payload_json()?;
    Ok(encode_parts(message.type_tag(), &payload))
}

/// Decode envelope text
pub fn decode(raw: &str) -> Result<Decoded, CodecError> {
    let envelope = Envelope::parse(raw)?;
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Ok(Decoded::IncompatibleProtocols {
            mine: PROTOCOL_VERSION,
            theirs: envelope.protocol_version,
        });
    }
    ProtocolMessage::from_parts(envelope.type_tag, envelope.payload).map(Decoded::Message)
}

/// Decode the bytes enclosed by a stream frame
pub fn decode_frame(bytes: &[u8]) -> Result<Decoded, CodecError> {
    let raw = core::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    decode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileType;
    use crate::protocol::messages::{
        tags, ChatInfoRequest, CommonMessage, FileResponse, GroupMessage,
    };
    use crate::types::ChatId;

    #[test]
    fn test_encode_layout() {
        let message = ProtocolMessage::Group(GroupMessage::ChatInfoRequest(ChatInfoRequest {
            chat_id: ChatId::from("c1"),
        }));
        let raw = encode(&message).unwrap();
        assert_eq!(raw, "1|Group.ChatInfo.Request|{\"chatId\":\"c1\"}");
        assert_eq!(decode(&raw).unwrap(), Decoded::Message(message));
    }

    #[test]
    fn test_payload_may_contain_divider() {
        let message = ProtocolMessage::Common(CommonMessage::FileResponse(FileResponse {
            file_type: FileType::Attachment,
            chat_id: Some(ChatId::from("a|b")),
            file_name: "x|y.png".into(),
            file_size: 3,
        }));
        let raw = encode(&message).unwrap();
        assert_eq!(decode(&raw).unwrap(), Decoded::Message(message));
    }

    #[test]
    fn test_version_gate_skips_payload_decode() {
        let raw = format!("2|{}|{{this is not json", tags::GROUP_HOST_CHAT_MESSAGE);
        assert_eq!(
            decode(&raw).unwrap(),
            Decoded::IncompatibleProtocols { mine: 1, theirs: 2 }
        );
        let raw = "7|No.Such.Type|{}";
        assert_eq!(
            decode(raw).unwrap(),
            Decoded::IncompatibleProtocols { mine: 1, theirs: 7 }
        );
    }

    #[test]
    fn test_unknown_type_fails() {
        let err = decode("1|Group.Nonsense|{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(tag) if tag == "Group.Nonsense"));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(matches!(
            decode("1|only-two").unwrap_err(),
            CodecError::MalformedEnvelope { .. }
        ));
        assert!(matches!(
            decode("v1|Group.FileReady|{}").unwrap_err(),
            CodecError::MalformedEnvelope { .. }
        ));
        assert!(matches!(
            decode("1|Group.FileReady|{}").unwrap_err(),
            CodecError::InvalidPayload { .. }
        ));
        assert!(matches!(
            decode_frame(&[0xff, 0xfe]).unwrap_err(),
            CodecError::InvalidUtf8
        ));
    }
}
