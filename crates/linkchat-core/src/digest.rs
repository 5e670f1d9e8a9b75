//! Stable change-detection digests
//!
//! Devices compare cheap digests instead of shipping whole chats. A digest is a
//! CRC-32 over the canonical JSON rendering of the entity, so two devices with
//! equal data always compute equal values regardless of platform.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::model::{GroupChat, Message, User};
use crate::types::{ChatId, MessageId};

// ----------------------------------------------------------------------------
// Digest
// ----------------------------------------------------------------------------

/// Content checksum of a user profile or chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(u32);

impl Digest {
    /// Wrap a raw checksum value
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw checksum value
    pub fn value(&self) -> u32 {
        self.0
    }

    fn of<T: Serialize>(value: &T) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        // Serializing plain data structs into a Vec cannot fail
        if let Ok(bytes) = serde_json::to_vec(value) {
            hasher.update(&bytes);
        }
        Self(hasher.finalize())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Digest of a user profile
pub fn user_hash(user: &User) -> Digest {
    Digest::of(user)
}

/// Aggregate digest of a group chat: its metadata plus the ordered message ids
pub fn chat_hash(chat: &GroupChat, messages: &[Message]) -> Digest {
    #[derive(Serialize)]
    struct Canonical<'a> {
        chat: &'a GroupChat,
        messages: Vec<&'a MessageId>,
    }

    Digest::of(&Canonical {
        chat,
        messages: messages.iter().map(|m| &m.id).collect(),
    })
}

// ----------------------------------------------------------------------------
// Reconciliation Digest
// ----------------------------------------------------------------------------

/// What a member tells the host about its copy of a group chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatHashInfo {
    pub chat_id: ChatId,
    pub chat_hash: Digest,
    pub last_message_id: Option<MessageId>,
}

impl GroupChatHashInfo {
    /// Summarize a local copy
    pub fn of(chat: &GroupChat, messages: &[Message]) -> Self {
        Self {
            chat_id: chat.id.clone(),
            chat_hash: chat_hash(chat, messages),
            last_message_id: messages.last().map(|m| m.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageContent;
    use crate::types::PeerAddress;

    fn chat() -> GroupChat {
        let mut chat = GroupChat::new(PeerAddress::new("host"), "team");
        chat.id = ChatId::from("fixed");
        chat
    }

    fn message(id: &str) -> Message {
        let mut m = Message::plain(
            ChatId::from("fixed"),
            PeerAddress::new("host"),
            vec![MessageContent::text(id)],
            None,
        );
        m.id = MessageId::from(id);
        m
    }

    #[test]
    fn test_chat_hash_tracks_history() {
        let chat = chat();
        let short = chat_hash(&chat, &[message("m1")]);
        let long = chat_hash(&chat, &[message("m1"), message("m2")]);
        assert_ne!(short, long);
        assert_eq!(long, chat_hash(&chat, &[message("m1"), message("m2")]));
    }

    #[test]
    fn test_chat_hash_tracks_metadata() {
        let mut renamed = chat();
        renamed.name = "other".into();
        assert_ne!(chat_hash(&chat(), &[]), chat_hash(&renamed, &[]));
    }

    #[test]
    fn test_user_hash_is_stable() {
        let user = User::new(PeerAddress::new("a"), "Ada");
        assert_eq!(user_hash(&user), user_hash(&user.clone()));
        assert_ne!(user_hash(&user), user_hash(&user.clone().with_picture("p.png")));
    }

    #[test]
    fn test_hash_info_reports_last_message() {
        let info = GroupChatHashInfo::of(&chat(), &[message("m1"), message("m2")]);
        assert_eq!(info.last_message_id, Some(MessageId::from("m2")));
        assert_eq!(GroupChatHashInfo::of(&chat(), &[]).last_message_id, None);
    }
}
