//! Chat domain model shared by every device
//!
//! These are the entities the persistence collaborator stores and the
//! synchronization protocol ships around: users, chats and the append-only
//! message history of each chat.

use serde::{Deserialize, Serialize};

use crate::types::{ChatId, MessageId, PeerAddress, Timestamp};

// ----------------------------------------------------------------------------
// Users
// ----------------------------------------------------------------------------

/// Public profile of a device owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Device address the profile belongs to
    pub address: PeerAddress,
    /// Display name
    pub name: String,
    /// File name of the profile picture, if any
    pub picture: Option<String>,
}

impl User {
    /// Create a user without a picture
    pub fn new<S: Into<String>>(address: PeerAddress, name: S) -> Self {
        Self {
            address,
            name: name.into(),
            picture: None,
        }
    }

    /// Attach a profile picture
    pub fn with_picture<S: Into<String>>(mut self, picture: S) -> Self {
        self.picture = Some(picture.into());
        self
    }
}

// ----------------------------------------------------------------------------
// Chats
// ----------------------------------------------------------------------------

/// A conversation, either with one peer or a hosted group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Chat {
    Private(PrivateChat),
    Group(GroupChat),
}

impl Chat {
    /// Local id of the chat
    pub fn id(&self) -> ChatId {
        match self {
            Chat::Private(chat) => ChatId::private(&chat.user),
            Chat::Group(chat) => chat.id.clone(),
        }
    }

    /// Take the group variant
    pub fn into_group(self) -> Option<GroupChat> {
        match self {
            Chat::Group(chat) => Some(chat),
            Chat::Private(_) => None,
        }
    }
}

/// Two-party chat keyed by the other party's address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChat {
    pub user: PeerAddress,
}

/// Group chat with a single authoritative host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChat {
    pub id: ChatId,
    pub host_address: PeerAddress,
    pub name: String,
    pub picture: Option<String>,
    /// Members including the host
    pub users: Vec<PeerAddress>,
    /// `false` once the chat was deleted or the local user was evicted
    pub exists: bool,
}

impl GroupChat {
    /// Create a new group hosted by `host`, who is its first member
    pub fn new<S: Into<String>>(host: PeerAddress, name: S) -> Self {
        Self {
            id: ChatId::generate(),
            host_address: host.clone(),
            name: name.into(),
            picture: None,
            users: vec![host],
            exists: true,
        }
    }

    /// Whether `address` hosts this chat
    pub fn is_host(&self, address: &PeerAddress) -> bool {
        &self.host_address == address
    }

    /// Whether `address` is a member
    pub fn is_member(&self, address: &PeerAddress) -> bool {
        self.users.iter().any(|user| user == address)
    }

    /// Add a member, keeping the list free of duplicates
    pub fn add_user(&mut self, address: PeerAddress) -> bool {
        if self.is_member(&address) {
            return false;
        }
        self.users.push(address);
        true
    }

    /// Remove a member
    pub fn remove_user(&mut self, address: &PeerAddress) -> bool {
        let before = self.users.len();
        self.users.retain(|user| user != address);
        self.users.len() != before
    }

    /// Members a host relays a message to: everyone except the host itself
    /// and the listed addresses
    pub fn fan_out_targets(&self, exclude: &[&PeerAddress]) -> Vec<PeerAddress> {
        self.users
            .iter()
            .filter(|user| **user != self.host_address)
            .filter(|user| !exclude.contains(user))
            .cloned()
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// One entry of a chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub author: PeerAddress,
    pub timestamp: Timestamp,
    pub body: MessageBody,
}

impl Message {
    /// Create a user-authored message
    pub fn plain(
        chat_id: ChatId,
        author: PeerAddress,
        content: Vec<MessageContent>,
        quoted_message_id: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            chat_id,
            author,
            timestamp: Timestamp::now(),
            body: MessageBody::Plain {
                content,
                quoted_message_id,
            },
        }
    }

    /// Create a membership or metadata change record
    pub fn group_update(
        chat_id: ChatId,
        author: PeerAddress,
        update_type: GroupUpdateType,
        target_address: Option<PeerAddress>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            chat_id,
            author,
            timestamp: Timestamp::now(),
            body: MessageBody::GroupUpdate {
                update_type,
                target_address,
            },
        }
    }

    /// File names of attachments referenced by this message
    pub fn attachments(&self) -> Vec<&str> {
        match &self.body {
            MessageBody::Plain { content, .. } => content
                .iter()
                .filter_map(MessageContent::file_name)
                .collect(),
            MessageBody::GroupUpdate { .. } => Vec::new(),
        }
    }

    /// Whether applying this message changes chat metadata
    pub fn changes_metadata(&self) -> bool {
        matches!(self.body, MessageBody::GroupUpdate { .. })
    }
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    #[serde(rename_all = "camelCase")]
    Plain {
        content: Vec<MessageContent>,
        quoted_message_id: Option<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    GroupUpdate {
        update_type: GroupUpdateType,
        target_address: Option<PeerAddress>,
    },
}

/// One part of a plain message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text { text: String },
    #[serde(rename_all = "camelCase")]
    Image { file_name: String },
    #[serde(rename_all = "camelCase")]
    File { file_name: String, size: u64 },
}

impl MessageContent {
    /// Text part
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// Attachment file name, if this part references a file
    pub fn file_name(&self) -> Option<&str> {
        match self {
            MessageContent::Text { .. } => None,
            MessageContent::Image { file_name } | MessageContent::File { file_name, .. } => {
                Some(file_name)
            }
        }
    }
}

/// Kinds of group history records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupUpdateType {
    ChatCreated,
    UserInvited,
    UserRemoved,
    UserLeft,
    NameChanged,
    PictureChanged,
    ChatClosed,
}

// ----------------------------------------------------------------------------
// Files
// ----------------------------------------------------------------------------

/// What a transferred file is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    UserPicture,
    ChatPicture,
    Attachment,
}

/// Everything the local file store needs to resolve a file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub file_type: FileType,
    pub chat_id: Option<ChatId>,
    /// Profile owner for user pictures
    pub owner: Option<PeerAddress>,
    pub file_name: String,
}

impl FileDescriptor {
    /// Profile picture of `owner`
    pub fn user_picture<S: Into<String>>(owner: PeerAddress, file_name: S) -> Self {
        Self {
            file_type: FileType::UserPicture,
            chat_id: None,
            owner: Some(owner),
            file_name: file_name.into(),
        }
    }

    /// Picture of a group chat
    pub fn chat_picture<S: Into<String>>(chat_id: ChatId, file_name: S) -> Self {
        Self {
            file_type: FileType::ChatPicture,
            chat_id: Some(chat_id),
            owner: None,
            file_name: file_name.into(),
        }
    }

    /// Attachment of a chat message
    pub fn attachment<S: Into<String>>(chat_id: ChatId, file_name: S) -> Self {
        Self {
            file_type: FileType::Attachment,
            chat_id: Some(chat_id),
            owner: None,
            file_name: file_name.into(),
        }
    }

    /// Relative storage path: per-user or per-chat folder plus file name
    pub fn relative_path(&self) -> String {
        match (&self.file_type, &self.chat_id, &self.owner) {
            (FileType::UserPicture, _, Some(owner)) => {
                format!("users/{}/{}", hex::encode(owner.as_str()), self.file_name)
            }
            (_, Some(chat_id), _) => {
                format!("chats/{}/{}", hex::encode(chat_id.as_str()), self.file_name)
            }
            _ => format!("misc/{}", self.file_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn test_fan_out_excludes_host_and_sender() {
        let mut chat = GroupChat::new(addr("host"), "team");
        chat.add_user(addr("a"));
        chat.add_user(addr("b"));
        chat.add_user(addr("c"));

        let targets = chat.fan_out_targets(&[&addr("b")]);
        assert_eq!(targets, vec![addr("a"), addr("c")]);
    }

    #[test]
    fn test_add_user_is_idempotent() {
        let mut chat = GroupChat::new(addr("host"), "team");
        assert!(chat.add_user(addr("a")));
        assert!(!chat.add_user(addr("a")));
        assert_eq!(chat.users.len(), 2);
        assert!(chat.remove_user(&addr("a")));
        assert!(!chat.is_member(&addr("a")));
    }

    #[test]
    fn test_attachments_lists_file_parts_only() {
        let message = Message::plain(
            ChatId::from("c"),
            addr("a"),
            vec![
                MessageContent::text("look"),
                MessageContent::Image {
                    file_name: "cat.png".into(),
                },
                MessageContent::File {
                    file_name: "notes.txt".into(),
                    size: 12,
                },
            ],
            None,
        );
        assert_eq!(message.attachments(), vec!["cat.png", "notes.txt"]);
        assert!(!message.changes_metadata());
    }

    #[test]
    fn test_relative_paths_are_scoped() {
        let user = FileDescriptor::user_picture(addr("a/b"), "me.png");
        let chat = FileDescriptor::attachment(ChatId::from("c1"), "x.bin");
        assert!(user.relative_path().starts_with("users/"));
        assert!(!user.relative_path().contains("a/b"));
        assert!(chat.relative_path().starts_with("chats/"));
        assert!(chat.relative_path().ends_with("/x.bin"));
    }
}
