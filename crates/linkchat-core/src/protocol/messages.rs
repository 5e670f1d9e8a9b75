//! Protocol message catalogue
//!
//! Every message that can travel inside an envelope is a variant of
//! [`ProtocolMessage`]. The type tag is the only runtime discriminator on the
//! wire; [`ProtocolMessage::from_parts`] is the single place that maps tags
//! back to payload types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, GroupChatHashInfo};
use crate::errors::CodecError;
use crate::model::{FileType, GroupChat, Message, User};
use crate::types::ChatId;

// ----------------------------------------------------------------------------
// Common Payloads
// ----------------------------------------------------------------------------

/// Opening message of the per-connection handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionRequest {
    /// Requester's own profile digest
    pub user_hash: Digest,
    /// Digest of the responder's profile as the requester knows it
    pub known_user_hash: Option<Digest>,
    /// Chats hosted by the responder that the requester holds as a member
    pub chat_digests: Vec<GroupChatHashInfo>,
    /// Chats hosted by the requester that list the responder as a member
    pub hosted_member_chat_ids: Vec<ChatId>,
}

/// Host's answer for one chat digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChatSync {
    /// Snapshot plus the history the requester has not seen
    #[serde(rename_all = "camelCase")]
    Updated {
        chat: GroupChat,
        chat_hash: Digest,
        messages: Vec<Message>,
    },
    /// Tombstone: the chat no longer exists on the host
    #[serde(rename_all = "camelCase")]
    Deleted { chat_id: ChatId },
}

/// Whether the responder still considers itself a member of a hosted chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipStatus {
    pub chat_id: ChatId,
    pub is_member: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionResponse {
    /// Responder's profile, present only when the requester's copy is stale
    pub user: Option<User>,
    pub chat_updates: Vec<ChatSync>,
    pub memberships: Vec<MembershipStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub file_type: FileType,
    pub chat_id: Option<ChatId>,
    pub file_name: String,
}

/// Header of a file transfer; exactly `file_size` raw bytes follow on the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub file_type: FileType,
    pub chat_id: Option<ChatId>,
    pub file_name: String,
    pub file_size: u64,
}

/// Messages shared by every chat kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonMessage {
    InitConnectionRequest(InitConnectionRequest),
    InitConnectionResponse(InitConnectionResponse),
    FileRequest(FileRequest),
    FileResponse(FileResponse),
}

// ----------------------------------------------------------------------------
// Group Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInviteRequest {
    pub chat: GroupChat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInviteResponse {
    pub chat_id: ChatId,
    pub accepted: bool,
}

/// Full snapshot sent to a member that just joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatInitiation {
    pub chat: GroupChat,
    pub chat_hash: Digest,
    pub messages: Vec<Message>,
}

/// Host-authored or host-relayed message, stamped with the host's chat digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostChatMessage {
    pub message: Message,
    pub chat_hash: Digest,
}

/// Member-authored message on its way to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChatMessage {
    pub message: Message,
    pub user_hash: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfoRequest {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfoResponse {
    pub chat: GroupChat,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoResponse {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReady {
    pub chat_id: ChatId,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveChatRequest {
    pub chat_id: ChatId,
}

/// Host-mediated group chat messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMessage {
    InviteRequest(GroupInviteRequest),
    InviteResponse(GroupInviteResponse),
    ChatInitiation(GroupChatInitiation),
    HostChatMessage(HostChatMessage),
    ClientChatMessage(ClientChatMessage),
    ChatInfoRequest(ChatInfoRequest),
    ChatInfoResponse(ChatInfoResponse),
    UserInfoRequest(UserInfoRequest),
    UserInfoResponse(UserInfoResponse),
    FileReady(FileReady),
    LeaveChatRequest(LeaveChatRequest),
}

// ----------------------------------------------------------------------------
// Private Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateInviteRequest {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateInviteResponse {
    pub accepted: bool,
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChatInitiation {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChatMessage {
    pub message: Message,
    pub user_hash: Digest,
}

/// Two-party chat messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateMessage {
    InviteRequest(PrivateInviteRequest),
    InviteResponse(PrivateInviteResponse),
    ChatInitiation(PrivateChatInitiation),
    ChatMessage(PrivateChatMessage),
    UserInfoRequest(UserInfoRequest),
    UserInfoResponse(UserInfoResponse),
}

// ----------------------------------------------------------------------------
// Protocol Message
// ----------------------------------------------------------------------------

/// Any message carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Common(CommonMessage),
    Group(GroupMessage),
    Private(PrivateMessage),
}

pub mod tags {
    pub const INIT_CONNECTION_REQUEST: &str = "Common.InitConnection.Request";
    pub const INIT_CONNECTION_RESPONSE: &str = "Common.InitConnection.Response";
    pub const FILE_REQUEST: &str = "Common.File.Request";
    pub const FILE_RESPONSE: &str = "Common.File.Response";

    pub const GROUP_INVITE_REQUEST: &str = "Group.InviteToChat.Request";
    pub const GROUP_INVITE_RESPONSE: &str = "Group.InviteToChat.Response";
    pub const GROUP_CHAT_INITIATION: &str = "Group.ChatInitiationMessage";
    pub const GROUP_HOST_CHAT_MESSAGE: &str = "Group.HostChatMessage";
    pub const GROUP_CLIENT_CHAT_MESSAGE: &str = "Group.ClientChatMessage";
    pub const GROUP_CHAT_INFO_REQUEST: &str = "Group.ChatInfo.Request";
    pub const GROUP_CHAT_INFO_RESPONSE: &str = "Group.ChatInfo.Response";
    pub const GROUP_USER_INFO_REQUEST: &str = "Group.UserInfo.Request";
    pub const GROUP_USER_INFO_RESPONSE: &str = "Group.UserInfo.Response";
    pub const GROUP_FILE_READY: &str = "Group.FileReady";
    pub const GROUP_LEAVE_CHAT_REQUEST: &str = "Group.LeaveChatRequest";

    pub const PRIVATE_INVITE_REQUEST: &str = "Private.InviteToChat.Request";
    pub const PRIVATE_INVITE_RESPONSE: &str = "Private.InviteToChat.Response";
    pub const PRIVATE_CHAT_INITIATION: &str = "Private.ChatInitiationMessage";
    pub const PRIVATE_CHAT_MESSAGE: &str = "Private.ChatMessage";
    pub const PRIVATE_USER_INFO_REQUEST: &str = "Private.UserInfo.Request";
    pub const PRIVATE_USER_INFO_RESPONSE: &str = "Private.UserInfo.Response";
}

fn parse<T: DeserializeOwned>(type_tag: &str, payload: &str) -> Result<T, CodecError> {
    serde_json::from_str(payload).map_err(|source| CodecError::InvalidPayload {
        type_tag: type_tag.to_string(),
        source,
    })
}

fn render<T: Serialize>(payload: &T) -> Result<String, CodecError> {
    serde_json::to_string(payload).map_err(CodecError::Serialize)
}

impl ProtocolMessage {
    /// Wire type tag of this message
    pub fn type_tag(&self) -> &'static str {
        use tags::*;
        match self {
            ProtocolMessage::Common(m) => match m {
                CommonMessage::InitConnectionRequest(_) => INIT_CONNECTION_REQUEST,
                CommonMessage::InitConnectionResponse(_) => INIT_CONNECTION_RESPONSE,
                CommonMessage::FileRequest(_) => FILE_REQUEST,
                CommonMessage::FileResponse(_) => FILE_RESPONSE,
            },
            ProtocolMessage::Group(m) => match m {
                GroupMessage::InviteRequest(_) => GROUP_INVITE_REQUEST,
                GroupMessage::InviteResponse(_) => GROUP_INVITE_RESPONSE,
                GroupMessage::ChatInitiation(_) => GROUP_CHAT_INITIATION,
                GroupMessage::HostChatMessage(_) => GROUP_HOST_CHAT_MESSAGE,
                GroupMessage::ClientChatMessage(_) => GROUP_CLIENT_CHAT_MESSAGE,
                GroupMessage::ChatInfoRequest(_) => GROUP_CHAT_INFO_REQUEST,
                GroupMessage::ChatInfoResponse(_) => GROUP_CHAT_INFO_RESPONSE,
                GroupMessage::UserInfoRequest(_) => GROUP_USER_INFO_REQUEST,
                GroupMessage::UserInfoResponse(_) => GROUP_USER_INFO_RESPONSE,
                GroupMessage::FileReady(_) => GROUP_FILE_READY,
                GroupMessage::LeaveChatRequest(_) => GROUP_LEAVE_CHAT_REQUEST,
            },
            ProtocolMessage::Private(m) => match m {
                PrivateMessage::InviteRequest(_) => PRIVATE_INVITE_REQUEST,
                PrivateMessage::InviteResponse(_) => PRIVATE_INVITE_RESPONSE,
                PrivateMessage::ChatInitiation(_) => PRIVATE_CHAT_INITIATION,
                PrivateMessage::ChatMessage(_) => PRIVATE_CHAT_MESSAGE,
                PrivateMessage::UserInfoRequest(_) => PRIVATE_USER_INFO_REQUEST,
                PrivateMessage::UserInfoResponse(_) => PRIVATE_USER_INFO_RESPONSE,
            },
        }
    }

    /// Serialize the payload to JSON
    pub fn payload_json(&self) -> Result<String, CodecError> {
        match self {
            ProtocolMessage::Common(m) => match m {
                CommonMessage::InitConnectionRequest(p) => render(p),
                CommonMessage::InitConnectionResponse(p) => render(p),
                CommonMessage::FileRequest(p) => render(p),
                CommonMessage::FileResponse(p) => render(p),
            },
            ProtocolMessage::Group(m) => match m {
                GroupMessage::InviteRequest(p) => render(p),
                GroupMessage::InviteResponse(p) => render(p),
                GroupMessage::ChatInitiation(p) => render(p),
                GroupMessage::HostChatMessage(p) => render(p),
                GroupMessage::ClientChatMessage(p) => render(p),
                GroupMessage::ChatInfoRequest(p) => render(p),
                GroupMessage::ChatInfoResponse(p) => render(p),
                GroupMessage::UserInfoRequest(p) => render(p),
                GroupMessage::UserInfoResponse(p) => render(p),
                GroupMessage::FileReady(p) => render(p),
                GroupMessage::LeaveChatRequest(p) => render(p),
            },
            ProtocolMessage::Private(m) => match m {
                PrivateMessage::InviteRequest(p) => render(p),
                PrivateMessage::InviteResponse(p) => render(p),
                PrivateMessage::ChatInitiation(p) => render(p),
                PrivateMessage::ChatMessage(p) => render(p),
                PrivateMessage::UserInfoRequest(p) => render(p),
                PrivateMessage::UserInfoResponse(p) => render(p),
            },
        }
    }

    /// Rebuild a message from its type tag and JSON payload
    pub fn from_parts(type_tag: &str, payload: &str) -> Result<Self, CodecError> {
        use tags::*;
        let message = match type_tag {
            INIT_CONNECTION_REQUEST => ProtocolMessage::Common(
                CommonMessage::InitConnectionRequest(parse(type_tag, payload)?),
            ),
            INIT_CONNECTION_RESPONSE => ProtocolMessage::Common(
                CommonMessage::InitConnectionResponse(parse(type_tag, payload)?),
            ),
            FILE_REQUEST => {
                ProtocolMessage::Common(CommonMessage::FileRequest(parse(type_tag, payload)?))
            }
            FILE_RESPONSE => {
                ProtocolMessage::Common(CommonMessage::FileResponse(parse(type_tag, payload)?))
            }

            GROUP_INVITE_REQUEST => {
                ProtocolMessage::Group(GroupMessage::InviteRequest(parse(type_tag, payload)?))
            }
            GROUP_INVITE_RESPONSE => {
                ProtocolMessage::Group(GroupMessage::InviteResponse(parse(type_tag, payload)?))
            }
            GROUP_CHAT_INITIATION => {
                ProtocolMessage::Group(GroupMessage::ChatInitiation(parse(type_tag, payload)?))
            }
            GROUP_HOST_CHAT_MESSAGE => {
                ProtocolMessage::Group(GroupMessage::HostChatMessage(parse(type_tag, payload)?))
            }
            GROUP_CLIENT_CHAT_MESSAGE => {
                ProtocolMessage::Group(GroupMessage::ClientChatMessage(parse(type_tag, payload)?))
            }
            GROUP_CHAT_INFO_REQUEST => {
                ProtocolMessage::Group(GroupMessage::ChatInfoRequest(parse(type_tag, payload)?))
            }
            GROUP_CHAT_INFO_RESPONSE => {
                ProtocolMessage::Group(GroupMessage::ChatInfoResponse(parse(type_tag, payload)?))
            }
            GROUP_USER_INFO_REQUEST => {
                ProtocolMessage::Group(GroupMessage::UserInfoRequest(parse(type_tag, payload)?))
            }
            GROUP_USER_INFO_RESPONSE => {
                ProtocolMessage::Group(GroupMessage::UserInfoResponse(parse(type_tag, payload)?))
            }
            GROUP_FILE_READY => {
                ProtocolMessage::Group(GroupMessage::FileReady(parse(type_tag, payload)?))
            }
            GROUP_LEAVE_CHAT_REQUEST => {
                ProtocolMessage::Group(GroupMessage::LeaveChatRequest(parse(type_tag, payload)?))
            }

            PRIVATE_INVITE_REQUEST => {
                ProtocolMessage::Private(PrivateMessage::InviteRequest(parse(type_tag, payload)?))
            }
            PRIVATE_INVITE_RESPONSE => {
                ProtocolMessage::Private(PrivateMessage::InviteResponse(parse(type_tag, payload)?))
            }
            PRIVATE_CHAT_INITIATION => {
                ProtocolMessage::Private(PrivateMessage::ChatInitiation(parse(type_tag, payload)?))
            }
            PRIVATE_CHAT_MESSAGE => {
                ProtocolMessage::Private(PrivateMessage::ChatMessage(parse(type_tag, payload)?))
            }
            PRIVATE_USER_INFO_REQUEST => ProtocolMessage::Private(
                PrivateMessage::UserInfoRequest(parse(type_tag, payload)?),
            ),
            PRIVATE_USER_INFO_RESPONSE => ProtocolMessage::Private(
                PrivateMessage::UserInfoResponse(parse(type_tag, payload)?),
            ),

            unknown => return Err(CodecError::UnknownType(unknown.to_string())),
        };
        Ok(message)
    }

    /// Chat a group or private message refers to, if any
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            ProtocolMessage::Common(CommonMessage::FileRequest(p)) => p.chat_id.as_ref(),
            ProtocolMessage::Common(CommonMessage::FileResponse(p)) => p.chat_id.as_ref(),
            ProtocolMessage::Common(_) => None,
            ProtocolMessage::Group(m) => match m {
                GroupMessage::InviteRequest(p) => Some(&p.chat.id),
                GroupMessage::InviteResponse(p) => Some(&p.chat_id),
                GroupMessage::ChatInitiation(p) => Some(&p.chat.id),
                GroupMessage::HostChatMessage(p) => Some(&p.message.chat_id),
                GroupMessage::ClientChatMessage(p) => Some(&p.message.chat_id),
                GroupMessage::ChatInfoRequest(p) => Some(&p.chat_id),
                GroupMessage::ChatInfoResponse(p) => Some(&p.chat.id),
                GroupMessage::FileReady(p) => Some(&p.chat_id),
                GroupMessage::LeaveChatRequest(p) => Some(&p.chat_id),
                GroupMessage::UserInfoRequest(_) | GroupMessage::UserInfoResponse(_) => None,
            },
            ProtocolMessage::Private(PrivateMessage::ChatMessage(p)) => Some(&p.message.chat_id),
            ProtocolMessage::Private(_) => None,
        }
    }
}

impl From<CommonMessage> for ProtocolMessage {
    fn from(message: CommonMessage) -> Self {
        ProtocolMessage::Common(message)
    }
}

impl From<GroupMessage> for ProtocolMessage {
    fn from(message: GroupMessage) -> Self {
        ProtocolMessage::Group(message)
    }
}

impl From<PrivateMessage> for ProtocolMessage {
    fn from(message: PrivateMessage) -> Self {
        ProtocolMessage::Private(message)
    }
}

