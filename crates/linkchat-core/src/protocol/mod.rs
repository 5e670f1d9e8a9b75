//! linkchat wire protocol
//!
//! - `messages`: the catalogue of protocol messages and their type tags
//! - `envelope`: versioned envelope encoding and the version gate
//! - `frame`: start/end token framing on the byte stream

pub mod envelope;
pub mod frame;
pub mod messages;

pub use envelope::{decode, decode_frame, encode, Decoded, Envelope, DIVIDER, PROTOCOL_VERSION};
pub use frame::{frame, FrameBuffer, END_TOKEN, START_TOKEN};
pub use messages::{
    ChatInfoRequest, ChatInfoResponse, ChatSync, ClientChatMessage, CommonMessage, FileReady,
    FileRequest, FileResponse, GroupChatInitiation, GroupInviteRequest, GroupInviteResponse,
    GroupMessage, HostChatMessage, InitConnectionRequest, InitConnectionResponse,
    LeaveChatRequest, MembershipStatus, PrivateChatInitiation,
    PrivateChatMessage, PrivateInviteRequest, PrivateInviteResponse, PrivateMessage,
    ProtocolMessage, UserInfoRequest, UserInfoResponse,
};
