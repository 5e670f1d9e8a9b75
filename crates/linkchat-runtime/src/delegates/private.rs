//! Private chat delegate
//!
//! Two-party chats without a host. Each side stores the chat under its own id
//! `private:<other address>`, so inbound messages are re-keyed on arrival.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use linkchat_core::protocol::messages::{
    PrivateChatInitiation, PrivateChatMessage, PrivateInviteRequest, PrivateInviteResponse,
    PrivateMessage, UserInfoRequest, UserInfoResponse,
};
use linkchat_core::{
    user_hash, Chat, ChatId, LinkchatError, LinkchatResult, Message, MessageContent, MessageId,
    PeerAddress, PrivateChat, User,
};
use tracing::{debug, info, warn};

use crate::delegates::{DelegateContext, FileDelegate, InvitePolicy};

#[derive(Clone)]
pub struct PrivateDelegate {
    inner: Arc<PrivateInner>,
}

struct PrivateInner {
    ctx: DelegateContext,
    files: FileDelegate,
    policy: InvitePolicy,
    sent_invites: DashSet<PeerAddress>,
    received_invites: DashMap<PeerAddress, User>,
}

impl PrivateDelegate {
    pub fn new(ctx: DelegateContext, files: FileDelegate, policy: InvitePolicy) -> Self {
        Self {
            inner: Arc::new(PrivateInner {
                ctx,
                files,
                policy,
                sent_invites: DashSet::new(),
                received_invites: DashMap::new(),
            }),
        }
    }

    fn ctx(&self) -> &DelegateContext {
        &self.inner.ctx
    }

    /// Invite a peer to a private chat. Returns whether the invitation was sent.
    pub async fn invite(&self, peer: &PeerAddress) -> LinkchatResult<bool> {
        let user = self.ctx().local_user().await?;
        self.inner.sent_invites.insert(peer.clone());
        let sent = self
            .ctx()
            .send(peer, PrivateMessage::InviteRequest(PrivateInviteRequest { user }))
            .await;
        if !sent {
            self.inner.sent_invites.remove(peer);
        }
        Ok(sent)
    }

    /// Profiles of peers waiting for an answer to their invitation
    pub fn pending_invitations(&self) -> Vec<User> {
        self.inner
            .received_invites
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Answer a pending invitation
    pub async fn respond_to_invite(&self, peer: &PeerAddress, accept: bool) -> LinkchatResult<bool> {
        let Some((_, inviter)) = self.inner.received_invites.remove(peer) else {
            return Err(LinkchatError::chat_not_found(ChatId::private(peer).as_str()));
        };
        self.answer_invite(inviter, accept).await
    }

    /// Send a message to the peer of an existing private chat
    pub async fn send_message(
        &self,
        peer: &PeerAddress,
        content: Vec<MessageContent>,
        quoted_message_id: Option<MessageId>,
    ) -> LinkchatResult<Message> {
        let ctx = self.ctx();
        let chat_id = ChatId::private(peer);
        if !matches!(ctx.store.chat(&chat_id).await?, Some(Chat::Private(_))) {
            return Err(LinkchatError::chat_not_found(chat_id.as_str()));
        }

        let message = Message::plain(chat_id, ctx.local_address(), content, quoted_message_id);
        ctx.store.save_message(message.clone()).await?;
        let user = ctx.local_user().await?;
        let sent = ctx
            .send(
                peer,
                PrivateMessage::ChatMessage(PrivateChatMessage {
                    message: message.clone(),
                    user_hash: user_hash(&user),
                }),
            )
            .await;
        if !sent {
            warn!("{} unreachable, message {} kept locally", peer, message.id);
        }
        Ok(message)
    }

    pub async fn handle(&self, from: &PeerAddress, message: PrivateMessage) -> LinkchatResult<()> {
        match message {
            PrivateMessage::InviteRequest(request) => {
                if request.user.address != *from {
                    warn!("{} sent an invitation on behalf of {}", from, request.user.address);
                    return Ok(());
                }
                info!("{} invited us to a private chat", from);
                if self.inner.policy.auto_accept {
                    self.answer_invite(request.user, true).await?;
                } else {
                    self.inner.received_invites.insert(from.clone(), request.user);
                }
                Ok(())
            }
            PrivateMessage::InviteResponse(response) => self.on_invite_response(from, response).await,
            PrivateMessage::ChatInitiation(PrivateChatInitiation { user }) => {
                if user.address != *from {
                    return Ok(());
                }
                self.establish(user).await
            }
            PrivateMessage::ChatMessage(message) => self.on_chat_message(from, message).await,
            PrivateMessage::UserInfoRequest(_) => {
                let user = self.ctx().local_user().await?;
                self.ctx()
                    .send(from, PrivateMessage::UserInfoResponse(UserInfoResponse { user }))
                    .await;
                Ok(())
            }
            PrivateMessage::UserInfoResponse(UserInfoResponse { user }) => {
                if user.address != *from {
                    warn!("{} sent the profile of {}", from, user.address);
                    return Ok(());
                }
                self.ctx().store.save_user(user.clone()).await?;
                self.inner.files.fetch_user_picture(&user).await;
                Ok(())
            }
        }
    }

    async fn on_invite_response(
        &self,
        from: &PeerAddress,
        response: PrivateInviteResponse,
    ) -> LinkchatResult<()> {
        if self.inner.sent_invites.remove(from).is_none() {
            warn!("Unsolicited private invitation answer from {}", from);
            return Ok(());
        }
        if !response.accepted {
            info!("{} declined the private chat", from);
            return Ok(());
        }
        let Some(user) = response.user.filter(|user| user.address == *from) else {
            warn!("{} accepted without a valid profile", from);
            return Ok(());
        };

        self.establish(user).await?;
        let local = self.ctx().local_user().await?;
        self.ctx()
            .send(
                from,
                PrivateMessage::ChatInitiation(PrivateChatInitiation { user: local }),
            )
            .await;
        Ok(())
    }

    async fn on_chat_message(
        &self,
        from: &PeerAddress,
        chat_message: PrivateChatMessage,
    ) -> LinkchatResult<()> {
        let ctx = self.ctx();
        let PrivateChatMessage {
            mut message,
            user_hash: sender_hash,
        } = chat_message;
        let chat_id = ChatId::private(from);
        if ctx.store.chat(&chat_id).await?.is_none() {
            debug!("Dropping message from {} without a chat", from);
            return Ok(());
        }
        if message.author != *from {
            warn!("Rejecting message {} forged by {}", message.id, from);
            return Ok(());
        }

        message.chat_id = chat_id;
        if !ctx.store.save_message(message.clone()).await? {
            return Ok(());
        }

        let known_hash = ctx.store.user(from).await?.as_ref().map(user_hash);
        if known_hash != Some(sender_hash) {
            debug!("Profile of {} changed, requesting it", from);
            ctx.send(from, PrivateMessage::UserInfoRequest(UserInfoRequest::default()))
                .await;
        }
        self.inner.files.fetch_attachments(&message, from).await;
        Ok(())
    }

    async fn answer_invite(&self, inviter: User, accept: bool) -> LinkchatResult<bool> {
        let peer = inviter.address.clone();
        let response = if accept {
            self.establish(inviter).await?;
            PrivateInviteResponse {
                accepted: true,
                user: Some(self.ctx().local_user().await?),
            }
        } else {
            PrivateInviteResponse {
                accepted: false,
                user: None,
            }
        };
        Ok(self
            .ctx()
            .send(&peer, PrivateMessage::InviteResponse(response))
            .await)
    }

    /// Save the peer's profile and make sure the chat exists
    async fn establish(&self, user: User) -> LinkchatResult<()> {
        let store = &self.ctx().store;
        let chat_id = ChatId::private(&user.address);
        store.save_user(user.clone()).await?;
        if store.chat(&chat_id).await?.is_none() {
            store
                .save_chat(Chat::Private(PrivateChat {
                    user: user.address.clone(),
                }))
                .await?;
            info!("Private chat with {} established", user.address);
        }
        self.inner.files.fetch_user_picture(&user).await;
        Ok(())
    }
}
