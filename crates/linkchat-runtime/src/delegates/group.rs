//! Group chat delegate
//!
//! Group chats use a star topology: one host per chat, and every mutation
//! flows through the host. Members send `ClientChatMessage` to the host, which
//! validates, appends and relays the message to everyone else as
//! `HostChatMessage` carrying the chat digest. Membership and metadata changes
//! are ordinary `GroupUpdate` history entries distributed the same way, so
//! they keep their order relative to plain messages.
//!
//! A digest mismatch on an inbound `HostChatMessage` makes the member pull a
//! full `ChatInfo.Response`; a profile digest mismatch on an inbound
//! `ClientChatMessage` makes the host pull a `UserInfo.Response`.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use linkchat_core::protocol::messages::{
    ChatInfoRequest, ChatInfoResponse, ClientChatMessage, FileReady, GroupChatInitiation,
    GroupInviteRequest, GroupInviteResponse, GroupMessage, HostChatMessage, LeaveChatRequest,
    UserInfoRequest, UserInfoResponse,
};
use linkchat_core::{
    chat_hash, user_hash, Chat, ChatId, Digest, FileDescriptor, GroupChat, GroupUpdateType,
    LinkchatError, LinkchatResult, Message, MessageBody, MessageContent, MessageId, PeerAddress,
};
use tracing::{debug, info, warn};

use crate::delegates::{DelegateContext, FileDelegate, InvitePolicy};

#[derive(Clone)]
pub struct GroupDelegate {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    ctx: DelegateContext,
    files: FileDelegate,
    policy: InvitePolicy,
    /// Invitations sent by this host and not answered yet
    sent_invites: DashSet<(ChatId, PeerAddress)>,
    /// Invitations waiting for the local user's answer
    received_invites: DashMap<ChatId, (PeerAddress, GroupChat)>,
}

impl GroupDelegate {
    pub fn new(ctx: DelegateContext, files: FileDelegate, policy: InvitePolicy) -> Self {
        Self {
            inner: Arc::new(GroupInner {
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

    // ------------------------------------------------------------------------
    // Host Operations
    // ------------------------------------------------------------------------

    /// Create a chat hosted by the local device and invite `invitees`
    pub async fn create_chat<S: Into<String>>(
        &self,
        name: S,
        invitees: &[PeerAddress],
    ) -> LinkchatResult<GroupChat> {
        let ctx = self.ctx();
        let chat = GroupChat::new(ctx.local_address(), name);
        ctx.store.save_chat(Chat::Group(chat.clone())).await?;
        self.append_update(&chat, GroupUpdateType::ChatCreated, None)
            .await?;
        info!("Created group chat {} ({})", chat.name, chat.id);

        for invitee in invitees {
            if !self.invite(&chat.id, invitee).await? {
                warn!("Could not invite {} to {}", invitee, chat.id);
            }
        }
        Ok(chat)
    }

    /// Invite a peer to a hosted chat. Returns whether the invitation was sent.
    pub async fn invite(&self, chat_id: &ChatId, address: &PeerAddress) -> LinkchatResult<bool> {
        let chat = self.hosted_chat(chat_id).await?;
        if chat.is_member(address) {
            debug!("{} is already a member of {}", address, chat_id);
            return Ok(false);
        }

        let key = (chat_id.clone(), address.clone());
        self.inner.sent_invites.insert(key.clone());
        let sent = self
            .ctx()
            .send(address, GroupMessage::InviteRequest(GroupInviteRequest { chat }))
            .await;
        if !sent {
            self.inner.sent_invites.remove(&key);
        }
        Ok(sent)
    }

    /// Remove a member from a hosted chat
    pub async fn remove_user(&self, chat_id: &ChatId, address: &PeerAddress) -> LinkchatResult<()> {
        let chat = self.hosted_chat(chat_id).await?;
        if chat.is_host(address) {
            return Err(LinkchatError::not_permitted(
                "the host cannot remove itself, leave the chat instead",
            ));
        }
        self.remove_member(chat, address, GroupUpdateType::UserRemoved)
            .await?;
        Ok(())
    }

    /// Rename a hosted chat
    pub async fn rename_chat<S: Into<String>>(&self, chat_id: &ChatId, name: S) -> LinkchatResult<()> {
        let mut chat = self.hosted_chat(chat_id).await?;
        chat.name = name.into();
        self.ctx().store.save_chat(Chat::Group(chat.clone())).await?;
        let update = self
            .append_update(&chat, GroupUpdateType::NameChanged, None)
            .await?;
        self.distribute(&chat, update, &[]).await?;
        Ok(())
    }

    /// Change or clear the picture of a hosted chat. The picture file must
    /// already be in the local file store.
    pub async fn set_chat_picture(
        &self,
        chat_id: &ChatId,
        picture: Option<String>,
    ) -> LinkchatResult<()> {
        let mut chat = self.hosted_chat(chat_id).await?;
        chat.picture = picture;
        self.ctx().store.save_chat(Chat::Group(chat.clone())).await?;
        let update = self
            .append_update(&chat, GroupUpdateType::PictureChanged, None)
            .await?;
        self.distribute(&chat, update, &[]).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Member Operations
    // ------------------------------------------------------------------------

    /// Invitations waiting for an answer
    pub fn pending_invitations(&self) -> Vec<GroupChat> {
        self.inner
            .received_invites
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect()
    }

    /// Answer a pending invitation. Returns whether the answer reached the host.
    pub async fn respond_to_invite(&self, chat_id: &ChatId, accept: bool) -> LinkchatResult<bool> {
        let Some((_, (host, _))) = self.inner.received_invites.remove(chat_id) else {
            return Err(LinkchatError::chat_not_found(chat_id.as_str()));
        };
        Ok(self.answer_invite(&host, chat_id, accept).await)
    }

    /// Send a message to a chat. The host relays it directly; a member hands
    /// it to the host.
    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        content: Vec<MessageContent>,
        quoted_message_id: Option<MessageId>,
    ) -> LinkchatResult<Message> {
        let ctx = self.ctx();
        let local = ctx.local_address();
        let chat = self.active_chat(chat_id).await?;
        if !chat.is_member(&local) {
            return Err(LinkchatError::not_permitted("not a member of this chat"));
        }

        let message = Message::plain(chat_id.clone(), local.clone(), content, quoted_message_id);
        ctx.store.save_message(message.clone()).await?;

        if chat.is_host(&local) {
            self.distribute(&chat, message.clone(), &[]).await?;
        } else {
            let user = ctx.local_user().await?;
            let sent = ctx
                .send(
                    &chat.host_address,
                    GroupMessage::ClientChatMessage(ClientChatMessage {
                        message: message.clone(),
                        user_hash: user_hash(&user),
                    }),
                )
                .await;
            if !sent {
                warn!(
                    "Host {} of {} unreachable, message {} kept locally",
                    chat.host_address, chat_id, message.id
                );
            }
        }
        Ok(message)
    }

    /// Leave a chat. A leaving host closes the chat for everyone.
    pub async fn leave_chat(&self, chat_id: &ChatId) -> LinkchatResult<()> {
        let ctx = self.ctx();
        let local = ctx.local_address();
        let chat = self.active_chat(chat_id).await?;

        if chat.is_host(&local) {
            let update = self
                .append_update(&chat, GroupUpdateType::ChatClosed, None)
                .await?;
            self.distribute(&chat, update, &[]).await?;
            info!("Closed group chat {}", chat_id);
        } else {
            let sent = ctx
                .send(
                    &chat.host_address,
                    GroupMessage::LeaveChatRequest(LeaveChatRequest {
                        chat_id: chat_id.clone(),
                    }),
                )
                .await;
            if !sent {
                debug!("Host offline, the next handshake reports the departure");
            }
            info!("Left group chat {}", chat_id);
        }
        self.deactivate(chat).await
    }

    /// Ask the host for a full snapshot of a chat
    pub async fn request_chat_info(&self, chat_id: &ChatId) -> LinkchatResult<bool> {
        let chat = self
            .ctx()
            .store
            .group_chat(chat_id)
            .await?
            .ok_or_else(|| LinkchatError::chat_not_found(chat_id.as_str()))?;
        Ok(self
            .ctx()
            .send(
                &chat.host_address,
                GroupMessage::ChatInfoRequest(ChatInfoRequest {
                    chat_id: chat_id.clone(),
                }),
            )
            .await)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub async fn handle(&self, from: &PeerAddress, message: GroupMessage) -> LinkchatResult<()> {
        match message {
            GroupMessage::InviteRequest(request) => self.on_invite_request(from, request).await,
            GroupMessage::InviteResponse(response) => self.on_invite_response(from, response).await,
            GroupMessage::ChatInitiation(initiation) => {
                self.on_chat_initiation(from, initiation).await
            }
            GroupMessage::HostChatMessage(message) => self.on_host_message(from, message).await,
            GroupMessage::ClientChatMessage(message) => self.on_client_message(from, message).await,
            GroupMessage::ChatInfoRequest(request) => self.on_chat_info_request(from, request).await,
            GroupMessage::ChatInfoResponse(response) => {
                self.on_chat_info_response(from, response).await
            }
            GroupMessage::UserInfoRequest(_) => {
                let user = self.ctx().local_user().await?;
                self.ctx()
                    .send(from, GroupMessage::UserInfoResponse(UserInfoResponse { user }))
                    .await;
                Ok(())
            }
            GroupMessage::UserInfoResponse(response) => self.on_user_info(from, response).await,
            GroupMessage::FileReady(ready) => self.on_file_ready(from, ready).await,
            GroupMessage::LeaveChatRequest(request) => {
                self.member_left(&request.chat_id, from).await?;
                Ok(())
            }
        }
    }

    async fn on_invite_request(
        &self,
        from: &PeerAddress,
        request: GroupInviteRequest,
    ) -> LinkchatResult<()> {
        let chat = request.chat;
        if !chat.is_host(from) {
            warn!("{} sent an invitation to {} it does not host", from, chat.id);
            return Ok(());
        }
        info!("{} invited us to {} ({})", from, chat.name, chat.id);
        if self.inner.policy.auto_accept {
            self.answer_invite(from, &chat.id, true).await;
        } else {
            self.inner
                .received_invites
                .insert(chat.id.clone(), (from.clone(), chat));
        }
        Ok(())
    }

    async fn on_invite_response(
        &self,
        from: &PeerAddress,
        response: GroupInviteResponse,
    ) -> LinkchatResult<()> {
        let key = (response.chat_id.clone(), from.clone());
        if self.inner.sent_invites.remove(&key).is_none() {
            warn!("Unsolicited invitation answer from {} for {}", from, response.chat_id);
            return Ok(());
        }
        if !response.accepted {
            info!("{} declined the invitation to {}", from, response.chat_id);
            return Ok(());
        }

        let mut chat = self.hosted_chat(&response.chat_id).await?;
        if !chat.add_user(from.clone()) {
            return Ok(());
        }
        let ctx = self.ctx();
        ctx.store.save_chat(Chat::Group(chat.clone())).await?;
        let update = self
            .append_update(&chat, GroupUpdateType::UserInvited, Some(from.clone()))
            .await?;

        let messages = ctx.store.messages(&chat.id).await?;
        let initiation = GroupChatInitiation {
            chat_hash: chat_hash(&chat, &messages),
            chat: chat.clone(),
            messages,
        };
        ctx.send(from, GroupMessage::ChatInitiation(initiation)).await;
        self.distribute(&chat, update, &[from]).await?;
        info!("{} joined {}", from, chat.id);
        Ok(())
    }

    async fn on_chat_initiation(
        &self,
        from: &PeerAddress,
        initiation: GroupChatInitiation,
    ) -> LinkchatResult<()> {
        let GroupChatInitiation {
            chat,
            chat_hash: expected,
            messages,
        } = initiation;
        if !chat.is_host(from) || !chat.is_member(&self.ctx().local_address()) {
            warn!("Ignoring chat initiation for {} from {}", chat.id, from);
            return Ok(());
        }

        // A re-invitation revives a chat the local user had left
        let chat = self.apply_snapshot(chat, messages).await?;
        self.check_hash(&chat, expected).await?;
        self.inner.files.fetch_chat_picture(&chat).await;
        Ok(())
    }

    async fn on_host_message(
        &self,
        from: &PeerAddress,
        host_message: HostChatMessage,
    ) -> LinkchatResult<()> {
        let HostChatMessage { message, chat_hash } = host_message;
        let Some(chat) = self.ctx().store.group_chat(&message.chat_id).await? else {
            debug!("Host message for unknown chat {}", message.chat_id);
            return Ok(());
        };
        if !chat.is_host(from) {
            warn!("{} relayed a message for {} it does not host", from, chat.id);
            return Ok(());
        }
        if !chat.exists {
            return Ok(());
        }

        let metadata_changed = message.changes_metadata();
        let chat = self.apply_delta(chat, message.clone()).await?;
        if !chat.exists {
            return Ok(());
        }
        self.check_hash(&chat, chat_hash).await?;

        // Attachments of relayed member messages are announced with FileReady
        if message.author == *from {
            self.inner.files.fetch_attachments(&message, from).await;
        }
        if metadata_changed {
            self.inner.files.fetch_chat_picture(&chat).await;
        }
        Ok(())
    }

    async fn on_client_message(
        &self,
        from: &PeerAddress,
        client_message: ClientChatMessage,
    ) -> LinkchatResult<()> {
        let ctx = self.ctx();
        let ClientChatMessage { message, user_hash: sender_hash } = client_message;
        let Some(chat) = ctx.store.group_chat(&message.chat_id).await? else {
            debug!("Client message for unknown chat {}", message.chat_id);
            return Ok(());
        };
        if !chat.is_host(&ctx.local_address()) || !chat.exists || !chat.is_member(from) {
            warn!("Rejecting message for {} from {}", chat.id, from);
            return Ok(());
        }
        if message.author != *from || message.changes_metadata() {
            warn!("Rejecting message {} forged by {}", message.id, from);
            return Ok(());
        }

        let known_hash = ctx.store.user(from).await?.as_ref().map(user_hash);
        if known_hash != Some(sender_hash) {
            debug!("Profile of {} changed, requesting it", from);
            ctx.send(from, GroupMessage::UserInfoRequest(UserInfoRequest::default()))
                .await;
        }

        if !ctx.store.save_message(message.clone()).await? {
            debug!("Duplicate message {} from {}", message.id, from);
            return Ok(());
        }
        self.distribute(&chat, message.clone(), &[from]).await?;
        self.announce_attachments(&chat.id, message, from.clone());
        Ok(())
    }

    async fn on_chat_info_request(
        &self,
        from: &PeerAddress,
        request: ChatInfoRequest,
    ) -> LinkchatResult<()> {
        let ctx = self.ctx();
        let Some(chat) = ctx.store.group_chat(&request.chat_id).await? else {
            return Ok(());
        };
        if !chat.is_host(&ctx.local_address()) || !chat.is_member(from) {
            debug!("Ignoring chat info request for {} from {}", chat.id, from);
            return Ok(());
        }
        let messages = ctx.store.messages(&chat.id).await?;
        ctx.send(
            from,
            GroupMessage::ChatInfoResponse(ChatInfoResponse { chat, messages }),
        )
        .await;
        Ok(())
    }

    async fn on_chat_info_response(
        &self,
        from: &PeerAddress,
        response: ChatInfoResponse,
    ) -> LinkchatResult<()> {
        let ChatInfoResponse { chat, messages } = response;
        if !chat.is_host(from) {
            warn!("{} sent chat info for {} it does not host", from, chat.id);
            return Ok(());
        }
        let local = self.ctx().store.group_chat(&chat.id).await?;
        if local.as_ref().is_some_and(|local| !local.exists) {
            debug!("Ignoring chat info for departed chat {}", chat.id);
            return Ok(());
        }
        if !chat.is_member(&self.ctx().local_address()) {
            if let Some(local) = local {
                info!("No longer a member of {}", local.id);
                self.deactivate(local).await?;
            }
            return Ok(());
        }

        let picture_changed = local.map_or(true, |local| local.picture != chat.picture);
        let chat = self.apply_snapshot(chat, messages).await?;
        if picture_changed {
            self.inner.files.fetch_chat_picture(&chat).await;
        }
        Ok(())
    }

    async fn on_user_info(&self, from: &PeerAddress, response: UserInfoResponse) -> LinkchatResult<()> {
        let user = response.user;
        if user.address != *from {
            warn!("{} sent the profile of {}", from, user.address);
            return Ok(());
        }
        self.ctx().store.save_user(user.clone()).await?;
        self.inner.files.fetch_user_picture(&user).await;
        Ok(())
    }

    async fn on_file_ready(&self, from: &PeerAddress, ready: FileReady) -> LinkchatResult<()> {
        let Some(chat) = self.ctx().store.group_chat(&ready.chat_id).await? else {
            return Ok(());
        };
        if !chat.is_host(from) || !chat.exists {
            return Ok(());
        }
        let descriptor = FileDescriptor::attachment(chat.id, ready.file_name);
        self.inner.files.request(descriptor, from).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Apply a digest update received during a handshake: save the metadata,
    /// append unseen messages in order and pull a full snapshot if the chat
    /// still differs from the host's copy
    pub(crate) async fn apply_digest_update(
        &self,
        from: &PeerAddress,
        chat: GroupChat,
        expected: Digest,
        messages: Vec<Message>,
    ) -> LinkchatResult<()> {
        let ctx = self.ctx();
        if !chat.is_host(from) {
            warn!("{} sent an update for {} it does not host", from, chat.id);
            return Ok(());
        }
        let local = ctx.store.group_chat(&chat.id).await?;
        if local.as_ref().is_some_and(|local| !local.exists) {
            debug!("Ignoring update for departed chat {}", chat.id);
            return Ok(());
        }
        if !chat.is_member(&ctx.local_address()) {
            if let Some(local) = local {
                info!("Evicted from {} while away", local.id);
                self.deactivate(local).await?;
            }
            return Ok(());
        }

        let picture_changed = local.map_or(true, |local| local.picture != chat.picture);
        ctx.store.save_chat(Chat::Group(chat.clone())).await?;
        for message in messages {
            ctx.store.save_message(message).await?;
        }
        self.check_hash(&chat, expected).await?;
        if picture_changed {
            self.inner.files.fetch_chat_picture(&chat).await;
        }
        Ok(())
    }

    /// Deactivate a chat its host reported as deleted
    pub(crate) async fn apply_tombstone(
        &self,
        from: &PeerAddress,
        chat_id: &ChatId,
    ) -> LinkchatResult<()> {
        let Some(chat) = self.ctx().store.group_chat(chat_id).await? else {
            return Ok(());
        };
        if !chat.is_host(from) || !chat.exists {
            return Ok(());
        }
        info!("Chat {} was deleted by its host", chat_id);
        self.deactivate(chat).await
    }

    /// Remove a departed member from a hosted chat and tell the others.
    /// Returns whether the member was removed.
    pub(crate) async fn member_left(
        &self,
        chat_id: &ChatId,
        address: &PeerAddress,
    ) -> LinkchatResult<bool> {
        let ctx = self.ctx();
        let Some(chat) = ctx.store.group_chat(chat_id).await? else {
            return Ok(false);
        };
        if !chat.is_host(&ctx.local_address()) || !chat.exists || chat.is_host(address) {
            return Ok(false);
        }
        self.remove_member(chat, address, GroupUpdateType::UserLeft)
            .await
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn answer_invite(&self, host: &PeerAddress, chat_id: &ChatId, accepted: bool) -> bool {
        let sent = self
            .ctx()
            .send(
                host,
                GroupMessage::InviteResponse(GroupInviteResponse {
                    chat_id: chat_id.clone(),
                    accepted,
                }),
            )
            .await;
        if !sent {
            warn!("Could not answer the invitation to {}", chat_id);
        }
        sent
    }

    /// An active chat hosted by the local device
    async fn hosted_chat(&self, chat_id: &ChatId) -> LinkchatResult<GroupChat> {
        let chat = self.active_chat(chat_id).await?;
        if !chat.is_host(&self.ctx().local_address()) {
            return Err(LinkchatError::not_permitted("only the host can change a group chat"));
        }
        Ok(chat)
    }

    async fn active_chat(&self, chat_id: &ChatId) -> LinkchatResult<GroupChat> {
        match self.ctx().store.group_chat(chat_id).await? {
            Some(chat) if chat.exists => Ok(chat),
            _ => Err(LinkchatError::chat_not_found(chat_id.as_str())),
        }
    }

    async fn append_update(
        &self,
        chat: &GroupChat,
        update_type: GroupUpdateType,
        target: Option<PeerAddress>,
    ) -> LinkchatResult<Message> {
        let message = Message::group_update(
            chat.id.clone(),
            self.ctx().local_address(),
            update_type,
            target,
        );
        self.ctx().store.save_message(message.clone()).await?;
        Ok(message)
    }

    /// Relay a stored message to the members, skipping `exclude`
    async fn distribute(
        &self,
        chat: &GroupChat,
        message: Message,
        exclude: &[&PeerAddress],
    ) -> LinkchatResult<usize> {
        let ctx = self.ctx();
        let messages = ctx.store.messages(&chat.id).await?;
        let targets = chat.fan_out_targets(exclude);
        let relay = HostChatMessage {
            message,
            chat_hash: chat_hash(chat, &messages),
        };
        let delivered = ctx
            .send_all(&targets, GroupMessage::HostChatMessage(relay))
            .await;
        if delivered < targets.len() {
            debug!(
                "Delivered to {}/{} members of {}",
                delivered,
                targets.len(),
                chat.id
            );
        }
        Ok(delivered)
    }

    /// Drop a member, record the change and tell the remaining members and
    /// the member itself
    async fn remove_member(
        &self,
        mut chat: GroupChat,
        address: &PeerAddress,
        update_type: GroupUpdateType,
    ) -> LinkchatResult<bool> {
        if !chat.remove_user(address) {
            return Ok(false);
        }
        let ctx = self.ctx();
        ctx.store.save_chat(Chat::Group(chat.clone())).await?;
        let update = self
            .append_update(&chat, update_type, Some(address.clone()))
            .await?;
        self.distribute(&chat, update.clone(), &[]).await?;

        if update_type == GroupUpdateType::UserRemoved {
            let messages = ctx.store.messages(&chat.id).await?;
            let notice = HostChatMessage {
                message: update,
                chat_hash: chat_hash(&chat, &messages),
            };
            ctx.send(address, GroupMessage::HostChatMessage(notice)).await;
        }
        info!("{} is no longer a member of {}", address, chat.id);
        Ok(true)
    }

    /// Store a relayed message and apply its effect on the chat
    async fn apply_delta(&self, mut chat: GroupChat, message: Message) -> LinkchatResult<GroupChat> {
        let ctx = self.ctx();
        let local = ctx.local_address();
        let body = message.body.clone();
        ctx.store.save_message(message).await?;

        let MessageBody::GroupUpdate {
            update_type,
            target_address,
        } = body
        else {
            return Ok(chat);
        };
        match (update_type, target_address) {
            (GroupUpdateType::UserInvited, Some(target)) => {
                if chat.add_user(target) {
                    ctx.store.save_chat(Chat::Group(chat.clone())).await?;
                }
            }
            (GroupUpdateType::UserRemoved | GroupUpdateType::UserLeft, Some(target)) => {
                if target == local {
                    info!("Removed from {}", chat.id);
                    chat.exists = false;
                    ctx.store.save_chat(Chat::Group(chat.clone())).await?;
                } else if chat.remove_user(&target) {
                    ctx.store.save_chat(Chat::Group(chat.clone())).await?;
                }
            }
            (GroupUpdateType::ChatClosed, _) => {
                info!("Chat {} was closed by its host", chat.id);
                chat.exists = false;
                ctx.store.save_chat(Chat::Group(chat.clone())).await?;
            }
            // Metadata arrives with the snapshot pulled on the digest mismatch
            _ => {}
        }
        Ok(chat)
    }

    /// Replace the local copy of a chat with the host's snapshot
    async fn apply_snapshot(
        &self,
        chat: GroupChat,
        messages: Vec<Message>,
    ) -> LinkchatResult<GroupChat> {
        let store = &self.ctx().store;
        store.save_chat(Chat::Group(chat.clone())).await?;
        store.delete_messages(&chat.id).await?;
        for message in messages {
            store.save_message(message).await?;
        }
        debug!("Applied snapshot of {}", chat.id);
        Ok(chat)
    }

    /// Pull a full snapshot when the local digest differs from the host's
    async fn check_hash(&self, chat: &GroupChat, expected: Digest) -> LinkchatResult<()> {
        let messages = self.ctx().store.messages(&chat.id).await?;
        let actual = chat_hash(chat, &messages);
        if actual != expected {
            debug!(
                "Digest of {} is {}, host has {}, requesting chat info",
                chat.id, actual, expected
            );
            self.request_chat_info(&chat.id).await?;
        }
        Ok(())
    }

    async fn deactivate(&self, mut chat: GroupChat) -> LinkchatResult<()> {
        chat.exists = false;
        self.ctx().store.save_chat(Chat::Group(chat)).await
    }

    /// Announce attachments of a relayed message once they are available
    /// locally, downloading them from the sender first if needed
    fn announce_attachments(&self, chat_id: &ChatId, message: Message, sender: PeerAddress) {
        let file_names: Vec<String> = message
            .attachments()
            .into_iter()
            .map(str::to_owned)
            .collect();
        if file_names.is_empty() {
            return;
        }

        let delegate = self.clone();
        let chat_id = chat_id.clone();
        tokio::spawn(async move {
            let config = delegate.ctx().config.clone();
            let mut ready = Vec::new();
            for file_name in file_names {
                let descriptor = FileDescriptor::attachment(chat_id.clone(), file_name.clone());
                if delegate
                    .inner
                    .files
                    .ensure_local(descriptor, &sender, config.download_timeout())
                    .await
                {
                    ready.push(file_name);
                } else {
                    warn!("Attachment {} of {} never arrived", file_name, chat_id);
                }
            }
            if ready.is_empty() {
                return;
            }

            tokio::time::sleep(config.file_ready_delay()).await;
            let chat = match delegate.ctx().store.group_chat(&chat_id).await {
                Ok(Some(chat)) if chat.exists => chat,
                _ => return,
            };
            let targets = chat.fan_out_targets(&[&sender]);
            for file_name in ready {
                let notice = GroupMessage::FileReady(FileReady {
                    chat_id: chat_id.clone(),
                    file_name,
                });
                delegate.ctx().send_all(&targets, notice).await;
            }
        });
    }
}
