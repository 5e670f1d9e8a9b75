//! Connection handshake
//!
//! Both ends send an `InitConnection.Request` on every new connection. The
//! request carries the sender's profile digest, the digest it holds of the
//! receiver's profile, a digest per chat the receiver hosts and the sender is
//! a member of, and the ids of chats the sender hosts that list the receiver.
//!
//! The responder answers with its profile when the digest is stale, an
//! `Updated` snapshot plus a bounded history delta for every diverging chat,
//! a tombstone for chats it no longer has, and whether each claimed
//! membership still holds. Running this exchange on every reconnection is
//! what makes chat state converge between devices.
//!
//! When the requester's profile digest matches the stored copy, no profile
//! comes back in the other direction, so the responder checks its picture
//! against the file store itself.

use std::collections::HashSet;

use linkchat_core::protocol::messages::{
    ChatSync, CommonMessage, InitConnectionRequest, InitConnectionResponse, MembershipStatus,
};
use linkchat_core::{
    chat_hash, user_hash, ChatId, GroupChat, GroupChatHashInfo, LinkchatResult, PeerAddress,
    User,
};
use tracing::{debug, info, warn};

use crate::delegates::{DelegateContext, FileDelegate, GroupDelegate};

#[derive(Clone)]
pub struct HandshakeDelegate {
    ctx: DelegateContext,
    group: GroupDelegate,
    files: FileDelegate,
}

impl HandshakeDelegate {
    pub fn new(ctx: DelegateContext, group: GroupDelegate, files: FileDelegate) -> Self {
        Self { ctx, group, files }
    }

    /// Start the handshake with a newly connected peer
    pub async fn initiate(&self, peer: &PeerAddress) -> LinkchatResult<bool> {
        let request = self.build_request(peer).await?;
        debug!(
            "Handshake with {}: {} digests, {} hosted chats",
            peer,
            request.chat_digests.len(),
            request.hosted_member_chat_ids.len()
        );
        Ok(self
            .ctx
            .send(peer, CommonMessage::InitConnectionRequest(request))
            .await)
    }

    pub async fn handle_request(
        &self,
        from: &PeerAddress,
        request: InitConnectionRequest,
    ) -> LinkchatResult<()> {
        let response = self.build_response(from, &request).await?;
        debug!(
            "Answering handshake of {} with {} chat updates",
            from,
            response.chat_updates.len()
        );
        self.ctx
            .send(from, CommonMessage::InitConnectionResponse(response))
            .await;

        // A current profile will not be resent, so its picture is only
        // fetched here
        if let Some(user) = self.current_profile(from, &request).await? {
            self.files.fetch_user_picture(&user).await;
        }
        Ok(())
    }

    pub async fn handle_response(
        &self,
        from: &PeerAddress,
        response: InitConnectionResponse,
    ) -> LinkchatResult<()> {
        if let Some(user) = response.user {
            if user.address == *from {
                self.ctx.store.save_user(user.clone()).await?;
                self.files.fetch_user_picture(&user).await;
            } else {
                warn!("{} sent the profile of {}", from, user.address);
            }
        }

        for update in response.chat_updates {
            let result = match update {
                ChatSync::Updated {
                    chat,
                    chat_hash,
                    messages,
                } => {
                    self.group
                        .apply_digest_update(from, chat, chat_hash, messages)
                        .await
                }
                ChatSync::Deleted { chat_id } => self.group.apply_tombstone(from, &chat_id).await,
            };
            if let Err(e) = result {
                warn!("Failed to apply chat update from {}: {}", from, e);
            }
        }

        for membership in response.memberships {
            if membership.is_member {
                continue;
            }
            match self.group.member_left(&membership.chat_id, from).await {
                Ok(true) => info!("{} left {} while away", from, membership.chat_id),
                Ok(false) => {}
                Err(e) => warn!("Failed to remove {} from {}: {}", from, membership.chat_id, e),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Digests
    // ------------------------------------------------------------------------

    pub(crate) async fn build_request(
        &self,
        peer: &PeerAddress,
    ) -> LinkchatResult<InitConnectionRequest> {
        let store = &self.ctx.store;
        let local = self.ctx.local_address();
        let user = self.ctx.local_user().await?;

        let mut chat_digests = Vec::new();
        let mut hosted_member_chat_ids = Vec::new();
        for chat in store.group_chats().await? {
            if !chat.exists {
                continue;
            }
            if chat.is_host(peer) && chat.is_member(&local) {
                let messages = store.messages(&chat.id).await?;
                chat_digests.push(GroupChatHashInfo::of(&chat, &messages));
            } else if chat.is_host(&local) && chat.is_member(peer) {
                hosted_member_chat_ids.push(chat.id);
            }
        }

        Ok(InitConnectionRequest {
            user_hash: user_hash(&user),
            known_user_hash: store.user(peer).await?.as_ref().map(user_hash),
            chat_digests,
            hosted_member_chat_ids,
        })
    }

    /// The stored profile of `from`, if it matches the digest it announced
    pub(crate) async fn current_profile(
        &self,
        from: &PeerAddress,
        request: &InitConnectionRequest,
    ) -> LinkchatResult<Option<User>> {
        Ok(self
            .ctx
            .store
            .user(from)
            .await?
            .filter(|user| user_hash(user) == request.user_hash))
    }

    pub(crate) async fn build_response(
        &self,
        from: &PeerAddress,
        request: &InitConnectionRequest,
    ) -> LinkchatResult<InitConnectionResponse> {
        let store = &self.ctx.store;
        let local = self.ctx.local_address();
        let limit = self.ctx.config.history_delta_limit;

        let me = self.ctx.local_user().await?;
        let user = (request.known_user_hash != Some(user_hash(&me))).then_some(me);

        let mut chat_updates = Vec::new();
        let mut digested: HashSet<&ChatId> = HashSet::new();
        for digest in &request.chat_digests {
            digested.insert(&digest.chat_id);
            let chat = match store.group_chat(&digest.chat_id).await? {
                Some(chat) if !chat.is_host(&local) => continue,
                Some(chat) if chat.exists => chat,
                _ => {
                    chat_updates.push(ChatSync::Deleted {
                        chat_id: digest.chat_id.clone(),
                    });
                    continue;
                }
            };

            let messages = store.messages(&chat.id).await?;
            let hash = chat_hash(&chat, &messages);
            if !chat.is_member(from) {
                // Lets the former member notice the eviction
                chat_updates.push(ChatSync::Updated {
                    chat,
                    chat_hash: hash,
                    messages: Vec::new(),
                });
                continue;
            }
            let last_id = messages.last().map(|message| &message.id);
            if hash == digest.chat_hash && last_id == digest.last_message_id.as_ref() {
                continue;
            }
            let delta = store
                .messages_after(&chat.id, digest.last_message_id.as_ref(), limit)
                .await?;
            chat_updates.push(ChatSync::Updated {
                chat,
                chat_hash: hash,
                messages: delta,
            });
        }

        // Hosted chats the peer should know about but did not mention
        for chat in store.group_chats().await? {
            if !chat.exists
                || !chat.is_host(&local)
                || !chat.is_member(from)
                || digested.contains(&chat.id)
            {
                continue;
            }
            let messages = store.messages(&chat.id).await?;
            let hash = chat_hash(&chat, &messages);
            let delta = store.messages_after(&chat.id, None, limit).await?;
            chat_updates.push(ChatSync::Updated {
                chat,
                chat_hash: hash,
                messages: delta,
            });
        }

        let mut memberships = Vec::with_capacity(request.hosted_member_chat_ids.len());
        for chat_id in &request.hosted_member_chat_ids {
            let is_member = match store.group_chat(chat_id).await? {
                Some(chat) => still_member(&chat, from, &local),
                // Unknown here: the invitation was missed and heals on its own
                None => true,
            };
            memberships.push(MembershipStatus {
                chat_id: chat_id.clone(),
                is_member,
            });
        }

        Ok(InitConnectionResponse {
            user,
            chat_updates,
            memberships,
        })
    }
}

fn still_member(chat: &GroupChat, host: &PeerAddress, local: &PeerAddress) -> bool {
    chat.exists && chat.is_host(host) && chat.is_member(local)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::collab::{ChatStore, StaticSession};
    use crate::delegates::InvitePolicy;
    use crate::manager::ConnectionManager;
    use crate::memory::{MemoryChatStore, MemoryFileStore, MemoryNetwork};
    use linkchat_core::{Chat, Digest, LinkchatConfig, Message, MessageContent};

    fn delegate(network: &MemoryNetwork, address: &str) -> (HandshakeDelegate, Arc<MemoryChatStore>) {
        let local = PeerAddress::new(address);
        let config = LinkchatConfig::fast();
        let files = Arc::new(MemoryFileStore::new());
        let store = Arc::new(MemoryChatStore::new());
        let manager = ConnectionManager::new(
            local.clone(),
            Arc::new(network.link(local.clone(), address)),
            files.clone(),
            config.connection.clone(),
        );
        let ctx = DelegateContext {
            manager,
            store: store.clone(),
            files,
            session: Arc::new(StaticSession::new(local)),
            config: config.sync,
        };
        let files = FileDelegate::new(ctx.clone());
        let group = GroupDelegate::new(ctx.clone(), files.clone(), InvitePolicy::manual());
        (HandshakeDelegate::new(ctx, group, files), store)
    }

    async fn hosted_chat(store: &MemoryChatStore, members: &[&str], texts: &[&str]) -> GroupChat {
        let host = PeerAddress::new("host");
        let mut chat = GroupChat::new(host.clone(), "friends");
        for member in members {
            chat.add_user(PeerAddress::new(*member));
        }
        store.save_chat(Chat::Group(chat.clone())).await.unwrap();
        for text in texts {
            let message = Message::plain(
                chat.id.clone(),
                host.clone(),
                vec![MessageContent::text(*text)],
                None,
            );
            store.save_message(message).await.unwrap();
        }
        chat
    }

    #[tokio::test]
    async fn test_request_lists_digests_and_hosted_chats() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "host");
        let chat = hosted_chat(&store, &["member"], &["hello"]).await;

        let request = handshake
            .build_request(&PeerAddress::new("member"))
            .await
            .unwrap();
        assert!(request.chat_digests.is_empty());
        assert_eq!(request.hosted_member_chat_ids, vec![chat.id]);
        assert_eq!(request.known_user_hash, None);
    }

    #[tokio::test]
    async fn test_response_sends_only_missing_delta() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "host");
        let chat = hosted_chat(&store, &["member"], &["m1", "m2", "m3"]).await;
        let messages = store.messages(&chat.id).await.unwrap();

        // The member only has the first message
        let member_view = GroupChatHashInfo::of(&chat, &messages[..1]);
        let request = InitConnectionRequest {
            user_hash: Digest::new(1),
            known_user_hash: None,
            chat_digests: vec![member_view],
            hosted_member_chat_ids: Vec::new(),
        };
        let response = handshake
            .build_response(&PeerAddress::new("member"), &request)
            .await
            .unwrap();

        assert!(response.user.is_some());
        assert_eq!(response.chat_updates.len(), 1);
        match &response.chat_updates[0] {
            ChatSync::Updated {
                chat_hash: hash,
                messages: delta,
                ..
            } => {
                assert_eq!(*hash, chat_hash(&chat, &messages));
                assert_eq!(delta.as_slice(), &messages[1..]);
            }
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_skips_converged_chat_and_current_profile() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "host");
        let chat = hosted_chat(&store, &["member"], &["m1"]).await;
        let messages = store.messages(&chat.id).await.unwrap();
        let me = User::new(PeerAddress::new("host"), "Host");
        store.save_user(me.clone()).await.unwrap();

        let request = InitConnectionRequest {
            user_hash: Digest::new(1),
            known_user_hash: Some(user_hash(&me)),
            chat_digests: vec![GroupChatHashInfo::of(&chat, &messages)],
            hosted_member_chat_ids: Vec::new(),
        };
        let response = handshake
            .build_response(&PeerAddress::new("member"), &request)
            .await
            .unwrap();
        assert!(response.user.is_none());
        assert!(response.chat_updates.is_empty());
    }

    #[tokio::test]
    async fn test_current_profile_matches_announced_digest() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "host");
        let member = PeerAddress::new("member");
        let profile = User::new(member.clone(), "Member").with_picture("me.png");

        let mut request = InitConnectionRequest {
            user_hash: user_hash(&profile),
            known_user_hash: None,
            chat_digests: Vec::new(),
            hosted_member_chat_ids: Vec::new(),
        };
        // Nothing stored yet
        assert!(handshake.current_profile(&member, &request).await.unwrap().is_none());

        store.save_user(profile.clone()).await.unwrap();
        assert_eq!(
            handshake.current_profile(&member, &request).await.unwrap(),
            Some(profile.clone())
        );

        // The member renamed itself since
        request.user_hash = user_hash(&User::new(member.clone(), "Renamed"));
        assert!(handshake.current_profile(&member, &request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_response_tombstones_and_missed_invitations() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "host");
        let joined = hosted_chat(&store, &["member"], &["m1"]).await;
        let gone = ChatId::from("gone");

        let request = InitConnectionRequest {
            user_hash: Digest::new(1),
            known_user_hash: None,
            chat_digests: vec![GroupChatHashInfo {
                chat_id: gone.clone(),
                chat_hash: Digest::new(7),
                last_message_id: None,
            }],
            hosted_member_chat_ids: Vec::new(),
        };
        let response = handshake
            .build_response(&PeerAddress::new("member"), &request)
            .await
            .unwrap();

        assert_eq!(response.chat_updates.len(), 2);
        assert!(response
            .chat_updates
            .contains(&ChatSync::Deleted { chat_id: gone }));
        assert!(response.chat_updates.iter().any(|update| matches!(
            update,
            ChatSync::Updated { chat, messages, .. } if chat.id == joined.id && messages.len() == 1
        )));
    }

    #[tokio::test]
    async fn test_membership_report() {
        let network = MemoryNetwork::new();
        let (handshake, store) = delegate(&network, "member");
        let host = PeerAddress::new("host");

        let mut active = GroupChat::new(host.clone(), "active");
        active.add_user(PeerAddress::new("member"));
        store.save_chat(Chat::Group(active.clone())).await.unwrap();

        let mut left = GroupChat::new(host.clone(), "left");
        left.add_user(PeerAddress::new("member"));
        left.exists = false;
        store.save_chat(Chat::Group(left.clone())).await.unwrap();

        let unknown = ChatId::from("unknown");
        let request = InitConnectionRequest {
            user_hash: Digest::new(1),
            known_user_hash: None,
            chat_digests: Vec::new(),
            hosted_member_chat_ids: vec![active.id.clone(), left.id.clone(), unknown.clone()],
        };
        let response = handshake.build_response(&host, &request).await.unwrap();
        assert_eq!(
            response.memberships,
            vec![
                MembershipStatus { chat_id: active.id, is_member: true },
                MembershipStatus { chat_id: left.id, is_member: false },
                MembershipStatus { chat_id: unknown, is_member: true },
            ]
        );
    }
}
