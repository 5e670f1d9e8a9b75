//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use linkchat_core::{Chat, GroupChat, LinkchatConfig, Message, MessageContent, PeerAddress, User};
use linkchat_runtime::{
    ChatStore, Collaborators, Engine, InvitePolicy, MemoryChatStore, MemoryFileStore,
    MemoryNetwork, StaticSession,
};

/// One simulated device
pub struct Node {
    pub address: PeerAddress,
    pub engine: Engine,
    pub store: Arc<MemoryChatStore>,
    pub files: MemoryFileStore,
}

impl Node {
    pub fn start(network: &MemoryNetwork, address: &str, policy: InvitePolicy) -> Self {
        let address = PeerAddress::new(address);
        let store = Arc::new(MemoryChatStore::new());
        let files = MemoryFileStore::new();
        let collaborators = Collaborators {
            link: Arc::new(network.link(address.clone(), address.as_str().to_uppercase())),
            store: store.clone(),
            files: Arc::new(files.clone()),
            session: Arc::new(StaticSession::new(address.clone())),
        };
        let mut engine = Engine::start_with_policy(LinkchatConfig::fast(), collaborators, policy)
            .expect("engine starts");
        engine.listen();
        Self {
            address,
            engine,
            store,
            files,
        }
    }

    /// Save a profile for the local user
    pub async fn with_profile(self, name: &str) -> Self {
        self.store
            .save_user(User::new(self.address.clone(), name))
            .await
            .unwrap();
        self
    }

    pub async fn messages(&self, chat: &GroupChat) -> Vec<Message> {
        self.store.messages(&chat.id).await.unwrap()
    }

    pub async fn group_chat(&self, chat: &GroupChat) -> Option<GroupChat> {
        self.store.group_chat(&chat.id).await.unwrap()
    }
}

/// Store a chat and its history directly, bypassing the protocol
pub async fn seed_chat(store: &MemoryChatStore, chat: &GroupChat, messages: &[Message]) {
    store.save_chat(Chat::Group(chat.clone())).await.unwrap();
    for message in messages {
        store.save_message(message.clone()).await.unwrap();
    }
}

pub fn text(chat: &GroupChat, author: &PeerAddress, text: &str) -> Message {
    Message::plain(
        chat.id.clone(),
        author.clone(),
        vec![MessageContent::text(text)],
        None,
    )
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect `from` to `to` and wait until both sides registered the stream
pub async fn connect(from: &Node, to: &Node) {
    assert!(from.engine.connect(&to.address).await);
    eventually("connection", || async move {
        from.engine.manager().is_connected(&to.address)
            && to.engine.manager().is_connected(&from.address)
    })
    .await;
}
