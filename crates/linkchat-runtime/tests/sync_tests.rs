//! End-to-end chat synchronization between in-memory devices

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, eventually, seed_chat, text, Node};
use linkchat_core::protocol::envelope::encode;
use linkchat_core::protocol::messages::{ClientChatMessage, GroupMessage, ProtocolMessage};
use linkchat_core::{
    chat_hash, user_hash, ChatId, FileDescriptor, GroupChat, LinkchatConfig, MessageContent,
    PeerAddress, User,
};
use linkchat_runtime::{
    ChatStore, Connection, DeviceLink, InboundKind, InvitePolicy, MemoryFileStore, MemoryNetwork,
    Role,
};
use tokio::sync::mpsc;

async fn hashes_match(a: &Node, b: &Node, chat: &GroupChat) -> bool {
    match (a.group_chat(chat).await, b.group_chat(chat).await) {
        (Some(left), Some(right)) => {
            chat_hash(&left, &a.messages(chat).await) == chat_hash(&right, &b.messages(chat).await)
        }
        _ => false,
    }
}

// ----------------------------------------------------------------------------
// Reconciliation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_handshake_reconciles_divergent_history() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let member = Node::start(&network, "b", InvitePolicy::manual());

    let mut chat = GroupChat::new(host.address.clone(), "friends");
    chat.add_user(member.address.clone());
    let history = vec![
        text(&chat, &host.address, "m1"),
        text(&chat, &host.address, "m2"),
        text(&chat, &host.address, "m3"),
    ];
    seed_chat(&host.store, &chat, &history).await;
    seed_chat(&member.store, &chat, &history[..1]).await;

    connect(&member, &host).await;

    eventually("member catches up", || async {
        member.messages(&chat).await == history
    })
    .await;
    eventually("hashes converge", || hashes_match(&host, &member, &chat)).await;
}

#[tokio::test]
async fn test_snapshot_repairs_reordered_history() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let member = Node::start(&network, "b", InvitePolicy::manual());

    let mut chat = GroupChat::new(host.address.clone(), "friends");
    chat.add_user(member.address.clone());
    let m1 = text(&chat, &host.address, "m1");
    let m2 = text(&chat, &host.address, "m2");
    // A member-only message the host never received
    let lost = text(&chat, &member.address, "lost");
    seed_chat(&host.store, &chat, &[m1.clone(), m2.clone()]).await;
    seed_chat(&member.store, &chat, &[m1.clone(), lost]).await;

    connect(&member, &host).await;

    eventually("member adopts host history", || async {
        member.messages(&chat).await == vec![m1.clone(), m2.clone()]
    })
    .await;
    eventually("hashes converge", || hashes_match(&host, &member, &chat)).await;
}

#[tokio::test]
async fn test_departure_while_offline_reaches_host() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let member = Node::start(&network, "b", InvitePolicy::manual());

    let mut chat = GroupChat::new(host.address.clone(), "friends");
    chat.add_user(member.address.clone());
    seed_chat(&host.store, &chat, &[]).await;
    let mut departed = chat.clone();
    departed.exists = false;
    seed_chat(&member.store, &departed, &[]).await;

    connect(&member, &host).await;

    eventually("host drops the member", || async {
        host.group_chat(&chat)
            .await
            .is_some_and(|chat| !chat.is_member(&member.address))
    })
    .await;
    // The departed chat stays inactive on the member
    assert!(!member.group_chat(&chat).await.unwrap().exists);
}

// ----------------------------------------------------------------------------
// Group Protocol
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_group_invite_and_messages() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let b = Node::start(&network, "b", InvitePolicy::accept_all());
    let c = Node::start(&network, "c", InvitePolicy::manual());
    connect(&b, &host).await;
    connect(&c, &host).await;

    let chat = host
        .engine
        .group()
        .create_chat("friends", &[b.address.clone(), c.address.clone()])
        .await
        .unwrap();

    eventually("b joins", || async {
        b.group_chat(&chat).await.is_some_and(|chat| chat.users.len() == 2)
    })
    .await;
    eventually("c is asked", || async {
        c.engine.group().pending_invitations().len() == 1
    })
    .await;
    assert!(c
        .engine
        .group()
        .respond_to_invite(&chat.id, true)
        .await
        .unwrap());
    eventually("everyone sees three members", || async {
        for node in [&host, &b, &c] {
            if !node.group_chat(&chat).await.is_some_and(|chat| chat.users.len() == 3) {
                return false;
            }
        }
        true
    })
    .await;

    let sent = b
        .engine
        .group()
        .send_message(&chat.id, vec![MessageContent::text("hello")], None)
        .await
        .unwrap();
    eventually("relayed to c", || async {
        c.messages(&chat).await.iter().any(|message| message.id == sent.id)
    })
    .await;
    eventually("all copies agree", || async {
        hashes_match(&host, &b, &chat).await && hashes_match(&host, &c, &chat).await
    })
    .await;

    host.engine.group().rename_chat(&chat.id, "best friends").await.unwrap();
    eventually("rename pulled by members", || async {
        c.group_chat(&chat).await.is_some_and(|chat| chat.name == "best friends")
    })
    .await;
}

#[tokio::test]
async fn test_removed_member_deactivates() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let b = Node::start(&network, "b", InvitePolicy::accept_all());
    connect(&b, &host).await;

    let chat = host
        .engine
        .group()
        .create_chat("friends", &[b.address.clone()])
        .await
        .unwrap();
    eventually("b joins", || async { b.group_chat(&chat).await.is_some() }).await;

    host.engine
        .group()
        .remove_user(&chat.id, &b.address)
        .await
        .unwrap();
    eventually("b deactivates", || async {
        b.group_chat(&chat).await.is_some_and(|chat| !chat.exists)
    })
    .await;
    assert!(b
        .engine
        .group()
        .send_message(&chat.id, vec![MessageContent::text("still here?")], None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_fan_out_skips_original_sender() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let c = Node::start(&network, "c", InvitePolicy::manual());

    // b is a bare connection so everything it receives can be inspected
    let pb = PeerAddress::new("b");
    let b_link = network.link(pb.clone(), "B");
    let stream = b_link.connect(&host.address).await.unwrap();
    let b = Connection::new(
        host.address.clone(),
        "A".into(),
        Role::Client,
        stream,
        LinkchatConfig::fast().connection,
        Arc::new(MemoryFileStore::new()),
    );
    let (tx, mut received) = mpsc::channel(64);
    tokio::spawn(Arc::clone(&b).run_read_loop(tx));

    let mut chat = GroupChat::new(host.address.clone(), "friends");
    chat.add_user(pb.clone());
    chat.add_user(c.address.clone());
    seed_chat(&host.store, &chat, &[]).await;
    seed_chat(&c.store, &chat, &[]).await;
    connect(&c, &host).await;
    eventually("host registers b", || async {
        host.engine.manager().is_connected(&pb)
    })
    .await;

    let message = text(&chat, &pb, "from b");
    let profile = User::new(pb.clone(), "B");
    host.store.save_user(profile.clone()).await.unwrap();
    let wire = encode(&ProtocolMessage::Group(GroupMessage::ClientChatMessage(
        ClientChatMessage {
            message: message.clone(),
            user_hash: user_hash(&profile),
        },
    )))
    .unwrap();
    assert!(b.send_message(&wire).await);

    eventually("c receives the relay", || async {
        c.messages(&chat).await.contains(&message)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    while let Ok(event) = received.try_recv() {
        if let InboundKind::Message(ProtocolMessage::Group(GroupMessage::HostChatMessage(relay))) =
            event.kind
        {
            assert_ne!(relay.message.id, message.id, "sender got its own message back");
        }
    }
}

#[tokio::test]
async fn test_member_attachment_announced_and_fetched() {
    let network = MemoryNetwork::new();
    let host = Node::start(&network, "a", InvitePolicy::manual());
    let b = Node::start(&network, "b", InvitePolicy::manual());
    let c = Node::start(&network, "c", InvitePolicy::manual());

    let mut chat = GroupChat::new(host.address.clone(), "friends");
    chat.add_user(b.address.clone());
    chat.add_user(c.address.clone());
    for node in [&host, &b, &c] {
        seed_chat(&node.store, &chat, &[]).await;
    }
    connect(&b, &host).await;
    connect(&c, &host).await;

    let descriptor = FileDescriptor::attachment(chat.id.clone(), "cat.png");
    let picture = vec![7u8; 10_000];
    b.files.insert(&descriptor, picture.clone());
    b.engine
        .group()
        .send_message(
            &chat.id,
            vec![MessageContent::Image {
                file_name: "cat.png".into(),
            }],
            None,
        )
        .await
        .unwrap();

    eventually("host downloads from the sender", || async {
        host.files.contents(&descriptor).as_ref() == Some(&picture)
    })
    .await;
    eventually("c fetches after the announcement", || async {
        c.files.contents(&descriptor).as_ref() == Some(&picture)
    })
    .await;
}

// ----------------------------------------------------------------------------
// Private Protocol
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_private_chat_and_attachment() {
    let network = MemoryNetwork::new();
    let a = Node::start(&network, "a", InvitePolicy::manual())
        .with_profile("Alice")
        .await;
    let b = Node::start(&network, "b", InvitePolicy::accept_all())
        .with_profile("Bob")
        .await;
    connect(&a, &b).await;

    assert!(a.engine.private().invite(&b.address).await.unwrap());
    let on_a = ChatId::private(&b.address);
    let on_b = ChatId::private(&a.address);
    eventually("both sides hold the chat", || async {
        a.store.chat(&on_a).await.unwrap().is_some() && b.store.chat(&on_b).await.unwrap().is_some()
    })
    .await;
    assert_eq!(b.store.user(&a.address).await.unwrap().unwrap().name, "Alice");
    assert_eq!(a.store.user(&b.address).await.unwrap().unwrap().name, "Bob");

    let sent_file = FileDescriptor::attachment(on_a.clone(), "notes.txt");
    a.files.insert(&sent_file, b"meeting at noon".to_vec());
    let sent = a
        .engine
        .private()
        .send_message(
            &b.address,
            vec![
                MessageContent::text("see attached"),
                MessageContent::File {
                    file_name: "notes.txt".into(),
                    size: 15,
                },
            ],
            None,
        )
        .await
        .unwrap();

    eventually("b stores the message under its own id", || async {
        b.store
            .messages(&on_b)
            .await
            .unwrap()
            .iter()
            .any(|message| message.id == sent.id && message.chat_id == on_b)
    })
    .await;
    let received_file = FileDescriptor::attachment(on_b.clone(), "notes.txt");
    eventually("b fetches the attachment", || async {
        b.files.contents(&received_file).is_some()
    })
    .await;
    assert_eq!(
        b.files.contents(&received_file),
        Some(b"meeting at noon".to_vec())
    );
}

#[tokio::test]
async fn test_profile_change_propagates_on_reconnect() {
    let network = MemoryNetwork::new();
    let a = Node::start(&network, "a", InvitePolicy::manual())
        .with_profile("Alice")
        .await;
    let b = Node::start(&network, "b", InvitePolicy::manual());
    connect(&b, &a).await;
    eventually("b learns a's profile", || async {
        b.store.user(&a.address).await.unwrap().is_some()
    })
    .await;

    b.engine.disconnect(&a.address).await;
    eventually("a notices", || async {
        !a.engine.manager().is_connected(&b.address)
    })
    .await;
    a.store
        .save_user(User::new(a.address.clone(), "Alice Cooper"))
        .await
        .unwrap();

    connect(&b, &a).await;
    eventually("b refreshes a's profile", || async {
        b.store
            .user(&a.address)
            .await
            .unwrap()
            .is_some_and(|user| user.name == "Alice Cooper")
    })
    .await;
}
