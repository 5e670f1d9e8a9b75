//! Command handlers for the linkchat CLI

use std::sync::Arc;

use anyhow::Context;
use linkchat_core::{Chat, GroupChat, Message, MessageBody, MessageContent, PeerAddress};
use linkchat_runtime::{
    ChatStore, Collaborators, Engine, InvitePolicy, MemoryChatStore, StaticSession, StoreEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::files::DirFileStore;
use crate::link::TcpLink;

const HELP: &str = "\
Commands:
  /peers                       configured devices and their state
  /connect <addr>              open a connection
  /disconnect <addr>           close a connection
  /chats                       list chats
  /group <name> [addr...]      create a group chat and invite peers
  /invite <chat> <addr>        invite a peer to a hosted chat
  /private <addr>              invite a peer to a private chat
  /invites                     pending invitations
  /accept <chat|addr>          accept an invitation
  /decline <chat|addr>         decline an invitation
  /send <chat> <text>          send a message
  /history <chat>              show a chat's messages
  /leave <chat>                leave (or close) a group chat
  /quit                        exit
Chats can be named by a unique prefix of their id or by the peer of a private chat.";

// ----------------------------------------------------------------------------
// Command Dispatch
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, mut config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Config => {
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
            Commands::Run { name } => {
                if let Some(name) = name {
                    config.identity.name = name;
                }
                config.validate()?;
                Self::handle_run_command(config).await
            }
        }
    }

    /// Start the engine and read commands from stdin until `/quit`
    async fn handle_run_command(config: AppConfig) -> Result<()> {
        let local = config.local_address();
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Cannot create data directory {}", data_dir.display()))?;
        info!(
            "Starting as {} ({}), files in {}",
            config.identity.name,
            local,
            data_dir.display()
        );

        let link = TcpLink::bind(
            local.clone(),
            config.network.listen,
            config.network.peers.clone(),
        )
        .await?;
        let store = Arc::new(MemoryChatStore::new());
        store.save_user(config.local_user()).await?;

        let collaborators = Collaborators {
            link: Arc::new(link),
            store: store.clone(),
            files: Arc::new(DirFileStore::new(data_dir)),
            session: Arc::new(StaticSession::new(local.clone())),
        };
        let policy = if config.auto_accept_invites {
            InvitePolicy::accept_all()
        } else {
            InvitePolicy::manual()
        };
        let mut engine = Engine::start_with_policy(config.engine.clone(), collaborators, policy)?;
        engine.listen();

        match engine.connect_to_paired().await {
            Ok(count) => info!("Connected to {} paired devices", count),
            Err(e) => warn!("Could not reach paired devices: {}", e),
        }

        let printer = tokio::spawn(print_store_events(store, local));
        let result = Repl::new(&engine, &config).run().await;

        printer.abort();
        engine.shutdown().await;
        result
    }
}

// ----------------------------------------------------------------------------
// Interactive Commands
// ----------------------------------------------------------------------------

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Peers,
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    Chats,
    Group {
        name: String,
        members: Vec<PeerAddress>,
    },
    Invite {
        chat: String,
        peer: PeerAddress,
    },
    Private(PeerAddress),
    Invites,
    Accept(String),
    Decline(String),
    Send {
        chat: String,
        text: String,
    },
    History(String),
    Leave(String),
    Quit,
}

impl Command {
    /// Parse a prompt line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(line) = line.strip_prefix('/') else {
            return Err(CliError::InvalidCommand(
                "commands start with '/', try /help".to_string(),
            ));
        };

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let mut args = rest.split_whitespace();
        let mut arg = |what: &str| {
            args.next()
                .map(str::to_string)
                .ok_or_else(|| CliError::InvalidCommand(format!("/{} needs {}", name, what)))
        };

        let command = match name {
            "help" => Command::Help,
            "peers" => Command::Peers,
            "connect" => Command::Connect(PeerAddress::new(arg("an address")?)),
            "disconnect" => Command::Disconnect(PeerAddress::new(arg("an address")?)),
            "chats" => Command::Chats,
            "group" => {
                let name = arg("a chat name")?;
                let members = rest.split_whitespace().skip(1).map(PeerAddress::new).collect();
                Command::Group { name, members }
            }
            "invite" => Command::Invite {
                chat: arg("a chat")?,
                peer: PeerAddress::new(arg("an address")?),
            },
            "private" => Command::Private(PeerAddress::new(arg("an address")?)),
            "invites" => Command::Invites,
            "accept" => Command::Accept(arg("a chat or address")?),
            "decline" => Command::Decline(arg("a chat or address")?),
            "send" => {
                let chat = arg("a chat")?;
                let text = rest[chat.len()..].trim();
                if text.is_empty() {
                    return Err(CliError::InvalidCommand("/send needs a text".to_string()));
                }
                Command::Send {
                    chat,
                    text: text.to_string(),
                }
            }
            "history" => Command::History(arg("a chat")?),
            "leave" => Command::Leave(arg("a chat")?),
            "quit" | "exit" => Command::Quit,
            other => {
                return Err(CliError::InvalidCommand(format!(
                    "unknown command /{}, try /help",
                    other
                )))
            }
        };
        Ok(Some(command))
    }
}

/// Read-eval loop over stdin
pub struct Repl<'a> {
    engine: &'a Engine,
    config: &'a AppConfig,
}

impl<'a> Repl<'a> {
    pub fn new(engine: &'a Engine, config: &'a AppConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(&self) -> Result<()> {
        println!("linkchat ready as {}, /help lists commands", self.engine.local_address());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let command = match Command::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };
            if command == Command::Quit {
                break;
            }
            if let Err(e) = self.execute(command).await {
                println!("error: {}", e);
            }
        }
        Ok(())
    }

    /// Run one command against the engine
    pub async fn execute(&self, command: Command) -> Result<()> {
        let engine = self.engine;
        match command {
            Command::Help => println!("{}", HELP),
            Command::Peers => {
                for peer in &self.config.network.peers {
                    let address = peer.peer_address();
                    println!(
                        "{:<20} {:<24} {:?}",
                        peer.address,
                        peer.display_name(),
                        engine.manager().peer_state(&address)
                    );
                }
            }
            Command::Connect(address) => {
                if engine.connect(&address).await {
                    println!("connected to {}", address);
                } else {
                    println!("could not connect to {}", address);
                }
            }
            Command::Disconnect(address) => {
                if !engine.disconnect(&address).await {
                    println!("not connected to {}", address);
                }
            }
            Command::Chats => {
                for chat in engine.store().chats().await? {
                    println!("{}", self.describe_chat(&chat));
                }
            }
            Command::Group { name, members } => {
                let chat = engine.group().create_chat(name, &members).await?;
                println!("created {} ({})", chat.name, short_id(&chat));
            }
            Command::Invite { chat, peer } => {
                let chat = self.resolve_group(&chat).await?;
                if !engine.group().invite(&chat.id, &peer).await? {
                    println!("invitation to {} was not sent", peer);
                }
            }
            Command::Private(peer) => {
                if !engine.private().invite(&peer).await? {
                    println!("invitation to {} was not sent", peer);
                }
            }
            Command::Invites => {
                for chat in engine.group().pending_invitations() {
                    println!(
                        "group   {} ({}) hosted by {}",
                        chat.name,
                        short_id(&chat),
                        chat.host_address
                    );
                }
                for user in engine.private().pending_invitations() {
                    println!("private {} ({})", user.name, user.address);
                }
            }
            Command::Accept(target) => self.answer(&target, true).await?,
            Command::Decline(target) => self.answer(&target, false).await?,
            Command::Send { chat, text } => {
                let content = vec![MessageContent::text(text)];
                match self.resolve_chat(&chat).await? {
                    Chat::Private(chat) => {
                        engine.private().send_message(&chat.user, content, None).await?;
                    }
                    Chat::Group(chat) => {
                        engine.group().send_message(&chat.id, content, None).await?;
                    }
                }
            }
            Command::History(chat) => {
                let chat = self.resolve_chat(&chat).await?;
                for message in engine.store().messages(&chat.id()).await? {
                    println!("{}", render(engine.store().as_ref(), &message).await);
                }
            }
            Command::Leave(chat) => {
                let chat = self.resolve_group(&chat).await?;
                engine.group().leave_chat(&chat.id).await?;
            }
            Command::Quit => {}
        }
        Ok(())
    }

    /// Answer a private invitation from `target`, or a group invitation
    /// whose id starts with `target`
    async fn answer(&self, target: &str, accept: bool) -> Result<()> {
        let engine = self.engine;
        let peer = PeerAddress::new(target);
        if engine
            .private()
            .pending_invitations()
            .iter()
            .any(|user| user.address == peer)
        {
            engine.private().respond_to_invite(&peer, accept).await?;
            return Ok(());
        }

        let pending = engine.group().pending_invitations();
        let chat = unique(
            target,
            pending
                .into_iter()
                .filter(|chat| chat.id.as_str().starts_with(target)),
        )?;
        if !engine.group().respond_to_invite(&chat.id, accept).await? {
            println!("{} is offline, the answer was not delivered", chat.host_address);
        }
        Ok(())
    }

    async fn resolve_chat(&self, target: &str) -> Result<Chat> {
        let chats = self.engine.store().chats().await?;
        let peer = PeerAddress::new(target);
        unique(
            target,
            chats.into_iter().filter(|chat| match chat {
                Chat::Private(private) => private.user == peer,
                Chat::Group(group) => group.id.as_str().starts_with(target),
            }),
        )
    }

    async fn resolve_group(&self, target: &str) -> Result<GroupChat> {
        self.resolve_chat(target)
            .await?
            .into_group()
            .ok_or_else(|| CliError::InvalidCommand(format!("{} is not a group chat", target)))
    }

    fn describe_chat(&self, chat: &Chat) -> String {
        match chat {
            Chat::Private(private) => format!("private  {}", private.user),
            Chat::Group(group) => {
                let role = if group.is_host(self.engine.local_address()) {
                    "host"
                } else {
                    "member"
                };
                let state = if group.exists { "" } else { " (closed)" };
                format!(
                    "group    {} {} [{}, {} members]{}",
                    short_id(group),
                    group.name,
                    role,
                    group.users.len(),
                    state
                )
            }
        }
    }
}

fn short_id(chat: &GroupChat) -> &str {
    let id = chat.id.as_str();
    id.get(..8).unwrap_or(id)
}

/// The single item matching `target`
fn unique<T>(target: &str, mut matches: impl Iterator<Item = T>) -> Result<T> {
    let first = matches
        .next()
        .ok_or_else(|| CliError::InvalidCommand(format!("nothing matches {}", target)))?;
    if matches.next().is_some() {
        return Err(CliError::InvalidCommand(format!(
            "{} is ambiguous, use a longer prefix",
            target
        )));
    }
    Ok(first)
}

// ----------------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------------

/// One line describing a message
async fn render(store: &dyn ChatStore, message: &Message) -> String {
    let author = match store.user(&message.author).await {
        Ok(Some(user)) => user.name,
        _ => message.author.to_string(),
    };
    let body = match &message.body {
        MessageBody::Plain { content, .. } => content
            .iter()
            .map(|part| match part {
                MessageContent::Text { text } => text.clone(),
                MessageContent::Image { file_name } => format!("[image {}]", file_name),
                MessageContent::File { file_name, size } => {
                    format!("[file {} ({} bytes)]", file_name, size)
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        MessageBody::GroupUpdate {
            update_type,
            target_address,
        } => match target_address {
            Some(target) => format!("* {:?} {}", update_type, target),
            None => format!("* {:?}", update_type),
        },
    };
    format!("[{}] {}: {}", message.chat_id, author, body)
}

/// Print messages from other devices as they are stored
async fn print_store_events(store: Arc<MemoryChatStore>, local: PeerAddress) {
    let mut events = store.subscribe();
    loop {
        match events.recv().await {
            Ok(StoreEvent::MessageSaved {
                chat_id,
                message_id,
            }) => {
                let messages = match store.messages(&chat_id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("Could not read {}: {}", chat_id, e);
                        continue;
                    }
                };
                if let Some(message) = messages
                    .iter()
                    .find(|message| message.id == message_id && message.author != local)
                {
                    println!("{}", render(store.as_ref(), message).await);
                }
            }
            Ok(event) => debug!("Store event {:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} store events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkchat_core::{ChatId, User};

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_group_with_members() {
        assert_eq!(
            parse("/group team alice bob"),
            Command::Group {
                name: "team".to_string(),
                members: vec![PeerAddress::new("alice"), PeerAddress::new("bob")],
            }
        );
        assert_eq!(
            parse("/group solo"),
            Command::Group {
                name: "solo".to_string(),
                members: Vec::new(),
            }
        );
    }

    #[test]
    fn test_parse_send_keeps_spacing_of_text() {
        assert_eq!(
            parse("  /send 3f2a  hello   there "),
            Command::Send {
                chat: "3f2a".to_string(),
                text: "hello   there".to_string(),
            }
        );
        assert!(Command::parse("/send 3f2a").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete() {
        assert!(Command::parse("").unwrap().is_none());
        assert!(Command::parse("hello").is_err());
        assert!(Command::parse("/dance").is_err());
        assert!(Command::parse("/connect").is_err());
        assert_eq!(parse("/exit"), Command::Quit);
        assert_eq!(parse("/accept desktop"), Command::Accept("desktop".to_string()));
    }

    #[test]
    fn test_unique_prefix() {
        let ids = ["abc1", "abd2", "xyz"];
        assert_eq!(unique("x", ids.iter().filter(|id| id.starts_with("x"))).unwrap(), &"xyz");
        assert!(unique("ab", ids.iter().filter(|id| id.starts_with("ab"))).is_err());
        assert!(unique("q", ids.iter().filter(|id| id.starts_with("q"))).is_err());
    }

    #[tokio::test]
    async fn test_render_uses_profile_names() {
        let store = MemoryChatStore::new();
        let author = PeerAddress::new("laptop");
        store.save_user(User::new(author.clone(), "Alice")).await.unwrap();
        let message = Message::plain(
            ChatId::from("chat"),
            author,
            vec![
                MessageContent::text("look"),
                MessageContent::Image {
                    file_name: "cat.jpg".to_string(),
                },
            ],
            None,
        );
        assert_eq!(render(&store, &message).await, "[chat] Alice: look [image cat.jpg]");
    }
}
