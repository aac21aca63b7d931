use anyhow::{bail, Result};
use chat_relay_cluster::cipher;
use chat_relay_cluster::protocol::{Envelope, Message};
use chat_relay_cluster::transport::{Inbound, Transport, UdpTransport};
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive chat client for the relay cluster")]
struct Args {
    /// Client id shown to other room members
    #[arg(long)]
    id: String,

    /// Any node of the cluster (e.g. 127.0.0.1:5001)
    #[arg(long)]
    server: SocketAddr,

    /// Local UDP address
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Scramble message bodies with this key (all room members must agree).
    /// `--key` alone uses the built-in key.
    #[arg(long, num_args = 0..=1, default_missing_value = cipher::DEFAULT_KEY)]
    key: Option<String>,
}

#[derive(Default)]
struct Session {
    /// (room, owner address) once an owner accepted us.
    joined: Option<(String, SocketAddr)>,
    /// Sent but not yet confirmed, kept so RESEND_REQUEST can be answered.
    unconfirmed: HashMap<String, Message>,
}

struct Client {
    id: String,
    entry: SocketAddr,
    key: Option<String>,
    transport: Arc<UdpTransport>,
    session: Mutex<Session>,
}

impl Client {
    async fn listen(self: Arc<Self>, mut inbound: Inbound) {
        while let Some(Envelope { from, message }) = inbound.recv().await {
            self.handle(message, from).await;
        }
    }

    async fn handle(&self, message: Message, from: SocketAddr) {
        match message {
            Message::ChatroomsList { rooms } => {
                if rooms.is_empty() {
                    println!("No rooms yet. Use /create <room>.");
                } else {
                    println!("Available rooms: {}", rooms.join(", "));
                }
            }
            Message::RoomAssignment { room, server_addr } => {
                let mut session = self.session.lock().await;
                let target = (room.clone(), server_addr);
                if from == server_addr {
                    // the owner itself confirmed membership
                    println!("[JOINED] {} on {}", room, server_addr);
                    session.joined = Some(target);
                    return;
                }
                // a directory answer, possibly repeated because our last
                // JOIN never reached a host: (re)join at the owner
                session.joined = Some(target);
                drop(session);
                self.transport
                    .send(server_addr, Message::JoinChatroom { room, client_id: self.id.clone(), reply_to: None });
            }
            Message::ChatMsg { message_id, from: sender, body, .. } => {
                let text = match &self.key {
                    Some(key) => cipher::decrypt(&body, key).unwrap_or_else(|_| format!("<unreadable> {body}")),
                    None => body,
                };
                println!("{}: {}", sender, text);
                self.transport.send(from, Message::Ack { message_id, from: self.id.clone() });
            }
            Message::Delivered { message_id } => {
                if self.session.lock().await.unconfirmed.remove(&message_id).is_some() {
                    println!("  ✓ delivered");
                }
            }
            Message::ResendRequest { message_id } => {
                let session = self.session.lock().await;
                match (session.unconfirmed.get(&message_id), &session.joined) {
                    (Some(msg), Some((_, owner))) => self.transport.send(*owner, msg.clone()),
                    _ => println!("  (server asked for unknown message {message_id})"),
                }
            }
            other => println!("  (unexpected {} from {})", other.kind(), from),
        }
    }

    async fn command(&self, line: &str) -> Result<bool> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("/quit") => return Ok(false),
            Some("/list") => self.transport.send(self.entry, Message::ListChatrooms),
            Some(verb @ ("/create" | "/join")) => {
                let Some(room) = parts.next() else {
                    println!("Usage: {verb} <room>");
                    return Ok(true);
                };
                let room = room.to_string();
                let client_id = self.id.clone();
                let msg = if verb == "/create" {
                    Message::CreateChatroom { room, client_id, reply_to: None }
                } else {
                    Message::JoinChatroom { room, client_id, reply_to: None }
                };
                self.transport.send(self.entry, msg);
            }
            Some(_) => self.chat(line).await,
            None => {}
        }
        Ok(true)
    }

    async fn chat(&self, text: &str) {
        let mut session = self.session.lock().await;
        let Some((room, owner)) = session.joined.clone() else {
            println!("Join a room first (/create <room> or /join <room>).");
            return;
        };
        let body = match &self.key {
            Some(key) => cipher::encrypt(text, key),
            None => text.to_string(),
        };
        let message_id = uuid::Uuid::new_v4().to_string();
        let msg = Message::ChatMsg { message_id: message_id.clone(), from: self.id.clone(), room, body };
        session.unconfirmed.insert(message_id, msg.clone());
        drop(session);
        self.transport.send(owner, msg);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.id.trim().is_empty() {
        bail!("client id must not be empty");
    }

    let (transport, inbound) = UdpTransport::bind(args.bind).await?;
    let client = Arc::new(Client {
        id: args.id,
        entry: args.server,
        key: args.key,
        transport,
        session: Mutex::new(Session::default()),
    });

    tokio::spawn(client.clone().listen(inbound));
    client.transport.send(client.entry, Message::ClientJoin { client_id: client.id.clone() });
    println!("Commands: /list | /create <room> | /join <room> | /quit | <text> to chat");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !client.command(line).await? {
            break;
        }
    }
    Ok(())
}
