//! The bridge loop: the one task that owns all bridging state.
//!
//! It waits on three inputs (chat events from the read task, queries from the
//! bus, keepalive ticks) and is the only place the directory and the session
//! writer are touched, so none of that state needs a lock.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::bus::{MessageBlock, Query, QueryType};
use crate::directory::Directory;
use crate::xmpp::stanza::{split_address, ChatEvent, ChatMessage, RoomInvitation};
use crate::xmpp::{XmppEvent, XmppWriter};

/// Result of scanning a message body for the bot's own `@mention`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub mentioned: bool,
    /// Body without the first mention token, trimmed. Empty when not mentioned.
    pub stripped: String,
}

/// Case-sensitive substring match for `@<mention_name>`. There is no word
/// boundary check, so `@bot` also matches inside `@botanist`. An empty mention
/// name never matches.
pub fn detect_mention(body: &str, mention_name: &str) -> Mention {
    if mention_name.is_empty() {
        return Mention { mentioned: false, stripped: String::new() };
    }
    let token = format!("@{mention_name}");
    match body.find(&token) {
        Some(at) => {
            let mut stripped = String::with_capacity(body.len() - token.len());
            stripped.push_str(&body[..at]);
            stripped.push_str(&body[at + token.len()..]);
            Mention {
                mentioned: true,
                stripped: stripped.trim().to_string(),
            }
        }
        None => Mention { mentioned: false, stripped: String::new() },
    }
}

/// Live session state, replaced on every reconnect.
struct Session {
    writer: XmppWriter,
    /// Full session JID used as `from` on outbound stanzas.
    jid: String,
    mention: String,
}

pub struct Bridge {
    nick: String,
    source_id: String,
    directory: Directory,
    session: Option<Session>,
    /// Contact addresses with a vCard request in flight.
    pending_lookups: HashSet<String>,
    span: Span,
}

enum Flow {
    Continue,
    Stop,
}

impl Bridge {
    pub fn new(nick: &str, source_id: &str, span: Span) -> Self {
        Self {
            nick: nick.to_string(),
            source_id: source_id.to_string(),
            directory: Directory::new(),
            session: None,
            pending_lookups: HashSet::new(),
            span,
        }
    }

    /// Run until a disengage arrives or an input channel closes.
    pub async fn run(
        self,
        xmpp_events: mpsc::Receiver<XmppEvent>,
        from_bus: mpsc::Receiver<Query>,
        to_bus: mpsc::Sender<Query>,
        keepalive: Duration,
    ) {
        let span = self.span.clone();
        self.event_loop(xmpp_events, from_bus, to_bus, keepalive)
            .instrument(span)
            .await
    }

    async fn event_loop(
        mut self,
        mut xmpp_events: mpsc::Receiver<XmppEvent>,
        mut from_bus: mpsc::Receiver<Query>,
        to_bus: mpsc::Sender<Query>,
        keepalive: Duration,
    ) {
        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = xmpp_events.recv() => {
                    let Some(event) = event else {
                        error!("Chat read loop stopped, terminating bridge");
                        return;
                    };
                    if let Some(query) = self.handle_xmpp_event(event).await {
                        if to_bus.send(query).await.is_err() {
                            warn!("Bus channel closed, terminating bridge");
                            return;
                        }
                    }
                }
                query = from_bus.recv() => {
                    let Some(query) = query else {
                        warn!("Bus channel closed, terminating bridge");
                        return;
                    };
                    if let Flow::Stop = self.handle_bus_query(query).await {
                        warn!("Disengage received, terminating");
                        return;
                    }
                }
                _ = ticker.tick() => self.keep_alive().await,
            }
        }
    }

    async fn handle_xmpp_event(&mut self, event: XmppEvent) -> Option<Query> {
        match event {
            XmppEvent::Connected(connected) => {
                let connected = *connected;
                for room in &connected.rooms {
                    self.directory.register_room(&room.name, &room.id);
                }
                let mention = connected.me.mention.clone();
                self.directory.upsert_user(connected.me);
                self.pending_lookups.clear();
                info!(
                    jid = %connected.session.jid,
                    mention = %mention,
                    rooms = self.directory.room_count(),
                    "Chat session ready"
                );
                self.session = Some(Session {
                    writer: connected.writer,
                    jid: connected.session.jid,
                    mention,
                });
                None
            }
            XmppEvent::UserInfo(user) => {
                self.pending_lookups.remove(&user.jid);
                self.directory.upsert_user(user);
                None
            }
            XmppEvent::Chat(ChatEvent::Message(message)) => self.handle_message(message).await,
            XmppEvent::Chat(ChatEvent::Invitation(invitation)) => {
                self.handle_invitation(invitation).await;
                None
            }
        }
    }

    async fn handle_message(&mut self, message: ChatMessage) -> Option<Query> {
        debug!(from = %message.from, kind = %message.kind, body = %message.body, "Chat message received");
        let (room_id, nick) = split_address(&message.from);
        let nick = nick.unwrap_or_default();

        if let Some(sender) = message.sender_jid.as_deref() {
            self.lookup_if_unknown(split_address(sender).0).await;
        }

        if message.body.is_empty() || nick == self.nick {
            return None;
        }

        let own_mention = self.session.as_ref().map(|s| s.mention.as_str()).unwrap_or_default();
        let mention = detect_mention(&message.body, own_mention);
        let room = self.directory.room_name(room_id).unwrap_or_default().to_string();

        Some(Query::message(
            &self.source_id,
            MessageBlock {
                message: message.body,
                from: nick.to_string(),
                room,
                mentioned: mention.mentioned,
                stripped: mention.stripped,
                mention_notify: Vec::new(),
            },
        ))
    }

    /// Request a vCard for a contact not yet in the directory, at most once
    /// until a response arrives. A lookup the server answers with an error iq
    /// never produces a profile, so that address stays pending until the next
    /// `Connected` clears the set.
    async fn lookup_if_unknown(&mut self, jid: &str) {
        if jid.is_empty() || self.directory.user_by_jid(jid).is_some() || self.pending_lookups.contains(jid) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.writer.request_user_info(&session.jid, jid).await {
            Ok(()) => {
                debug!(jid, "Requested user info");
                self.pending_lookups.insert(jid.to_string());
            }
            Err(e) => warn!(jid, error = %e, "User info request failed"),
        }
    }

    async fn handle_invitation(&mut self, invitation: RoomInvitation) {
        let room_id = split_address(&invitation.from).0.to_string();
        info!(room = %invitation.room_name, room_id = %room_id, "Invited to room, joining");
        self.directory.register_room(&invitation.room_name, &room_id);

        let Some(session) = self.session.as_mut() else {
            warn!(room = %invitation.room_name, "No chat session, cannot join");
            return;
        };
        if let Err(e) = session.writer.join_rooms(&session.jid, &self.nick, &[room_id]).await {
            warn!(room = %invitation.room_name, error = %e, "Room join failed");
        }
    }

    async fn handle_bus_query(&mut self, query: Query) -> Flow {
        if query.is_disengage() {
            return Flow::Stop;
        }
        match (query.kind, query.message) {
            (QueryType::Message, Some(block)) => self.send_group_message(block).await,
            (QueryType::Message, None) => debug!("Ignoring message query without a payload"),
            (kind, _) => debug!(?kind, "Ignoring bus query"),
        }
        Flow::Continue
    }

    async fn send_group_message(&mut self, block: MessageBlock) {
        let room_id = match self.directory.room_id(&block.room) {
            Some(id) => id.to_string(),
            None if self.directory.room_name(&block.room).is_some() => block.room.clone(),
            None => {
                warn!(room = %block.room, "Unknown room, dropping outbound message");
                return;
            }
        };

        let mut body = block.message;
        for name in &block.mention_notify {
            match self.directory.user_by_name(name) {
                Some(user) if !user.mention.is_empty() => {
                    body.push_str(" @");
                    body.push_str(&user.mention);
                }
                _ => debug!(name = %name, "No mention name known for user"),
            }
        }

        let Some(session) = self.session.as_mut() else {
            warn!(room = %block.room, "No chat session, dropping outbound message");
            return;
        };
        debug!(room = %room_id, body = %body, "Sending group message");
        if let Err(e) = session.writer.send_groupchat(&session.jid, &room_id, &self.nick, &body).await {
            warn!(room = %room_id, error = %e, "Group message send failed");
        }
    }

    async fn keep_alive(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.writer.keep_alive().await {
            Ok(()) => debug!("KeepAlive sent"),
            Err(e) => warn!(error = %e, "KeepAlive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Room, User};
    use crate::xmpp::framing::StanzaWriter;
    use crate::xmpp::lifecycle::Connected;
    use crate::xmpp::stanza::SessionInfo;
    use crate::xmpp::XmppStream;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const SOURCE: &str = "groupchat-adapter";

    /// A session writer whose far end the test can read.
    async fn wire() -> (XmppWriter, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = tokio::io::split(XmppStream::Plain(client));
        (StanzaWriter::new(write), server)
    }

    fn connected(writer: XmppWriter) -> XmppEvent {
        XmppEvent::Connected(Box::new(Connected {
            writer,
            session: SessionInfo {
                jid: "1_20@chat/bot".to_string(),
                ..Default::default()
            },
            me: User {
                id: "1_20".to_string(),
                jid: "1_20@chat".to_string(),
                name: "Helper Bot".to_string(),
                mention: "bot".to_string(),
                email: String::new(),
            },
            rooms: vec![Room {
                id: "room1@conf".to_string(),
                name: "Room One".to_string(),
            }],
        }))
    }

    fn group_message(from: &str, sender_jid: Option<&str>, body: &str) -> XmppEvent {
        XmppEvent::Chat(ChatEvent::Message(ChatMessage {
            from: from.to_string(),
            sender_jid: sender_jid.map(str::to_string),
            body: body.to_string(),
            kind: "groupchat".to_string(),
        }))
    }

    /// Read from the far end until `needle` shows up.
    async fn read_until(socket: &mut TcpStream, needle: &str) -> String {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !String::from_utf8_lossy(&received).contains(needle) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "writer closed before sending {needle}");
                received.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for outbound stanza");
        String::from_utf8(received).unwrap()
    }

    struct Harness {
        chat: mpsc::Sender<XmppEvent>,
        bus_in: mpsc::Sender<Query>,
        bus_out: mpsc::Receiver<Query>,
        task: JoinHandle<()>,
    }

    fn start(keepalive: Duration) -> Harness {
        let (chat, xmpp_events) = mpsc::channel(16);
        let (bus_in, from_bus) = mpsc::channel(16);
        let (to_bus, bus_out) = mpsc::channel(16);
        let bridge = Bridge::new("Helper Bot", SOURCE, Span::none());
        let task = tokio::spawn(bridge.run(xmpp_events, from_bus, to_bus, keepalive));
        Harness { chat, bus_in, bus_out, task }
    }

    async fn next_query(rx: &mut mpsc::Receiver<Query>) -> Query {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a bus query")
            .expect("bridge stopped")
    }

    #[test]
    fn test_detect_mention_strips_first_token() {
        assert_eq!(
            detect_mention("@bot hello", "bot"),
            Mention { mentioned: true, stripped: "hello".to_string() }
        );
        assert_eq!(detect_mention("hey @bot and @bot", "bot").stripped, "hey  and @bot");
    }

    #[test]
    fn test_detect_mention_is_case_sensitive() {
        assert!(!detect_mention("@Bot hello", "bot").mentioned);
        assert!(!detect_mention("bot hello", "bot").mentioned);
    }

    #[test]
    fn test_detect_mention_matches_inside_longer_names() {
        // Known false positive: no word boundary check
        let mention = detect_mention("ask @botanist", "bot");
        assert!(mention.mentioned);
        assert_eq!(mention.stripped, "ask anist");
    }

    #[test]
    fn test_detect_mention_empty_name_never_matches() {
        assert!(!detect_mention("@ anything", "").mentioned);
    }

    #[tokio::test]
    async fn test_group_message_forwarded_with_mention() {
        let (writer, _far_end) = wire().await;
        let mut h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat.send(group_message("room1@conf/alice", None, "@bot hello")).await.unwrap();

        let query = next_query(&mut h.bus_out).await;
        assert_eq!(query.kind, QueryType::Message);
        assert_eq!(query.source, SOURCE);
        assert_eq!(query.to, "server");
        assert_eq!(
            query.message.unwrap(),
            MessageBlock {
                message: "@bot hello".to_string(),
                from: "alice".to_string(),
                room: "Room One".to_string(),
                mentioned: true,
                stripped: "hello".to_string(),
                mention_notify: Vec::new(),
            }
        );
        h.task.abort();
    }

    #[tokio::test]
    async fn test_own_messages_and_unknown_rooms() {
        let (writer, _far_end) = wire().await;
        let mut h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat.send(group_message("room1@conf/Helper Bot", None, "echo")).await.unwrap();
        h.chat.send(group_message("other@conf/alice", None, "plain")).await.unwrap();

        // The bot's own message is dropped; the next one comes through unresolved
        let query = next_query(&mut h.bus_out).await;
        let block = query.message.unwrap();
        assert_eq!(block.message, "plain");
        assert_eq!(block.room, "");
        assert!(!block.mentioned);
        assert_eq!(block.stripped, "");
        h.task.abort();
    }

    #[tokio::test]
    async fn test_unknown_sender_triggers_single_lookup() {
        let (writer, mut far_end) = wire().await;
        let mut h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat
            .send(group_message("room1@conf/alice", Some("1_10@chat"), "one"))
            .await
            .unwrap();
        h.chat
            .send(group_message("room1@conf/alice", Some("1_10@chat"), "two"))
            .await
            .unwrap();
        next_query(&mut h.bus_out).await;
        next_query(&mut h.bus_out).await;

        // Mark the end of the outbound stream with a known stanza
        h.bus_in
            .send(Query::message(
                "server",
                MessageBlock {
                    message: "marker".to_string(),
                    room: "Room One".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let sent = read_until(&mut far_end, "marker").await;
        assert_eq!(sent.matches("vcard-temp").count(), 1);
        assert!(sent.contains("to=\"1_10@chat\""));
        h.task.abort();
    }

    #[tokio::test]
    async fn test_unanswered_lookup_is_retried_only_after_reconnect() {
        let (writer, mut first_end) = wire().await;
        let mut h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat
            .send(group_message("room1@conf/alice", Some("1_10@chat"), "one"))
            .await
            .unwrap();
        next_query(&mut h.bus_out).await;
        read_until(&mut first_end, "vcard-temp").await;

        // No profile ever arrives; the new session starts with nothing pending
        let (writer, mut second_end) = wire().await;
        h.chat.send(connected(writer)).await.unwrap();
        h.chat
            .send(group_message("room1@conf/alice", Some("1_10@chat"), "two"))
            .await
            .unwrap();
        next_query(&mut h.bus_out).await;

        let sent = read_until(&mut second_end, "vcard-temp").await;
        assert!(sent.contains("to=\"1_10@chat\""));
        h.task.abort();
    }

    #[tokio::test]
    async fn test_outbound_message_resolves_room_and_mentions() {
        let (writer, mut far_end) = wire().await;
        let h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat
            .send(XmppEvent::UserInfo(User {
                id: "1_10".to_string(),
                jid: "1_10@chat".to_string(),
                name: "Alice Liddell".to_string(),
                mention: "alice".to_string(),
                email: String::new(),
            }))
            .await
            .unwrap();
        h.bus_in
            .send(Query::message(
                "server",
                MessageBlock {
                    message: "deploy done".to_string(),
                    room: "Room One".to_string(),
                    mention_notify: vec!["Alice Liddell".to_string(), "Nobody".to_string()],
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let sent = read_until(&mut far_end, "</message>").await;
        assert!(sent.contains("type=\"groupchat\""));
        assert!(sent.contains("to=\"room1@conf/Helper Bot\""));
        assert!(sent.contains("from=\"1_20@chat/bot\""));
        assert!(sent.contains("<body>deploy done @alice</body>"));
        h.task.abort();
    }

    #[tokio::test]
    async fn test_outbound_message_accepts_room_id() {
        let (writer, mut far_end) = wire().await;
        let h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.bus_in
            .send(Query::message(
                "server",
                MessageBlock {
                    message: "by id".to_string(),
                    room: "room1@conf".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let sent = read_until(&mut far_end, "</message>").await;
        assert!(sent.contains("to=\"room1@conf/Helper Bot\""));
        h.task.abort();
    }

    #[tokio::test]
    async fn test_invitation_registers_and_joins_room() {
        let (writer, mut far_end) = wire().await;
        let mut h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.chat
            .send(XmppEvent::Chat(ChatEvent::Invitation(RoomInvitation {
                from: "newroom@conf/inviter".to_string(),
                room_name: "New Room".to_string(),
                room_id: "4242".to_string(),
            })))
            .await
            .unwrap();
        let sent = read_until(&mut far_end, "</presence>").await;
        assert!(sent.contains("to=\"newroom@conf/Helper Bot\""));
        assert!(sent.contains("http://jabber.org/protocol/muc"));

        // Messages from the new room now resolve to its name
        h.chat.send(group_message("newroom@conf/alice", None, "welcome")).await.unwrap();
        assert_eq!(next_query(&mut h.bus_out).await.message.unwrap().room, "New Room");
        h.task.abort();
    }

    #[tokio::test]
    async fn test_disengage_stops_without_sending() {
        let (writer, mut far_end) = wire().await;
        let h = start(Duration::from_secs(3600));
        h.chat.send(connected(writer)).await.unwrap();
        h.bus_in
            .send(serde_json::from_str(r#"{"type":"command","command":{"action":"disengage"}}"#).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("bridge did not stop")
            .unwrap();

        // The writer was dropped with the bridge and nothing was written
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), far_end.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_keepalive_writes_single_space() {
        let (writer, mut far_end) = wire().await;
        let h = start(Duration::from_millis(50));
        h.chat.send(connected(writer)).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), far_end.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n >= 1);
        assert!(buf[..n].iter().all(|b| *b == b' '));
        h.task.abort();
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session_writer() {
        let (first_writer, mut first_end) = wire().await;
        let (second_writer, mut second_end) = wire().await;
        let h = start(Duration::from_secs(3600));
        h.chat.send(connected(first_writer)).await.unwrap();
        h.chat.send(connected(second_writer)).await.unwrap();
        h.bus_in
            .send(Query::message(
                "server",
                MessageBlock {
                    message: "after reconnect".to_string(),
                    room: "Room One".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        read_until(&mut second_end, "after reconnect").await;
        // The first writer was dropped on replacement
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), first_end.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        h.task.abort();
    }
}
