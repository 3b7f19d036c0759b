//! Connection lifecycle: negotiate a session, bootstrap it, and keep it alive.
//!
//! [`Lifecycle::establish`] runs one full attempt (connect, stream negotiation,
//! self profile, room discovery, joins, presence). [`Lifecycle::establish_with_retry`]
//! repeats it with a fixed back-off until it succeeds. The read task owns the
//! receive half of the session and re-enters the retry loop whenever the server
//! ends the stream.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::stanza::{self, SessionInfo};
use super::{ns, XmppConnection, XmppEvent, XmppReader, XmppWriter};
use crate::config::XmppConfig;
use crate::directory::{Room, User};
use crate::error::XmppError;

/// Consecutive non-fatal read errors after which the socket is treated as dead.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

/// A ready session as handed to the bridge.
pub struct Connected {
    pub writer: XmppWriter,
    pub session: SessionInfo,
    /// Own profile; `jid` is always the bare session JID.
    pub me: User,
    pub rooms: Vec<Room>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    StreamOpened,
    FeaturesReceived,
    TlsRequested,
    TlsUpgraded,
    Authenticated,
}

pub struct Lifecycle {
    config: XmppConfig,
    span: Span,
}

impl Lifecycle {
    pub fn new(config: XmppConfig, span: Span) -> Self {
        Self { config, span }
    }

    /// One complete connection attempt. Any failure after negotiation closes
    /// the connection before the error is returned.
    pub async fn establish(&self) -> Result<(XmppReader, Connected), XmppError> {
        let conn = XmppConnection::connect(&self.config.host, self.config.port, self.config.connect_timeout).await?;
        let (mut conn, session) = self.negotiate(conn).await?;

        match self.bootstrap(&mut conn, &session).await {
            Ok((me, rooms)) => {
                let (reader, writer) = conn.into_split();
                Ok((reader, Connected { writer, session, me, rooms }))
            }
            Err(e) => {
                conn.disconnect().await;
                Err(e)
            }
        }
    }

    /// Stream negotiation: open, optional STARTTLS upgrade and re-open, auth.
    async fn negotiate(&self, mut conn: XmppConnection) -> Result<(XmppConnection, SessionInfo), XmppError> {
        let identity = self.config.identity();
        let host = self.config.host.as_str();

        conn.open_stream(&identity, host).await?;
        let mut state = NegotiationState::StreamOpened;

        loop {
            let start = conn.next_element().await?;

            if start.is("stream", ns::STREAM) {
                let features = conn.read_features().await?;
                state = NegotiationState::FeaturesReceived;
                debug!(
                    ?state,
                    starttls_required = features.starttls_required,
                    tls = conn.is_tls(),
                    mechanisms = ?features.mechanisms,
                    "Stream features received"
                );

                if features.starttls_required && !conn.is_tls() {
                    conn.request_starttls().await?;
                    state = NegotiationState::TlsRequested;
                    continue;
                }

                let session = conn
                    .authenticate(&self.config.username, &self.config.password, &self.config.resource)
                    .await?;
                state = NegotiationState::Authenticated;
                debug!(?state, "Stream negotiation complete");
                return Ok((conn, session));
            }

            if start.is("proceed", ns::TLS) && state == NegotiationState::TlsRequested {
                conn = conn.upgrade_tls(host, self.config.insecure_tls).await?;
                state = NegotiationState::TlsUpgraded;
                debug!(?state, "Re-opening stream over TLS");
                conn.open_stream(&identity, host).await?;
                state = NegotiationState::StreamOpened;
                continue;
            }

            if start.is("failure", ns::TLS) {
                return Err(XmppError::Tls("server refused STARTTLS".to_string()));
            }

            debug!(element = %start.name, ?state, "Skipping element during negotiation");
            conn.skip();
        }
    }

    /// Post-auth setup: own profile, rooms, joins and presence.
    async fn bootstrap(&self, conn: &mut XmppConnection, session: &SessionInfo) -> Result<(User, Vec<Room>), XmppError> {
        conn.writer().request_user_info(&session.jid, "").await?;
        let mut me = conn.decode_user_info(None).await?;
        me.jid = session.bare_jid().to_string();
        me.id = stanza::local_part(&me.jid).to_string();
        info!(name = %me.name, mention = %me.mention, "Own profile loaded");

        let rooms = conn.discover_rooms(&session.jid, &session.muc_host).await?;
        let room_ids: Vec<String> = rooms.iter().map(|room| room.id.clone()).collect();
        conn.writer().join_rooms(&session.jid, &self.config.nick, &room_ids).await?;
        conn.writer().set_available(&session.jid).await?;
        info!(rooms = rooms.len(), nick = %self.config.nick, "Joined rooms and announced availability");

        Ok((me, rooms))
    }

    /// Retry [`establish`](Self::establish) with a fixed back-off until it succeeds.
    pub async fn establish_with_retry(&self) -> (XmppReader, Connected) {
        loop {
            match self.establish().await {
                Ok(established) => return established,
                Err(e) => {
                    error!(error = %e, "Failed to establish connection with chat service");
                    warn!(delay = ?self.config.retry_delay, "Sleeping before retry");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Establish a session and hand its writer to the bridge. `None` once the
    /// bridge has gone away.
    async fn connect_and_announce(&self, events: &mpsc::Sender<XmppEvent>) -> Option<XmppReader> {
        let (reader, connected) = self.establish_with_retry().await;
        match events.send(XmppEvent::Connected(Box::new(connected))).await {
            Ok(()) => Some(reader),
            Err(_) => None,
        }
    }
}

/// Spawn the read task inside the lifecycle's span.
pub fn spawn_reader(lifecycle: Lifecycle, events: mpsc::Sender<XmppEvent>) -> JoinHandle<()> {
    let span = lifecycle.span.clone();
    tokio::spawn(run_reader(lifecycle, events).instrument(span))
}

/// Read loop: establish, then decode and forward stanzas until the bridge stops
/// listening. End-of-stream re-establishes the session in place, and so does a
/// run of `MAX_CONSECUTIVE_READ_ERRORS` failed reads.
pub async fn run_reader(lifecycle: Lifecycle, events: mpsc::Sender<XmppEvent>) {
    let Some(mut reader) = lifecycle.connect_and_announce(&events).await else {
        return;
    };
    let mut consecutive_errors = 0u32;

    loop {
        let start = match reader.next_element().await {
            Ok(start) => {
                consecutive_errors = 0;
                start
            }
            Err(e) => {
                let dead = match e {
                    XmppError::EndOfStream => true,
                    _ => {
                        consecutive_errors += 1;
                        error!(error = %e, consecutive_errors, "Chat stream read failed");
                        consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS
                    }
                };
                if dead {
                    warn!("Chat stream ended, reconnecting");
                    consecutive_errors = 0;
                    reader = match lifecycle.connect_and_announce(&events).await {
                        Some(reader) => reader,
                        None => return,
                    };
                }
                continue;
            }
        };

        let event = match start.name.as_str() {
            "message" => match reader.decode().and_then(|element| stanza::decode_message(&element)) {
                Ok(Some(chat)) => XmppEvent::Chat(chat),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable message");
                    continue;
                }
            },
            "iq" => match reader.decode().and_then(|element| stanza::decode_vcard(&element)) {
                Ok(user) => XmppEvent::UserInfo(user),
                Err(e) => {
                    warn!(error = %e, "Error decoding user vCard");
                    continue;
                }
            },
            _ => {
                reader.skip();
                continue;
            }
        };

        if events.send(event).await.is_err() {
            info!("Bridge stopped, ending chat read loop");
            return;
        }
    }
}
