//! Typed records for the stanzas this adapter exchanges with the chat service,
//! plus the builders for everything it sends.

use base64::Engine;
use quick_xml::escape::escape;

use super::framing::Element;
use super::ns;
use crate::directory::{Room, User};
use crate::error::XmppError;

/// Random 16-hex-digit stanza id.
pub fn stanza_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Split `bare/resource` at the first slash.
pub fn split_address(address: &str) -> (&str, Option<&str>) {
    match address.split_once('/') {
        Some((bare, resource)) => (bare, Some(resource)),
        None => (address, None),
    }
}

/// Local part of a JID (`12345_678` in `12345_678@chat.hipchat.com`).
pub fn local_part(jid: &str) -> &str {
    let (bare, _) = split_address(jid);
    bare.split_once('@').map_or(bare, |(local, _)| local)
}

// --- inbound ---

/// Capabilities advertised in `<stream:features>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Features {
    pub starttls: bool,
    pub starttls_required: bool,
    /// Auth mechanisms offered, by element name (the service advertises `<auth/>`).
    pub mechanisms: Vec<String>,
}

impl Features {
    pub fn decode(element: &Element) -> Result<Self, XmppError> {
        if !element.is("features", ns::STREAM) {
            return Err(XmppError::MalformedStanza(format!(
                "expected stream features, got <{}>",
                element.name
            )));
        }

        let starttls = element.children.iter().find(|c| c.is("starttls", ns::TLS));
        let mechanisms = element
            .children
            .iter()
            .filter(|c| c.name != "starttls")
            .map(|c| c.name.clone())
            .collect();

        Ok(Self {
            starttls: starttls.is_some(),
            starttls_required: starttls.is_some_and(|s| s.child("required").is_some()),
            mechanisms,
        })
    }
}

/// Session record returned by the service in the auth `<success>` element.
/// Attributes the server leaves out are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    /// Full JID bound to this session.
    pub jid: String,
    pub api_host: String,
    pub chat_host: String,
    /// Conference host used for room discovery.
    pub muc_host: String,
    pub web_host: String,
    /// OAuth2 token for the REST API; never logged.
    pub token: String,
}

impl SessionInfo {
    pub fn decode(element: &Element) -> Result<Self, XmppError> {
        if element.name != "success" {
            return Err(XmppError::Auth(format!("unexpected <{}> in place of <success>", element.name)));
        }
        Ok(Self {
            jid: element.attr_or_empty("jid"),
            api_host: element.attr_or_empty("api_host"),
            chat_host: element.attr_or_empty("chat_host"),
            muc_host: element.attr_or_empty("muc_host"),
            web_host: element.attr_or_empty("web_host"),
            token: element.attr_or_empty("oauth2_token"),
        })
    }

    /// Group-wide account id (the part of the local JID before `_`).
    pub fn account_id(&self) -> &str {
        let local = local_part(&self.jid);
        local.split_once('_').map_or(local, |(account, _)| account)
    }

    /// Bare form of the session JID.
    pub fn bare_jid(&self) -> &str {
        split_address(&self.jid).0
    }
}

/// Condition name of an auth `<failure>`, e.g. `not-authorized`.
pub fn failure_condition(element: &Element) -> String {
    let condition = element
        .children
        .iter()
        .find(|c| c.name != "text")
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "unspecified".to_string());
    let text = element.child_text("text");
    if text.is_empty() {
        condition
    } else {
        format!("{condition} ({text})")
    }
}

/// Decode a disco#items result into rooms. Items without a JID are dropped.
pub fn decode_rooms(element: &Element) -> Result<Vec<Room>, XmppError> {
    if element.name != "iq" {
        return Err(XmppError::DirectoryLookup(format!("expected <iq>, got <{}>", element.name)));
    }
    if element.attr("type") == Some("error") {
        return Err(XmppError::DirectoryLookup("room discovery returned an error".to_string()));
    }
    let query = element
        .children
        .iter()
        .find(|c| c.is("query", ns::DISCO_ITEMS))
        .ok_or_else(|| XmppError::DirectoryLookup("room list has no disco#items query".to_string()))?;

    Ok(query
        .children_named("item")
        .filter_map(|item| {
            let id = item.attr("jid").filter(|jid| !jid.is_empty())?;
            Some(Room {
                id: id.to_string(),
                name: item.attr_or_empty("name"),
            })
        })
        .collect())
}

/// Decode a vCard iq result. The user's JID is the bare form of the iq
/// `from` attribute; a response to a self-lookup may carry none.
pub fn decode_vcard(element: &Element) -> Result<User, XmppError> {
    if element.name != "iq" {
        return Err(XmppError::DirectoryLookup(format!("expected <iq>, got <{}>", element.name)));
    }
    let vcard = element
        .children
        .iter()
        .find(|c| c.is("vCard", ns::VCARD))
        .ok_or_else(|| XmppError::DirectoryLookup("iq carries no vCard".to_string()))?;

    let jid = split_address(element.attr("from").unwrap_or_default()).0.to_string();
    let email = vcard
        .child("EMAIL")
        .map(|email| email.child_text("USERID"))
        .unwrap_or_default();

    Ok(User {
        id: local_part(&jid).to_string(),
        jid,
        name: vcard.child_text("FN"),
        mention: vcard.child_text("NICKNAME"),
        email,
    })
}

/// A chat message with a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// `room/nick` for group chat, a user address for direct chat.
    pub from: String,
    /// Sender's real JID (`from_jid`), when the service supplies it.
    pub sender_jid: Option<String>,
    pub body: String,
    /// `type` attribute (`groupchat`, `chat`, ...).
    pub kind: String,
}

/// An invitation to a room the bot has not joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInvitation {
    /// Address the invitation was sent from.
    pub from: String,
    pub room_name: String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Invitation(RoomInvitation),
}

/// Decode a `<message>` stanza. Messages with neither a body nor an invitation
/// (typing notifications, receipts) decode to `None`.
pub fn decode_message(element: &Element) -> Result<Option<ChatEvent>, XmppError> {
    if element.name != "message" {
        return Err(XmppError::MalformedStanza(format!("expected <message>, got <{}>", element.name)));
    }
    let from = element
        .attr("from")
        .ok_or_else(|| XmppError::MalformedStanza("message without a sender".to_string()))?
        .to_string();

    let body = element.child_text("body");
    if !body.is_empty() {
        return Ok(Some(ChatEvent::Message(ChatMessage {
            from,
            sender_jid: element.attr("from_jid").filter(|j| !j.is_empty()).map(str::to_string),
            body,
            kind: element.attr_or_empty("type"),
        })));
    }

    let invite = element.child("x").map(|x| (x.child_text("name"), x.child_text("id")));
    match invite {
        Some((room_name, room_id)) if !room_name.is_empty() => {
            Ok(Some(ChatEvent::Invitation(RoomInvitation { from, room_name, room_id })))
        }
        _ => Ok(None),
    }
}

// --- outbound ---

/// Stream header opening (or re-opening) the client stream.
pub fn stream_header(from: &str, to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream from='{}' to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
        escape(from),
        escape(to),
        ns::CLIENT,
        ns::STREAM
    )
}

pub const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// Single-space whitespace keepalive.
pub const KEEPALIVE: &[u8] = b" ";

pub fn starttls() -> Element {
    Element::new("starttls").with_ns(ns::TLS)
}

/// Proprietary auth element: base64 of `\0user\0password\0resource`.
pub fn auth(username: &str, password: &str, resource: &str) -> Element {
    let credentials = format!("\0{username}\0{password}\0{resource}");
    Element::new("auth")
        .with_ns(ns::AUTH)
        .with_attr("oauth2_token", "true")
        .with_text(base64::engine::general_purpose::STANDARD.encode(credentials))
}

pub fn disco_items(from: &str, to: &str) -> Element {
    Element::new("iq")
        .with_attr("type", "get")
        .with_attr("id", stanza_id())
        .with_attr("from", from)
        .with_attr("to", to)
        .with_child(Element::new("query").with_ns(ns::DISCO_ITEMS))
}

/// vCard request. An empty `to` asks for the account's own vCard.
pub fn vcard_request(from: &str, to: &str) -> Element {
    Element::new("iq")
        .with_attr("type", "get")
        .with_attr("id", stanza_id())
        .with_attr("from", from)
        .with_opt_attr("to", to)
        .with_child(Element::new("vCard").with_ns(ns::VCARD))
}

pub fn join_room(from: &str, room_id: &str, nick: &str) -> Element {
    Element::new("presence")
        .with_attr("id", stanza_id())
        .with_attr("from", from)
        .with_attr("to", format!("{room_id}/{nick}"))
        .with_child(Element::new("x").with_ns(ns::MUC))
}

pub fn available(from: &str) -> Element {
    Element::new("presence")
        .with_attr("id", stanza_id())
        .with_attr("from", from)
        .with_child(Element::new("show").with_text("chat"))
}

pub fn groupchat(from: &str, room_id: &str, nick: &str, body: &str) -> Element {
    Element::new("message")
        .with_attr("from", from)
        .with_attr("to", format!("{room_id}/{nick}"))
        .with_attr("id", stanza_id())
        .with_attr("type", "groupchat")
        .with_child(Element::new("body").with_text(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_id_is_16_hex_digits() {
        let id = stanza_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(stanza_id(), stanza_id());
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("room@conf/Alice Liddell"), ("room@conf", Some("Alice Liddell")));
        assert_eq!(split_address("room@conf"), ("room@conf", None));
        assert_eq!(split_address("a@b/c/d"), ("a@b", Some("c/d")));
        assert_eq!(local_part("12_34@chat.hipchat.com/bot"), "12_34");
    }

    #[test]
    fn test_features_required_starttls() {
        let features = Element::parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
        )
        .unwrap();
        let features = Features::decode(&features).unwrap();
        assert!(features.starttls);
        assert!(features.starttls_required);
        assert!(features.mechanisms.is_empty());
    }

    #[test]
    fn test_features_after_tls_offer_auth_only() {
        let features = Element::parse(
            "<stream:features><auth xmlns='http://hipchat.com/protocol/auth'/></stream:features>",
        )
        .unwrap();
        let features = Features::decode(&features).unwrap();
        assert!(!features.starttls_required);
        assert_eq!(features.mechanisms, vec!["auth".to_string()]);
    }

    #[test]
    fn test_features_rejects_other_elements() {
        let iq = Element::parse("<iq type='result'/>").unwrap();
        assert!(matches!(Features::decode(&iq), Err(XmppError::MalformedStanza(_))));
    }

    #[test]
    fn test_session_from_success() {
        let success = Element::parse(
            "<success xmlns='http://hipchat.com' jid='12345_678@chat.hipchat.com/bot' api_host='api.hipchat.com' chat_host='chat.hipchat.com' muc_host='conf.hipchat.com' web_host='www.hipchat.com' oauth2_token='tok'/>",
        )
        .unwrap();
        let session = SessionInfo::decode(&success).unwrap();
        assert_eq!(session.jid, "12345_678@chat.hipchat.com/bot");
        assert_eq!(session.bare_jid(), "12345_678@chat.hipchat.com");
        assert_eq!(session.muc_host, "conf.hipchat.com");
        assert_eq!(session.token, "tok");
        assert_eq!(session.account_id(), "12345");
    }

    #[test]
    fn test_session_missing_attributes_are_empty() {
        let success = Element::parse("<success jid='1_2@chat'/>").unwrap();
        let session = SessionInfo::decode(&success).unwrap();
        assert_eq!(session.muc_host, "");
        assert_eq!(session.web_host, "");
        assert_eq!(session.token, "");
    }

    #[test]
    fn test_failure_condition() {
        let failure = Element::parse(
            "<failure xmlns='http://hipchat.com'><not-authorized/><text>Invalid password</text></failure>",
        )
        .unwrap();
        assert_eq!(failure_condition(&failure), "not-authorized (Invalid password)");
        assert_eq!(failure_condition(&Element::new("failure")), "unspecified");
    }

    #[test]
    fn test_decode_rooms() {
        let iq = Element::parse(
            "<iq type='result' id='x'><query xmlns='http://jabber.org/protocol/disco#items'>\
             <item jid='room1@conf.hipchat.com' name='Room One'/>\
             <item jid='room2@conf.hipchat.com' name='Ops &amp; Infra'><x xmlns='http://hipchat.com/protocol/muc#room'><topic>t</topic></x></item>\
             <item name='no jid'/>\
             </query></iq>",
        )
        .unwrap();
        let rooms = decode_rooms(&iq).unwrap();
        assert_eq!(
            rooms,
            vec![
                Room { id: "room1@conf.hipchat.com".to_string(), name: "Room One".to_string() },
                Room { id: "room2@conf.hipchat.com".to_string(), name: "Ops & Infra".to_string() },
            ]
        );
    }

    #[test]
    fn test_decode_rooms_rejects_error_iq() {
        let iq = Element::parse("<iq type='error'><error type='cancel'/></iq>").unwrap();
        assert!(matches!(decode_rooms(&iq), Err(XmppError::DirectoryLookup(_))));
    }

    #[test]
    fn test_decode_vcard() {
        let iq = Element::parse(
            "<iq type='result' from='1_10@chat.hipchat.com' id='v'><vCard xmlns='vcard-temp'>\
             <FN>Alice Liddell</FN><NICKNAME>alice</NICKNAME><EMAIL><USERID>alice@example.com</USERID></EMAIL>\
             </vCard></iq>",
        )
        .unwrap();
        let user = decode_vcard(&iq).unwrap();
        assert_eq!(user.jid, "1_10@chat.hipchat.com");
        assert_eq!(user.id, "1_10");
        assert_eq!(user.name, "Alice Liddell");
        assert_eq!(user.mention, "alice");
        assert_eq!(user.email, "alice@example.com");
    }

    #[test]
    fn test_decode_vcard_requires_vcard_child() {
        let iq = Element::parse("<iq type='result' from='a@b'><query xmlns='jabber:iq:roster'/></iq>").unwrap();
        assert!(matches!(decode_vcard(&iq), Err(XmppError::DirectoryLookup(_))));
    }

    #[test]
    fn test_decode_group_message() {
        let message = Element::parse(
            "<message type='groupchat' from='room1@conf/Alice Liddell' from_jid='1_10@chat.hipchat.com' to='1_20@chat/bot'><body>@bot hello</body></message>",
        )
        .unwrap();
        let Some(ChatEvent::Message(chat)) = decode_message(&message).unwrap() else {
            panic!("expected a chat message");
        };
        assert_eq!(chat.from, "room1@conf/Alice Liddell");
        assert_eq!(chat.sender_jid.as_deref(), Some("1_10@chat.hipchat.com"));
        assert_eq!(chat.body, "@bot hello");
        assert_eq!(chat.kind, "groupchat");
    }

    #[test]
    fn test_decode_invitation() {
        let message = Element::parse(
            "<message from='1_10@chat.hipchat.com/web' to='1_20@chat'><x xmlns='http://hipchat.com/protocol/muc#room'><name>New Room</name><id>4242</id></x></message>",
        )
        .unwrap();
        let event = decode_message(&message).unwrap();
        assert_eq!(
            event,
            Some(ChatEvent::Invitation(RoomInvitation {
                from: "1_10@chat.hipchat.com/web".to_string(),
                room_name: "New Room".to_string(),
                room_id: "4242".to_string(),
            }))
        );
    }

    #[test]
    fn test_decode_bodiless_message_is_ignored() {
        let message = Element::parse(
            "<message from='room@conf/alice'><composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
        )
        .unwrap();
        assert_eq!(decode_message(&message).unwrap(), None);
    }

    #[test]
    fn test_decode_message_requires_sender() {
        let message = Element::parse("<message><body>hi</body></message>").unwrap();
        assert!(matches!(decode_message(&message), Err(XmppError::MalformedStanza(_))));
    }

    #[test]
    fn test_auth_payload() {
        let auth = auth("12345_678", "secret", "bot");
        assert!(auth.is("auth", ns::AUTH));
        assert_eq!(auth.attr("oauth2_token"), Some("true"));
        let decoded = base64::engine::general_purpose::STANDARD.decode(&auth.text).unwrap();
        assert_eq!(decoded, b"\x0012345_678\x00secret\x00bot");
    }

    #[test]
    fn test_stream_header_escapes_attributes() {
        let header = stream_header("bot@chat'x", "chat.hipchat.com");
        assert!(header.starts_with("<?xml version='1.0'?><stream:stream from='bot@chat&apos;x'"));
        assert!(header.contains("to='chat.hipchat.com'"));
        assert!(header.contains("xmlns='jabber:client'"));
        assert!(header.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
    }

    #[test]
    fn test_vcard_request_without_target_omits_to() {
        let request = vcard_request("1_20@chat/bot", "");
        assert_eq!(request.attr("to"), None);
        assert!(request.child("vCard").unwrap().is("vCard", ns::VCARD));

        let request = vcard_request("1_20@chat/bot", "1_10@chat");
        assert_eq!(request.attr("to"), Some("1_10@chat"));
    }

    #[test]
    fn test_join_and_groupchat_address_room_nick() {
        let join = join_room("me@chat/bot", "room1@conf", "Helper Bot");
        assert_eq!(join.attr("to"), Some("room1@conf/Helper Bot"));
        assert!(join.child("x").unwrap().is("x", ns::MUC));

        let message = groupchat("me@chat/bot", "room1@conf", "Helper Bot", "hi there");
        assert_eq!(message.attr("type"), Some("groupchat"));
        assert_eq!(message.attr("to"), Some("room1@conf/Helper Bot"));
        assert_eq!(message.child_text("body"), "hi there");
    }

    #[test]
    fn test_available_presence_shows_chat() {
        let presence = available("me@chat/bot");
        assert_eq!(presence.child_text("show"), "chat");
        assert_eq!(presence.attr("id").map(str::len), Some(16));
    }
}
