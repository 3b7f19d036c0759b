//! Client-side XMPP transport for the hosted chat service.
//!
//! Owns the TCP socket, the in-place STARTTLS upgrade and the protocol
//! operations the adapter needs (auth, room discovery, joins, presence, vCards,
//! group messages). Once a session is established the connection is split: the
//! reader stays with the read loop in [`lifecycle`], the writer goes to the bridge.

pub mod framing;
pub mod lifecycle;
pub mod stanza;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::directory::{Room, User};
use crate::error::XmppError;
use framing::{Element, StanzaReader, StanzaWriter, StartElement};
use stanza::{ChatEvent, Features, SessionInfo};

/// XML namespaces used on the chat stream.
pub mod ns {
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// Proprietary auth namespace of the hosted service.
    pub const AUTH: &str = "http://hipchat.com";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const VCARD: &str = "vcard-temp";
}

/// Initialize rustls crypto provider (must be called once at startup)
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: Only used when `--dangerous-insecure-tls` is set, for servers
/// with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS connector backed by the system's native root certificates, or by no
/// verification at all when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, XmppError> {
    if insecure {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(XmppError::Tls(
            "no system root certificates found; install the CA certificates package".to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| XmppError::Tls(format!("failed to add root certificate: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over an established TCP stream, using `host` for SNI.
async fn upgrade_to_tls(
    tcp_stream: TcpStream,
    host: &str,
    insecure: bool,
) -> Result<TlsStream<TcpStream>, XmppError> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| XmppError::Tls(format!("invalid server name {host}: {e}")))?;

    connector.connect(server_name, tcp_stream).await.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("timed out") || detail.contains("timeout") {
            "timeout"
        } else if detail.contains("refused") || detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(host, error = %e, error_class = classification, "TLS handshake failed");
        XmppError::Tls(format!("handshake with {host} failed ({classification}): {e}"))
    })
}

/// The chat socket before or after the STARTTLS upgrade.
pub enum XmppStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for XmppStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            XmppStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for XmppStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            XmppStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_flush(cx),
            XmppStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            XmppStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

pub type XmppReader = StanzaReader<ReadHalf<XmppStream>>;
pub type XmppWriter = StanzaWriter<WriteHalf<XmppStream>>;

/// Everything the read loop forwards to the bridge.
pub enum XmppEvent {
    /// A session was (re-)established; carries the fresh writer and directory seed.
    Connected(Box<lifecycle::Connected>),
    Chat(ChatEvent),
    UserInfo(User),
}

/// One connection to the chat service, from TCP connect to session teardown.
pub struct XmppConnection {
    reader: XmppReader,
    writer: XmppWriter,
    tls: bool,
}

impl XmppConnection {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, XmppError> {
        let connect_err = |source: io::Error| XmppError::Connect {
            host: host.to_string(),
            port,
            source,
        };
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| connect_err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(connect_err)?;
        let _ = tcp.set_nodelay(true);
        info!(host, port, "Connected to chat service");
        Ok(Self::from_stream(XmppStream::Plain(tcp), false))
    }

    fn from_stream(stream: XmppStream, tls: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: StanzaReader::new(read_half),
            writer: StanzaWriter::new(write_half),
            tls,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub async fn open_stream(&mut self, from: &str, to: &str) -> Result<(), XmppError> {
        debug!(from, to, tls = self.tls, "Opening stream");
        self.writer.write_raw(stanza::stream_header(from, to).as_bytes()).await
    }

    pub async fn next_element(&mut self) -> Result<StartElement, XmppError> {
        self.reader.next_element().await
    }

    pub fn skip(&mut self) {
        self.reader.skip();
    }

    /// Decode the features element following the server's stream header.
    pub async fn read_features(&mut self) -> Result<Features, XmppError> {
        let element = self.reader.read_element().await?;
        Features::decode(&element)
    }

    pub async fn request_starttls(&mut self) -> Result<(), XmppError> {
        debug!("Sending STARTTLS request");
        self.writer.send(&stanza::starttls()).await
    }

    /// Re-wrap the socket in TLS after `<proceed/>`. The stream must be
    /// re-opened by the caller.
    pub async fn upgrade_tls(self, host: &str, insecure: bool) -> Result<Self, XmppError> {
        let (read_half, leftover) = self.reader.into_parts();
        if !leftover.is_empty() {
            warn!(bytes = leftover.len(), "Discarding plaintext received after <proceed/>");
        }
        let tcp = match read_half.unsplit(self.writer.into_inner()) {
            XmppStream::Plain(tcp) => tcp,
            XmppStream::Tls(_) => return Err(XmppError::Tls("stream is already encrypted".to_string())),
        };
        let tls = upgrade_to_tls(tcp, host, insecure).await?;
        info!(host, "TLS handshake complete");
        Ok(Self::from_stream(XmppStream::Tls(Box::new(tls)), true))
    }

    /// Send the proprietary auth element and wait for `<success>`.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        resource: &str,
    ) -> Result<SessionInfo, XmppError> {
        debug!(username, resource, "Authenticating");
        self.writer.send(&stanza::auth(username, password, resource)).await?;

        let response = self.reader.read_element().await?;
        match response.name.as_str() {
            "success" => {
                let session = SessionInfo::decode(&response)?;
                info!(jid = %session.jid, account = session.account_id(), "Authenticated");
                Ok(session)
            }
            "failure" => Err(XmppError::Auth(stanza::failure_condition(&response))),
            other => Err(XmppError::Auth(format!("unexpected <{other}> in reply to auth"))),
        }
    }

    /// Ask the conference host for its room list. A reply that cannot be
    /// decoded yields no rooms; transport failures still propagate.
    pub async fn discover_rooms(&mut self, from: &str, muc_host: &str) -> Result<Vec<Room>, XmppError> {
        self.writer.send(&stanza::disco_items(from, muc_host)).await?;
        let reply = self.reader.read_element().await;
        match reply.and_then(|element| stanza::decode_rooms(&element)) {
            Ok(rooms) => {
                debug!(count = rooms.len(), "Room list received");
                Ok(rooms)
            }
            Err(e @ (XmppError::EndOfStream | XmppError::Io(_))) => Err(e),
            Err(e) => {
                warn!(error = %e, "Could not decode room list, continuing without rooms");
                Ok(Vec::new())
            }
        }
    }

    pub fn writer(&mut self) -> &mut XmppWriter {
        &mut self.writer
    }

    /// Decode a vCard result. With `element` unset the next element is read
    /// from the stream first.
    pub async fn decode_user_info(&mut self, element: Option<&Element>) -> Result<User, XmppError> {
        match element {
            Some(element) => stanza::decode_vcard(element),
            None => {
                let element = self.reader.read_element().await?;
                stanza::decode_vcard(&element)
            }
        }
    }

    pub fn into_split(self) -> (XmppReader, XmppWriter) {
        (self.reader, self.writer)
    }

    /// Close the stream and the socket. Errors are ignored; the peer may already be gone.
    pub async fn disconnect(mut self) {
        self.writer.close().await;
    }
}

/// Protocol operations on the send half of a session.
impl<W: AsyncWrite + Unpin> StanzaWriter<W> {
    pub async fn join_rooms(&mut self, from: &str, nick: &str, room_ids: &[String]) -> Result<(), XmppError> {
        for room_id in room_ids {
            debug!(room = %room_id, nick, "Joining room");
            self.send(&stanza::join_room(from, room_id, nick)).await?;
        }
        Ok(())
    }

    pub async fn set_available(&mut self, from: &str) -> Result<(), XmppError> {
        self.send(&stanza::available(from)).await
    }

    pub async fn keep_alive(&mut self) -> Result<(), XmppError> {
        self.write_raw(stanza::KEEPALIVE).await
    }

    /// Request a vCard; an empty `target` requests the account's own.
    pub async fn request_user_info(&mut self, from: &str, target: &str) -> Result<(), XmppError> {
        self.send(&stanza::vcard_request(from, target)).await
    }

    pub async fn send_groupchat(&mut self, from: &str, room_id: &str, nick: &str, body: &str) -> Result<(), XmppError> {
        self.send(&stanza::groupchat(from, room_id, nick, body)).await
    }

    /// Write `</stream:stream>` and shut the socket down, ignoring errors.
    pub async fn close(&mut self) {
        if let Err(e) = self.write_raw(stanza::STREAM_CLOSE).await {
            debug!(error = %e, "Could not send stream close");
        }
        if let Err(e) = self.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}
