//! IMAP Mailbox Module
//!
//! [`MailSource`] over IMAP with implicit TLS. One session is opened lazily
//! and reused across polls; any failure drops it so the next poll
//! reconnects. Messages are read through `ENVELOPE`, which leaves their
//! `\Seen` flag untouched.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::otp::{MailMessage, MailSource, MailboxConfig, RECENT_MESSAGES};
use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use secrecy::ExposeSecret;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Bound on TCP connect plus TLS handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type ImapSession = Session<TlsStream<TcpStream>>;

/// Inbox reader for `imap_server:imap_port` from the mailbox settings
pub struct ImapSource {
    tls: TlsConnector,
    session: Mutex<Option<ImapSession>>,
}

impl ImapSource {
    /// Source that trusts the bundled web PKI roots
    pub fn new() -> FlowResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| mailbox_error("TLS setup", e))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            session: Mutex::new(None),
        })
    }

    async fn connect(&self, mailbox: &MailboxConfig) -> FlowResult<ImapSession> {
        let server = mailbox.imap_server.as_str();
        let port = mailbox.imap_port;
        let server_name = ServerName::try_from(server.to_string())
            .map_err(|e| FlowEngineError::Mailbox(format!("invalid IMAP server name {}: {}", server, e)))?;

        let handshake = async {
            let tcp = TcpStream::connect((server, port))
                .await
                .map_err(|e| mailbox_error("connect", e))?;
            self.tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| mailbox_error("TLS handshake", e))
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| FlowEngineError::Mailbox(format!("connecting to {}:{} timed out", server, port)))??;

        let client = async_imap::Client::new(stream);
        let mut session = client
            .login(&mailbox.address, mailbox.password.expose_secret())
            .await
            .map_err(|(e, _)| FlowEngineError::Mailbox(format!("login as {} failed: {}", mailbox.address, e)))?;
        session
            .select("INBOX")
            .await
            .map_err(|e| mailbox_error("select INBOX", e))?;

        info!("[OTP] connected to {}:{} as {}", server, port, mailbox.address);
        Ok(session)
    }

    /// Newest messages matching an IMAP search `query`, oldest first
    async fn list(&self, mailbox: &MailboxConfig, query: &str) -> FlowResult<Vec<MailMessage>> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(mailbox).await?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| FlowEngineError::Mailbox("no IMAP session".to_string()))?;

        let result = fetch_envelopes(session, query).await;
        if result.is_err() {
            debug!("[OTP] dropping IMAP session after failure");
            *guard = None;
        }
        result
    }
}

impl fmt::Debug for ImapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn unseen(&self, mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>> {
        self.list(mailbox, "UNSEEN").await
    }

    async fn recent(&self, mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>> {
        self.list(mailbox, "ALL").await
    }
}

async fn fetch_envelopes(session: &mut ImapSession, query: &str) -> FlowResult<Vec<MailMessage>> {
    let ids: Vec<u32> = session
        .search(query)
        .await
        .map_err(|e| mailbox_error("search", e))?
        .into_iter()
        .collect();
    let Some(set) = newest_sequence_set(ids) else {
        return Ok(Vec::new());
    };

    let fetches: Vec<_> = session
        .fetch(&set, "ENVELOPE")
        .await
        .map_err(|e| mailbox_error("fetch", e))?
        .try_collect()
        .await
        .map_err(|e| mailbox_error("fetch", e))?;

    let mut messages: Vec<(u32, MailMessage)> = fetches
        .iter()
        .filter_map(|fetch| {
            let envelope = fetch.envelope()?;
            let from = envelope
                .from
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|a| format_address(a.name.as_deref(), a.mailbox.as_deref(), a.host.as_deref()))
                .collect::<Vec<_>>();
            let to = envelope
                .to
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|a| format_address(a.name.as_deref(), a.mailbox.as_deref(), a.host.as_deref()))
                .collect::<Vec<_>>();
            let message = MailMessage {
                from: from.join(", "),
                to: to.join(", "),
                subject: lossy(envelope.subject.as_deref()),
            };
            Some((fetch.message, message))
        })
        .collect();
    messages.sort_by_key(|(seq, _)| *seq);
    Ok(messages.into_iter().map(|(_, message)| message).collect())
}

/// Comma-separated set of the newest [`RECENT_MESSAGES`] ids
fn newest_sequence_set(mut ids: Vec<u32>) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    ids.sort_unstable();
    let newest = &ids[ids.len().saturating_sub(RECENT_MESSAGES)..];
    Some(newest.iter().map(u32::to_string).collect::<Vec<_>>().join(","))
}

fn format_address(name: Option<&[u8]>, mailbox: Option<&[u8]>, host: Option<&[u8]>) -> String {
    let addr = match host {
        Some(host) => format!("{}@{}", lossy(mailbox), lossy(Some(host))),
        None => lossy(mailbox),
    };
    let name = lossy(name);
    if name.is_empty() {
        addr
    } else {
        format!("{} <{}>", name, addr)
    }
}

fn lossy(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

fn mailbox_error(action: &str, e: impl fmt::Display) -> FlowEngineError {
    FlowEngineError::Mailbox(format!("{} failed: {}", action, e))
}
