//! OTP Mailbox Module
//!
//! Mailbox settings, message matching and the polling loop behind
//! `wait_otp`. The mail transport itself sits behind [`MailSource`] so any
//! retrieval protocol can be plugged in.

use crate::error::FlowResult;
use crate::flow::control::StopSignal;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref OTP_CODE: Regex = Regex::new(r"\d{6}").expect("otp pattern is valid");
}

/// Shortest time window a watcher will poll for
pub const MIN_WINDOW: Duration = Duration::from_secs(5);

/// Delay between inbox polls
pub const MAILBOX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Only the newest messages are inspected on each poll
pub const RECENT_MESSAGES: usize = 10;

/// Receives the code found by a watcher
pub type CodeSink = Arc<dyn Fn(String) + Send + Sync>;

/// Mailbox that verification emails are delivered to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub address: String,
    /// Mailbox password or app authorisation code
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    #[serde(default = "default_imap_server")]
    pub imap_server: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    /// Substring the From header must contain; empty accepts any sender
    #[serde(default)]
    pub sender_pattern: String,
    /// Every keyword must appear in the subject (case-insensitive)
    #[serde(default)]
    pub subject_keywords: Vec<String>,
    #[serde(default = "default_time_window")]
    pub time_window_seconds: u64,
}

fn default_imap_server() -> String {
    "imap.qq.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_time_window() -> u64 {
    300
}

impl MailboxConfig {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: SecretString::from(password.into()),
            imap_server: default_imap_server(),
            imap_port: default_imap_port(),
            sender_pattern: String::new(),
            subject_keywords: Vec::new(),
            time_window_seconds: default_time_window(),
        }
    }

    pub fn with_subject_keywords(mut self, keywords: Vec<String>) -> Self {
        self.subject_keywords = keywords;
        self
    }

    pub fn with_sender_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.sender_pattern = pattern.into();
        self
    }

    /// Both the address and the credential are filled in
    pub fn is_complete(&self) -> bool {
        !self.address.is_empty() && !self.password.expose_secret().is_empty()
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_seconds).max(MIN_WINDOW)
    }
}

/// One message as seen by the matcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
}

/// Everything a watcher needs to look for one account's code
#[derive(Debug, Clone)]
pub struct OtpRequest {
    pub mailbox: MailboxConfig,
    pub account_email: String,
}

impl OtpRequest {
    /// Code carried by `message` if it is addressed to this account and
    /// matches the sender and subject rules
    pub fn match_message(&self, message: &MailMessage) -> Option<String> {
        if !message.to.contains(&self.account_email) {
            return None;
        }
        let pattern = &self.mailbox.sender_pattern;
        if !pattern.is_empty() && !message.from.to_lowercase().contains(&pattern.to_lowercase()) {
            return None;
        }
        let subject = message.subject.to_lowercase();
        if !self
            .mailbox
            .subject_keywords
            .iter()
            .all(|k| subject.contains(&k.to_lowercase()))
        {
            return None;
        }
        extract_otp_from_subject(&message.subject)
    }
}

/// First six-digit run in a subject line
pub fn extract_otp_from_subject(subject: &str) -> Option<String> {
    OTP_CODE.find(subject).map(|m| m.as_str().to_string())
}

/// Background operation that delivers a code for one account.
///
/// Implementations return quietly when the window elapses or `stop` fires;
/// a code is delivered at most once.
#[async_trait]
pub trait MailboxWatcher: Send + Sync {
    async fn watch(&self, request: OtpRequest, on_code: CodeSink, stop: StopSignal);
}

/// Transport that lists inbox messages, newest last
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Unread messages; the watcher falls back to `recent` when empty
    async fn unseen(&self, mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>>;

    async fn recent(&self, mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>>;
}

/// Watcher that polls a [`MailSource`] until a matching message arrives
pub struct PollingWatcher<S> {
    source: S,
    poll_interval: Duration,
}

impl<S: MailSource> PollingWatcher<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            poll_interval: MAILBOX_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn poll_once(&self, request: &OtpRequest) -> FlowResult<Option<String>> {
        let mut messages = self.source.unseen(&request.mailbox).await?;
        if messages.is_empty() {
            messages = self.source.recent(&request.mailbox).await?;
        }
        let code = messages
            .iter()
            .rev()
            .take(RECENT_MESSAGES)
            .find_map(|m| request.match_message(m));
        Ok(code)
    }
}

#[async_trait]
impl<S: MailSource> MailboxWatcher for PollingWatcher<S> {
    async fn watch(&self, request: OtpRequest, on_code: CodeSink, stop: StopSignal) {
        if request.account_email.is_empty() {
            return;
        }
        info!("[OTP] watching mailbox for {}", request.account_email);

        let deadline = tokio::time::Instant::now() + request.mailbox.time_window();
        while tokio::time::Instant::now() < deadline {
            if stop.is_stopped() {
                info!("[OTP] stop requested, no longer watching for {}", request.account_email);
                return;
            }

            match self.poll_once(&request).await {
                Ok(Some(code)) => {
                    info!("[OTP] code received for {}", request.account_email);
                    on_code(code);
                    return;
                }
                Ok(None) => debug!("[OTP] nothing yet for {}", request.account_email),
                Err(e) => warn!("[OTP] mailbox poll failed for {}: {}", request.account_email, e),
            }

            tokio::select! {
                _ = stop.stopped() => {}
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + self.poll_interval)) => {}
            }
        }

        info!("[OTP] no verification email for {} within the window", request.account_email);
    }
}

/// Runs several watchers for the same request; the first code delivered
/// wins and stops the others
pub struct FirstCodeWatcher {
    watchers: Vec<Arc<dyn MailboxWatcher>>,
}

impl FirstCodeWatcher {
    pub fn new(watchers: Vec<Arc<dyn MailboxWatcher>>) -> Self {
        Self { watchers }
    }
}

#[async_trait]
impl MailboxWatcher for FirstCodeWatcher {
    async fn watch(&self, request: OtpRequest, on_code: CodeSink, stop: StopSignal) {
        let done = stop.child();
        let delivered = Arc::new(AtomicBool::new(false));
        let sink: CodeSink = {
            let done = done.clone();
            Arc::new(move |code: String| {
                if !delivered.swap(true, Ordering::SeqCst) {
                    on_code(code);
                    done.stop();
                }
            })
        };

        futures::future::join_all(
            self.watchers
                .iter()
                .map(|watcher| watcher.watch(request.clone(), sink.clone(), done.clone())),
        )
        .await;
    }
}

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::from(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn request() -> OtpRequest {
        OtpRequest {
            mailbox: MailboxConfig::new("inbox@example.com", "app-code")
                .with_subject_keywords(vec!["Verify".to_string()]),
            account_email: "abc123@example.org".to_string(),
        }
    }

    fn message(to: &str, subject: &str) -> MailMessage {
        MailMessage {
            from: "noreply@service.example".to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
        }
    }

    #[test]
    fn test_extract_code() {
        assert_eq!(extract_otp_from_subject("Your code 482913 - verify").as_deref(), Some("482913"));
        assert_eq!(extract_otp_from_subject("code 12345"), None);
        assert_eq!(extract_otp_from_subject(""), None);
    }

    #[test]
    fn test_match_rules() {
        let req = request();
        assert_eq!(
            req.match_message(&message("abc123@example.org", "VERIFY your email: 112233")).as_deref(),
            Some("112233")
        );
        assert_eq!(req.match_message(&message("other@example.org", "verify 112233")), None);
        assert_eq!(req.match_message(&message("abc123@example.org", "welcome 112233")), None);

        let mut strict = request();
        strict.mailbox.sender_pattern = "accounts@".to_string();
        assert_eq!(strict.match_message(&message("abc123@example.org", "verify 112233")), None);
    }

    #[test]
    fn test_incomplete_mailbox() {
        assert!(!MailboxConfig::new("", "x").is_complete());
        assert!(!MailboxConfig::new("a@b", "").is_complete());
        assert!(MailboxConfig::new("a@b", "x").is_complete());
    }

    struct Inbox {
        polls: Mutex<usize>,
        deliver_after: usize,
    }

    #[async_trait]
    impl MailSource for Inbox {
        async fn unseen(&self, _mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>> {
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            if *polls > self.deliver_after {
                Ok(vec![
                    message("someone@example.org", "verify 000000"),
                    message("abc123@example.org", "Verify code 654321"),
                ])
            } else {
                Ok(Vec::new())
            }
        }

        async fn recent(&self, _mailbox: &MailboxConfig) -> FlowResult<Vec<MailMessage>> {
            Ok(vec![message("abc123@example.org", "newsletter")])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_watcher_delivers_code() {
        let watcher = PollingWatcher::new(Inbox { polls: Mutex::new(0), deliver_after: 2 });
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        watcher
            .watch(
                request(),
                Arc::new(move |code| sink.lock().unwrap().push(code)),
                StopSignal::new(),
            )
            .await;

        assert_eq!(*received.lock().unwrap(), vec!["654321".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_watcher_gives_up_silently() {
        let watcher = PollingWatcher::new(Inbox { polls: Mutex::new(0), deliver_after: usize::MAX });
        let mut req = request();
        req.mailbox.time_window_seconds = 12;
        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = received.clone();

        watcher
            .watch(req, Arc::new(move |code| sink.lock().unwrap().push(code)), StopSignal::new())
            .await;

        assert!(received.lock().unwrap().is_empty());
    }

    /// Delivers `code` after `delay`, unless stopped first
    struct Delayed {
        code: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl MailboxWatcher for Delayed {
        async fn watch(&self, _request: OtpRequest, on_code: CodeSink, stop: StopSignal) {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => on_code(self.code.to_string()),
                _ = stop.stopped() => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_code_wins() {
        let watcher = FirstCodeWatcher::new(vec![
            Arc::new(Delayed { code: "222222", delay: Duration::from_secs(30) }),
            Arc::new(Delayed { code: "111111", delay: Duration::from_secs(3) }),
        ]);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let stop = StopSignal::new();

        let started = tokio::time::Instant::now();
        watcher
            .watch(request(), Arc::new(move |code: String| sink.lock().unwrap().push(code)), stop.clone())
            .await;

        assert_eq!(*received.lock().unwrap(), vec!["111111".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!stop.is_stopped());
    }

    #[tokio::test]
    async fn test_polling_watcher_honours_stop() {
        let watcher = PollingWatcher::new(Inbox { polls: Mutex::new(0), deliver_after: usize::MAX });
        let stop = StopSignal::new();
        stop.stop();
        watcher.watch(request(), Arc::new(|_| {}), stop).await;
    }
}
