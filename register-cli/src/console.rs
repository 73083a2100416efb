//! Operator console
//!
//! A background thread reads stdin lines. In auto mode a line carrying a
//! six-digit code is handed to the verification-code watcher; any other
//! line releases the current manual checkpoint.

use async_trait::async_trait;
use flow_engine::{extract_otp_from_subject, CodeSink, MailboxWatcher, ManualSignal, OtpRequest, StopSignal};
use std::io::BufRead;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// What one line of operator input means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Code(String),
    Continue,
}

impl ConsoleInput {
    pub fn parse(line: &str, auto_mode: bool) -> Self {
        if !auto_mode {
            return ConsoleInput::Continue;
        }
        match extract_otp_from_subject(line.trim()) {
            Some(code) => ConsoleInput::Code(code),
            None => ConsoleInput::Continue,
        }
    }
}

/// Start reading stdin on a detached thread.
///
/// The thread ends at end of input; a pending read never holds up process
/// exit.
pub fn spawn_stdin_reader(auto_mode: bool, manual: ManualSignal, codes: mpsc::UnboundedSender<String>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            dispatch(ConsoleInput::parse(&line, auto_mode), &manual, &codes);
        }
        debug!("Console input closed");
    });
}

fn dispatch(input: ConsoleInput, manual: &ManualSignal, codes: &mpsc::UnboundedSender<String>) {
    match input {
        ConsoleInput::Code(code) => {
            if codes.send(code).is_err() {
                debug!("Verification code typed but nothing is waiting for it");
            }
        }
        ConsoleInput::Continue => manual.trigger(),
    }
}

/// Watcher fed by codes the operator types on the console
pub struct ConsoleCodeWatcher {
    codes: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ConsoleCodeWatcher {
    pub fn new(codes: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            codes: Mutex::new(codes),
        }
    }
}

#[async_trait]
impl MailboxWatcher for ConsoleCodeWatcher {
    async fn watch(&self, request: OtpRequest, on_code: CodeSink, stop: StopSignal) {
        let mut codes = self.codes.lock().await;
        // Codes typed for an earlier account are stale
        while codes.try_recv().is_ok() {}

        info!(
            "Type the verification code sent to {} and press Enter",
            request.account_email
        );
        tokio::select! {
            code = codes.recv() => {
                if let Some(code) = code {
                    on_code(code);
                }
            }
            _ = stop.stopped() => {}
            _ = tokio::time::sleep(request.mailbox.time_window()) => {
                info!("No verification code entered for {}", request.account_email);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::MailboxConfig;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_parse_console_input() {
        assert_eq!(ConsoleInput::parse("  482913 \n", true), ConsoleInput::Code("482913".to_string()));
        assert_eq!(ConsoleInput::parse("482913", false), ConsoleInput::Continue);
        assert_eq!(ConsoleInput::parse("", true), ConsoleInput::Continue);
        assert_eq!(ConsoleInput::parse("go", true), ConsoleInput::Continue);
        assert_eq!(ConsoleInput::parse("12345", true), ConsoleInput::Continue);
    }

    #[test]
    fn test_dispatch() {
        let manual = ManualSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(ConsoleInput::Continue, &manual, &tx);
        assert!(manual.is_set());

        dispatch(ConsoleInput::Code("111222".to_string()), &manual, &tx);
        assert_eq!(rx.try_recv().unwrap(), "111222");
    }

    #[tokio::test]
    async fn test_watcher_delivers_fresh_code() {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = ConsoleCodeWatcher::new(rx);
        tx.send("000000".to_string()).unwrap();

        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink_received = received.clone();
        let sink: CodeSink = Arc::new(move |code: String| sink_received.lock().unwrap().push(code));
        let request = OtpRequest {
            mailbox: MailboxConfig::new("inbox@example.com", "app-code"),
            account_email: "new@example.org".to_string(),
        };

        let sender = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            sender.send("654321".to_string()).unwrap();
        });
        watcher.watch(request, sink, StopSignal::new()).await;

        assert_eq!(*received.lock().unwrap(), vec!["654321".to_string()]);
    }

    #[tokio::test]
    async fn test_watcher_returns_on_stop() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let watcher = ConsoleCodeWatcher::new(rx);
        let stop = StopSignal::new();
        stop.stop();

        let sink: CodeSink = Arc::new(|_: String| panic!("no code expected"));
        let request = OtpRequest {
            mailbox: MailboxConfig::new("inbox@example.com", "app-code"),
            account_email: "new@example.org".to_string(),
        };
        watcher.watch(request, sink, stop).await;
    }
}
