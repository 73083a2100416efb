//! Account Records
//!
//! One synthetic account per registration attempt, with its status
//! lifecycle, plus aggregate counters for a batch of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Registration status of an account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Not attempted yet
    #[default]
    Pending,
    /// Flow currently running for this account
    InProgress,
    /// Registration completed
    Success,
    /// Registration failed, see `error_message`
    Failed,
}

impl AccountStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, AccountStatus::Success | AccountStatus::Failed)
    }
}

/// Account data fed to a flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: u32,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,

    #[serde(default)]
    pub status: AccountStatus,
    pub error_message: Option<String>,
    /// Carried for record keeping; nothing retries accounts automatically
    #[serde(default)]
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Create a pending account
    pub fn new(id: u32, email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            username: username.into(),
            password: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            status: AccountStatus::Pending,
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    pub fn mark_started(&mut self) {
        self.status = AccountStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self) {
        self.status = AccountStatus::Success;
        self.error_message = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = AccountStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// The `account` placeholder namespace for this account
    pub fn variables(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "username": self.username,
            "password": self.password,
            "first_name": self.first_name,
            "last_name": self.last_name,
        })
    }
}

/// Progress counters for a batch of accounts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total: usize,
    pub completed: usize,
    pub success: usize,
    pub failed: usize,
}

impl BatchStatistics {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Recount from a list of accounts
    pub fn from_accounts(accounts: &[Account]) -> Self {
        let mut stats = Self::new(accounts.len());
        for account in accounts {
            match account.status {
                AccountStatus::Success => stats.record(true),
                AccountStatus::Failed => stats.record(false),
                AccountStatus::Pending | AccountStatus::InProgress => {}
            }
        }
        stats
    }

    pub fn record(&mut self, success: bool) {
        self.completed += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Percentage of completed accounts that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.success as f64 / self.completed as f64 * 100.0
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}
