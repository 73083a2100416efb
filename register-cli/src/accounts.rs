//! Account generation
//!
//! Synthetic accounts with random mailbox names under the configured domain.

use crate::config::MAX_ACCOUNTS;
use crate::error::{CliError, CliResult};
use rand::distributions::{Alphanumeric, DistString, Uniform};
use rand::Rng;
use registration_common::Account;
use tracing::info;

const LOCAL_PART_LEN: usize = 15;
const NAME_LEN: usize = 3;
const PASSWORD_LEN: usize = 12;
const LOCAL_PART_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate `count` pending accounts under `domain`.
///
/// Every account gets `password` when it is non-empty, otherwise its own
/// random one.
pub fn generate_accounts(count: u32, domain: &str, password: &str) -> CliResult<Vec<Account>> {
    if !(1..=MAX_ACCOUNTS).contains(&count) {
        return Err(CliError::config(format!(
            "account count must be between 1 and {}, got {}",
            MAX_ACCOUNTS, count
        )));
    }
    let domain = domain.trim().trim_start_matches('@');
    if domain.is_empty() {
        return Err(CliError::config("registration.domain must not be empty"));
    }

    let mut rng = rand::thread_rng();
    let accounts: Vec<Account> = (1..=count)
        .map(|id| {
            let local = random_from(&mut rng, LOCAL_PART_CHARS, LOCAL_PART_LEN);
            let password = if password.is_empty() {
                Alphanumeric.sample_string(&mut rng, PASSWORD_LEN)
            } else {
                password.to_string()
            };
            Account::new(id, format!("{}@{}", local, domain), local)
                .with_password(password)
                .with_name(random_name(&mut rng), random_name(&mut rng))
        })
        .collect();

    info!("Generated {} account(s) under {}", accounts.len(), domain);
    Ok(accounts)
}

fn random_from<R: Rng>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    let pick = Uniform::from(0..alphabet.len());
    (0..len).map(|_| alphabet[rng.sample(pick)] as char).collect()
}

/// Three random letters, capitalised
fn random_name<R: Rng>(rng: &mut R) -> String {
    let name = random_from(rng, b"abcdefghijklmnopqrstuvwxyz", NAME_LEN);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registration_common::AccountStatus;
    use std::collections::HashSet;

    #[test]
    fn test_generated_account_shape() {
        let accounts = generate_accounts(5, "example.org", "Secret123").unwrap();
        assert_eq!(accounts.len(), 5);

        for (idx, account) in accounts.iter().enumerate() {
            assert_eq!(account.id as usize, idx + 1);
            let (local, domain) = account.email.split_once('@').unwrap();
            assert_eq!(domain, "example.org");
            assert_eq!(local.len(), 15);
            assert!(local.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            assert_eq!(account.username, local);
            assert_eq!(account.password, "Secret123");
            assert_eq!(account.first_name.len(), 3);
            assert!(account.first_name.chars().next().unwrap().is_ascii_uppercase());
            assert_eq!(account.status, AccountStatus::Pending);
        }

        let unique: HashSet<_> = accounts.iter().map(|a| a.email.clone()).collect();
        assert_eq!(unique.len(), accounts.len());
    }

    #[test]
    fn test_random_password_when_unset() {
        let accounts = generate_accounts(2, "@example.org", "").unwrap();
        assert_eq!(accounts[0].password.len(), 12);
        assert!(accounts[0].password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(accounts[0].email.ends_with("@example.org"));
    }

    #[test]
    fn test_count_bounds() {
        assert!(generate_accounts(0, "example.org", "").is_err());
        assert!(generate_accounts(101, "example.org", "").is_err());
        assert_eq!(generate_accounts(100, "example.org", "").unwrap().len(), 100);
    }

    #[test]
    fn test_empty_domain_is_rejected() {
        assert!(matches!(generate_accounts(1, " ", "pw"), Err(CliError::Config(_))));
    }
}
