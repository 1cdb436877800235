use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::AccountDirectory;
use crate::activity::{Account, AccountActivityPredicate, Backend};
use crate::address::EmailAddress;
use crate::error::FilterError;
use crate::reason::RejectionReason;

/// Accounts held in process; the predicate is evaluated in Rust.
pub struct MemoryDirectory {
    accounts: RwLock<BTreeMap<EmailAddress, Account>>,
    queries: AtomicUsize,
    backend: Backend,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        MemoryDirectory::new([])
    }
}

impl MemoryDirectory {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        MemoryDirectory {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|account| (account.email.clone(), account))
                    .collect(),
            ),
            queries: AtomicUsize::new(0),
            backend: Backend::Sqlite,
        }
    }

    /// Day differences follow `backend` instead of SQLite.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub async fn insert(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.email.clone(), account);
    }

    /// Number of batches resolved so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn find_rejections(
        &self,
        emails: &BTreeSet<EmailAddress>,
        predicate: &AccountActivityPredicate,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<EmailAddress, RejectionReason>, FilterError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let accounts = self.accounts.read().await;

        Ok(emails
            .iter()
            .filter_map(|email| {
                let account = accounts.get(email)?;
                predicate
                    .evaluate(account, now)
                    .map(|reason| (email.clone(), reason))
            })
            .collect())
    }
}
