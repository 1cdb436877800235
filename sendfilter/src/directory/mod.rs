//! The account directory: resolves a batch of addresses to rejection reasons.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::activity::{AccountActivityPredicate, Backend};
use crate::address::EmailAddress;
use crate::error::FilterError;
use crate::reason::RejectionReason;

pub mod memory;
pub mod sql;
pub mod sqlite;

pub use memory::MemoryDirectory;
pub use sql::RejectionQuery;
pub use sqlite::SqliteDirectory;

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// The SQL dialect whose date semantics this directory follows. The
    /// engine builds every predicate for this backend.
    fn backend(&self) -> Backend;

    /// Resolves every address in one batch. Accounts that pass the predicate,
    /// and addresses with no account, are left out of the result.
    async fn find_rejections(
        &self,
        emails: &BTreeSet<EmailAddress>,
        predicate: &AccountActivityPredicate,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<EmailAddress, RejectionReason>, FilterError>;
}
