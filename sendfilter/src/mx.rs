//! Per-domain mail exchange reachability, cached with asymmetric expiry.
//!
//! A reachable domain is trusted for 30 days, an unreachable one is looked up
//! again after 7 days. Lookup failures and timeouts count as unreachable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use hickory_resolver::{error::ResolveErrorKind, TokioAsyncResolver};
use miette::{Context, IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::FilterError;
use crate::storage::{load_json, store_json, Storage};

pub const MX_RECORDS_KEY: &str = "mx-records";
pub const MX_RECORD_VALID_EXPIRY_DAYS: i64 = 30;
pub const MX_RECORD_INVALID_EXPIRY_DAYS: i64 = 7;

const CONCURRENT_LOOKUPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCacheEntry {
    pub domain: String,
    pub is_reachable: bool,
    pub expires_at: DateTime<Utc>,
}

impl DomainCacheEntry {
    pub fn observed(domain: String, is_reachable: bool, now: DateTime<Utc>) -> Self {
        let days = if is_reachable {
            MX_RECORD_VALID_EXPIRY_DAYS
        } else {
            MX_RECORD_INVALID_EXPIRY_DAYS
        };
        DomainCacheEntry {
            domain,
            is_reachable,
            expires_at: now + chrono::Duration::days(days),
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Answers whether a domain publishes a usable MX record.
#[async_trait]
pub trait MailExchangeResolver: Send + Sync {
    async fn resolve_mail_exchange(&self, domain: &str) -> Result<bool, FilterError>;
}

pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .into_diagnostic()
            .wrap_err("creating dns resolver")?;
        Ok(HickoryResolver { resolver })
    }
}

/// Appends the root label so the system search domains are never tried.
fn fully_qualified(domain: &str) -> String {
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{}.", domain)
    }
}

#[async_trait]
impl MailExchangeResolver for HickoryResolver {
    async fn resolve_mail_exchange(&self, domain: &str) -> Result<bool, FilterError> {
        match self.resolver.mx_lookup(fully_qualified(domain)).await {
            // A lone "." exchange is a null MX: the domain accepts no mail.
            Ok(mx) => Ok(mx.iter().any(|record| !record.exchange().is_root())),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(FilterError::DnsLookup {
                    domain: domain.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

pub struct MxRecordCache {
    storage: Arc<dyn Storage>,
    resolver: Arc<dyn MailExchangeResolver>,
    clock: Arc<dyn Clock>,
    lookup_timeout: Duration,
    /// `None` until the persisted map has been read.
    entries: Mutex<Option<BTreeMap<String, DomainCacheEntry>>>,
}

impl MxRecordCache {
    pub fn new(
        storage: Arc<dyn Storage>,
        resolver: Arc<dyn MailExchangeResolver>,
        clock: Arc<dyn Clock>,
        lookup_timeout: Duration,
    ) -> Self {
        MxRecordCache {
            storage,
            resolver,
            clock,
            lookup_timeout,
            entries: Mutex::new(None),
        }
    }

    pub async fn is_reachable(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        let reachability = self.reachability([domain.as_str()]).await;
        reachability.get(&domain).copied().unwrap_or(false)
    }

    /// Resolves every distinct domain once, serving fresh entries from the cache
    /// and looking the rest up concurrently. The map is persisted once afterwards.
    pub async fn reachability<I, S>(&self, domains: I) -> HashMap<String, bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains: BTreeSet<String> = domains
            .into_iter()
            .map(|d| d.as_ref().to_lowercase())
            .collect();
        let now = self.clock.now();
        let mut result = HashMap::with_capacity(domains.len());
        let mut misses = Vec::new();

        {
            let mut guard = self.entries.lock().await;
            let entries = self.loaded(&mut *guard).await;
            for domain in domains {
                match entries.get(&domain) {
                    Some(entry) if entry.is_fresh(now) => {
                        debug!(domain = %domain, reachable = entry.is_reachable, "mx cache hit");
                        result.insert(domain, entry.is_reachable);
                    }
                    _ => misses.push(domain),
                }
            }
        }

        if misses.is_empty() {
            return result;
        }

        let observed: Vec<DomainCacheEntry> = stream::iter(misses)
            .map(|domain| async move {
                let reachable = self.lookup(&domain).await;
                DomainCacheEntry::observed(domain, reachable, self.clock.now())
            })
            .buffer_unordered(CONCURRENT_LOOKUPS)
            .collect()
            .await;

        let snapshot = {
            let mut guard = self.entries.lock().await;
            let entries = self.loaded(&mut *guard).await;
            for entry in observed {
                result.insert(entry.domain.clone(), entry.is_reachable);
                entries.insert(entry.domain.clone(), entry);
            }
            let now = self.clock.now();
            entries.retain(|_, entry| entry.is_fresh(now));
            entries.clone()
        };

        if let Err(e) = store_json(self.storage.as_ref(), MX_RECORDS_KEY, &snapshot).await {
            warn!(error = ?e, "failed to persist mx record cache");
        }

        result
    }

    async fn loaded<'a>(
        &self,
        slot: &'a mut Option<BTreeMap<String, DomainCacheEntry>>,
    ) -> &'a mut BTreeMap<String, DomainCacheEntry> {
        if slot.is_none() {
            let persisted = match load_json(self.storage.as_ref(), MX_RECORDS_KEY).await {
                Ok(Some(entries)) => entries,
                Ok(None) => BTreeMap::new(),
                Err(e) => {
                    warn!(error = ?e, "ignoring unreadable persisted mx record cache");
                    BTreeMap::new()
                }
            };
            *slot = Some(persisted);
        }
        slot.get_or_insert_with(BTreeMap::new)
    }

    async fn lookup(&self, domain: &str) -> bool {
        match tokio::time::timeout(
            self.lookup_timeout,
            self.resolver.resolve_mail_exchange(domain),
        )
        .await
        {
            Ok(Ok(reachable)) => {
                debug!(domain, reachable, "resolved mail exchange");
                reachable
            }
            Ok(Err(e)) => {
                warn!(domain, error = %e, "mx lookup failed, treating domain as unreachable");
                false
            }
            Err(_) => {
                warn!(
                    domain,
                    timeout = ?self.lookup_timeout,
                    "mx lookup timed out, treating domain as unreachable"
                );
                false
            }
        }
    }
}
