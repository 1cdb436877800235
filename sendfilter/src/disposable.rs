//! Known disposable-mail domains, fetched from a remote list and persisted between runs.
//!
//! The list is best-effort: when it cannot be fetched the previously persisted
//! set keeps being served (an empty one on a cold start) and the failure is only
//! logged. Sending mail must never be blocked by this check.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::FilterError;
use crate::storage::{load_json, store_json, Storage};

pub const DISPOSABLE_DOMAINS_KEY: &str = "disposable-domains";

const DEFAULT_EXPIRATION_DAYS: u32 = 30;

/// How long a failed refresh is remembered before the same cache tries again.
const FAILED_FETCH_RETRY_MINUTES: i64 = 60;

/// Where the disposable list comes from and how long a fetched copy stays valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisposableSettings {
    pub url: Option<String>,
    /// Zero means the default of 30 days.
    #[serde(default)]
    pub expiration_days: u32,
}

impl DisposableSettings {
    pub fn expiration(&self) -> chrono::Duration {
        let days = match self.expiration_days {
            0 => DEFAULT_EXPIRATION_DAYS,
            days => days,
        };
        chrono::Duration::days(i64::from(days))
    }

    fn source_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// The persisted form of the list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisposableDomainSet {
    pub domains: BTreeSet<String>,
    /// Set only by a successful fetch.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl DisposableDomainSet {
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    fn is_stale(&self, now: DateTime<Utc>, expiration: chrono::Duration) -> bool {
        match self.fetched_at {
            Some(fetched_at) => now - fetched_at > expiration,
            None => true,
        }
    }
}

/// Fetches the raw disposable list body.
#[async_trait]
pub trait ListFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FilterError>;
}

/// [`ListFetcher`] over HTTP(S). Any non-2xx status is a failure.
pub struct HttpListFetcher {
    client: reqwest::Client,
}

impl HttpListFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .into_diagnostic()?;
        Ok(HttpListFetcher { client })
    }
}

#[async_trait]
impl ListFetcher for HttpListFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FilterError> {
        let fetch_error = |e: reqwest::Error| FilterError::RemoteFetch {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?;
        let body = response.bytes().await.map_err(fetch_error)?;
        Ok(body.to_vec())
    }
}

#[derive(Default)]
struct CacheState {
    set: Option<Arc<DisposableDomainSet>>,
    last_failure: Option<DateTime<Utc>>,
}

pub struct DisposableDomainCache {
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn ListFetcher>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    state: Mutex<CacheState>,
}

impl DisposableDomainCache {
    pub fn new(
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn ListFetcher>,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
    ) -> Self {
        DisposableDomainCache {
            storage,
            fetcher,
            clock,
            fetch_timeout,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Exact, case-insensitive membership test. Subdomains of a listed domain
    /// do not match.
    pub async fn lookup(&self, domain: &str, settings: &DisposableSettings) -> bool {
        let set = self.current(settings).await;
        let hit = set.contains(domain);
        if hit {
            debug!(domain, "domain is a known disposable service");
        }
        hit
    }

    /// Returns the set to filter against, refreshing it first when it has expired.
    pub async fn current(&self, settings: &DisposableSettings) -> Arc<DisposableDomainSet> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let set = match state.set.clone() {
            Some(set) => set,
            None => {
                let loaded = Arc::new(self.load().await);
                state.set = Some(loaded.clone());
                loaded
            }
        };

        if !set.is_stale(now, settings.expiration()) {
            return set;
        }

        if let Some(failed_at) = state.last_failure {
            if now - failed_at < chrono::Duration::minutes(FAILED_FETCH_RETRY_MINUTES) {
                return set;
            }
        }

        match self.refresh(settings).await {
            Ok(fresh) => {
                state.set = Some(fresh.clone());
                state.last_failure = None;
                fresh
            }
            Err(e) => {
                warn!(
                    error = %e,
                    kept = set.len(),
                    "failed to retrieve the list of disposable domains, keeping previous list"
                );
                state.last_failure = Some(now);
                set
            }
        }
    }

    async fn load(&self) -> DisposableDomainSet {
        match load_json::<DisposableDomainSet>(self.storage.as_ref(), DISPOSABLE_DOMAINS_KEY).await
        {
            Ok(Some(set)) => {
                debug!(count = set.len(), "loaded persisted disposable domain list");
                set
            }
            Ok(None) => DisposableDomainSet::default(),
            Err(e) => {
                warn!(error = ?e, "ignoring unreadable persisted disposable domain list");
                DisposableDomainSet::default()
            }
        }
    }

    async fn refresh(
        &self,
        settings: &DisposableSettings,
    ) -> Result<Arc<DisposableDomainSet>, FilterError> {
        let url = settings
            .source_url()
            .ok_or_else(|| FilterError::RemoteFetch {
                url: String::new(),
                message: "no source url configured".to_string(),
            })?;

        let body = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(url)).await {
            Ok(body) => body?,
            Err(_) => {
                return Err(FilterError::RemoteFetch {
                    url: url.to_string(),
                    message: format!("timed out after {:?}", self.fetch_timeout),
                })
            }
        };

        let domains = parse_domain_list(&body).map_err(|message| FilterError::RemoteFetch {
            url: url.to_string(),
            message,
        })?;

        let fresh = DisposableDomainSet {
            domains,
            fetched_at: Some(self.clock.now()),
        };
        if let Err(e) = store_json(self.storage.as_ref(), DISPOSABLE_DOMAINS_KEY, &fresh).await {
            warn!(error = ?e, "failed to persist disposable domain list");
        }
        info!(url, count = fresh.len(), "refreshed disposable domain list");

        Ok(Arc::new(fresh))
    }
}

/// Splits a list body into lower-cased domains. Lines starting with `#` are comments.
fn parse_domain_list(body: &[u8]) -> Result<BTreeSet<String>, String> {
    let text =
        std::str::from_utf8(body).map_err(|_| "response body is not valid UTF-8".to_string())?;

    let mut domains = BTreeSet::new();
    for line in text.lines() {
        // Everything after `#` is a comment, whole-line or trailing.
        let line = line.split('#').next().unwrap_or_default();
        for token in line.split_whitespace() {
            domains.insert(token.to_lowercase());
        }
    }

    if domains.is_empty() {
        return Err("response contained no domains".to_string());
    }
    Ok(domains)
}
