//! The filtering pipeline.
//!
//! Stages run in a fixed order: disposable domains, then account activity, then
//! mail exchange reachability. Each stage only sees the addresses that survived
//! the previous ones, and a removed address keeps the reason of the stage that
//! removed it. The directory query is a single batch and cheaper than DNS, so
//! MX lookups are only spent on addresses that are otherwise deliverable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::activity::{AccountActivityPredicate, ActivityChecks};
use crate::address::EmailAddress;
use crate::clock::Clock;
use crate::directory::AccountDirectory;
use crate::disposable::{DisposableDomainCache, DisposableSettings};
use crate::error::FilterError;
use crate::mx::MxRecordCache;
use crate::reason::RejectionReason;
use crate::roles::{RoleThresholds, ThresholdResolver};

/// Settings for one filtering run. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfiguration {
    pub check_disposable: bool,
    pub check_mx_record: bool,
    pub check_inactivity: bool,
    pub check_never_logged_in: bool,
    pub check_not_validated: bool,
    /// Minimum account age, in days, before inactivity rules apply.
    pub inactivity_threshold_days: u64,
    pub disposable: DisposableSettings,
    /// Message template keys that bypass filtering entirely.
    pub passthrough_keys: BTreeSet<String>,
    pub role_thresholds: RoleThresholds,
}

impl FilterConfiguration {
    pub fn activity_checks(&self) -> ActivityChecks {
        ActivityChecks {
            inactivity: self.check_inactivity,
            never_logged_in: self.check_never_logged_in,
            not_validated: self.check_not_validated,
        }
    }

    pub fn is_passthrough(&self, template_key: &str) -> bool {
        self.passthrough_keys.contains(template_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterOutcome {
    pub accepted: BTreeSet<EmailAddress>,
    pub rejected: BTreeMap<EmailAddress, RejectionReason>,
}

/// Long-lived filtering service. The caches and the directory are shared by
/// every run; the configuration is supplied per run.
pub struct FilterEngine {
    disposable: Arc<DisposableDomainCache>,
    mx: Arc<MxRecordCache>,
    directory: Arc<dyn AccountDirectory>,
    clock: Arc<dyn Clock>,
}

impl FilterEngine {
    pub fn new(
        disposable: Arc<DisposableDomainCache>,
        mx: Arc<MxRecordCache>,
        directory: Arc<dyn AccountDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        FilterEngine {
            disposable,
            mx,
            directory,
            clock,
        }
    }

    pub fn pipeline(&self, config: FilterConfiguration) -> FilterPipeline<'_> {
        FilterPipeline::new(self, config)
    }

    pub async fn filter_emails<I, S>(
        &self,
        addresses: I,
        config: &FilterConfiguration,
    ) -> Result<FilterOutcome, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<EmailAddress>,
    {
        let addresses: BTreeSet<EmailAddress> = addresses
            .into_iter()
            .map(|address| -> EmailAddress { address.into() })
            .filter(|email| !email.as_str().is_empty())
            .collect();
        self.pipeline(config.clone()).filter(addresses).await
    }

    /// Like [`FilterEngine::filter_emails`], bounded by `limit`. Nothing is
    /// accepted when the limit elapses.
    pub async fn filter_emails_within<I, S>(
        &self,
        addresses: I,
        config: &FilterConfiguration,
        limit: Duration,
    ) -> Result<FilterOutcome, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<EmailAddress>,
    {
        match tokio::time::timeout(limit, self.filter_emails(addresses, config)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(limit = ?limit, "filtering timed out");
                Err(FilterError::Timeout {
                    millis: limit.as_millis(),
                })
            }
        }
    }
}

/// One configuration bound to an engine. Threshold bands are resolved once,
/// when the pipeline is built.
pub struct FilterPipeline<'a> {
    engine: &'a FilterEngine,
    config: FilterConfiguration,
    predicate: AccountActivityPredicate,
}

impl<'a> FilterPipeline<'a> {
    /// The predicate follows the date semantics of the engine's directory.
    pub fn new(engine: &'a FilterEngine, config: FilterConfiguration) -> Self {
        let bands = ThresholdResolver::new(config.role_thresholds.clone()).resolve();
        let predicate = AccountActivityPredicate::new(
            config.activity_checks(),
            config.inactivity_threshold_days,
            bands,
            engine.directory.backend(),
        );
        FilterPipeline {
            engine,
            config,
            predicate,
        }
    }

    pub fn config(&self) -> &FilterConfiguration {
        &self.config
    }

    pub async fn filter(
        &self,
        addresses: BTreeSet<EmailAddress>,
    ) -> Result<FilterOutcome, FilterError> {
        let total = addresses.len();
        let mut remaining = addresses;
        let mut rejected = BTreeMap::new();

        if self.config.check_disposable && !remaining.is_empty() {
            let set = self.engine.disposable.current(&self.config.disposable).await;
            remove_where(
                &mut remaining,
                &mut rejected,
                RejectionReason::DisposableService,
                |email| email.domain().map_or(false, |domain| set.contains(domain)),
            );
        }

        if self.predicate.checks().any() && !remaining.is_empty() {
            let now = self.engine.clock.now();
            let found = self
                .engine
                .directory
                .find_rejections(&remaining, &self.predicate, now)
                .await
                .map_err(|e| {
                    error!(error = %e, "account directory query failed");
                    e
                })?;
            for (email, reason) in found {
                if remaining.remove(&email) {
                    debug!(email = %email, reason = %reason, "rejected by account rules");
                    rejected.insert(email, reason);
                }
            }
        }

        if self.config.check_mx_record && !remaining.is_empty() {
            let reachability = {
                let domains: BTreeSet<&str> =
                    remaining.iter().filter_map(EmailAddress::domain).collect();
                self.engine.mx.reachability(domains).await
            };
            remove_where(
                &mut remaining,
                &mut rejected,
                RejectionReason::InvalidMailExchange,
                |email| {
                    !email
                        .domain()
                        .and_then(|domain| reachability.get(domain).copied())
                        .unwrap_or(false)
                },
            );
        }

        info!(
            total,
            accepted = remaining.len(),
            rejected = rejected.len(),
            "filtered recipients"
        );

        Ok(FilterOutcome {
            accepted: remaining,
            rejected,
        })
    }
}

fn remove_where(
    remaining: &mut BTreeSet<EmailAddress>,
    rejected: &mut BTreeMap<EmailAddress, RejectionReason>,
    reason: RejectionReason,
    mut matches: impl FnMut(&EmailAddress) -> bool,
) {
    remaining.retain(|email| {
        if matches(email) {
            debug!(email = %email, reason = %reason, "rejected");
            rejected.insert(email.clone(), reason);
            false
        } else {
            true
        }
    });
}
