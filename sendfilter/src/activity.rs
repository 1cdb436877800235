//! Account activity and verification rules.
//!
//! An account is checked in a fixed order and the first rule that matches gives
//! the rejection reason: not validated, then never logged in, then inactive.
//! Inactivity uses the most lenient threshold band the account belongs to.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::EmailAddress;
use crate::error::FilterError;
use crate::reason::RejectionReason;
use crate::roles::{RoleId, Threshold, ThresholdBand};

/// Name of the Unicode lower-casing function registered on SQLite connections.
pub const SQLITE_LOWER_FUNCTION: &str = "sf_lower";

/// Directory backend whose date semantics the day difference follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    MySql,
    Postgres,
    Sqlite,
}

impl Backend {
    /// Whole calendar days from `earlier` to `later`, ignoring the time of day.
    ///
    /// This is what `DATEDIFF` (MySQL), `DATE(a) - DATE(b)` (PostgreSQL) and the
    /// `julianday(date(..))` difference (SQLite) all compute.
    pub fn elapsed_days(self, later: DateTime<Utc>, earlier: DateTime<Utc>) -> i64 {
        (later.date_naive() - earlier.date_naive()).num_days()
    }

    /// SQL expression lower-casing `expr` the way [`crate::EmailAddress`] does.
    ///
    /// SQLite's `LOWER` only folds ASCII, so its connections carry a Unicode
    /// aware `sf_lower` function instead.
    pub fn lower_sql(self, expr: &str) -> String {
        match self {
            Backend::MySql | Backend::Postgres => format!("LOWER({})", expr),
            Backend::Sqlite => format!("{}({})", SQLITE_LOWER_FUNCTION, expr),
        }
    }

    /// SQL expression for the same day difference.
    pub fn day_difference_sql(self, later: &str, earlier: &str) -> String {
        match self {
            Backend::MySql => format!("DATEDIFF({}, {})", later, earlier),
            Backend::Postgres => format!("DATE({}) - DATE({})", later, earlier),
            Backend::Sqlite => format!(
                "CAST(julianday(date({})) - julianday(date({})) AS INTEGER)",
                later, earlier
            ),
        }
    }
}

impl FromStr for Backend {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mysqli" | "mariadb" => Ok(Backend::MySql),
            "postgres" | "postgresql" | "pgsql" => Ok(Backend::Postgres),
            "sqlite" | "sqlite3" => Ok(Backend::Sqlite),
            _ => Err(FilterError::UnsupportedBackend {
                backend: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::MySql => "mysql",
            Backend::Postgres => "postgres",
            Backend::Sqlite => "sqlite",
        })
    }
}

/// The directory's view of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub email: EmailAddress,
    pub date_registered: DateTime<Utc>,
    pub date_last_login: DateTime<Utc>,
    pub date_validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    /// Real roles only.
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub assigned_to_submission: bool,
}

/// Which account rules are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityChecks {
    pub inactivity: bool,
    pub never_logged_in: bool,
    pub not_validated: bool,
}

impl ActivityChecks {
    pub fn any(&self) -> bool {
        self.inactivity || self.never_logged_in || self.not_validated
    }
}

#[derive(Debug, Clone)]
pub struct AccountActivityPredicate {
    checks: ActivityChecks,
    min_registration_days: u64,
    bands: Vec<ThresholdBand>,
    backend: Backend,
}

impl AccountActivityPredicate {
    /// `bands` must be ordered most lenient first, as returned by
    /// [`crate::roles::ThresholdResolver::resolve`].
    pub fn new(
        checks: ActivityChecks,
        min_registration_days: u64,
        bands: Vec<ThresholdBand>,
        backend: Backend,
    ) -> Self {
        AccountActivityPredicate {
            checks,
            min_registration_days,
            bands,
            backend,
        }
    }

    pub fn checks(&self) -> ActivityChecks {
        self.checks
    }

    pub fn min_registration_days(&self) -> u64 {
        self.min_registration_days
    }

    pub fn bands(&self) -> &[ThresholdBand] {
        &self.bands
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn evaluate(&self, account: &Account, now: DateTime<Utc>) -> Option<RejectionReason> {
        if self.checks.not_validated && account.date_validated.is_none() && account.disabled {
            return Some(RejectionReason::NotValidated);
        }

        if self.checks.never_logged_in
            && account.date_last_login.date_naive() == account.date_registered.date_naive()
        {
            return Some(RejectionReason::NeverLoggedIn);
        }

        if self.checks.inactivity && self.is_inactive(account, now) {
            return Some(RejectionReason::Inactive);
        }

        None
    }

    /// The first band, in leniency order, whose membership test the account passes.
    pub fn band_for(&self, account: &Account) -> Option<&ThresholdBand> {
        self.bands.iter().find(|band| band_matches(band, account))
    }

    fn is_inactive(&self, account: &Account, now: DateTime<Utc>) -> bool {
        let registered_days = self.backend.elapsed_days(now, account.date_registered);
        if !at_least(registered_days, self.min_registration_days) {
            return false;
        }

        match self.band_for(account).map(|band| band.threshold) {
            Some(Threshold::Days(days)) => {
                let idle_days = self.backend.elapsed_days(now, account.date_last_login);
                at_least(idle_days, days)
            }
            Some(Threshold::Never) | None => false,
        }
    }
}

fn band_matches(band: &ThresholdBand, account: &Account) -> bool {
    band.real_roles().any(|role| account.roles.contains(&role))
        || (band.includes_unassigned() && account.roles.is_empty())
        || (band.includes_assigned_submission() && account.assigned_to_submission)
}

fn at_least(days: i64, minimum: u64) -> bool {
    u64::try_from(days).map_or(false, |days| days >= minimum)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::roles::{RoleThresholds, ThresholdResolver};

    pub(crate) fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    /// An account registered long ago that last logged in on `last_login`.
    pub(crate) fn account(email: &str, last_login: &str, roles: &[i64]) -> Account {
        Account {
            email: EmailAddress::new(email),
            date_registered: at("2020-01-01T09:00:00Z"),
            date_last_login: at(last_login),
            date_validated: Some(at("2020-01-01T09:30:00Z")),
            disabled: false,
            roles: roles.iter().copied().map(RoleId).collect(),
            assigned_to_submission: false,
        }
    }

    fn predicate(checks: ActivityChecks, thresholds: &[(RoleId, Option<i64>)]) -> AccountActivityPredicate {
        let thresholds: RoleThresholds = thresholds.iter().copied().collect();
        AccountActivityPredicate::new(
            checks,
            30,
            ThresholdResolver::new(thresholds).resolve(),
            Backend::Sqlite,
        )
    }

    fn inactivity_only() -> ActivityChecks {
        ActivityChecks {
            inactivity: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_most_lenient_role_wins() {
        let predicate = predicate(
            inactivity_only(),
            &[(RoleId(16), Some(10)), (RoleId(17), Some(0))],
        );
        let now = at("2024-06-01T00:00:00Z");
        let both = account("both@real.test", "2021-01-01T00:00:00Z", &[16, 17]);
        assert_eq!(predicate.evaluate(&both, now), None);

        let only_strict = account("strict@real.test", "2021-01-01T00:00:00Z", &[16]);
        assert_eq!(predicate.evaluate(&only_strict, now), Some(RejectionReason::Inactive));
    }

    #[test]
    fn test_inactivity_boundary_is_inclusive() {
        let predicate = predicate(inactivity_only(), &[(RoleId(16), Some(10))]);
        let user = account("u@real.test", "2024-05-22T23:59:00Z", &[16]);

        assert_eq!(predicate.evaluate(&user, at("2024-05-31T08:00:00Z")), None);
        assert_eq!(
            predicate.evaluate(&user, at("2024-06-01T00:01:00Z")),
            Some(RejectionReason::Inactive)
        );
    }

    #[test]
    fn test_unassigned_role_band_only_matches_roleless_accounts() {
        let predicate = predicate(
            inactivity_only(),
            &[(RoleId::UNASSIGNED_ROLE, Some(30)), (RoleId(16), Some(0))],
        );
        let now = at("2024-06-01T00:00:00Z");

        let roleless = account("nobody@real.test", "2024-01-01T00:00:00Z", &[]);
        assert_eq!(predicate.evaluate(&roleless, now), Some(RejectionReason::Inactive));

        let with_role = account("editor@real.test", "2024-01-01T00:00:00Z", &[16]);
        assert_eq!(predicate.evaluate(&with_role, now), None);

        let other_role = account("reader@real.test", "2024-01-01T00:00:00Z", &[1048576]);
        assert_eq!(predicate.band_for(&other_role), None);
        assert_eq!(predicate.evaluate(&other_role, now), None);
    }

    #[test]
    fn test_assigned_submission_band() {
        let predicate = predicate(
            inactivity_only(),
            &[(RoleId::ASSIGNED_SUBMISSION, Some(365)), (RoleId::UNASSIGNED_ROLE, Some(30))],
        );
        let now = at("2024-06-01T00:00:00Z");

        let mut author = account("author@real.test", "2024-01-01T00:00:00Z", &[]);
        author.assigned_to_submission = true;
        assert_eq!(
            predicate.band_for(&author).map(|band| band.threshold),
            Some(Threshold::Days(365))
        );
        assert_eq!(predicate.evaluate(&author, now), None);

        author.date_last_login = at("2023-01-01T00:00:00Z");
        assert_eq!(predicate.evaluate(&author, now), Some(RejectionReason::Inactive));
    }

    #[test]
    fn test_recent_registrations_are_not_inactive() {
        let predicate = predicate(inactivity_only(), &[(RoleId(16), Some(1))]);
        let now = at("2024-06-01T00:00:00Z");
        let mut newcomer = account("new@real.test", "2024-05-20T00:00:00Z", &[16]);
        newcomer.date_registered = at("2024-05-10T00:00:00Z");

        assert_eq!(predicate.evaluate(&newcomer, now), None);

        newcomer.date_registered = at("2024-05-02T00:00:00Z");
        assert_eq!(predicate.evaluate(&newcomer, now), Some(RejectionReason::Inactive));
    }

    #[test]
    fn test_never_logged_in_compares_calendar_days() {
        let checks = ActivityChecks {
            never_logged_in: true,
            ..Default::default()
        };
        let predicate = predicate(checks, &[]);
        let now = at("2024-06-01T00:00:00Z");

        let mut user = account("u@real.test", "2020-01-01T23:00:00Z", &[]);
        assert_eq!(predicate.evaluate(&user, now), Some(RejectionReason::NeverLoggedIn));

        user.date_last_login = at("2020-01-02T00:00:00Z");
        assert_eq!(predicate.evaluate(&user, now), None);
    }

    #[test]
    fn test_not_validated_requires_disabled_account() {
        let checks = ActivityChecks {
            not_validated: true,
            ..Default::default()
        };
        let predicate = predicate(checks, &[]);
        let now = at("2024-06-01T00:00:00Z");

        let mut user = account("u@real.test", "2024-05-01T00:00:00Z", &[]);
        user.date_validated = None;
        assert_eq!(predicate.evaluate(&user, now), None);

        user.disabled = true;
        assert_eq!(predicate.evaluate(&user, now), Some(RejectionReason::NotValidated));
    }

    #[test]
    fn test_rules_apply_in_priority_order() {
        let checks = ActivityChecks {
            inactivity: true,
            never_logged_in: true,
            not_validated: true,
        };
        let predicate = predicate(checks, &[(RoleId::UNASSIGNED_ROLE, Some(10))]);
        let now = at("2024-06-01T00:00:00Z");

        let mut user = account("u@real.test", "2020-01-01T10:00:00Z", &[]);
        user.date_validated = None;
        user.disabled = true;
        assert_eq!(predicate.evaluate(&user, now), Some(RejectionReason::NotValidated));

        user.disabled = false;
        assert_eq!(predicate.evaluate(&user, now), Some(RejectionReason::NeverLoggedIn));

        user.date_last_login = at("2021-01-01T10:00:00Z");
        assert_eq!(predicate.evaluate(&user, now), Some(RejectionReason::Inactive));
    }

    #[test]
    fn test_disabled_checks_accept_everyone() {
        let predicate = predicate(ActivityChecks::default(), &[(RoleId(16), Some(1))]);
        let mut user = account("u@real.test", "2020-01-01T10:00:00Z", &[16]);
        user.date_validated = None;
        user.disabled = true;
        assert_eq!(predicate.evaluate(&user, at("2024-06-01T00:00:00Z")), None);
    }

    #[test]
    fn test_backend_parsing_and_day_difference() {
        assert_eq!("MySQL".parse::<Backend>().unwrap(), Backend::MySql);
        assert_eq!("postgresql".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!("sqlite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert!(matches!(
            "oracle".parse::<Backend>(),
            Err(FilterError::UnsupportedBackend { .. })
        ));

        assert_eq!(
            Backend::MySql.day_difference_sql(":now", "u.date_registered"),
            "DATEDIFF(:now, u.date_registered)"
        );
        assert_eq!(
            Backend::Postgres.day_difference_sql(":now", "u.date_registered"),
            "DATE(:now) - DATE(u.date_registered)"
        );
        assert_eq!(Backend::Postgres.lower_sql("u.email"), "LOWER(u.email)");
        assert_eq!(Backend::Sqlite.lower_sql("u.email"), "sf_lower(u.email)");
        assert_eq!(
            Backend::Sqlite.elapsed_days(at("2024-03-01T00:10:00Z"), at("2024-02-28T23:50:00Z")),
            2
        );
    }
}
