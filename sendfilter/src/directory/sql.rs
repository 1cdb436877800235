//! Renders the activity predicate as one batched SQL query over the host
//! application's schema (`users`, `user_user_groups`, `user_groups`,
//! `stage_assignments`, `submissions`).
//!
//! Thresholds and the registration age are inlined as integer literals. The
//! addresses are bound as `:e0`, `:e1`, ... and the current time as `:now`.

use crate::activity::{AccountActivityPredicate, Backend};
use crate::roles::{Threshold, ThresholdBand};

const NEVER: &str = "0 = 1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionQuery {
    pub sql: String,
    /// Whether the statement references `:now`.
    pub binds_now: bool,
}

impl RejectionQuery {
    pub fn render(predicate: &AccountActivityPredicate, email_count: usize) -> Self {
        let checks = predicate.checks();
        let backend = predicate.backend();
        let email = backend.lower_sql("u.email");

        let not_validated = if checks.not_validated {
            "u.date_validated IS NULL AND COALESCE(u.disabled, 0) = 1".to_string()
        } else {
            NEVER.to_string()
        };
        let never_logged_in = if checks.never_logged_in {
            "DATE(u.date_last_login) = DATE(u.date_registered)".to_string()
        } else {
            NEVER.to_string()
        };
        let inactive = if checks.inactivity {
            format!(
                "({} >= {} AND {})",
                backend.day_difference_sql(":now", "u.date_registered"),
                predicate.min_registration_days(),
                band_ladder(predicate.bands(), backend)
            )
        } else {
            NEVER.to_string()
        };

        let placeholders = (0..email_count)
            .map(email_param)
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT {email} AS email,
    CASE
        WHEN {nv} THEN 'notValidated'
        WHEN {nl} THEN 'neverLoggedIn'
        WHEN {ia} THEN 'inactive'
    END AS reason
FROM users AS u
WHERE {email} IN ({placeholders})
    AND (({nv}) OR ({nl}) OR ({ia}))",
            nv = not_validated,
            nl = never_logged_in,
            ia = inactive,
            email = email,
            placeholders = placeholders,
        );

        RejectionQuery {
            sql,
            binds_now: checks.inactivity,
        }
    }
}

pub fn email_param(index: usize) -> String {
    format!(":e{}", index)
}

/// `CASE WHEN <member of band> THEN <inactive?> ... END = 1`, most lenient band first.
fn band_ladder(bands: &[ThresholdBand], backend: Backend) -> String {
    if bands.is_empty() {
        return NEVER.to_string();
    }

    let arms: Vec<String> = bands
        .iter()
        .map(|band| {
            let outcome = match band.threshold {
                Threshold::Never => "0".to_string(),
                Threshold::Days(days) => format!(
                    "CASE WHEN {} >= {} THEN 1 END",
                    backend.day_difference_sql(":now", "u.date_last_login"),
                    days
                ),
            };
            format!("WHEN {} THEN {}", band_membership(band), outcome)
        })
        .collect();

    format!("CASE {} END = 1", arms.join(" "))
}

fn band_membership(band: &ThresholdBand) -> String {
    let mut conditions = Vec::new();

    let real_roles: Vec<String> = band.real_roles().map(|role| role.to_string()).collect();
    if !real_roles.is_empty() {
        conditions.push(format!(
            "EXISTS (SELECT 0 FROM user_user_groups AS uug \
             INNER JOIN user_groups AS ug ON uug.user_group_id = ug.user_group_id \
             AND ug.role_id IN ({}) WHERE uug.user_id = u.user_id)",
            real_roles.join(", ")
        ));
    }
    if band.includes_unassigned() {
        conditions.push(
            "NOT EXISTS (SELECT 0 FROM user_user_groups AS uug \
             INNER JOIN user_groups AS ug ON uug.user_group_id = ug.user_group_id \
             WHERE uug.user_id = u.user_id)"
                .to_string(),
        );
    }
    if band.includes_assigned_submission() {
        conditions.push(
            "EXISTS (SELECT 0 FROM submissions AS s \
             INNER JOIN stage_assignments AS sa ON sa.submission_id = s.submission_id \
             WHERE sa.user_id = u.user_id)"
                .to_string(),
        );
    }

    if conditions.is_empty() {
        NEVER.to_string()
    } else {
        format!("({})", conditions.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityChecks;
    use crate::roles::{RoleId, RoleThresholds, ThresholdResolver};

    fn predicate(
        checks: ActivityChecks,
        thresholds: &[(RoleId, Option<i64>)],
        backend: Backend,
    ) -> AccountActivityPredicate {
        let thresholds: RoleThresholds = thresholds.iter().copied().collect();
        AccountActivityPredicate::new(
            checks,
            45,
            ThresholdResolver::new(thresholds).resolve(),
            backend,
        )
    }

    #[test]
    fn test_disabled_checks_render_as_false() {
        let query = RejectionQuery::render(
            &predicate(
                ActivityChecks {
                    never_logged_in: true,
                    ..Default::default()
                },
                &[],
                Backend::MySql,
            ),
            2,
        );

        assert!(!query.binds_now);
        assert!(query.sql.contains("WHEN 0 = 1 THEN 'notValidated'"));
        assert!(query.sql.contains("WHEN DATE(u.date_last_login) = DATE(u.date_registered) THEN 'neverLoggedIn'"));
        assert!(query.sql.contains("WHEN 0 = 1 THEN 'inactive'"));
        assert!(query.sql.contains("LOWER(u.email) IN (:e0, :e1)"));
        assert!(!query.sql.contains(":now"));
    }

    #[test]
    fn test_sqlite_folds_case_with_registered_function() {
        let query = RejectionQuery::render(
            &predicate(
                ActivityChecks {
                    never_logged_in: true,
                    ..Default::default()
                },
                &[],
                Backend::Sqlite,
            ),
            1,
        );

        assert!(query.sql.starts_with("SELECT sf_lower(u.email) AS email"));
        assert!(query.sql.contains("WHERE sf_lower(u.email) IN (:e0)"));
        assert!(!query.sql.contains("LOWER("));
    }

    #[test]
    fn test_inactivity_ladder_per_backend() {
        let checks = ActivityChecks {
            inactivity: true,
            ..Default::default()
        };
        let thresholds = [
            (RoleId(16), Some(30)),
            (RoleId(17), Some(0)),
            (RoleId::UNASSIGNED_ROLE, Some(30)),
            (RoleId::ASSIGNED_SUBMISSION, Some(365)),
        ];

        let mysql = RejectionQuery::render(&predicate(checks, &thresholds, Backend::MySql), 1);
        assert!(mysql.binds_now);
        assert!(mysql.sql.contains("DATEDIFF(:now, u.date_registered) >= 45"));
        assert!(mysql
            .sql
            .contains("CASE WHEN DATEDIFF(:now, u.date_last_login) >= 30 THEN 1 END"));

        let never = mysql.sql.find("ug.role_id IN (17)").unwrap();
        let submission = mysql.sql.find("FROM submissions AS s").unwrap();
        let thirty = mysql.sql.find("ug.role_id IN (16)").unwrap();
        assert!(never < submission && submission < thirty);
        assert!(mysql.sql.contains("NOT EXISTS (SELECT 0 FROM user_user_groups"));
        assert!(mysql.sql.contains("THEN 0 WHEN"));

        let postgres = RejectionQuery::render(&predicate(checks, &thresholds, Backend::Postgres), 1);
        assert!(postgres
            .sql
            .contains("DATE(:now) - DATE(u.date_last_login) >= 365"));
    }

    #[test]
    fn test_inactivity_without_bands_never_matches() {
        let query = RejectionQuery::render(
            &predicate(
                ActivityChecks {
                    inactivity: true,
                    ..Default::default()
                },
                &[(RoleId(16), None)],
                Backend::Sqlite,
            ),
            1,
        );
        assert!(query.sql.contains(">= 45 AND 0 = 1)"));
    }
}
