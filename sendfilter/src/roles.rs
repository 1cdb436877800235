//! Per-role inactivity thresholds and their grouping into priority bands.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a role. Real roles use the host application's ids; the two
/// negative ids are synthetic and only take part in threshold matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub i64);

impl RoleId {
    /// Matches accounts without any role membership.
    pub const UNASSIGNED_ROLE: RoleId = RoleId(-1);
    /// Matches accounts assigned to at least one submission.
    pub const ASSIGNED_SUBMISSION: RoleId = RoleId(-2);

    pub fn is_synthetic(self) -> bool {
        self == Self::UNASSIGNED_ROLE || self == Self::ASSIGNED_SUBMISSION
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long an account may stay without logging in.
///
/// `Never` sorts above every finite value, so a descending sort puts the most
/// lenient band first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Threshold {
    Days(u64),
    Never,
}

impl Threshold {
    /// Configured values are taken by absolute value; zero means "never expires".
    pub fn from_setting(days: i64) -> Self {
        match days.unsigned_abs() {
            0 => Threshold::Never,
            days => Threshold::Days(days),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Days(days) => write!(f, "{}d", days),
            Threshold::Never => f.write_str("never"),
        }
    }
}

/// Roles sharing one threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdBand {
    pub threshold: Threshold,
    pub roles: BTreeSet<RoleId>,
}

impl ThresholdBand {
    /// The real (non-synthetic) roles of the band.
    pub fn real_roles(&self) -> impl Iterator<Item = RoleId> + '_ {
        self.roles.iter().copied().filter(|role| !role.is_synthetic())
    }

    pub fn includes_unassigned(&self) -> bool {
        self.roles.contains(&RoleId::UNASSIGNED_ROLE)
    }

    pub fn includes_assigned_submission(&self) -> bool {
        self.roles.contains(&RoleId::ASSIGNED_SUBMISSION)
    }
}

/// Configured threshold per role; `None` means the role has no rule.
pub type RoleThresholds = BTreeMap<RoleId, Option<i64>>;

pub struct ThresholdResolver {
    thresholds: RoleThresholds,
}

impl ThresholdResolver {
    pub fn new(thresholds: RoleThresholds) -> Self {
        ThresholdResolver { thresholds }
    }

    /// Groups the configured roles by threshold, most lenient band first.
    pub fn resolve(&self) -> Vec<ThresholdBand> {
        let mut grouped: BTreeMap<Threshold, BTreeSet<RoleId>> = BTreeMap::new();
        for (role, days) in &self.thresholds {
            if let Some(days) = days {
                grouped
                    .entry(Threshold::from_setting(*days))
                    .or_default()
                    .insert(*role);
            }
        }

        let mut bands: Vec<ThresholdBand> = grouped
            .into_iter()
            .map(|(threshold, roles)| ThresholdBand { threshold, roles })
            .collect();
        bands.sort_by_key(|band| Reverse(band.threshold));
        bands
    }
}
