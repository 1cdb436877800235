use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why an address was removed. Every rejected address carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionReason {
    DisposableService,
    InvalidMailExchange,
    NotValidated,
    NeverLoggedIn,
    Inactive,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::DisposableService => "disposableService",
            RejectionReason::InvalidMailExchange => "invalidMailExchange",
            RejectionReason::NotValidated => "notValidated",
            RejectionReason::NeverLoggedIn => "neverLoggedIn",
            RejectionReason::Inactive => "inactive",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disposableService" => Ok(RejectionReason::DisposableService),
            "invalidMailExchange" => Ok(RejectionReason::InvalidMailExchange),
            "notValidated" => Ok(RejectionReason::NotValidated),
            "neverLoggedIn" => Ok(RejectionReason::NeverLoggedIn),
            "inactive" => Ok(RejectionReason::Inactive),
            other => Err(format!("unknown rejection reason '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde() {
        for reason in [
            RejectionReason::DisposableService,
            RejectionReason::InvalidMailExchange,
            RejectionReason::NotValidated,
            RejectionReason::NeverLoggedIn,
            RejectionReason::Inactive,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
            assert_eq!(reason.as_str().parse::<RejectionReason>(), Ok(reason));
        }
        assert!("never_logged".parse::<RejectionReason>().is_err());
    }
}
