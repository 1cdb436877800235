use std::fmt;

use serde::{Deserialize, Serialize};

/// A recipient address in its canonical, lower-cased form.
///
/// Every stage of the filter keys on this value, so `User@Example.com` and
/// `user@example.com` are the same recipient.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn new(raw: &str) -> Self {
        EmailAddress(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the last `@`, or `None` when the address has no domain.
    pub fn domain(&self) -> Option<&str> {
        match self.0.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => Some(domain),
            _ => None,
        }
    }
}

impl From<&str> for EmailAddress {
    fn from(raw: &str) -> Self {
        EmailAddress::new(raw)
    }
}

impl From<String> for EmailAddress {
    fn from(raw: String) -> Self {
        EmailAddress::new(&raw)
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_case_and_whitespace() {
        let a = EmailAddress::new("  User@Example.COM ");
        let b = EmailAddress::new("user@example.com");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "user@example.com");
    }

    #[test]
    fn test_domain_extraction() {
        assert_eq!(EmailAddress::new("a@b.test").domain(), Some("b.test"));
        assert_eq!(EmailAddress::new("\"x@y\"@quoted.test").domain(), Some("quoted.test"));
        assert_eq!(EmailAddress::new("no-domain").domain(), None);
        assert_eq!(EmailAddress::new("trailing@").domain(), None);
    }
}
