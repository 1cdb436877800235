//! Applies the filter to an outgoing message's recipient lists.

use std::collections::{BTreeMap, BTreeSet};

use lettre::message::Mailbox;
use tracing::info;

use crate::address::EmailAddress;
use crate::error::FilterError;
use crate::pipeline::{FilterConfiguration, FilterEngine};
use crate::reason::RejectionReason;

/// The parts of an outgoing message the filter needs to see and rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    template_key: Option<String>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
}

impl OutgoingMessage {
    pub fn new(template_key: Option<String>) -> Self {
        OutgoingMessage {
            template_key,
            ..Default::default()
        }
    }

    /// The message type tag used for passthrough exemptions.
    pub fn template_key(&self) -> Option<&str> {
        self.template_key.as_deref()
    }

    fn recipients(&self) -> BTreeSet<EmailAddress> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(mailbox_address)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Exempt from filtering; the message is untouched.
    Passthrough,
    /// Send to the surviving recipients.
    Deliver {
        rejected: BTreeMap<EmailAddress, RejectionReason>,
    },
    /// No primary recipient survived. The send counts as handled, not failed.
    Suppress {
        rejected: BTreeMap<EmailAddress, RejectionReason>,
    },
}

/// Filters every recipient of `message` in one run and rewrites its lists to
/// the accepted addresses.
pub async fn screen_message(
    engine: &FilterEngine,
    message: &mut OutgoingMessage,
    config: &FilterConfiguration,
) -> Result<SendDecision, FilterError> {
    if let Some(key) = message.template_key() {
        if config.is_passthrough(key) {
            info!(template = key, "message exempt from recipient filtering");
            return Ok(SendDecision::Passthrough);
        }
    }

    let outcome = engine.filter_emails(message.recipients(), config).await?;
    let keep = |mailbox: &Mailbox| outcome.accepted.contains(&mailbox_address(mailbox));
    message.to.retain(keep);
    message.cc.retain(keep);
    message.bcc.retain(keep);

    if message.to.is_empty() {
        info!(
            rejected = outcome.rejected.len(),
            "no recipient left, suppressing message"
        );
        Ok(SendDecision::Suppress {
            rejected: outcome.rejected,
        })
    } else {
        Ok(SendDecision::Deliver {
            rejected: outcome.rejected,
        })
    }
}

fn mailbox_address(mailbox: &Mailbox) -> EmailAddress {
    EmailAddress::new(mailbox.email.as_ref())
}
