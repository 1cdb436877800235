//! Send-time recipient filtering.
//!
//! [`FilterEngine`] removes recipients on disposable mail domains, recipients
//! whose account is unvalidated or inactive, and recipients on domains without
//! a mail exchange, reporting one [`RejectionReason`] per removed address.

pub mod activity;
pub mod address;
pub mod clock;
pub mod config;
pub mod directory;
pub mod disposable;
pub mod error;
pub mod mx;
pub mod pipeline;
pub mod reason;
pub mod roles;
pub mod screen;
pub mod storage;

pub use activity::{Account, AccountActivityPredicate, ActivityChecks, Backend};
pub use address::EmailAddress;
pub use clock::{Clock, SystemClock};
pub use directory::{AccountDirectory, MemoryDirectory, SqliteDirectory};
pub use disposable::{DisposableDomainCache, DisposableSettings, HttpListFetcher, ListFetcher};
pub use error::FilterError;
pub use mx::{HickoryResolver, MailExchangeResolver, MxRecordCache};
pub use pipeline::{FilterConfiguration, FilterEngine, FilterOutcome, FilterPipeline};
pub use reason::RejectionReason;
pub use roles::{RoleId, Threshold, ThresholdBand, ThresholdResolver};
pub use screen::{screen_message, OutgoingMessage, SendDecision};
pub use storage::{FileSystemStorage, MemoryStorage, Storage};
