use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("Failed to fetch disposable domain list from {url}: {message}")]
    #[diagnostic(code(sendfilter::remote_fetch))]
    RemoteFetch { url: String, message: String },

    #[error("MX lookup for {domain} failed: {message}")]
    #[diagnostic(code(sendfilter::dns_lookup))]
    DnsLookup { domain: String, message: String },

    #[error("Account directory query failed: {message}")]
    #[diagnostic(
        code(sendfilter::directory_query),
        help("recipients cannot be cleared without the account directory")
    )]
    DirectoryQuery { message: String },

    #[error("Unsupported directory backend: {backend}")]
    #[diagnostic(
        code(sendfilter::unsupported_backend),
        help("supported backends are mysql, postgres and sqlite")
    )]
    UnsupportedBackend { backend: String },

    #[error("Filtering did not complete within {millis}ms")]
    #[diagnostic(code(sendfilter::timeout))]
    Timeout { millis: u128 },
}

impl FilterError {
    pub(crate) fn directory(message: impl Into<String>) -> Self {
        FilterError::DirectoryQuery {
            message: message.into(),
        }
    }
}
