use async_trait::async_trait;
use miette::{Context, IntoDiagnostic, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod fs_storage;
pub mod memory;

pub use fs_storage::FileSystemStorage;
pub use memory::MemoryStorage;

/// Durable key-value store for cache state that must outlive the process.
///
/// Values are opaque blobs that are always read and written whole.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub async fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .into_diagnostic()
                .wrap_err_with(|| format!("decoding stored {}", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn store_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .into_diagnostic()
        .wrap_err_with(|| format!("encoding {}", key))?;
    storage.put(key, bytes).await
}
