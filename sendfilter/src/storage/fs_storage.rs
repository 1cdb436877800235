use crate::storage::Storage;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use miette::{Context, IntoDiagnostic, Result};
use tokio::fs;

/// Stores every key as `<base_path>/<key>.json`.
pub struct FileSystemStorage {
    base_path: Utf8PathBuf,
}

impl FileSystemStorage {
    pub async fn new<P: AsRef<Utf8Path>>(base_path: P) -> Result<Self> {
        // Create the base path if it doesn't exist.
        fs::create_dir_all(base_path.as_ref())
            .await
            .into_diagnostic()
            .wrap_err("creating base path")?;

        Ok(FileSystemStorage {
            base_path: base_path.as_ref().to_owned(),
        })
    }

    fn file_path(&self, key: &str) -> Utf8PathBuf {
        self.base_path.join(format!("{}.json", key))
    }
}

#[async_trait]
impl Storage for FileSystemStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.file_path(key);
        if path.exists() {
            let contents = fs::read(&path)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("reading {}", path))?;
            Ok(Some(contents))
        } else {
            Ok(None)
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.file_path(key);
        // Readers never see a half-written blob.
        let tmp_path = self.base_path.join(format!("{}.json.tmp", key));
        fs::write(&tmp_path, value)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("writing {}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("replacing {}", path))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.file_path(key);
        if path.exists() {
            fs::remove_file(path).await.into_diagnostic()?;
        }
        Ok(())
    }
}
