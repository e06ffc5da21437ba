use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::safe_write_all;

/// A filesystem backed document store
///
/// Every document is a JSON file named after its key, directly under the
/// store root. Writes are atomic but there is no locking, two stores on the
/// same root may overwrite each other.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("invalid document key `{0}`")]
    InvalidKey(String),
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    /// Create or replace the document for the key
    pub async fn write<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let path = self.document_path(key)?;

        // fails if the root exists but is not a directory
        fs::create_dir_all(&self.root).await?;

        let buf = serde_json::to_vec(value)?;
        trace!("writing {}", path.display());
        safe_write_all(path, &buf).await?;
        Ok(())
    }

    /// Read the document for the key, if there is one
    pub async fn read<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, StoreError> {
        let path = self.document_path(key)?;
        trace!("reading {}", path.display());

        match fs::read(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the document for the key. Deleting a missing document succeeds
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.document_path(key)?;
        trace!("removing {}", path.display());
        match fs::remove_file(path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn it_reads_back_written_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("config"));

        store
            .write("pinDevice", &json!({"app": 1, "commit": "abc"}))
            .await
            .unwrap();

        let value: Option<Value> = store.read("pinDevice").await.unwrap();
        assert_eq!(value, Some(json!({"app": 1, "commit": "abc"})));
        assert!(store.root().join("pinDevice.json").exists());
    }

    #[tokio::test]
    async fn it_returns_none_for_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let value: Option<Value> = store.read("deviceId").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn it_deletes_documents_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("apiKey", &json!("secret")).await.unwrap();
        store.delete("apiKey").await.unwrap();
        store.delete("apiKey").await.unwrap();

        let value: Option<Value> = store.read("apiKey").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn it_rejects_keys_that_are_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store.write("../outside", &json!(1)).await;
        assert!(matches!(res, Err(StoreError::InvalidKey(_))));
        let res: Result<Option<Value>, _> = store.read("").await;
        assert!(matches!(res, Err(StoreError::InvalidKey(_))));
    }
}
