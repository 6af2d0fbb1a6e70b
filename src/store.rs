//! JSON 文档元数据存储：每个文档是一个记录数组，写入时加锁并原子替换。

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::debug;

use crate::atomic::write_atomic;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::locking::DocumentLocks;
use crate::storage::StorageError;

pub const PROJECTS_DOC: &str = "projects.json";
pub const FILES_DOC: &str = "files.json";
pub const CATEGORY_PASSWORDS_DOC: &str = "category_passwords.json";

#[derive(Debug)]
pub struct MetaStore {
    data_dir: PathBuf,
    locks: DocumentLocks,
    lock_timeout: Duration,
}

impl MetaStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            locks: DocumentLocks::new(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// 创建数据目录，并为缺失的文档写入空数组。
    pub async fn ensure_documents(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir).await?;
        for document in [PROJECTS_DOC, FILES_DOC, CATEGORY_PASSWORDS_DOC] {
            let path = self.data_dir.join(document);
            if fs::metadata(&path).await.is_err() {
                write_atomic(&path, b"[]").await?;
            }
        }
        Ok(())
    }

    /// 读取整个文档；文件缺失或为空视为空数组。
    pub async fn load<T: DeserializeOwned>(&self, document: &str) -> Result<Vec<T>, StorageError> {
        let path = self.data_dir.join(document);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(StorageError::Corrupt)
    }

    /// 在文档锁内完成读取、修改与原子写回。
    pub async fn update<T, R, F>(&self, document: &str, apply: F) -> Result<R, StorageError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> R,
    {
        let _guard = self
            .locks
            .acquire(document, self.lock_timeout)
            .await
            .ok_or(StorageError::Busy)?;
        let mut records = self.load::<T>(document).await?;
        let result = apply(&mut records);
        let content = serde_json::to_vec_pretty(&records).map_err(StorageError::Corrupt)?;
        fs::create_dir_all(&self.data_dir).await?;
        write_atomic(&self.data_dir.join(document), &content).await?;
        debug!(document, records = records.len(), "metadata document saved");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Row {
        id: u32,
    }

    fn make_store() -> (tempfile::TempDir, Arc<MetaStore>) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(MetaStore::new(temp.path().join("data")));
        (temp, store)
    }

    #[tokio::test]
    async fn missing_and_blank_documents_load_empty() {
        let (_temp, store) = make_store();
        assert!(store.load::<Row>(FILES_DOC).await.expect("load").is_empty());

        std::fs::create_dir_all(store.data_dir()).expect("mkdir");
        std::fs::write(store.data_dir().join(FILES_DOC), "  \n").expect("write");
        assert!(store.load::<Row>(FILES_DOC).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn ensure_documents_seeds_empty_arrays() {
        let (_temp, store) = make_store();
        store.ensure_documents().await.expect("ensure");
        let content =
            std::fs::read_to_string(store.data_dir().join(PROJECTS_DOC)).expect("read projects");
        assert_eq!(content, "[]");
    }

    #[tokio::test]
    async fn corrupt_document_is_reported_not_discarded() {
        let (_temp, store) = make_store();
        std::fs::create_dir_all(store.data_dir()).expect("mkdir");
        std::fs::write(store.data_dir().join(FILES_DOC), "[{\"id\":").expect("write");

        let result = store
            .update::<Row, _, _>(FILES_DOC, |rows| rows.push(Row { id: 1 }))
            .await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
        let content = std::fs::read_to_string(store.data_dir().join(FILES_DOC)).expect("read");
        assert_eq!(content, "[{\"id\":");
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let (_temp, store) = make_store();
        let mut tasks = Vec::new();
        for id in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update::<Row, _, _>(FILES_DOC, |rows| rows.push(Row { id }))
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("update");
        }

        let mut ids: Vec<u32> = store
            .load::<Row>(FILES_DOC)
            .await
            .expect("load")
            .into_iter()
            .map(|row| row.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..32).collect::<Vec<_>>());
    }
}
