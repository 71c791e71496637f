//! 基于 opendal 的远程存储，ID 即存储内路径（文件夹以 `/` 结尾，顶层为空串）

use super::{
    EntryKind, LocalStore, RemoteEntry, RemoteStore, FOLDER_MIME_TYPE, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use crate::core::tree::{leaf_name, HashAlgorithm};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 分块传输大小（不小于 S3 分片上传的最小分片）
pub const TRANSFER_CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub struct OperatorRemote {
    operator: Operator,
    name: String,
    chunk_size: usize,
}

impl OperatorRemote {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn with_timeouts(operator: Operator) -> Operator {
        operator
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
    }

    /// 本地目录模拟的远程存储
    pub fn fs(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        std::fs::create_dir_all(root)?;
        let builder = Fs::default().root(root);
        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        Ok(Self {
            operator,
            name: format!("fs:{}", root),
            chunk_size: TRANSFER_CHUNK_SIZE,
        })
    }

    pub async fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        // 某些 WebDAV 服务器需要先创建根目录，忽略错误
        let _ = operator.create_dir("/").await;

        Ok(Self {
            operator,
            name,
            chunk_size: TRANSFER_CHUNK_SIZE,
        })
    }

    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            name,
            chunk_size: TRANSFER_CHUNK_SIZE,
        })
    }

    /// 按块读取本地文件写入远程，失败时中止写入
    async fn write_from_file(&self, id: &str, local_path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut writer = self
            .operator
            .writer_with(id)
            .chunk(self.chunk_size)
            .await?;

        let mut buf = vec![0u8; self.chunk_size];
        let result = async {
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(buf[..n].to_vec()).await?;
            }
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                writer.close().await?;
                Ok(())
            }
            Err(e) => {
                let _ = writer.abort().await;
                Err(e)
            }
        }
    }

    /// opendal 中的目录路径，顶层为 `/`
    fn dir_path(id: &str) -> String {
        let trimmed = id.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", trimmed)
        }
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        let parent = parent_id.trim_matches('/');
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        }
    }

    fn to_entry(id: &str, meta: &Metadata) -> RemoteEntry {
        let is_dir = meta.is_dir();
        RemoteEntry {
            id: id.to_string(),
            name: leaf_name(id).to_string(),
            kind: if is_dir {
                EntryKind::Folder
            } else {
                EntryKind::File
            },
            mime_type: if is_dir {
                Some(FOLDER_MIME_TYPE.to_string())
            } else {
                meta.content_type().map(|s| s.to_string())
            },
            size: if is_dir { 0 } else { meta.content_length() },
            modified_at: meta.last_modified().unwrap_or_default(),
            checksum: None,
        }
    }
}

#[async_trait]
impl RemoteStore for OperatorRemote {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        let dir = Self::dir_path(folder_id);
        let mut children = Vec::new();

        let mut lister = self
            .operator
            .lister_with(&dir)
            .metakey(
                Metakey::ContentLength
                    | Metakey::LastModified
                    | Metakey::Mode
                    | Metakey::ContentType,
            )
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let path = entry.path();

            // 跳过目录自身
            if path.is_empty() || path == "/" || path == dir {
                continue;
            }

            children.push(Self::to_entry(path, entry.metadata()));
        }

        Ok(children)
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry> {
        let path = if id.trim_matches('/').is_empty() { "/" } else { id };
        let meta = self.operator.stat(path).await?;
        Ok(Self::to_entry(id, &meta))
    }

    async fn download(&self, id: &str, dest_path: &Path) -> Result<()> {
        let size = self.operator.stat(id).await?.content_length();
        let part_path = LocalStore::part_path(dest_path);
        LocalStore::ensure_parent(dest_path).await?;

        let result = async {
            let mut file = tokio::fs::File::create(&part_path).await?;
            let mut offset = 0u64;
            while offset < size {
                let end = (offset + self.chunk_size as u64).min(size);
                let data = self.operator.read_with(id).range(offset..end).await?;
                file.write_all(&data.to_vec()).await?;
                offset = end;
            }
            file.sync_all().await?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&part_path, dest_path).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }

    async fn upload(&self, local_path: &Path, parent_id: &str, name: &str) -> Result<RemoteEntry> {
        let id = Self::child_id(parent_id, name);
        self.write_from_file(&id, local_path).await?;
        self.get_metadata(&id).await
    }

    async fn update_content(&self, id: &str, local_path: &Path) -> Result<RemoteEntry> {
        self.write_from_file(id, local_path).await?;
        self.get_metadata(id).await
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteEntry> {
        let id = format!("{}/", Self::child_id(parent_id, name));
        self.operator.create_dir(&id).await?;

        Ok(RemoteEntry {
            id,
            name: name.to_string(),
            kind: EntryKind::Folder,
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            size: 0,
            modified_at: Utc::now(),
            checksum: None,
        })
    }

    async fn resolve_path_to_id(&self, path: &str) -> Result<Option<String>> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Some(String::new()));
        }

        // 先按目录查找，再按文件查找
        let dir = format!("{}/", trimmed);
        match self.operator.stat(&dir).await {
            Ok(meta) if meta.is_dir() => return Ok(Some(dir)),
            Ok(_) => {}
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match self.operator.stat(trimmed).await {
            Ok(meta) if !meta.is_dir() => Ok(Some(trimmed.to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let result = if id.ends_with('/') {
            self.operator.remove_all(id).await
        } else {
            self.operator.delete(id).await
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn checksum_algorithm(&self) -> Option<HashAlgorithm> {
        None
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_helpers() {
        assert_eq!(OperatorRemote::dir_path(""), "/");
        assert_eq!(OperatorRemote::dir_path("Docs/sub/"), "Docs/sub/");
        assert_eq!(OperatorRemote::child_id("", "a.txt"), "a.txt");
        assert_eq!(OperatorRemote::child_id("Docs/", "a.txt"), "Docs/a.txt");
    }

    #[tokio::test]
    async fn test_fs_backend_round_trip() {
        let remote_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let remote = OperatorRemote::fs(remote_dir.path().to_str().unwrap()).unwrap();

        let folder = remote.create_folder("Docs", "").await.unwrap();
        assert_eq!(folder.id, "Docs/");

        let src = local_dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let uploaded = remote.upload(&src, &folder.id, "a.txt").await.unwrap();
        assert_eq!(uploaded.id, "Docs/a.txt");
        assert_eq!(uploaded.size, 5);

        let children = remote.list_children(&folder.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "a.txt");

        assert_eq!(
            remote.resolve_path_to_id("Docs").await.unwrap(),
            Some("Docs/".to_string())
        );
        assert_eq!(remote.resolve_path_to_id("Missing").await.unwrap(), None);

        let dest = local_dir.path().join("copy.txt");
        remote.download(&uploaded.id, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

        remote.delete_by_id(&folder.id).await.unwrap();
        assert_eq!(remote.resolve_path_to_id("Docs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transfers_span_multiple_chunks() {
        let remote_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let remote = OperatorRemote::fs(remote_dir.path().to_str().unwrap())
            .unwrap()
            .with_chunk_size(4);

        let data: Vec<u8> = (0u8..=41).collect();
        let src = local_dir.path().join("big.bin");
        std::fs::write(&src, &data).unwrap();

        let uploaded = remote.upload(&src, "", "big.bin").await.unwrap();
        assert_eq!(uploaded.size, data.len() as u64);
        assert_eq!(std::fs::read(remote_dir.path().join("big.bin")).unwrap(), data);

        let dest = local_dir.path().join("out/big.bin");
        remote.download(&uploaded.id, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!LocalStore::part_path(&dest).exists());

        let changed = vec![9u8; 10];
        std::fs::write(&src, &changed).unwrap();
        let updated = remote.update_content(&uploaded.id, &src).await.unwrap();
        assert_eq!(updated.size, 10);
        assert_eq!(std::fs::read(remote_dir.path().join("big.bin")).unwrap(), changed);
    }
}
