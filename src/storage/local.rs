use anyhow::Result;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 本地文件系统操作
pub struct LocalStore;

impl LocalStore {
    /// 规范路径转换为文件系统路径
    pub fn fs_path(canonical: &str) -> PathBuf {
        PathBuf::from(canonical)
    }

    /// 规范化路径分隔符（统一使用 /）
    pub fn normalize_path(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// 创建目录，返回是否新建
    pub async fn create_folder(path: &Path) -> std::io::Result<bool> {
        if fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            return Ok(false);
        }
        fs::create_dir_all(path).await?;
        Ok(true)
    }

    /// 确保父目录存在
    pub async fn ensure_parent(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// 下载中的临时文件路径
    pub fn part_path(path: &Path) -> PathBuf {
        let mut temp: OsString = path.as_os_str().to_owned();
        temp.push(".part");
        PathBuf::from(temp)
    }

    /// 先写临时文件，再原子重命名
    pub async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
        Self::ensure_parent(path).await?;

        let temp_path = Self::part_path(path);

        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, path).await?;

        Ok(())
    }

    /// 设置文件修改时间
    pub fn set_modified(path: &Path, modified_at: DateTime<Utc>) -> std::io::Result<()> {
        let mtime = FileTime::from_unix_time(
            modified_at.timestamp(),
            modified_at.timestamp_subsec_nanos(),
        );
        filetime::set_file_mtime(path, mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("file.txt");

        LocalStore::write_atomic(&target, b"data".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        assert!(!dir.path().join("a/b/file.txt.part").exists());
    }

    #[tokio::test]
    async fn test_create_folder_reports_whether_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new");

        assert!(LocalStore::create_folder(&target).await.unwrap());
        assert!(!LocalStore::create_folder(&target).await.unwrap());
    }

    #[test]
    fn test_set_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let when = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        LocalStore::set_modified(&file, when).unwrap();

        let modified: DateTime<Utc> = std::fs::metadata(&file).unwrap().modified().unwrap().into();
        assert_eq!(modified, when);
    }
}
