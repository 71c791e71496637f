//! 远程路径与本地路径之间的双向映射

use crate::config::RootPair;
use crate::core::tree::join_path;
use crate::error::PathMappingError;

/// 规范化远程根路径：`"root"`、`"/"` 表示云端顶层，映射为空串
pub fn normalize_remote_root(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed == "root" || trimmed.trim_matches('/').is_empty() {
        return String::new();
    }
    trimmed.trim_matches('/').to_string()
}

/// 规范化本地根路径：统一使用 `/`，去掉末尾分隔符
pub fn normalize_local_root(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 若 `path` 位于 `root` 之下（按路径段匹配），返回相对路径
fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    if root.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    if path == root {
        return Some("");
    }
    if root == "/" {
        return path.strip_prefix('/');
    }
    path.strip_prefix(root)?.strip_prefix('/')
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MappedRoot {
    remote: String,
    local: String,
}

/// 根目录对映射表
///
/// 路径按“最长匹配根”规则归属到某一对：根完全相同者优先，云端顶层（空根）优先级最低。
/// 找不到匹配时返回错误，不做任何猜测。
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    roots: Vec<MappedRoot>,
}

impl PathMapper {
    pub fn new(pairs: &[RootPair]) -> Self {
        let roots = pairs
            .iter()
            .map(|p| MappedRoot {
                remote: normalize_remote_root(&p.remote),
                local: normalize_local_root(&p.local),
            })
            .collect();
        Self { roots }
    }

    /// 只包含一对根目录的映射表
    pub fn for_pair(pair: &RootPair) -> Self {
        Self::new(std::slice::from_ref(pair))
    }

    /// 远程规范路径 -> 本地路径
    pub fn remote_to_local(&self, remote_path: &str) -> Result<String, PathMappingError> {
        self.roots
            .iter()
            .filter_map(|r| strip_root(&r.remote, remote_path).map(|rel| (r, rel)))
            .max_by_key(|(r, _)| r.remote.len())
            .map(|(r, rel)| rebase(&r.local, rel))
            .ok_or_else(|| PathMappingError::RemoteNotMappable(remote_path.to_string()))
    }

    /// 本地路径 -> 远程规范路径
    pub fn local_to_remote(&self, local_path: &str) -> Result<String, PathMappingError> {
        let local_path = local_path.replace('\\', "/");
        self.roots
            .iter()
            .filter_map(|r| strip_root(&r.local, &local_path).map(|rel| (r, rel)))
            .max_by_key(|(r, _)| r.local.len())
            .map(|(r, rel)| rebase(&r.remote, rel))
            .ok_or_else(|| PathMappingError::LocalNotMappable(local_path.clone()))
    }
}

fn rebase(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        root.to_string()
    } else {
        join_path(root, rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(pairs: &[(&str, &str)]) -> PathMapper {
        let pairs: Vec<_> = pairs.iter().map(|(r, l)| RootPair::new(*r, *l)).collect();
        PathMapper::new(&pairs)
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_remote_root("root"), "");
        assert_eq!(normalize_remote_root("/"), "");
        assert_eq!(normalize_remote_root("/Work/Reports/"), "Work/Reports");
        assert_eq!(normalize_local_root("C:\\Users\\me\\Drive\\"), "C:/Users/me/Drive");
        assert_eq!(normalize_local_root("/"), "/");
    }

    #[test]
    fn test_maps_both_directions() {
        let m = mapper(&[("Documents", "/home/me/Documents"), ("Work/Reports", "/srv/reports")]);

        assert_eq!(
            m.remote_to_local("Documents/a/b.txt").unwrap(),
            "/home/me/Documents/a/b.txt"
        );
        assert_eq!(m.remote_to_local("Work/Reports").unwrap(), "/srv/reports");
        assert_eq!(
            m.local_to_remote("/srv/reports/q1.pdf").unwrap(),
            "Work/Reports/q1.pdf"
        );
    }

    #[test]
    fn test_prefix_must_end_on_component_boundary() {
        let m = mapper(&[("Doc", "/d")]);
        assert_eq!(
            m.remote_to_local("Documents/x.txt"),
            Err(PathMappingError::RemoteNotMappable("Documents/x.txt".to_string()))
        );
    }

    #[test]
    fn test_longest_root_wins_over_top_level() {
        let m = mapper(&[("root", "/data/drive"), ("Photos", "/media/photos")]);

        assert_eq!(m.remote_to_local("Photos/cat.jpg").unwrap(), "/media/photos/cat.jpg");
        assert_eq!(m.remote_to_local("notes.txt").unwrap(), "/data/drive/notes.txt");
        assert_eq!(m.local_to_remote("/data/drive/a/b").unwrap(), "a/b");
        assert_eq!(m.local_to_remote("/data/drive").unwrap(), "");
    }

    #[test]
    fn test_single_pair_mapper_ignores_nested_roots() {
        let top = RootPair::new("root", "/data/drive");
        let m = PathMapper::for_pair(&top);

        assert_eq!(m.remote_to_local("Photos/cat.jpg").unwrap(), "/data/drive/Photos/cat.jpg");
        assert_eq!(m.local_to_remote("/data/drive/Photos/cat.jpg").unwrap(), "Photos/cat.jpg");
        assert!(m.local_to_remote("/media/photos/cat.jpg").is_err());
    }

    #[test]
    fn test_unmapped_paths_fail_instead_of_guessing() {
        let m = mapper(&[("Documents", "/home/me/Documents")]);
        assert!(matches!(
            m.remote_to_local("Other/file.txt"),
            Err(PathMappingError::RemoteNotMappable(_))
        ));
        assert!(matches!(
            m.local_to_remote("/tmp/file.txt"),
            Err(PathMappingError::LocalNotMappable(_))
        ));
    }
}
