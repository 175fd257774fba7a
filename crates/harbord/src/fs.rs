//! On-disk layout under the daemon's var path.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

/// Read (or mint once) the stable cluster identifier for an internal
/// service type. Stored at `<var>/isvcs/<type>.clustername`, mode 0600.
pub fn cluster_name(var_path: &Path, isvcs_type: &str) -> anyhow::Result<String> {
    let file = var_path
        .join("isvcs")
        .join(format!("{isvcs_type}.clustername"));
    match fs::read_to_string(&file) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
        _ => {
            let name = uuid::Uuid::new_v4().to_string();
            let dir = file.parent().expect("clustername file has a parent");
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o770))?;
            fs::write(&file, &name)
                .with_context(|| format!("writing {}", file.display()))?;
            fs::set_permissions(&file, fs::Permissions::from_mode(0o600))?;
            info!(file = %file.display(), "cluster name created");
            Ok(name)
        }
    }
}

/// The per-tenant filesystem mount point.
pub fn tenant_volume_path(var_path: &Path, pool_id: &str, tenant_id: &str) -> PathBuf {
    var_path.join("volumes").join(pool_id).join(tenant_id)
}

/// The host-id file consulted when `--host-id` is not passed.
pub fn host_id_file(var_path: &Path) -> PathBuf {
    var_path.join("host-id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_name_is_created_once_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = cluster_name(dir.path(), "elasticsearch").unwrap();
        let second = cluster_name(dir.path(), "elasticsearch").unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());

        // A different type gets its own name.
        let other = cluster_name(dir.path(), "logstash").unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn cluster_name_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        cluster_name(dir.path(), "elasticsearch").unwrap();
        let file = dir.path().join("isvcs").join("elasticsearch.clustername");
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn volume_path_layout() {
        let path = tenant_volume_path(Path::new("/var/lib/harbor"), "p1", "t1");
        assert_eq!(path, PathBuf::from("/var/lib/harbor/volumes/p1/t1"));
    }
}
