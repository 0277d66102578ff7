//! Instance identity persisted across restarts.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorContext, GsmError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub id: Uuid,
    pub path: PathBuf,
    /// True when this start wrote the file
    pub created: bool,
}

impl InstanceIdentity {
    /// Read the UUID stored in `dir/file`, writing a fresh one when the file
    /// is absent or unreadable as a UUID.
    pub fn load_or_create(dir: &Path, file: &str) -> Result<Self> {
        let path = dir.join(file);

        match std::fs::read_to_string(&path) {
            Ok(contents) => match Uuid::parse_str(contents.trim()) {
                Ok(id) => {
                    info!(instance_id = %id, path = %path.display(), "Reusing instance id");
                    return Ok(Self { id, path, created: false });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Instance id file is corrupt, replacing it");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GsmError::internal("Failed to read instance id file").with_source(e)),
        }

        std::fs::create_dir_all(dir).context("Failed to create instance id directory")?;
        let id = Uuid::new_v4();
        std::fs::write(&path, id.to_string()).context("Failed to write instance id file")?;
        info!(instance_id = %id, path = %path.display(), "Created instance id");

        Ok(Self { id, path, created: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceIdentity::load_or_create(dir.path(), "id").unwrap();
        let second = InstanceIdentity::load_or_create(dir.path(), "id").unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id"), "not-a-uuid").unwrap();

        let identity = InstanceIdentity::load_or_create(dir.path(), "id").unwrap();
        assert!(identity.created);
        let stored = std::fs::read_to_string(dir.path().join("id")).unwrap();
        assert_eq!(stored, identity.id.to_string());
    }
}
