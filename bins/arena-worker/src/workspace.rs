use std::io;
use std::path::Path;
use tempfile::TempDir;

/// Scratch directory owned by exactly one grading run.
///
/// Removed when dropped, so every exit path of the run (success, early
/// return, error, panic) cleans up after itself.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(root: &Path, submission_id: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;

        let prefix = format!("grader_{}_", sanitize(submission_id));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;

        // the sandbox user is not the worker user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = Workspace::create(root.path(), "sub-1").unwrap();
            assert!(workspace.path().is_dir());
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_workspaces_are_unique_per_run() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path(), "sub-1").unwrap();
        let b = Workspace::create(root.path(), "sub-1").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_prefix_strips_path_characters() {
        assert_eq!(sanitize("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize("a1-b_2"), "a1-b_2");
    }
}
