#![forbid(unsafe_code)]

//! Process and file hardening for the sync job.

use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Refuses to start as root. Downloads land in user-owned trees and the OAuth
/// token must not end up owned by root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; schedule it under a regular user account");
    }
    Ok(())
}

/// Limits `path` to owner read/write (0600). No-op on non-unix targets.
pub fn restrict_to_owner(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_uid_is_allowed() {
        assert!(ensure_not_root_for(Uid::from_raw(1000), "ytpl_sync").is_ok());
    }

    #[test]
    fn root_uid_is_rejected() {
        let err = ensure_not_root_for(Uid::from_raw(0), "ytpl_sync").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[cfg(unix)]
    #[test]
    fn restrict_to_owner_sets_0600() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let file = tempfile::NamedTempFile::new()?;
        restrict_to_owner(file.path())?;
        let mode = std::fs::metadata(file.path())?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }
}
