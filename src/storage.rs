//! Local filesystem helpers
//!
//! Home directory expansion, free space queries and the guard against
//! clean-replacing a directory that must never be wiped.

use std::path::{Component, Path, PathBuf};

/// The current user's home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = match home_dir() {
        Some(home) => home,
        None => return PathBuf::from(path),
    };

    if path == "~" {
        home
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Whether a clean replace of `path` would wipe the filesystem root, the
/// home directory or a directory containing it.
///
/// `..` components are resolved lexically before the check.
pub fn is_dangerous_target(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return true;
    }

    let target = normalize(path);
    if !target.components().any(|c| matches!(c, Component::Normal(_))) {
        return true;
    }

    match home_dir() {
        Some(home) => normalize(&home).starts_with(&target),
        None => false,
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Free space available to unprivileged users on the filesystem holding `path`
#[cfg(unix)]
pub fn free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = CString::new(path.as_os_str().as_bytes()).ok()?;

    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        if libc::statvfs(path_cstr.as_ptr(), stat.as_mut_ptr()) == 0 {
            let stat = stat.assume_init();
            Some(stat.f_bavail as u64 * stat.f_frsize as u64)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> Option<u64> {
    None
}

/// Format a byte count for humans
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(65536), "64.00 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
    }

    #[test]
    fn test_dangerous_targets() {
        assert!(is_dangerous_target(Path::new("")));
        assert!(is_dangerous_target(Path::new("/")));
        assert!(is_dangerous_target(Path::new("/./")));
        assert!(!is_dangerous_target(Path::new("/srv/app")));
        assert!(!is_dangerous_target(Path::new("relative/app")));
        assert!(is_dangerous_target(Path::new("/tmp/..")));
        assert!(is_dangerous_target(Path::new("/srv/../..")));
        assert!(is_dangerous_target(Path::new("relative/..")));
        assert!(!is_dangerous_target(Path::new("/srv/app/../robot")));

        if let Some(home) = home_dir() {
            assert!(is_dangerous_target(&home));
            assert!(is_dangerous_target(&home.join("app/..")));
            assert!(is_dangerous_target(&home.join("x/../..")));
            assert!(!is_dangerous_target(&home.join("app")));
            assert!(!is_dangerous_target(&home.join("app/../robot")));
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/srv/./app/../robot/")), PathBuf::from("/srv/robot"));
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/opt/app"), PathBuf::from("/opt/app"));
        if let Some(home) = home_dir() {
            assert_eq!(expand_home("~/app"), home.join("app"));
            assert_eq!(expand_home("~"), home);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space(dir.path()).is_some());
        assert!(free_space(&dir.path().join("missing")).is_none());
    }
}
