//! Helper for anonymizing paths that live under the user's home directory.
//!
//! Error messages and log lines frequently include filesystem paths, and
//! those paths often embed the current username (`/home/alice/.tor/...`).
//! This module lets callers replace the home-directory prefix with `~`
//! before displaying such a path, so that the structure of the path is
//! still visible without leaking the username.

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

/// The current user's home directory, cached on first use.
///
/// `None` if we couldn't determine one (unusual, but not impossible: e.g.
/// `$HOME` unset and no password-database entry).
static HOME: Lazy<Option<PathBuf>> = Lazy::new(dirs::home_dir);

/// Extension trait adding [`anonymize_home`](PathExt::anonymize_home) to
/// [`Path`].
pub trait PathExt {
    /// Return a display-friendly string form of this path, with the user's
    /// home directory (if any, and if this path is under it) replaced by
    /// `~`.
    fn anonymize_home(&self) -> String;
}

impl PathExt for Path {
    fn anonymize_home(&self) -> String {
        if let Some(home) = HOME.as_ref() {
            if let Ok(rest) = self.strip_prefix(home) {
                if rest.as_os_str().is_empty() {
                    return "~".to_string();
                }
                return format!("~{}{}", std::path::MAIN_SEPARATOR, rest.display());
            }
        }
        self.display().to_string()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn unrelated_path_is_untouched() {
        // A path with no plausible relationship to any real home directory
        // (on any OS) should come back unchanged.
        let p = Path::new("/nonexistent-root-for-testing/some/file");
        assert_eq!(p.anonymize_home(), p.display().to_string());
    }

    #[test]
    fn home_prefix_is_replaced() {
        if let Some(home) = HOME.as_ref() {
            let under_home = home.join("foo").join("bar");
            assert_eq!(under_home.anonymize_home(), format!("~{}foo{}bar", std::path::MAIN_SEPARATOR, std::path::MAIN_SEPARATOR));
            assert_eq!(home.anonymize_home(), "~");
        }
    }
}
