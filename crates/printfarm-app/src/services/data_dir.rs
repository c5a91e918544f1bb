// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::{Path, PathBuf};

/// Name of the per-user application directory.
const APP_DIR: &str = "printfarm";

/// Return the application data directory, creating it if needed.
///
/// `$XDG_DATA_HOME/printfarm`, else `~/.local/share/printfarm`, else
/// `/tmp/printfarm`.
pub fn data_dir() -> PathBuf {
    let dir = resolve(
        std::env::var_os("XDG_DATA_HOME").as_deref().map(Path::new),
        std::env::var_os("HOME").as_deref().map(Path::new),
    );
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(path = %dir.display(), error = %e, "could not create data directory");
    }
    dir
}

fn resolve(xdg_data_home: Option<&Path>, home: Option<&Path>) -> PathBuf {
    let base = match (xdg_data_home, home) {
        (Some(xdg), _) if !xdg.as_os_str().is_empty() => xdg.to_path_buf(),
        (_, Some(home)) if !home.as_os_str().is_empty() => home.join(".local").join("share"),
        _ => PathBuf::from("/tmp"),
    };
    base.join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_wins_over_home() {
        let dir = resolve(Some(Path::new("/xdg")), Some(Path::new("/home/ada")));
        assert_eq!(dir, PathBuf::from("/xdg/printfarm"));
    }

    #[test]
    fn home_falls_back_to_local_share() {
        let dir = resolve(None, Some(Path::new("/home/ada")));
        assert_eq!(dir, PathBuf::from("/home/ada/.local/share/printfarm"));
        let dir = resolve(Some(Path::new("")), Some(Path::new("/home/ada")));
        assert_eq!(dir, PathBuf::from("/home/ada/.local/share/printfarm"));
    }

    #[test]
    fn last_resort_is_tmp() {
        assert_eq!(resolve(None, None), PathBuf::from("/tmp/printfarm"));
    }
}
