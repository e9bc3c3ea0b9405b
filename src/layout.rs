// ============================================================================
// src/layout.rs – On-volume layout of an installation
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

pub const EFI_DIR: &str = "EFI";
pub const MARKER_DIR: &str = "BootNext";
pub const LOADER_FILE: &str = "BootNext.efi";
pub const CONFIG_FILE: &str = "config.conf";

/// Find a visible child directory of `parent` whose name matches `name`
/// ignoring ASCII case (FAT volumes are case-insensitive).
pub fn find_child_dir(parent: &Path, name: &str) -> Option<PathBuf> {
    fs::read_dir(parent).ok()?.flatten().find_map(|entry| {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with('.') || !file_name.eq_ignore_ascii_case(name) {
            return None;
        }
        let path = entry.path();
        path.is_dir().then_some(path)
    })
}

/// Existing `EFI/BootNext` directory under a mounted volume root, if any.
pub fn marker_dir(root: &Path) -> Option<PathBuf> {
    find_child_dir(root, EFI_DIR).and_then(|efi| find_child_dir(&efi, MARKER_DIR))
}

/// Where an installation goes. Reuses whatever spelling already exists on the
/// volume so a second `efi/` directory is never created next to `EFI/`.
pub fn install_dir(root: &Path) -> PathBuf {
    let efi = find_child_dir(root, EFI_DIR).unwrap_or_else(|| root.join(EFI_DIR));
    find_child_dir(&efi, MARKER_DIR).unwrap_or_else(|| efi.join(MARKER_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_matches_any_case() {
        let dir = tempdir().unwrap();
        assert!(marker_dir(dir.path()).is_none());

        fs::create_dir_all(dir.path().join("efi").join("bootNEXT")).unwrap();
        let found = marker_dir(dir.path()).unwrap();
        assert!(found.ends_with("efi/bootNEXT"));
    }

    #[test]
    fn marker_must_be_a_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("EFI")).unwrap();
        fs::write(dir.path().join("EFI").join("BootNext"), b"file").unwrap();
        assert!(marker_dir(dir.path()).is_none());
    }

    #[test]
    fn install_dir_reuses_existing_spelling() {
        let dir = tempdir().unwrap();
        assert_eq!(
            install_dir(dir.path()),
            dir.path().join("EFI").join("BootNext")
        );

        fs::create_dir_all(dir.path().join("efi")).unwrap();
        assert_eq!(
            install_dir(dir.path()),
            dir.path().join("efi").join("BootNext")
        );
    }
}
