use std::{io::Write, path::Path};

use serde::Serialize;

use crate::error::Result;

/// Replace `path` with `content` so readers see either the old file or the
/// new one, never a partial write.
///
/// The temporary file lives next to the target, so the final rename stays on
/// one filesystem. It is removed if any step fails.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Best effort. The file is already in place.
    if let Err(e) = sync_dir(parent) {
        tracing::debug!(path = %parent.display(), error = %e, "directory sync failed");
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

/// Pretty-print `value` as JSON with a trailing newline and write it
/// atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("atomic.json");
        write_atomic(&path, b"v1").unwrap();
        write_atomic(&path, b"v2").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").join("b").join("out.json");
        write_json_atomic(&path, &serde_json::json!({"k": 1})).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\n  \"k\": 1\n}\n");
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory at the target path makes the final rename fail.
        let target = tmp.path().join("taken");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "x").unwrap();

        assert!(write_atomic(&target, b"data").is_err());
        let entries: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(entries, [std::ffi::OsString::from("taken")]);
    }

    #[test]
    fn directory_sync_reports_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(sync_dir(tmp.path()).is_ok());
        assert!(sync_dir(&tmp.path().join("gone")).is_err());
    }
}
