use crate::errors::AttractorError;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Atomically write a JSON document: temp file in the destination directory,
/// fsync, rename. The temp file is unlinked on any error so partial writes
/// are never visible at the target path.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AttractorError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| AttractorError::Runtime(format!("serialize {}: {error}", path.display())))?;
    atomic_write_bytes(path, &bytes)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), AttractorError> {
    let dir = path
        .parent()
        .ok_or_else(|| AttractorError::Runtime(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|error| AttractorError::io(dir, error))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = dir.join(format!(".{file_name}.tmp-{}", std::process::id()));

    let result = (|| {
        let mut file = File::create(&tmp).map_err(|error| AttractorError::io(&tmp, error))?;
        file.write_all(bytes)
            .map_err(|error| AttractorError::io(&tmp, error))?;
        file.sync_all()
            .map_err(|error| AttractorError::io(&tmp, error))?;
        fs::rename(&tmp, path).map_err(|error| AttractorError::io(path, error))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn ensure_dir(path: &Path) -> Result<(), AttractorError> {
    fs::create_dir_all(path).map_err(|error| AttractorError::io(path, error))
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, AttractorError> {
    let bytes = fs::read(path).map_err(|error| AttractorError::io(path, error))?;
    serde_json::from_slice(&bytes).map_err(|error| {
        AttractorError::Runtime(format!("deserialize {}: {error}", path.display()))
    })
}

/// Recursive directory copy used for branch worktree isolation. Symlinks are
/// copied as the files they point to; special files are skipped.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), AttractorError> {
    ensure_dir(dst)?;
    let entries = fs::read_dir(src).map_err(|error| AttractorError::io(src, error))?;
    for entry in entries {
        let entry = entry.map_err(|error| AttractorError::io(src, error))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|error| AttractorError::io(&src_path, error))?;
        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            if src_path.is_file() {
                fs::copy(&src_path, &dst_path)
                    .map_err(|error| AttractorError::io(&src_path, error))?;
            }
        }
    }
    Ok(())
}
