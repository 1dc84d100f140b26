use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::Serialize;

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Missing(PathBuf),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {e}"),
            ProjectError::Json(e) => write!(f, "JSON error: {e}"),
            ProjectError::Missing(path) => write!(f, "{} does not exist", path.display()),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Json(e)
    }
}

// ── Canonical project paths ─────────────────────────────────────────

/// Canonical form of a project path, used as the key for locks and history.
///
/// Existing files resolve through `canonicalize`. For files that do not exist
/// yet the parent directory is canonicalized when possible, otherwise the path
/// is made absolute against the working directory and lexically normalized.
pub fn canonical_project_path(path: &Path) -> Result<PathBuf, ProjectError> {
    if path.as_os_str().is_empty() {
        return Err(ProjectError::Missing(path.to_path_buf()));
    }
    if let Ok(canonical) = fs::canonicalize(path) {
        return Ok(canonical);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);
    if let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) {
        if let Ok(parent) = fs::canonicalize(parent) {
            return Ok(parent.join(name));
        }
    }
    Ok(normalized)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Read a project file, mapping a missing file to [`ProjectError::Missing`].
pub fn read_project_bytes(path: &Path) -> Result<Vec<u8>, ProjectError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ProjectError::Missing(path.to_path_buf()))
        }
        Err(e) => Err(ProjectError::Io(e)),
    }
}

// ── Atomic writes ───────────────────────────────────────────────────

/// Per-file mutex map to serialize concurrent writes to the same path.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Atomically write bytes to a file using write-to-temp-then-rename.
///
/// 1. Acquires a per-file mutex so concurrent callers never share the `.tmp` file
/// 2. Writes data to a `.tmp` sibling file and calls `fsync`
/// 3. Renames the `.tmp` file over the target path
///
/// Readers observe either the old bytes or the new bytes, never a mix.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ProjectError> {
    let lock = {
        let mut locks = FILE_LOCKS.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = lock.lock();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path.file_name().unwrap_or_default();
    let mut tmp_name = OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(ProjectError::Io(e));
    }
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProjectError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProjectError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(ProjectError::Io(e)),
    };
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::setup_test_dir;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = setup_test_dir("atomic");
        let path = dir.join("nested").join("scene.proj");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_canonical_path_for_missing_file() {
        let dir = setup_test_dir("canon");
        let a = canonical_project_path(&dir.join("sub").join("..").join("p.proj")).unwrap();
        let b = canonical_project_path(&dir.join("p.proj")).unwrap();
        assert_eq!(a, b);
        fs::write(dir.join("p.proj"), b"{}").unwrap();
        let c = canonical_project_path(&dir.join("./p.proj")).unwrap();
        assert_eq!(b, c);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_read_json_missing_is_reported() {
        let dir = setup_test_dir("readjson");
        let err = read_json::<serde_json::Value>(&dir.join("nope.json")).unwrap_err();
        assert!(matches!(err, ProjectError::Missing(_)));
        let _ = fs::remove_dir_all(&dir);
    }
}
