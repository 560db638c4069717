//! File transfer payloads.
//!
//! Files travel as a single message whose value carries the relative `path`
//! and, on the reply, the base64 body under `file`. Relative paths are
//! resolved beneath a configured root and never escape it.

use crate::error::{WireError, WireResult};
use base64::Engine;
use fieldmesh_types::Value;
use std::path::{Component, Path, PathBuf};

/// Field naming the requested resource.
pub const PATH_FIELD: &str = "path";
/// Field carrying the base64 body.
pub const FILE_FIELD: &str = "file";

/// Join `rel` onto `root`, rejecting absolute paths and `..` components.
pub fn resolve_under(root: &Path, rel: &str) -> WireResult<PathBuf> {
    if rel.is_empty() {
        return Err(WireError::Path("empty path".into()));
    }
    let path = Path::new(rel);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(WireError::Path(format!("'..' not allowed in {rel}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(WireError::Path(format!("absolute path {rel}")));
            }
        }
    }
    Ok(root.join(path))
}

/// Read `rel` beneath `root` and build the reply value.
pub fn load(root: &Path, rel: &str) -> WireResult<Value> {
    let full = resolve_under(root, rel)?;
    let body = std::fs::read(&full)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(body);
    Ok(Value::map([
        (PATH_FIELD, Value::from(rel)),
        (FILE_FIELD, Value::Str(encoded)),
    ]))
}

/// Write a received file value beneath `root`, creating parent directories.
pub fn save(root: &Path, value: &Value) -> WireResult<PathBuf> {
    let rel = value
        .get(PATH_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Path("missing path".into()))?;
    let encoded = value
        .get(FILE_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Malformed(format!("no file body for {rel}")))?;
    let body = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| WireError::Malformed(format!("file body for {rel}: {e}")))?;

    let full = resolve_under(root, rel)?;
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&full, body)?;
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escape() {
        let root = Path::new("/srv/files");
        assert_eq!(
            resolve_under(root, "sounds/tone.wav").unwrap(),
            PathBuf::from("/srv/files/sounds/tone.wav")
        );
        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "a/../../b").is_err());
        assert!(resolve_under(root, "/etc/passwd").is_err());
        assert!(resolve_under(root, "").is_err());
    }

    #[test]
    fn test_load_then_save() {
        let served = tempfile::tempdir().unwrap();
        let saved = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(served.path().join("sounds")).unwrap();
        std::fs::write(served.path().join("sounds/tone.wav"), b"RIFF0000").unwrap();

        let value = load(served.path(), "sounds/tone.wav").unwrap();
        let written = save(saved.path(), &value).unwrap();
        assert_eq!(std::fs::read(written).unwrap(), b"RIFF0000");
    }

    #[test]
    fn test_save_rejects_bad_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let no_body = Value::map([(PATH_FIELD, Value::from("x.bin"))]);
        assert!(save(dir.path(), &no_body).is_err());

        let escape = Value::map([
            (PATH_FIELD, Value::from("../x.bin")),
            (FILE_FIELD, Value::from("AAAA")),
        ]);
        assert!(matches!(save(dir.path(), &escape), Err(WireError::Path(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load(dir.path(), "absent.txt"), Err(WireError::Io(_))));
    }
}
