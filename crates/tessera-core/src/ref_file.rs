//! Ref files: one ref handed across processes through the filesystem.
//!
//! The file holds a json-encoded bundle with exactly one root. The bundle
//! carries whatever the root needs (e.g. a peer and its route associations),
//! so the reader can unbundle it and then act on the root.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::bundle::Bundle;
use crate::capsule::Ref;
use crate::codec::{Codec, DecodeError, EncodeError};
use crate::json::JsonCodec;
use crate::object::Object;

#[derive(Debug, Error)]
pub enum RefFileError {
    #[error("ref file {0} does not exist")]
    Missing(PathBuf),

    #[error("ref file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("ref file must have exactly one root, found {0}")]
    RootCount(usize),

    #[error("ref file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Write `bundle` atomically: a temp file in the same directory, then rename.
pub fn save_ref_file(path: &Path, bundle: &Bundle) -> Result<(), RefFileError> {
    if bundle.roots.len() != 1 {
        return Err(RefFileError::RootCount(bundle.roots.len()));
    }
    let bytes = JsonCodec.encode(&Bundle::schema(), &bundle.to_value())?;

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| RefFileError::Io(path.to_path_buf(), e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ref".into());
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, &bytes).map_err(|e| RefFileError::Io(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        RefFileError::Io(path.to_path_buf(), e)
    })?;
    tracing::debug!(path = %path.display(), root = %bundle.roots[0].short(), "ref file written");
    Ok(())
}

pub fn load_ref_file(path: &Path) -> Result<Bundle, RefFileError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RefFileError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(RefFileError::Io(path.to_path_buf(), e)),
    };
    let corrupt = |e: DecodeError| RefFileError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let value = JsonCodec.decode(&Bundle::schema(), &bytes).map_err(corrupt)?;
    let bundle = Bundle::from_value(value).map_err(corrupt)?;
    if bundle.roots.len() != 1 {
        return Err(RefFileError::RootCount(bundle.roots.len()));
    }
    Ok(bundle)
}

/// The single root of a loaded ref file.
pub fn root_of(bundle: &Bundle) -> Result<Ref, RefFileError> {
    match bundle.roots.as_slice() {
        [root] => Ok(*root),
        roots => Err(RefFileError::RootCount(roots.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::Capsule;
    use crate::codec::CDR;

    fn one_root() -> Bundle {
        let capsule = Capsule::new("tessera.text", CDR, &b"payload"[..]);
        Bundle {
            roots: vec![capsule.make_ref()],
            aux_roots: vec![],
            capsule_list: vec![capsule],
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ref");
        save_ref_file(&path, &one_root()).unwrap();
        let loaded = load_ref_file(&path).unwrap();
        assert_eq!(loaded, one_root());
        assert_eq!(root_of(&loaded).unwrap(), one_root().roots[0]);
    }

    #[test]
    fn file_is_human_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ref");
        save_ref_file(&path, &one_root()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"roots\""));
        assert!(text.contains("blake3:"));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_ref_file(&dir.path().join("absent.ref")),
            Err(RefFileError::Missing(_))
        ));
    }

    #[test]
    fn corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ref");
        std::fs::write(&path, b"{\"roots\": 7}").unwrap();
        assert!(matches!(load_ref_file(&path), Err(RefFileError::Corrupt { .. })));
    }

    #[test]
    fn multiple_roots_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.ref");
        let mut bundle = one_root();
        bundle.roots.push(Ref::from_hash([2; 32]));
        assert!(matches!(
            save_ref_file(&path, &bundle),
            Err(RefFileError::RootCount(2))
        ));

        let text = String::from_utf8(
            JsonCodec
                .encode(&Bundle::schema(), &bundle.to_value())
                .unwrap(),
        )
        .unwrap();
        std::fs::write(&path, text).unwrap();
        assert!(matches!(load_ref_file(&path), Err(RefFileError::RootCount(2))));
    }
}
