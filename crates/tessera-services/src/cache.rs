//! On-disk capsule cache, the mosaic's spill backend.
//!
//! Capsules are stored by ref in a two-level directory structure:
//!   {root}/{hex[0..2]}/{hex}
//!
//! Each file holds the capsule's canonical bytes. Files are immutable: if
//! the ref exists, the content hashes to it. The mosaic re-verifies on load
//! anyway, so a damaged file is a miss, never a wrong answer.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use tessera_core::mosaic::CapsuleSpill;
use tessera_core::{Capsule, Ref};

#[derive(Clone)]
pub struct DiskCapsuleCache {
    root: PathBuf,
}

impl DiskCapsuleCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn has(&self, r: &Ref) -> bool {
        self.capsule_path(r).exists()
    }

    /// Raw canonical bytes for `r`, if cached.
    pub fn get(&self, r: &Ref) -> Result<Option<Bytes>> {
        let path = self.capsule_path(r);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open capsule: {}", path.display()))?;

        // Safety: opened read-only, and files are never rewritten in place.
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap capsule: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Atomic: temp file, then rename. A ref already present is a no-op.
    pub fn put(&self, r: &Ref, data: &[u8]) -> Result<()> {
        let path = self.capsule_path(r);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write capsule data")?;
            file.sync_all().context("failed to sync capsule to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(r = %r.short(), "capsule cached");
        Ok(())
    }

    fn capsule_path(&self, r: &Ref) -> PathBuf {
        let hex = hex::encode(r.hash);
        self.root.join(&hex[0..2]).join(&hex)
    }

    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

impl CapsuleSpill for DiskCapsuleCache {
    fn store(&self, r: &Ref, capsule: &Capsule) -> std::io::Result<()> {
        self.put(r, &capsule.canonical_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")))
    }

    fn load(&self, r: &Ref) -> Option<Capsule> {
        let bytes = match self.get(r) {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::warn!(r = %r.short(), error = %e, "capsule cache read failed");
                return None;
            }
        };
        match Capsule::from_canonical_bytes(&bytes) {
            Ok(capsule) => Some(capsule),
            Err(e) => {
                tracing::warn!(r = %r.short(), error = %e, "cached capsule is corrupt");
                None
            }
        }
    }
}
