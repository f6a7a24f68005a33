//! Content-Addressed Skill Loader
//!
//! Fetches a named skill bundle into the local cache from either a local
//! registry directory or a remote git registry, and verifies the bundle's
//! content hash against an expected value.
//!
//! A bundle that is already cached is returned unchanged: no re-fetch, no
//! re-verification. Callers that need hash enforcement go through
//! [`SkillLoader::load_verified`].

use super::types::{validate_skill_id, SkillBundle, SkillError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// How many hex chars of a digest may appear in error text.
const HASH_PREFIX_LEN: usize = 12;

/// Skill loader with an in-memory resolution cache and an on-disk bundle
/// cache under `<cache_dir>/bundles/<id>`.
pub struct SkillLoader {
    cache_dir: PathBuf,
    local_registry: Option<PathBuf>,
    registry_url: Option<String>,
    resolved: Mutex<HashMap<String, PathBuf>>,
    /// Remote registry checkout, cloned at most once per process.
    checkout: tokio::sync::Mutex<Option<PathBuf>>,
}

impl SkillLoader {
    pub fn new(
        cache_dir: PathBuf,
        local_registry: Option<PathBuf>,
        registry_url: Option<String>,
    ) -> Self {
        Self {
            cache_dir,
            local_registry,
            registry_url,
            resolved: Mutex::new(HashMap::new()),
            checkout: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolve a skill identifier to a local bundle directory, fetching it
    /// if it is not already cached.
    pub async fn load(&self, id: &str) -> Result<PathBuf, SkillError> {
        validate_skill_id(id)?;

        if let Some(dir) = self.resolved.lock().unwrap().get(id).cloned() {
            return Ok(dir);
        }

        let bundle_dir = self.cache_dir.join("bundles").join(id);
        if bundle_dir.is_dir() {
            debug!("skill '{}' already cached at {}", id, bundle_dir.display());
            self.remember(id, &bundle_dir);
            return Ok(bundle_dir);
        }

        if let Some(ref registry) = self.local_registry {
            let src = registry.join(id);
            if !src.is_dir() {
                return Err(SkillError::NotFound(id.to_string()));
            }
            copy_dir(&src, &bundle_dir)?;
            info!("fetched skill '{}' from local registry", id);
        } else if self.registry_url.is_some() {
            let checkout = self.ensure_checkout().await?;
            let src = checkout.join(id);
            if !src.is_dir() {
                return Err(SkillError::NotFound(id.to_string()));
            }
            copy_dir(&src, &bundle_dir)?;
            info!("fetched skill '{}' from remote registry", id);
        } else {
            return Err(SkillError::NotFound(id.to_string()));
        }

        self.remember(id, &bundle_dir);
        Ok(bundle_dir)
    }

    /// Resolve a bundle and, when an expected content hash is supplied,
    /// recompute and compare. A mismatch is a fatal tamper-detection error
    /// carrying truncated hash prefixes only.
    pub async fn load_verified(
        &self,
        id: &str,
        expected_hash: Option<&str>,
    ) -> Result<SkillBundle, SkillError> {
        let dir = self.load(id).await?;
        let actual = content_hash(&dir)?;

        if let Some(expected) = expected_hash {
            let expected = expected.trim().to_ascii_lowercase();
            if expected != actual {
                return Err(SkillError::ContentHashMismatch {
                    id: id.to_string(),
                    expected: truncate_hash(&expected),
                    actual: truncate_hash(&actual),
                });
            }
        }

        Ok(SkillBundle {
            id: id.to_string(),
            dir,
            content_hash: actual,
        })
    }

    fn remember(&self, id: &str, dir: &Path) {
        self.resolved
            .lock()
            .unwrap()
            .insert(id.to_string(), dir.to_path_buf());
    }

    /// Clone the remote registry once per process (shallow, depth 1) and
    /// reuse the same checkout for every subsequent skill id.
    async fn ensure_checkout(&self) -> Result<PathBuf, SkillError> {
        let mut guard = self.checkout.lock().await;
        if let Some(ref path) = *guard {
            return Ok(path.clone());
        }

        let url = self
            .registry_url
            .clone()
            .expect("ensure_checkout called without registry url");
        let dest = self.cache_dir.join("registry");

        if !dest.join(".git").exists() {
            info!("cloning skill registry {}", url);
            let clone_dest = dest.clone();
            tokio::task::spawn_blocking(move || clone_shallow(&url, &clone_dest))
                .await
                .map_err(|e| SkillError::Io(std::io::Error::other(e)))??;
        }

        *guard = Some(dest.clone());
        Ok(dest)
    }
}

fn clone_shallow(url: &str, dest: &Path) -> Result<(), SkillError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut fetch_opts = git2::FetchOptions::new();
    fetch_opts.depth(1);
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_opts);
    builder.clone(url, dest)?;
    Ok(())
}

/// Compute the bundle's content hash: SHA-256 over the sorted list of
/// relative paths, each path and its content fed in a fixed order
/// (`path NUL content NUL`). Identical file sets hash identically
/// regardless of read order; any rename or byte change changes the digest.
pub fn content_hash(dir: &Path) -> Result<String, SkillError> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        let content = fs::read(dir.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), SkillError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if path.is_dir() {
            if name == ".git" {
                continue;
            }
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .into_owned();
            out.push(rel);
        }
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), SkillError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn truncate_hash(hash: &str) -> String {
    hash.chars().take(HASH_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        // Same (path, content) pairs written in different orders.
        write_bundle(a.path(), &[("SKILL.md", "m"), ("lib/util.sh", "u"), ("z.txt", "z")]);
        write_bundle(b.path(), &[("z.txt", "z"), ("SKILL.md", "m"), ("lib/util.sh", "u")]);
        assert_eq!(
            content_hash(a.path()).unwrap(),
            content_hash(b.path()).unwrap()
        );
    }

    #[test]
    fn test_content_hash_sensitive_to_bytes_and_names() {
        let a = TempDir::new().unwrap();
        write_bundle(a.path(), &[("SKILL.md", "m"), ("data.txt", "abc")]);
        let base = content_hash(a.path()).unwrap();

        let b = TempDir::new().unwrap();
        write_bundle(b.path(), &[("SKILL.md", "m"), ("data.txt", "abd")]);
        assert_ne!(base, content_hash(b.path()).unwrap());

        let c = TempDir::new().unwrap();
        write_bundle(c.path(), &[("SKILL.md", "m"), ("renamed.txt", "abc")]);
        assert_ne!(base, content_hash(c.path()).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_any_io() {
        let cache = TempDir::new().unwrap();
        // No registry configured at all: a valid id would hit NotFound,
        // an invalid one must fail on the pattern first.
        let loader = SkillLoader::new(cache.path().to_path_buf(), None, None);
        for id in ["../escape", "a/b", "", "has space"] {
            match loader.load(id).await {
                Err(SkillError::InvalidSkillId(_)) => {}
                other => panic!("expected InvalidSkillId for {id:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_load_from_local_registry_and_cache() {
        let registry = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let skill_src = registry.path().join("greet");
        write_bundle(&skill_src, &[("SKILL.md", "---\nname: greet\n---\n")]);

        let loader = SkillLoader::new(
            cache.path().to_path_buf(),
            Some(registry.path().to_path_buf()),
            None,
        );

        let dir = loader.load("greet").await.unwrap();
        assert!(dir.join("SKILL.md").is_file());

        // Cached: removing the registry source must not matter any more.
        fs::remove_dir_all(&skill_src).unwrap();
        let again = loader.load("greet").await.unwrap();
        assert_eq!(dir, again);
    }

    #[tokio::test]
    async fn test_unknown_skill_not_found() {
        let registry = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let loader = SkillLoader::new(
            cache.path().to_path_buf(),
            Some(registry.path().to_path_buf()),
            None,
        );
        match loader.load("missing").await {
            Err(SkillError::NotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_fatal_and_truncated() {
        let registry = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let skill_src = registry.path().join("pinned");
        write_bundle(&skill_src, &[("SKILL.md", "---\nname: pinned\n---\n")]);

        let loader = SkillLoader::new(
            cache.path().to_path_buf(),
            Some(registry.path().to_path_buf()),
            None,
        );

        let wrong = "0".repeat(64);
        let err = loader
            .load_verified("pinned", Some(wrong.as_str()))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("content hash mismatch"), "got: {text}");
        // Only prefixes, never the full 64-char digest.
        assert!(!text.contains(&wrong));
    }

    #[tokio::test]
    async fn test_matching_hash_verifies() {
        let registry = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let skill_src = registry.path().join("ok");
        write_bundle(&skill_src, &[("SKILL.md", "---\nname: ok\n---\n")]);
        let expected = content_hash(&skill_src).unwrap();

        let loader = SkillLoader::new(
            cache.path().to_path_buf(),
            Some(registry.path().to_path_buf()),
            None,
        );
        let bundle = loader
            .load_verified("ok", Some(expected.as_str()))
            .await
            .unwrap();
        assert_eq!(bundle.content_hash, expected);
    }
}
