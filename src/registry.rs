//! Alias -> target tag registry and its on-disk JSON form.
//!
//! Automated merges are first-writer-wins; only explicit edits (`set`,
//! `remove`) change an existing alias. The file is shared by every open
//! document, so [`RegistryFile::sync`] reconciles with disk under an
//! exclusive lock before replacing it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::{Result, TagError};
use crate::normalize::{canonical_alias, is_linkable};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagRegistry {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
    // Explicit local edits since the last sync; these win over disk.
    dirty: HashSet<String>,
    // Merge insertions since the last sync; disk wins if it has them.
    added: HashSet<String>,
    // Aliases removed locally since the last sync; never re-adopted from disk.
    tombstones: HashSet<String>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(alias, target)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.index.contains_key(alias)
    }

    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.index.get(alias).map(|&i| self.entries[i].1.as_str())
    }

    /// Every target, once per alias naming it, in insertion order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, t)| t.as_str())
    }

    /// Distinct targets in order of first appearance.
    pub fn distinct_targets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.targets().filter(|t| seen.insert(*t)).collect()
    }

    /// First alias naming `target`.
    pub fn alias_for_target(&self, target: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, t)| t == target)
            .map(|(a, _)| a.as_str())
    }

    /// Inserts aliases that are not present yet; returns how many were added.
    pub fn merge<I>(&mut self, aliases: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        for (alias, target) in aliases {
            if self.contains(&alias) {
                continue;
            }
            self.tombstones.remove(&alias);
            self.added.insert(alias.clone());
            self.push(alias, target);
            added += 1;
        }
        if added > 0 {
            debug!(added, total = self.len(), "merged aliases into registry");
        }
        added
    }

    /// Explicit user edit: inserts or overwrites. Returns the previous target.
    pub fn set(&mut self, alias: impl Into<String>, target: impl Into<String>) -> Option<String> {
        let alias = alias.into();
        let target = target.into();
        self.tombstones.remove(&alias);
        self.added.remove(&alias);
        self.dirty.insert(alias.clone());
        match self.index.get(&alias) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, target)),
            None => {
                self.push(alias, target);
                None
            }
        }
    }

    /// Explicit user deletion. Returns the removed target.
    pub fn remove(&mut self, alias: &str) -> Option<String> {
        let i = self.index.remove(alias)?;
        let (alias, target) = self.entries.remove(i);
        self.reindex();
        self.dirty.remove(&alias);
        self.added.remove(&alias);
        self.tombstones.insert(alias);
        Some(target)
    }

    /// Target for a followed link labelled `label`.
    ///
    /// Returns the target and whether a new self-referential alias was added,
    /// or `None` when `label` cannot be written back as a link.
    pub fn ensure_link(&mut self, label: &str) -> Option<(String, bool)> {
        let label = label.trim();
        if !is_linkable(label) {
            return None;
        }
        let alias = canonical_alias(label);
        if let Some(target) = self.resolve(&alias) {
            return Some((target.to_string(), false));
        }
        // Rewritten text shows targets, so a known target needs no new alias.
        if self.targets().any(|t| t == label) {
            return Some((label.to_string(), false));
        }
        self.merge([(alias, label.to_string())]);
        Some((label.to_string(), true))
    }

    /// Registers the file stem of a document as a self-referential tag.
    pub fn register_document(&mut self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_string_lossy().trim().to_string();
        if !is_linkable(&stem) {
            return None;
        }
        self.merge([(canonical_alias(&stem), stem.clone())]);
        Some(stem)
    }

    /// Case-insensitive substring filter over aliases and targets.
    pub fn search(&self, query: &str) -> Vec<(&str, &str)> {
        let query = query.to_lowercase();
        self.iter()
            .filter(|(a, t)| a.to_lowercase().contains(&query) || t.to_lowercase().contains(&query))
            .collect()
    }

    fn push(&mut self, alias: String, target: String) {
        self.index.insert(alias.clone(), self.entries.len());
        self.entries.push((alias, target));
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (a, _))| (a.clone(), i))
            .collect();
    }

    fn mark_clean(&mut self) {
        self.dirty.clear();
        self.added.clear();
        self.tombstones.clear();
    }

    /// Folds a fresh disk snapshot into memory. Explicit local edits win.
    /// Merged aliases stay only where disk has no entry for them, and
    /// everything else follows disk. Returns how many aliases changed.
    fn reconcile(&mut self, disk: &TagRegistry) -> usize {
        let mut changed = 0;

        let gone: Vec<String> = self
            .entries
            .iter()
            .filter(|(a, _)| {
                !disk.contains(a) && !self.dirty.contains(a) && !self.added.contains(a)
            })
            .map(|(a, _)| a.clone())
            .collect();
        if !gone.is_empty() {
            self.entries.retain(|(a, _)| !gone.contains(a));
            self.reindex();
            changed += gone.len();
        }

        for (alias, target) in disk.iter() {
            if self.tombstones.contains(alias) || self.dirty.contains(alias) {
                continue;
            }
            match self.index.get(alias) {
                Some(&i) if self.entries[i].1 != target => {
                    self.entries[i].1 = target.to_string();
                    changed += 1;
                }
                Some(_) => {}
                None => {
                    self.push(alias.to_string(), target.to_string());
                    changed += 1;
                }
            }
        }
        changed
    }
}

impl Serialize for TagRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (alias, target) in &self.entries {
            map.serialize_entry(alias, target)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagRegistry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RegistryVisitor;

        impl<'de> Visitor<'de> for RegistryVisitor {
            type Value = TagRegistry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of alias strings to target strings")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<TagRegistry, A::Error> {
                let mut registry = TagRegistry::new();
                while let Some((alias, target)) = map.next_entry::<String, String>()? {
                    if !registry.contains(&alias) {
                        registry.push(alias, target);
                    }
                }
                Ok(registry)
            }
        }

        deserializer.deserialize_map(RegistryVisitor)
    }
}

pub const DEFAULT_LOCK_RETRIES: u32 = 20;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);

/// The registry's JSON file plus the lock policy used when syncing it.
#[derive(Debug, Clone)]
pub struct RegistryFile {
    path: PathBuf,
    lock_retries: u32,
    retry_delay: Duration,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RegistryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_retries: DEFAULT_LOCK_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_lock_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.lock_retries = retries.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    /// Reads the registry. A missing file is an empty registry.
    pub fn try_load(&self) -> Result<TagRegistry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TagRegistry::new()),
            Err(e) => {
                return Err(TagError::RegistryCorrupt {
                    path: self.path.clone(),
                    source: serde_json::Error::io(e),
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(TagRegistry::new());
        }
        serde_json::from_str(&content).map_err(|source| TagError::RegistryCorrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Reads the registry, starting empty on any failure.
    pub fn load(&self) -> TagRegistry {
        match self.try_load() {
            Ok(registry) => {
                debug!(path = %self.path.display(), aliases = registry.len(), "loaded registry");
                registry
            }
            Err(e) => {
                warn!("{}; starting with an empty registry", e);
                TagRegistry::new()
            }
        }
    }

    /// Replaces the file with `registry` without coordinating with other
    /// writers. Concurrent savers can overwrite each other's aliases; use
    /// [`RegistryFile::sync`] when other processes share the file.
    pub fn save(&self, registry: &TagRegistry) -> Result<()> {
        self.write_atomic(registry)?;
        info!(path = %self.path.display(), aliases = registry.len(), "saved registry");
        Ok(())
    }

    /// Locks the file, folds in what other processes wrote since our last
    /// sync, and writes the union. Returns how many aliases changed locally.
    ///
    /// On error the in-memory registry keeps every local change.
    pub fn sync(&self, registry: &mut TagRegistry) -> Result<usize> {
        let _guard = self.lock()?;

        let changed = match self.try_load() {
            Ok(disk) => registry.reconcile(&disk),
            Err(e) => {
                warn!("{}; overwriting with in-memory registry", e);
                0
            }
        };
        self.write_atomic(registry)?;
        registry.mark_clean();

        info!(
            path = %self.path.display(),
            aliases = registry.len(),
            adopted = changed,
            "synced registry"
        );
        Ok(changed)
    }

    fn lock(&self) -> Result<LockGuard> {
        let lock_path = self.lock_path();
        let persist_err = |source| TagError::Persist {
            path: lock_path.clone(),
            source,
        };

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(persist_err)?;

        let contended = fs2::lock_contended_error();
        for attempt in 1..=self.lock_retries {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if e.raw_os_error() == contended.raw_os_error() => {
                    debug!(attempt, path = %lock_path.display(), "registry lock busy");
                    if attempt < self.lock_retries {
                        thread::sleep(self.retry_delay);
                    }
                }
                Err(e) => return Err(persist_err(e)),
            }
        }
        Err(TagError::LockTimeout {
            path: lock_path,
            attempts: self.lock_retries,
        })
    }

    fn write_atomic(&self, registry: &TagRegistry) -> Result<()> {
        let persist_err = |source| TagError::Persist {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_string_pretty(registry)
            .map_err(|e| persist_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let tmp = self.sibling(&format!(".{}.tmp", std::process::id()));
        let mut file = File::create(&tmp).map_err(persist_err)?;
        file.write_all(json.as_bytes()).map_err(persist_err)?;
        file.write_all(b"\n").map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            persist_err(e)
        })
    }
}
