//! `.taglink.toml` configuration.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{DEFAULT_EPS, DEFAULT_MIN_CLUSTER_SIZE};
use crate::error::{Result, TagError};
use crate::oracle::{CommandExtractor, EntityExtractor, RuleExtractor};
use crate::registry::{RegistryFile, DEFAULT_LOCK_RETRIES, DEFAULT_RETRY_DELAY};
use crate::trigger::{TriggerPolicy, DEFAULT_SENTENCE_THRESHOLD, DEFAULT_WINDOW_LINES};

pub const DEFAULT_CONFIG_FILE: &str = ".taglink.toml";
pub const DEFAULT_REGISTRY_FILE: &str = "ner_tags.json";
pub const DEFAULT_DIMENSIONS: usize = 256;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub registry: PathBuf,
    /// Where followed links create their documents.
    pub documents_dir: PathBuf,
    pub trigger: TriggerConfig,
    pub extractor: ExtractorConfig,
    pub cluster: ClusterConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    pub sentence_threshold: usize,
    pub window_lines: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ExtractorConfig {
    /// External model command; the rule extractor is used when empty.
    pub command: Vec<String>,
    pub min_confidence: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub eps: f32,
    pub min_cluster_size: usize,
    pub dimensions: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub lock_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: PathBuf::from(DEFAULT_REGISTRY_FILE),
            documents_dir: PathBuf::from("."),
            trigger: TriggerConfig::default(),
            extractor: ExtractorConfig::default(),
            cluster: ClusterConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            sentence_threshold: DEFAULT_SENTENCE_THRESHOLD,
            window_lines: DEFAULT_WINDOW_LINES,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            lock_retries: DEFAULT_LOCK_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents).map_err(|source| TagError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn registry_file(&self) -> RegistryFile {
        RegistryFile::new(&self.registry).with_lock_policy(
            self.persistence.lock_retries,
            Duration::from_millis(self.persistence.retry_delay_ms),
        )
    }

    pub fn trigger_policy(&self) -> TriggerPolicy {
        TriggerPolicy::new(self.trigger.sentence_threshold, self.trigger.window_lines)
    }

    pub fn extractor(&self) -> Arc<dyn EntityExtractor> {
        match CommandExtractor::from_command_line(&self.extractor.command) {
            Some(command) => Arc::new(command),
            None => Arc::new(RuleExtractor::new()),
        }
    }

    /// Path of the document a link target opens.
    pub fn document_path(&self, target: &str) -> PathBuf {
        self.documents_dir.join(format!("{}.txt", target))
    }
}
