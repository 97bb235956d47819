//! One open document wired to the trigger, worker, registry and rewriter.
//!
//! Everything here runs on the thread that owns the session. Extraction is
//! the only work done elsewhere, and its results are applied by
//! [`EditorSession::pump`], which [`EditorSession::on_edit`] calls before
//! looking at the new text.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::lemma::{Lemmatizer, StemLemmatizer};
use crate::markup::{link_at, LinkSpan};
use crate::normalize::tag_aliases;
use crate::oracle::EntityExtractor;
use crate::registry::{RegistryFile, TagRegistry};
use crate::rewrite::SpanRewriter;
use crate::trigger::TriggerPolicy;
use crate::worker::{ExtractionOutcome, ExtractionWorker, JobHandle};

/// Something the editor shell should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// New aliases entered the registry.
    TagsMerged { added: usize, tags: Vec<String> },
    /// The document text was replaced; spans are in the new text.
    Rewritten { inserted: Vec<LinkSpan> },
    /// The oracle failed; the same text is retried on a later edit.
    ExtractionFailed { reason: String },
    /// The registry could not be written; memory still holds every change.
    PersistFailed { reason: String },
}

/// Result of following the link under a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowedLink {
    pub span: LinkSpan,
    pub target: String,
    /// Whether following it registered a new alias.
    pub alias_added: bool,
}

// The running job and where its trigger's watermark sits in the current text.
#[derive(Debug, Clone, Copy)]
struct PendingJob {
    handle: JobHandle,
    watermark: usize,
}

pub struct EditorSession {
    path: Option<PathBuf>,
    document: String,
    policy: TriggerPolicy,
    registry: TagRegistry,
    store: Option<RegistryFile>,
    worker: ExtractionWorker,
    rewriter: SpanRewriter,
    in_flight: Option<PendingJob>,
}

impl EditorSession {
    /// An empty, unsaved document backed by an in-memory registry.
    pub fn new(
        extractor: Arc<dyn EntityExtractor>,
        lemmatizer: Arc<dyn Lemmatizer>,
        policy: TriggerPolicy,
        min_confidence: f32,
    ) -> Result<Self> {
        Ok(Self {
            path: None,
            document: String::new(),
            policy,
            registry: TagRegistry::new(),
            store: None,
            worker: ExtractionWorker::spawn(extractor, min_confidence)?,
            rewriter: SpanRewriter::new(lemmatizer),
            in_flight: None,
        })
    }

    /// A session using the configured extractor and the registry file.
    pub fn from_config(config: &Config) -> Result<Self> {
        let session = Self::new(
            config.extractor(),
            Arc::new(StemLemmatizer::english()),
            config.trigger_policy(),
            config.extractor.min_confidence,
        )?;
        Ok(session.with_store(config.registry_file()))
    }

    pub fn with_registry(mut self, registry: TagRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Loads the registry from `store` and syncs to it after every change.
    pub fn with_store(mut self, store: RegistryFile) -> Self {
        self.registry = store.load();
        self.store = Some(store);
        self
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// Whether an extraction is still running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Opens `path` (missing files start empty) and registers its name as a tag.
    /// Existing content never triggers extraction.
    pub fn open(&mut self, path: &Path) -> Result<Vec<SessionEvent>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if let Some(pending) = self.in_flight.take() {
            debug!(job = pending.handle.id(), "discarding extraction for the previous document");
        }
        self.policy = self.policy.clone().resume(&text);
        self.document = text;
        self.path = Some(path.to_path_buf());
        info!(path = %path.display(), bytes = self.document.len(), "opened document");
        Ok(self.register_document(path))
    }

    /// Writes the document to `path`, or to where it was opened from.
    pub fn save(&mut self, path: Option<&Path>) -> Result<Vec<SessionEvent>> {
        let path = match path.or(self.path.as_deref()) {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "document has no path; pass one to save",
                )
                .into())
            }
        };
        fs::write(&path, &self.document)?;
        info!(path = %path.display(), bytes = self.document.len(), "saved document");
        let events = self.register_document(&path);
        self.path = Some(path);
        Ok(events)
    }

    /// Replaces the document with `text` after the user edited it.
    pub fn on_edit(&mut self, text: impl Into<String>) -> Vec<SessionEvent> {
        self.document = text.into();
        let mut events = self.pump();

        if self.in_flight.is_none() {
            if let Some(trigger) = self.policy.should_trigger(&self.document) {
                let watermark = trigger.watermark;
                match self.worker.submit(trigger) {
                    Ok(handle) => {
                        debug!(job = handle.id(), "extraction submitted");
                        self.in_flight = Some(PendingJob { handle, watermark });
                    }
                    Err(e) => {
                        warn!("could not schedule extraction: {}", e);
                        events.push(SessionEvent::ExtractionFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        events
    }

    /// Applies every finished extraction without blocking.
    pub fn pump(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(outcome) = self.worker.try_recv() {
            self.apply(outcome, &mut events);
        }
        events
    }

    /// Blocks until the running extraction is applied or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> Vec<SessionEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.pump();
        while self.in_flight.is_some() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.worker.recv_timeout(remaining) {
                Some(outcome) => self.apply(outcome, &mut events),
                None => break,
            }
        }
        events
    }

    /// Resolves the link under `offset`, registering its label if unknown.
    /// Spans whose label is not a valid link give `None`.
    pub fn follow_link(&mut self, offset: usize) -> Option<(FollowedLink, Vec<SessionEvent>)> {
        let span = link_at(&self.document, offset)?;
        let (target, alias_added) = self.registry.ensure_link(&span.target)?;
        let mut events = Vec::new();
        if alias_added {
            self.persist(&mut events);
        }
        debug!(target = %target, alias_added, "followed link");
        Some((
            FollowedLink {
                span,
                target,
                alias_added,
            },
            events,
        ))
    }

    /// Explicit user edit: points `alias` at `target`, overwriting.
    pub fn set_tag(&mut self, alias: &str, target: &str) -> Vec<SessionEvent> {
        self.registry.set(alias, target);
        let mut events = Vec::new();
        self.persist(&mut events);
        self.relink(&mut events);
        events
    }

    /// Explicit user deletion of `alias`.
    pub fn remove_tag(&mut self, alias: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.registry.remove(alias).is_some() {
            self.persist(&mut events);
        }
        events
    }

    /// Rewrites the document against the current registry.
    pub fn relink_now(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.relink(&mut events);
        events
    }

    fn register_document(&mut self, path: &Path) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let before = self.registry.len();
        if let Some(tag) = self.registry.register_document(path) {
            if self.registry.len() > before {
                events.push(SessionEvent::TagsMerged {
                    added: 1,
                    tags: vec![tag],
                });
                self.persist(&mut events);
            }
        }
        events
    }

    fn apply(&mut self, outcome: ExtractionOutcome, events: &mut Vec<SessionEvent>) {
        let pending = match self.in_flight {
            Some(pending) if pending.handle.id() == outcome.id => pending,
            _ => {
                debug!(job = outcome.id, "dropping stale extraction");
                return;
            }
        };
        self.in_flight = None;

        let tags = match outcome.result {
            Ok(tags) => tags,
            Err(e) => {
                warn!(job = outcome.id, "extraction failed, will retry: {}", e);
                events.push(SessionEvent::ExtractionFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let mut trigger = outcome.trigger;
        trigger.watermark = pending.watermark;
        self.policy.commit(&trigger);
        let added = self.registry.merge(tag_aliases(&tags));
        info!(job = outcome.id, found = tags.len(), added, "merged extracted tags");
        if added > 0 {
            events.push(SessionEvent::TagsMerged {
                added,
                tags: tags.into_iter().collect(),
            });
            self.persist(events);
        }
        self.relink(events);
    }

    fn relink(&mut self, events: &mut Vec<SessionEvent>) {
        let rewrite = self.rewriter.rewrite_with_report(&self.document, &self.registry);
        if !rewrite.changed() {
            return;
        }
        self.policy.rebase(|offset| rewrite.map_offset(offset));
        if let Some(pending) = &mut self.in_flight {
            pending.watermark = rewrite.map_offset(pending.watermark);
        }
        debug!(links = rewrite.inserted.len(), "document relinked");
        self.document = rewrite.text;
        events.push(SessionEvent::Rewritten {
            inserted: rewrite.inserted,
        });
    }

    fn persist(&mut self, events: &mut Vec<SessionEvent>) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.sync(&mut self.registry) {
            warn!("{}; keeping tags in memory", e);
            events.push(SessionEvent::PersistFailed {
                reason: e.to_string(),
            });
        }
    }
}
