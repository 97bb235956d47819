//! Semantic tag linking for plain-text notes.
//!
//! Named entities found in freshly typed text become registry tags, and every
//! occurrence of a known tag, in any inflected form, is rewritten into a
//! `[[target]]` link span. Related tags can be grouped into superset clusters.

pub mod cluster;
pub mod config;
pub mod embed;
pub mod error;
pub mod lemma;
pub mod markup;
pub mod normalize;
pub mod oracle;
pub mod registry;
pub mod rewrite;
pub mod session;
pub mod trigger;
pub mod worker;

pub use cluster::{TagCluster, TagClusterer};
pub use config::Config;
pub use embed::{Embedder, HashingEmbedder};
pub use error::{Result, TagError};
pub use lemma::{LemmaToken, Lemmatizer, StemLemmatizer};
pub use markup::{find_links, link_at, LinkSpan};
pub use normalize::{canonical_alias, normalize, tag_aliases};
pub use oracle::{CommandExtractor, EntityExtractor, EntityLabel, RuleExtractor, TaggedToken};
pub use registry::{RegistryFile, TagRegistry};
pub use rewrite::{Rewrite, SpanRewriter};
pub use session::{EditorSession, FollowedLink, SessionEvent};
pub use trigger::{Trigger, TriggerPolicy};
pub use worker::{ExtractionWorker, JobHandle};
