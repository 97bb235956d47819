use clap::{Parser, Subcommand};
use colored::Colorize;
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use taglink::config::DEFAULT_CONFIG_FILE;
use taglink::markup::link_at;
use taglink::normalize::{canonical_alias, is_linkable, normalize, tag_aliases};
use taglink::{
    Config, EditorSession, HashingEmbedder, LinkSpan, SessionEvent, SpanRewriter,
    StemLemmatizer, TagCluster, TagClusterer, TagRegistry,
};

/// taglink - Semantic tag linking for plain-text notes
#[derive(Parser)]
#[command(name = "taglink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Registry file (overrides the config)
    #[arg(short, long, global = true)]
    registry: Option<PathBuf>,

    /// Quiet mode - only warnings and errors on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract entity tags from a file (or stdin) and merge them into the registry
    Extract {
        /// Text file to read; stdin when omitted
        file: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite known tags in a document into [[links]]
    Link {
        /// Document to rewrite
        file: PathBuf,

        /// Write the result back instead of printing it
        #[arg(short, long)]
        write: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registry entries
    Tags {
        /// Case-insensitive filter over aliases and targets
        search: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add or overwrite a tag
    Add {
        /// Tag text or [[alias]]
        tag: String,

        /// Target document name (defaults to the tag itself)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Remove a tag alias
    Remove {
        /// Tag text or [[alias]]
        alias: String,
    },

    /// Follow the link at a byte offset, creating its document if needed
    Follow {
        /// Document containing the link
        file: PathBuf,

        /// Byte offset inside the link
        offset: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Register every document name under a directory as a tag
    Seed {
        /// Directory to walk
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// File extensions to include (comma-separated)
        #[arg(short, long, default_value = "md,txt")]
        types: String,
    },

    /// Group related tags into supersets
    Cluster {
        /// Maximum cosine distance between neighbours
        #[arg(long)]
        eps: Option<f32>,

        /// Minimum tags per cluster
        #[arg(long)]
        min_size: Option<usize>,

        /// Add each cluster label to the registry (never overwrites)
        #[arg(long)]
        apply: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive writing session with background tagging
    Compose {
        /// Document to open; a new unsaved document when omitted
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ExtractReport {
    tags: Vec<String>,
    added: usize,
}

#[derive(Serialize)]
struct LinkReport<'a> {
    text: &'a str,
    inserted: &'a [LinkSpan],
}

#[derive(Serialize)]
struct TagEntry<'a> {
    alias: &'a str,
    target: &'a str,
}

#[derive(Serialize)]
struct FollowReport {
    target: String,
    path: PathBuf,
    alias_added: bool,
    created: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = load_config(&cli.config, cli.registry.as_deref()).and_then(|config| {
        match cli.command {
            Commands::Extract { file, json } => cmd_extract(&config, file.as_deref(), json),
            Commands::Link { file, write, json } => cmd_link(&config, &file, write, json),
            Commands::Tags { search, json } => cmd_tags(&config, search.as_deref(), json),
            Commands::Add { tag, target } => cmd_add(&config, &tag, target.as_deref()),
            Commands::Remove { alias } => cmd_remove(&config, &alias),
            Commands::Follow { file, offset, json } => cmd_follow(&config, &file, offset, json),
            Commands::Seed { dir, types } => cmd_seed(&config, &dir, &types, cli.quiet),
            Commands::Cluster { eps, min_size, apply, json } => {
                cmd_cluster(&config, eps, min_size, apply, json)
            }
            Commands::Compose { file } => cmd_compose(&config, file.as_deref()),
        }
    });

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("taglink={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: &Path, registry: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::load(path)?;
    if let Some(registry) = registry {
        config.registry = registry.to_path_buf();
    }
    debug!(registry = %config.registry.display(), "configuration loaded");
    Ok(config)
}

/// `Einstein` and `[[Einstein]]` both name the alias `[[Einstein]]`.
fn alias_of(tag: &str) -> String {
    let tag = tag.trim();
    let inner = tag
        .strip_prefix("[[")
        .and_then(|t| t.strip_suffix("]]"))
        .unwrap_or(tag);
    canonical_alias(inner)
}

fn cmd_extract(
    config: &Config,
    file: Option<&Path>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = match file {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let extractor = config.extractor();
    let tokens = extractor.predict(&text)?;
    let tags = normalize(&tokens, config.extractor.min_confidence);

    let store = config.registry_file();
    let mut registry = store.load();
    let known: HashSet<String> = tags
        .iter()
        .filter(|t| registry.contains(&canonical_alias(t)))
        .cloned()
        .collect();
    let added = registry.merge(tag_aliases(&tags));
    if added > 0 {
        store.sync(&mut registry)?;
    }
    info!(oracle = extractor.name(), found = tags.len(), added, "extraction finished");

    if json {
        let report = ExtractReport {
            tags: tags.into_iter().collect(),
            added,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if tags.is_empty() {
        println!("{}", "No tags found.".yellow());
        return Ok(());
    }
    for tag in &tags {
        if known.contains(tag) {
            println!("  {}", tag.dimmed());
        } else {
            println!("  {} {}", "+".green().bold(), tag.cyan());
        }
    }
    println!();
    println!("{} new, {} already known", added.to_string().green(), known.len());
    Ok(())
}

fn cmd_link(
    config: &Config,
    file: &Path,
    write: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let document = fs::read_to_string(file)?;
    let registry = config.registry_file().load();
    let rewriter = SpanRewriter::new(Arc::new(StemLemmatizer::english()));
    let rewrite = rewriter.rewrite_with_report(&document, &registry);

    if write && rewrite.changed() {
        fs::write(file, &rewrite.text)?;
        info!(path = %file.display(), links = rewrite.inserted.len(), "document relinked");
    }

    if json {
        let report = LinkReport {
            text: &rewrite.text,
            inserted: &rewrite.inserted,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if write {
        println!(
            "{} {} link(s) in {}",
            "Inserted".green().bold(),
            rewrite.inserted.len(),
            file.display()
        );
    } else {
        print!("{}", rewrite.text);
        if !rewrite.text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn cmd_tags(
    config: &Config,
    search: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = config.registry_file().load();
    let entries: Vec<(&str, &str)> = match search {
        Some(query) => registry.search(query),
        None => registry.iter().collect(),
    };

    if json {
        let entries: Vec<TagEntry> = entries
            .iter()
            .map(|&(alias, target)| TagEntry { alias, target })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "No tags.".yellow());
        return Ok(());
    }
    let width = entries.iter().map(|(a, _)| a.chars().count()).max().unwrap_or(0);
    for (alias, target) in &entries {
        println!("  {:width$}  {} {}", alias.cyan(), "->".dimmed(), target, width = width);
    }
    println!();
    println!("{} of {} tags", entries.len(), registry.len());
    Ok(())
}

fn cmd_add(config: &Config, tag: &str, target: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let alias = alias_of(tag);
    let target = target
        .map(str::trim)
        .unwrap_or_else(|| &alias[2..alias.len() - 2])
        .to_string();
    if !is_linkable(&alias[2..alias.len() - 2]) || !is_linkable(&target) {
        return Err(format!("'{}' cannot be written as a [[link]]", tag).into());
    }

    let store = config.registry_file();
    let mut registry = store.load();
    let previous = registry.set(alias.clone(), target.clone());
    store.sync(&mut registry)?;

    match previous {
        Some(old) if old != target => {
            println!("{} {} -> {} (was {})", "Updated".green().bold(), alias.cyan(), target, old.dimmed())
        }
        _ => println!("{} {} -> {}", "Added".green().bold(), alias.cyan(), target),
    }
    Ok(())
}

fn cmd_remove(config: &Config, alias: &str) -> Result<(), Box<dyn std::error::Error>> {
    let alias = alias_of(alias);
    let store = config.registry_file();
    let mut registry = store.load();

    match registry.remove(&alias) {
        Some(target) => {
            store.sync(&mut registry)?;
            println!("{} {} (-> {})", "Removed".green().bold(), alias.cyan(), target);
        }
        None => println!("{} {}", "No such tag:".yellow(), alias),
    }
    Ok(())
}

fn cmd_follow(
    config: &Config,
    file: &Path,
    offset: usize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let document = fs::read_to_string(file)?;
    let span = link_at(&document, offset)
        .ok_or_else(|| format!("no link at offset {} in {}", offset, file.display()))?;

    let store = config.registry_file();
    let mut registry = store.load();
    let (target, alias_added) = registry
        .ensure_link(&span.target)
        .ok_or_else(|| format!("'{}' cannot be followed as a [[link]]", span.target))?;
    if alias_added {
        store.sync(&mut registry)?;
    }

    let path = config.document_path(&target);
    let created = !path.exists();
    if created {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, "")?;
        info!(path = %path.display(), "created linked document");
    }

    if json {
        let report = FollowReport {
            target,
            path,
            alias_added,
            created,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if alias_added {
            println!("{} {}", "Registered".green().bold(), canonical_alias(&target).cyan());
        }
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_seed(
    config: &Config,
    dir: &Path,
    types: &str,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let extensions: HashSet<String> = types
        .split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    if !quiet {
        println!("{} {}", "Seeding tags from".cyan().bold(), dir.display());
    }

    let store = config.registry_file();
    let mut registry = store.load();
    let before = registry.len();
    let mut scanned = 0;

    let mut builder = WalkBuilder::new(dir);
    builder.hidden(true).git_ignore(true).git_global(true);

    for entry in builder.build().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !extensions.contains(&ext) {
            continue;
        }

        scanned += 1;
        if let Some(tag) = registry.register_document(path) {
            debug!(path = %path.display(), tag = %tag, "registered document");
        }
    }

    let added = registry.len() - before;
    if added > 0 {
        store.sync(&mut registry)?;
    }

    if !quiet {
        println!(
            "  {} documents scanned, {} new tags",
            scanned.to_string().cyan(),
            added.to_string().green()
        );
    }
    Ok(())
}

fn cmd_cluster(
    config: &Config,
    eps: Option<f32>,
    min_size: Option<usize>,
    apply: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = config.registry_file();
    let mut registry = store.load();
    let tags: Vec<String> = registry.distinct_targets().into_iter().map(str::to_string).collect();

    let clusterer = TagClusterer::new(
        Arc::new(HashingEmbedder::new(config.cluster.dimensions)),
        Arc::new(StemLemmatizer::english()),
    )
    .with_eps(eps.unwrap_or(config.cluster.eps))
    .with_min_cluster_size(min_size.unwrap_or(config.cluster.min_cluster_size));
    let clusters = clusterer.cluster(&tags)?;

    let added = if apply {
        apply_clusters(&mut registry, &clusters)
    } else {
        0
    };
    if added > 0 {
        store.sync(&mut registry)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("{}", "No clusters found.".yellow());
        return Ok(());
    }
    for cluster in &clusters {
        println!("{} {}", "Superset:".green().bold(), cluster.label.cyan());
        for member in &cluster.members {
            println!("  {} {}", "->".dimmed(), member);
        }
    }
    if apply {
        println!();
        println!("{} new superset tags", added.to_string().green());
    }
    Ok(())
}

fn apply_clusters(registry: &mut TagRegistry, clusters: &[TagCluster]) -> usize {
    registry.merge(
        clusters
            .iter()
            .filter(|c| is_linkable(&c.label))
            .map(TagCluster::as_alias),
    )
}

fn cmd_compose(config: &Config, file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = EditorSession::from_config(config)?;
    if let Some(path) = file {
        let events = session.open(path)?;
        println!("{} {}", "Opened".cyan().bold(), path.display());
        print_events(&session, &events);
    }

    println!("{}", "taglink compose".green().bold());
    println!("Type text; lines are appended to the document. Commands: :show, :tags, :save [path], :quit\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", ">".cyan().bold());
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim_end_matches(['\n', '\r']);

        match input.trim() {
            ":quit" | ":q" => break,
            ":show" => {
                let events = session.pump();
                print_events(&session, &events);
                println!("{}", session.document());
            }
            ":tags" => {
                for (alias, target) in session.registry().iter() {
                    println!("  {} {} {}", alias.cyan(), "->".dimmed(), target);
                }
            }
            cmd if cmd.starts_with(":save") => {
                let arg = cmd[":save".len()..].trim();
                let target = (!arg.is_empty()).then(|| PathBuf::from(arg));
                match session.save(target.as_deref()) {
                    Ok(events) => {
                        print_events(&session, &events);
                        if let Some(path) = session.path() {
                            println!("{} {}", "Saved".green().bold(), path.display());
                        }
                    }
                    Err(e) => println!("{} {}", "Cannot save:".yellow(), e),
                }
            }
            _ => {
                let text = format!("{}{}\n", session.document(), input);
                let events = session.on_edit(text);
                print_events(&session, &events);
            }
        }
    }

    let events = session.wait_idle(Duration::from_secs(10));
    print_events(&session, &events);
    Ok(())
}

fn print_events(session: &EditorSession, events: &[SessionEvent]) {
    for event in events {
        match event {
            SessionEvent::TagsMerged { added, tags } => {
                println!("{} {} ({} new)", "tags:".green().bold(), tags.join(", "), added)
            }
            SessionEvent::Rewritten { inserted } => {
                println!("{} {} link(s)", "linked:".green().bold(), inserted.len());
                println!("{}", session.document().dimmed());
            }
            SessionEvent::ExtractionFailed { reason } => {
                println!("{} {}", "extraction failed:".yellow(), reason)
            }
            SessionEvent::PersistFailed { reason } => {
                println!("{} {}", "registry not saved:".red(), reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_of_accepts_both_forms() {
        assert_eq!(alias_of("Einstein"), "[[Einstein]]");
        assert_eq!(alias_of(" [[Einstein]] "), "[[Einstein]]");
        assert_eq!(alias_of("[[ black hole ]]"), "[[black hole]]");
    }

    #[test]
    fn test_apply_clusters_never_overwrites() {
        let mut registry = TagRegistry::new();
        registry.set("[[quantum]]", "Quantum Notes");
        let clusters = vec![
            TagCluster {
                label: "quantum".into(),
                members: ["quantum theory".to_string()].into_iter().collect(),
            },
            TagCluster {
                label: "black hole".into(),
                members: ["black holes".to_string()].into_iter().collect(),
            },
        ];

        assert_eq!(apply_clusters(&mut registry, &clusters), 1);
        assert_eq!(registry.resolve("[[quantum]]"), Some("Quantum Notes"));
        assert_eq!(registry.resolve("[[black hole]]"), Some("black hole"));
    }
}
