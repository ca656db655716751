//! Replay a scripted set of responses through the engine.
//!
//! The script is a JSON document:
//!
//! ```json
//! {
//!   "behavior": "request_with_wait",
//!   "refreshes": [ { "clear_all": true, "appends": [ ... ] } ],
//!   "pages": { "page-2": { "appends": [ ... ] } }
//! }
//! ```
//!
//! Usage:
//!   feedsync-replay script.json
//!   feedsync-replay script.json --follow --stats
//!   feedsync-replay script.json --config engine.toml
//!   feedsync-replay script.json --persist

use anyhow::{bail, Context, Result};
use clap::Parser;
use feedsync::session::FixedScheduler;
use feedsync::{
    logging, ContinuationToken, EngineConfig, FeatureChange, FeatureChangeObserver, ModelError,
    ModelProvider, ModelProviderFactory, ModelProviderObserver, RequestBehavior, Response,
    ScriptedRequestManager, UiContext,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Replay scripted feed responses and print the resulting session tree
#[derive(Parser, Debug)]
#[command(name = "feedsync-replay")]
#[command(about = "Replay scripted feed responses through the session engine")]
struct Args {
    /// JSON script of refresh and page responses
    script: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Keep paging until no continuation token is left
    #[arg(long, short = 'f')]
    follow: bool,

    /// Upper bound on pages fetched with --follow
    #[arg(long, default_value_t = 32)]
    max_pages: usize,

    /// Keep content and session records in the file store (the configured
    /// `store_path`, or the user cache directory)
    #[arg(long)]
    persist: bool,

    /// Print manager statistics as JSON
    #[arg(long)]
    stats: bool,

    /// How long to wait for each page, in milliseconds
    #[arg(long, default_value_t = 5000)]
    page_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    behavior: Option<RequestBehavior>,
    refreshes: Vec<Response>,
    /// Page responses keyed by the UTF-8 continuation token
    pages: BTreeMap<String, Response>,
}

enum Event {
    Changed,
    Failed(ModelError),
}

/// Forwards observer callbacks to the replay loop
struct Forwarder(mpsc::UnboundedSender<Event>);

impl FeatureChangeObserver for Forwarder {
    fn on_change(&self, _change: &FeatureChange) {
        let _ = self.0.send(Event::Changed);
    }
}

impl ModelProviderObserver for Forwarder {
    fn on_session_start(&self, _ui_context: &UiContext) {}

    fn on_session_finished(&self, _ui_context: &UiContext) {}

    fn on_error(&self, error: &ModelError) {
        let _ = self.0.send(Event::Failed(error.clone()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    logging::init(&config.log_filter);
    if args.persist {
        config.store_path = Some(config.resolved_store_path()?);
    }

    let raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;
    let script: Script = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse script {}", args.script.display()))?;

    let requests = Arc::new(ScriptedRequestManager::new());
    for response in script.refreshes {
        requests.push_refresh(response);
    }
    for (token, response) in script.pages {
        requests.set_page(ContinuationToken::new(token.into_bytes()), response);
    }
    let behavior = script
        .behavior
        .unwrap_or(RequestBehavior::RequestWithWait);

    let factory = ModelProviderFactory::builder(requests.clone())
        .scheduler(Arc::new(FixedScheduler::new(behavior)))
        .config(config)
        .spawn()
        .context("Failed to start the session manager")?;

    let provider = factory
        .create_new(None, UiContext::new(&b"feedsync-replay"[..]))
        .await
        .context("Failed to create a session")?;

    if args.follow {
        follow_tokens(&provider, args.max_pages, Duration::from_millis(args.page_timeout_ms))
            .await?;
    }

    println!("session {} ({})", provider.get_session_id(), provider.current_state());
    print_tree(&provider);

    if args.stats {
        let stats = factory.stats().await.context("Failed to read manager stats")?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    factory.shutdown().await.context("Session manager stopped with an error")?;
    Ok(())
}

async fn follow_tokens(provider: &ModelProvider, max_pages: usize, wait: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(Forwarder(tx));
    provider.register_observer(forwarder.clone());
    if let Some(root) = provider.get_root_feature() {
        root.register_observer(forwarder);
    }

    for _ in 0..max_pages {
        let Some(token) = next_token(provider) else {
            return Ok(());
        };
        provider
            .handle_token(&token)
            .with_context(|| format!("Failed to request page {}", token))?;

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(Event::Changed)) => {}
            Ok(Some(Event::Failed(error))) => bail!("Paging stopped: {}", error),
            Ok(None) => bail!("Observer channel closed"),
            Err(_) => bail!("Timed out waiting for page {}", token),
        }
    }
    Ok(())
}

fn next_token(provider: &ModelProvider) -> Option<ContinuationToken> {
    provider
        .get_all_root_children()
        .into_iter()
        .find_map(|child| child.continuation_token)
}

fn print_tree(provider: &ModelProvider) {
    let Some(root) = provider.get_root_feature() else {
        println!("  (no content)");
        return;
    };
    println!("{}", root.content_id());
    print_children(provider, &root, 1);
}

fn print_children(provider: &ModelProvider, feature: &feedsync::ModelFeature, depth: usize) {
    let indent = "  ".repeat(depth);
    for child in feature.cursor() {
        match &child.continuation_token {
            Some(token) => println!("{}[token {}]", indent, token),
            None => {
                println!("{}{}", indent, child.content_id);
                if let Some(nested) = provider.get_feature(&child.content_id) {
                    print_children(provider, &nested, depth + 1);
                }
            }
        }
    }
}
