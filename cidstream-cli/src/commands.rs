//! CLI command implementations

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cidstream_core::invalidation::FileStore;
use cidstream_core::scheduler::ChunkStream;
use cidstream_core::{
    Cid, CidStreamConfig, CidStreamError, Clock, Command, CommandError, CommandOutcome,
    DeliveryServices, InvalidationCache, LoadTarget, NetworkStack, NoopObserver, PlaybackSession,
    Player, PreloadManager, ProviderCatalog, ProviderRegistry, Result, Rotation, SystemClock,
    spawn_command_queue,
};
use clap::Subcommand;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::player::HeadlessPlayer;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List configured providers with their current ranking
    Providers {
        /// Provider catalogue JSON (defaults to the built-in gateways)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Find the provider that can serve a CID right now
    Validate {
        cid: String,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Fetch the first chunks of a CID to a file
    Fetch {
        cid: String,
        /// Number of chunks to fetch
        #[arg(short, long, default_value = "4")]
        chunks: u64,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Run a headless playback session over a manifest of CIDs
    Play {
        /// JSON array of CIDs
        #[arg(short, long)]
        manifest: PathBuf,
        /// Number of next-loads to perform
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,
        /// Seconds to stream each CID before moving on
        #[arg(long, default_value = "5")]
        dwell: u64,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: CidStreamConfig) -> Result<()> {
    match command {
        Commands::Providers { catalog } => list_providers(catalog.as_deref(), &config).await,
        Commands::Validate { cid, catalog } => {
            validate_cid(&cid, catalog.as_deref(), &config).await
        }
        Commands::Fetch {
            cid,
            chunks,
            out,
            catalog,
        } => fetch_chunks(&cid, chunks, &out, catalog.as_deref(), &config).await,
        Commands::Play {
            manifest,
            count,
            dwell,
            catalog,
        } => {
            play_manifest(
                &manifest,
                count,
                Duration::from_secs(dwell),
                catalog.as_deref(),
                &config,
            )
            .await
        }
    }
}

/// List providers in ranking order
///
/// # Errors
/// - `CidStreamError::Provider` - Catalogue could not be loaded
/// - `CidStreamError::Store` - Persisted provider errors could not be read
pub async fn list_providers(catalog: Option<&Path>, config: &CidStreamConfig) -> Result<()> {
    let services = build_services(catalog, config).await?;

    println!("Providers (best first)");
    println!("{:-<72}", "");
    for ranked in services.registry.ranked(false) {
        let stats = &ranked.stats;
        println!(
            "{:<12} {:<20} {:?} errors={} successes={}{}",
            ranked.provider.key,
            ranked.provider.display_name,
            ranked.provider.cors_mode,
            stats.error_count,
            stats.success_count,
            if stats.is_disqualified() {
                " (disqualified)"
            } else {
                ""
            }
        );
        println!("    {}", ranked.provider.url_template);
    }

    Ok(())
}

/// Validate one CID and print the fallback chain
///
/// # Errors
/// - `CidStreamError::Validation` - CID malformed or no provider can serve it
pub async fn validate_cid(raw: &str, catalog: Option<&Path>, config: &CidStreamConfig) -> Result<()> {
    let services = build_services(catalog, config).await?;
    let cancel = CancellationToken::new();

    let result = services.validator.validate(raw, &cancel).await;
    persist_errors(&services).await;
    let validation = result?;

    println!("CID:      {}", validation.cid);
    println!("Provider: {}", validation.provider);
    println!("URL:      {}", validation.url);
    println!(
        "Chain:    {}",
        validation
            .reachable
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    Ok(())
}

/// Fetch the first `chunks` chunks of a CID and write them in order
///
/// # Errors
/// - `CidStreamError::Validation` - No provider can serve the CID
/// - `CidStreamError::Fetch` - A chunk failed after every recovery
/// - `CidStreamError::Io` - Output could not be written
pub async fn fetch_chunks(
    raw: &str,
    chunks: u64,
    out: &Path,
    catalog: Option<&Path>,
    config: &CidStreamConfig,
) -> Result<()> {
    let services = build_services(catalog, config).await?;
    let cancel = CancellationToken::new();
    let cid = Cid::parse(raw)?;

    let validation = services.validator.validate_cid(&cid, &cancel).await?;
    println!("Streaming {} from {}", cid, validation.provider);

    let mut stream = ChunkStream::start(
        Arc::clone(&services.scheduler),
        cid.clone(),
        validation.reachable,
        &cancel,
    );

    let mut received = BTreeMap::new();
    while (received.len() as u64) < chunks {
        let Some(chunk) = stream.next_chunk().await? else {
            break;
        };
        println!(
            "  chunk {:>4} {:>8} bytes via {}",
            chunk.index,
            chunk.len(),
            chunk.provider_used
        );
        received.insert(chunk.index, chunk);
    }
    stream.stop();
    persist_errors(&services).await;

    // Only the contiguous prefix is meaningful on disk
    let mut data = Vec::new();
    for (expected, (index, chunk)) in received.iter().enumerate() {
        if *index != expected as u64 {
            break;
        }
        data.extend_from_slice(&chunk.data);
    }
    fs::write(out, &data).await?;

    println!("Wrote {} bytes to {}", data.len(), out.display());
    Ok(())
}

/// Run a headless session: load the next CID `count` times, playing each
///
/// # Errors
/// - `CidStreamError::Configuration` - Manifest missing or not a JSON array
/// - `CidStreamError::Command` - A load failed for good
pub async fn play_manifest(
    manifest: &Path,
    count: usize,
    dwell: Duration,
    catalog: Option<&Path>,
    config: &CidStreamConfig,
) -> Result<()> {
    let raw = fs::read_to_string(manifest).await?;
    let cids: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| CidStreamError::Configuration {
            reason: format!("manifest {}: {e}", manifest.display()),
        })?;

    let services = build_services(catalog, config).await?;
    let rotation = Rotation::new(cids);
    let preload = PreloadManager::new(services.clone(), rotation.clone(), config.preload.clone());
    let player = Arc::new(HeadlessPlayer::new());
    let session = PlaybackSession::new(
        services.clone(),
        preload.clone(),
        rotation.clone(),
        Arc::clone(&player) as Arc<dyn Player>,
        Arc::new(NoopObserver),
        config.session.clone(),
    );
    let status = session.status();
    let queue = spawn_command_queue(
        session,
        Arc::clone(&services.clock),
        config.command.clone(),
    );

    for _ in 0..count {
        if rotation.is_empty() {
            println!("Rotation exhausted");
            break;
        }

        match queue.enqueue_default(Command::Load(LoadTarget::Next)).await {
            Ok(CommandOutcome::Loaded { cid, provider }) => {
                println!("Loaded {cid} from {provider}");
            }
            Ok(other) => tracing::warn!("Unexpected load outcome {:?}", other),
            Err(CommandError::Session(e)) => {
                println!("Load failed: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = queue.enqueue_default(Command::Play).await?;
        tracing::debug!("Play: {:?}", outcome);

        tokio::time::sleep(dwell).await;
        println!(
            "  {:?}: {} chunks, {} bytes buffered",
            status.get().state,
            player.buffered_chunks(),
            player.buffered_bytes()
        );
    }

    queue.shutdown();
    preload.shutdown();
    persist_errors(&services).await;
    Ok(())
}

/// Wire registry, persisted state and network into shared services.
async fn build_services(catalog: Option<&Path>, config: &CidStreamConfig) -> Result<DeliveryServices> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let catalog = match catalog {
        Some(path) => ProviderCatalog::from_json(&fs::read_to_string(path).await?)?,
        None => ProviderCatalog::builtin(),
    };
    let registry = Arc::new(ProviderRegistry::from_catalog(&catalog, Arc::clone(&clock))?);
    if registry.is_empty() {
        return Err(CidStreamError::Configuration {
            reason: "provider catalogue is empty".to_string(),
        });
    }

    let store = FileStore::new(
        config.storage.state_dir.clone(),
        config.storage.temp_file_suffix,
    );
    let invalidation = Arc::new(
        InvalidationCache::load(
            Arc::new(store),
            Arc::clone(&clock),
            config.storage.invalid_cid_window,
        )
        .await?,
    );
    invalidation.restore_provider_errors(&registry).await?;

    let network = NetworkStack::production(&config.network)?;
    Ok(DeliveryServices::new(
        config,
        registry,
        invalidation,
        network,
        clock,
    ))
}

async fn persist_errors(services: &DeliveryServices) {
    if let Err(e) = services
        .invalidation
        .persist_provider_errors(&services.registry)
        .await
    {
        tracing::warn!("Failed to persist provider errors: {}", e);
    }
}
