//! Playback session: rotation, the active stream and the player.
//!
//! The session is the executor behind the command queue. A load cancels the
//! previous load's stream, clears the player, validates the CID (reusing a
//! warmed result when one exists), delivers the first chunk and then hands
//! the stream to a feeder task that appends chunks as the player frees
//! buffer room. Loads of the next or previous rotation entry retry with
//! backoff and give up on a CID by marking it invalid.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cid::Cid;
use crate::command::{Command, CommandExecutor, CommandOutcome, LoadTarget};
use crate::config::SessionConfig;
use crate::observer::PlaybackObserver;
use crate::player::{BufferDemand, MediaSource, Player, PlayerError};
use crate::preload::PreloadManager;
use crate::provider::ProviderKey;
use crate::rotation::{Direction, Rotation};
use crate::scheduler::{Chunk, ChunkStream, FetchError};
use crate::services::DeliveryServices;
use crate::validator::{ValidationError, ValidationResult};

/// Errors that occur while executing session commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error("CID {cid} has no content")]
    EmptyResource { cid: Cid },

    #[error("No source loaded")]
    NoActiveSource,

    #[error("Rotation is empty")]
    RotationEmpty,

    #[error("Gave up on {cid} after {attempts} load attempts")]
    LoadExhausted { cid: String, attempts: u32 },

    #[error("Session shut down")]
    Cancelled,
}

/// Player state as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
}

/// Snapshot of what the session is doing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: PlayerState,
    pub cid: Option<Cid>,
    pub provider: Option<ProviderKey>,
    /// Last requested byte position
    pub position: u64,
}

/// Shared read access to the session status after the session moved into
/// the command queue.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<SessionStatus>>,
}

impl StatusHandle {
    pub fn get(&self) -> SessionStatus {
        self.inner.lock().clone()
    }

    fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.inner.lock());
    }
}

/// The load currently attached to the player.
#[derive(Debug)]
struct ActiveLoad {
    cid: Cid,
    cancel: CancellationToken,
    demand: BufferDemand,
    seek_tx: mpsc::UnboundedSender<u64>,
}

impl ActiveLoad {
    fn stop(&self) {
        self.cancel.cancel();
        self.demand.close();
    }
}

impl Drop for ActiveLoad {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spinner on for the lifetime of a load; also resets a load interrupted
/// mid-way back to `Idle`.
struct LoadingGuard<'a> {
    observer: &'a dyn PlaybackObserver,
    status: &'a StatusHandle,
}

impl<'a> LoadingGuard<'a> {
    fn new(observer: &'a dyn PlaybackObserver, status: &'a StatusHandle) -> Self {
        observer.on_spinner_update(true);
        Self { observer, status }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.status.update(|status| {
            if status.state == PlayerState::Loading {
                status.state = PlayerState::Idle;
            }
        });
        self.observer.on_spinner_update(false);
    }
}

/// Owner of the rotation, the active stream and the player.
#[derive(Debug)]
pub struct PlaybackSession {
    services: DeliveryServices,
    preload: PreloadManager,
    rotation: Rotation,
    player: Arc<dyn Player>,
    observer: Arc<dyn PlaybackObserver>,
    config: SessionConfig,
    status: StatusHandle,
    active: Option<ActiveLoad>,
    /// Id of the load allowed to append; held while appending
    delivery_gate: Arc<tokio::sync::Mutex<u64>>,
    load_counter: u64,
    shutdown: CancellationToken,
}

impl PlaybackSession {
    pub fn new(
        services: DeliveryServices,
        preload: PreloadManager,
        rotation: Rotation,
        player: Arc<dyn Player>,
        observer: Arc<dyn PlaybackObserver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            services,
            preload,
            rotation,
            player,
            observer,
            config,
            status: StatusHandle::default(),
            active: None,
            delivery_gate: Arc::new(tokio::sync::Mutex::new(0)),
            load_counter: 0,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn rotation(&self) -> &Rotation {
        &self.rotation
    }

    /// Stops the active load and any backoff in progress.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(active) = self.active.take() {
            active.stop();
        }
        self.preload.shutdown();
    }

    /// Loads `raw` once.
    ///
    /// # Errors
    ///
    /// - `SessionError::Validation` - No usable source; malformed CIDs are
    ///   also dropped from the rotation
    /// - `SessionError::Fetch` - The first chunk could not be fetched
    /// - `SessionError::EmptyResource` - The CID has no bytes
    /// - `SessionError::Player` - The player rejected the source
    pub async fn load(&mut self, raw: &str) -> Result<ValidationResult, SessionError> {
        let cid = match Cid::parse(raw) {
            Ok(cid) => cid,
            Err(e) => {
                tracing::warn!("Rejecting load: {}", e);
                self.drop_from_rotation(raw);
                return Err(ValidationError::from(e).into());
            }
        };
        self.load_cid(&cid).await
    }

    /// Loads the rotation entry in `direction` with caller-level retry.
    ///
    /// Malformed and recently invalid entries are dropped without using an
    /// attempt. `NoAvailableProvider` resets every provider's stats before
    /// the next attempt. A CID that fails every attempt is marked invalid
    /// and removed from the rotation.
    ///
    /// # Errors
    ///
    /// - `SessionError::RotationEmpty` - Nothing left to load
    /// - `SessionError::LoadExhausted` - The target failed every attempt
    /// - `SessionError::Cancelled` - The session shut down during backoff
    pub async fn load_adjacent(
        &mut self,
        direction: Direction,
    ) -> Result<ValidationResult, SessionError> {
        let retry = self.config.load_retry.clone();
        let mut attempts = 0;

        loop {
            let Some(raw) = self.rotation.peek(direction) else {
                return Err(SessionError::RotationEmpty);
            };

            let error = match self.load(&raw).await {
                Ok(validation) => return Ok(validation),
                Err(error) => error,
            };

            match &error {
                SessionError::Validation(ValidationError::MalformedCid(_)) => continue,
                SessionError::Validation(ValidationError::MarkedInvalid { .. }) => {
                    self.drop_from_rotation(&raw);
                    attempts = 0;
                    continue;
                }
                SessionError::Validation(ValidationError::Cancelled)
                | SessionError::Fetch(FetchError::Cancelled)
                | SessionError::Cancelled => return Err(error),
                SessionError::Validation(ValidationError::NoAvailableProvider { .. }) => {
                    tracing::warn!("No provider available; resetting provider stats");
                    self.services.registry.reset_all_stats();
                }
                _ => {}
            }

            attempts += 1;
            if !retry.should_retry(attempts) {
                tracing::warn!("Giving up on {} after {} attempts: {}", raw, attempts, error);
                if let Ok(cid) = Cid::parse(&raw)
                    && let Err(e) = self.services.invalidation.mark_invalid(&cid).await
                {
                    tracing::warn!("Failed to persist invalid mark for {}: {}", cid, e);
                }
                self.drop_from_rotation(&raw);
                return Err(SessionError::LoadExhausted { cid: raw, attempts });
            }

            tracing::info!(
                "Load of {} failed (attempt {}/{}): {}",
                raw,
                attempts,
                retry.max_attempts,
                error
            );
            retry
                .backoff(self.services.clock.as_ref(), attempts - 1, &self.shutdown)
                .await
                .map_err(|_| SessionError::Cancelled)?;
        }
    }

    async fn load_cid(&mut self, cid: &Cid) -> Result<ValidationResult, SessionError> {
        self.stop_active().await;

        let cancel = self.shutdown.child_token();
        // Stops the stream and feeder if this future is dropped mid-load
        let cancel_on_drop = cancel.clone().drop_guard();
        let load_id = self.load_counter;
        self.status.update(|status| {
            *status = SessionStatus {
                state: PlayerState::Loading,
                cid: Some(cid.clone()),
                provider: None,
                position: 0,
            };
        });
        let spinner = LoadingGuard::new(self.observer.as_ref(), &self.status);

        let (validation, active) = match self.start_stream(cid, load_id, &cancel).await {
            Ok(started) => started,
            Err(e) => {
                drop(spinner);
                drop(cancel_on_drop);
                self.persist_provider_errors().await;
                return Err(e);
            }
        };

        self.active = Some(active);
        cancel_on_drop.disarm();
        self.status.update(|status| {
            status.state = PlayerState::Ready;
            status.provider = Some(validation.provider.clone());
        });
        drop(spinner);
        self.rotation.set_current(cid.as_str());
        self.preload.schedule_upcoming();
        tracing::info!("Loaded {} from {}", cid, validation.provider);

        self.persist_provider_errors().await;
        Ok(validation)
    }

    async fn start_stream(
        &self,
        cid: &Cid,
        load_id: u64,
        cancel: &CancellationToken,
    ) -> Result<(ValidationResult, ActiveLoad), SessionError> {
        let validation = match self.preload.take_warmed(cid) {
            Some(warmed) if !self.services.invalidation.is_invalid(cid) => {
                tracing::debug!("Using warmed source for {}", cid);
                warmed
            }
            _ => self.services.validator.validate_cid(cid, cancel).await?,
        };

        let mut stream = ChunkStream::start(
            Arc::clone(&self.services.scheduler),
            cid.clone(),
            validation.reachable.clone(),
            cancel,
        );
        let first = stream
            .next_chunk()
            .await?
            .ok_or_else(|| SessionError::EmptyResource { cid: cid.clone() })?;

        let demand = BufferDemand::new(self.config.buffer_chunks);
        let source = MediaSource {
            cid: cid.clone(),
            provider: validation.provider.clone(),
            url: validation.url.clone(),
        };
        self.player.set_source(&source, demand.clone()).await?;

        let feeder = Feeder {
            player: Arc::clone(&self.player),
            observer: Arc::clone(&self.observer),
            gate: Arc::clone(&self.delivery_gate),
            load_id,
            demand: demand.clone(),
            cancel: cancel.clone(),
        };
        if !demand.acquire().await {
            return Err(SessionError::Cancelled);
        }
        feeder.deliver(&first).await?;

        let (seek_tx, seek_rx) = mpsc::unbounded_channel();
        tokio::spawn(feeder.run(stream, seek_rx));

        Ok((
            validation,
            ActiveLoad {
                cid: cid.clone(),
                cancel: cancel.clone(),
                demand,
                seek_tx,
            },
        ))
    }

    /// Cancels the previous load and waits until it can no longer append.
    async fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!("Cancelling load of {}", active.cid);
            active.stop();
        }

        self.load_counter += 1;
        *self.delivery_gate.lock().await = self.load_counter;
        self.player.clear_source().await;
    }

    async fn play(&mut self) -> Result<CommandOutcome, SessionError> {
        if self.active.is_none() {
            return Err(SessionError::NoActiveSource);
        }
        match self.player.play().await {
            Ok(()) => {
                self.status.update(|status| status.state = PlayerState::Playing);
                Ok(CommandOutcome::Playing)
            }
            Err(PlayerError::AutoplayBlocked) => {
                tracing::info!("Autoplay blocked; waiting for user interaction");
                self.observer.on_autoplay_blocked();
                Ok(CommandOutcome::AutoplayBlocked)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pause(&mut self) -> Result<CommandOutcome, SessionError> {
        if self.active.is_none() {
            return Err(SessionError::NoActiveSource);
        }
        self.player.pause().await;
        self.status.update(|status| status.state = PlayerState::Paused);
        Ok(CommandOutcome::Paused)
    }

    async fn seek(&mut self, position: u64) -> Result<CommandOutcome, SessionError> {
        let Some(active) = &self.active else {
            return Err(SessionError::NoActiveSource);
        };
        self.player.seek(position).await?;
        if active.seek_tx.send(position).is_err() {
            tracing::debug!("Feeder for {} already finished", active.cid);
        }
        self.status.update(|status| status.position = position);
        Ok(CommandOutcome::Seeked { position })
    }

    fn drop_from_rotation(&self, raw: &str) {
        if self.rotation.remove(raw) {
            self.observer.on_load_failed(raw);
        }
    }

    async fn persist_provider_errors(&self) {
        if let Err(e) = self
            .services
            .invalidation
            .persist_provider_errors(&self.services.registry)
            .await
        {
            tracing::warn!("Failed to persist provider errors: {}", e);
        }
    }
}

#[async_trait]
impl CommandExecutor for PlaybackSession {
    async fn execute(&mut self, command: Command) -> Result<CommandOutcome, SessionError> {
        let validation = match command {
            Command::Load(LoadTarget::Cid(raw)) => self.load(&raw).await?,
            Command::Load(LoadTarget::Next) => self.load_adjacent(Direction::Next).await?,
            Command::Load(LoadTarget::Previous) => {
                self.load_adjacent(Direction::Previous).await?
            }
            Command::Play => return self.play().await,
            Command::Pause => return self.pause().await,
            Command::Seek { position } => return self.seek(position).await,
        };

        Ok(CommandOutcome::Loaded {
            cid: validation.cid,
            provider: validation.provider,
        })
    }
}

/// Appends one load's chunks to the player as buffer room frees up.
struct Feeder {
    player: Arc<dyn Player>,
    observer: Arc<dyn PlaybackObserver>,
    gate: Arc<tokio::sync::Mutex<u64>>,
    load_id: u64,
    demand: BufferDemand,
    cancel: CancellationToken,
}

impl Feeder {
    async fn run(self, mut stream: ChunkStream, mut seek_rx: mpsc::UnboundedReceiver<u64>) {
        loop {
            let credit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(position) = seek_rx.recv() => {
                    stream.seek(position);
                    continue;
                }
                credit = self.demand.acquire() => credit,
            };
            if !credit {
                break;
            }

            let next = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    Some(position) = seek_rx.recv() => stream.seek(position),
                    next = stream.next_chunk() => break next,
                }
            };

            match next {
                Ok(Some(chunk)) => {
                    if let Err(e) = self.deliver(&chunk).await {
                        tracing::warn!("Player rejected chunk {} of {}: {}", chunk.index, chunk.cid, e);
                        break;
                    }
                }
                Ok(None) => {
                    self.demand.consumed(1);
                    // Fully delivered; only a seek restarts delivery
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        position = seek_rx.recv() => match position {
                            Some(position) => stream.seek(position),
                            None => break,
                        },
                    }
                }
                Err(FetchError::Cancelled) => break,
                Err(e) => {
                    tracing::warn!("Stream for {} failed: {}", stream.cid(), e);
                    break;
                }
            }
        }
        tracing::debug!("Feeder for {} stopped", stream.cid());
    }

    /// Appends `chunk` unless a newer load took over the player.
    async fn deliver(&self, chunk: &Chunk) -> Result<(), PlayerError> {
        let gate = self.gate.lock().await;
        if *gate != self.load_id || self.cancel.is_cancelled() {
            tracing::trace!("Discarding chunk {} of superseded load", chunk.index);
            return Ok(());
        }
        self.player.append_chunk(chunk).await?;
        drop(gate);

        self.observer.on_chunk_ready(chunk);
        Ok(())
    }
}
