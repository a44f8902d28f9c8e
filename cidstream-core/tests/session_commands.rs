//! Integration tests for the command queue driving a playback session.
//!
//! These tests go through the public `CommandQueue` API with scripted
//! gateways and a recording player, checking command ordering, load
//! supersession and timeout behavior end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cidstream_core::config::INVALID_CID_WINDOW;
use cidstream_core::invalidation::PROVIDER_ERRORS_KEY;
use cidstream_core::testing::{
    MockGateway, MockPlayer, MockResolver, MockTransport, ObserverEvent, PlayerEvent,
    RecordingObserver, fake_mp4, test_cid, test_network, test_registry,
};
use cidstream_core::{
    Cid, CidStreamConfig, Clock, Command, CommandError, CommandKind, CommandOutcome, CommandQueue,
    DeliveryServices, InvalidationCache, KeyValueStore, LoadTarget, ManualClock, MemoryStore,
    PlaybackObserver, PlaybackSession, Player, PlayerState, PreloadManager, ProviderKey, Rotation,
    SessionError, StatusHandle, StoreError, spawn_command_queue,
};

const CHUNK_SIZE: u64 = 1024;

/// Session behind a command queue over one scripted gateway.
struct SessionFixture {
    queue: CommandQueue,
    status: StatusHandle,
    transport: Arc<MockTransport>,
    player: Arc<MockPlayer>,
    observer: Arc<RecordingObserver>,
    services: DeliveryServices,
    rotation: Rotation,
}

/// Store whose provider error snapshots take ten seconds to write.
#[derive(Debug, Default)]
struct SlowErrorStore {
    inner: MemoryStore,
}

#[async_trait]
impl KeyValueStore for SlowErrorStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key == PROVIDER_ERRORS_KEY {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        self.inner.save(key, value).await
    }
}

impl SessionFixture {
    async fn new(cids: &[Cid]) -> Self {
        Self::with_store(cids, Arc::new(MemoryStore::new())).await
    }

    async fn with_store(cids: &[Cid], store: Arc<dyn KeyValueStore>) -> Self {
        let mut config = CidStreamConfig::for_testing();
        config.scheduler.chunk_size = CHUNK_SIZE;

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let transport = Arc::new(MockTransport::new());
        let invalidation = InvalidationCache::load(
            store,
            Arc::clone(&clock),
            INVALID_CID_WINDOW,
        )
        .await
        .unwrap();
        let services = DeliveryServices::new(
            &config,
            Arc::new(test_registry(2)),
            Arc::new(invalidation),
            test_network(Arc::clone(&transport), Arc::new(MockResolver::new())),
            Arc::clone(&clock),
        );

        let rotation = Rotation::new(cids.iter().map(ToString::to_string));
        let preload = PreloadManager::new(services.clone(), rotation.clone(), config.preload);
        let player = Arc::new(MockPlayer::new());
        let observer = Arc::new(RecordingObserver::new());
        let session = PlaybackSession::new(
            services.clone(),
            preload,
            rotation.clone(),
            Arc::clone(&player) as Arc<dyn Player>,
            Arc::clone(&observer) as Arc<dyn PlaybackObserver>,
            config.session,
        );
        let status = session.status();
        let queue = spawn_command_queue(session, clock, config.command);

        Self {
            queue,
            status,
            transport,
            player,
            observer,
            services,
            rotation,
        }
    }

    /// Both gateways serve `content` for every CID.
    fn serve(&self, content: bytes::Bytes, latency: Duration) {
        for host in ["gw0.test", "gw1.test"] {
            self.transport.set_gateway(
                host,
                MockGateway::serving(content.clone()).with_latency(latency),
            );
        }
    }

    fn load(cid: &Cid) -> Command {
        Command::Load(LoadTarget::Cid(cid.to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_load_seek_load_runs_in_order_and_supersedes() {
    let a = test_cid(100);
    let b = test_cid(200);
    let fixture = SessionFixture::new(&[a.clone(), b.clone()]).await;
    fixture.serve(fake_mp4(16 * CHUNK_SIZE as usize), Duration::from_millis(30));

    let timeout = Duration::from_secs(5);
    let load_a = fixture.queue.submit(SessionFixture::load(&a), timeout).unwrap();
    let seek = fixture
        .queue
        .submit(Command::Seek { position: 5 }, timeout)
        .unwrap();
    let load_b = fixture.queue.submit(SessionFixture::load(&b), timeout).unwrap();

    assert!(matches!(
        load_a.outcome().await,
        Ok(CommandOutcome::Loaded { cid, .. }) if cid == a
    ));
    assert_eq!(
        seek.outcome().await,
        Ok(CommandOutcome::Seeked { position: 5 })
    );
    assert!(matches!(
        load_b.outcome().await,
        Ok(CommandOutcome::Loaded { cid, .. }) if cid == b
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let events = fixture.player.events();

    let set_a = events
        .iter()
        .position(|e| *e == PlayerEvent::SetSource(a.clone()))
        .unwrap();
    let seek_at = events
        .iter()
        .position(|e| *e == PlayerEvent::Seek(5))
        .unwrap();
    let set_b = events
        .iter()
        .position(|e| *e == PlayerEvent::SetSource(b.clone()))
        .unwrap();
    assert!(set_a < seek_at && seek_at < set_b);

    // The seek observed A loaded; B's load cleared the player first
    assert_eq!(events[set_b - 1], PlayerEvent::ClearSource);
    assert!(
        events[set_b..]
            .iter()
            .all(|e| !matches!(e, PlayerEvent::Append { cid, .. } if *cid == a))
    );

    let status = fixture.status.get();
    assert_eq!(status.cid, Some(b.clone()));
    assert_eq!(status.state, PlayerState::Ready);
    assert_eq!(fixture.rotation.current(), Some(b.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_load_leaves_session_usable() {
    let stuck = test_cid(300);
    let good = test_cid(301);
    let fixture = SessionFixture::new(&[stuck.clone(), good.clone()]).await;
    for host in ["gw0.test", "gw1.test"] {
        fixture.transport.set_gateway(host, MockGateway::stalled());
    }

    let result = fixture
        .queue
        .enqueue(SessionFixture::load(&stuck), Duration::from_millis(200))
        .await;
    assert_eq!(
        result,
        Err(CommandError::Timeout {
            kind: CommandKind::Load,
            timeout: Duration::from_millis(200)
        })
    );
    assert_eq!(fixture.status.get().state, PlayerState::Idle);
    assert_eq!(
        fixture.observer.events().last(),
        Some(&ObserverEvent::Spinner(false))
    );

    // Later commands still run
    fixture.serve(fake_mp4(2 * CHUNK_SIZE as usize), Duration::ZERO);
    let outcome = fixture
        .queue
        .enqueue_default(SessionFixture::load(&good))
        .await
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::Loaded { cid, .. } if cid == good));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_while_persisting_keeps_attached_source() {
    let cid = test_cid(310);
    let fixture =
        SessionFixture::with_store(std::slice::from_ref(&cid), Arc::new(SlowErrorStore::default()))
            .await;
    fixture.serve(fake_mp4(8 * CHUNK_SIZE as usize), Duration::ZERO);

    let result = fixture
        .queue
        .enqueue(SessionFixture::load(&cid), Duration::from_secs(2))
        .await;
    assert_eq!(
        result,
        Err(CommandError::Timeout {
            kind: CommandKind::Load,
            timeout: Duration::from_secs(2)
        })
    );

    // The source was attached before the timeout, so the session owns it
    let status = fixture.status.get();
    assert_eq!(status.state, PlayerState::Ready);
    assert_eq!(status.cid, Some(cid.clone()));
    assert_eq!(
        fixture.queue.enqueue_default(Command::Play).await,
        Ok(CommandOutcome::Playing)
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut appended = fixture.player.appended(&cid);
    appended.sort_unstable();
    assert_eq!(appended, (0..8).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_mid_delivery_stops_abandoned_load() {
    let slow = test_cid(320);
    let next = test_cid(321);
    let fixture = SessionFixture::new(&[slow.clone(), next.clone()]).await;
    fixture.serve(fake_mp4(8 * CHUNK_SIZE as usize), Duration::ZERO);
    fixture.player.delay_appends(Duration::from_secs(5));

    let result = fixture
        .queue
        .enqueue(SessionFixture::load(&slow), Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(CommandError::Timeout { .. })));
    assert!(
        fixture
            .player
            .events()
            .contains(&PlayerEvent::SetSource(slow.clone()))
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fixture.player.appended(&slow).is_empty());
    assert_eq!(fixture.status.get().state, PlayerState::Idle);
    assert_eq!(
        fixture.queue.enqueue_default(Command::Play).await,
        Err(CommandError::Session(SessionError::NoActiveSource))
    );

    let outcome = fixture
        .queue
        .enqueue(SessionFixture::load(&next), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::Loaded { cid, .. } if cid == next));
    assert!(fixture.player.appended(&slow).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_play_and_pause_follow_load() {
    let cid = test_cid(400);
    let fixture = SessionFixture::new(std::slice::from_ref(&cid)).await;
    fixture.serve(fake_mp4(CHUNK_SIZE as usize), Duration::ZERO);

    assert_eq!(
        fixture.queue.enqueue_default(Command::Pause).await,
        Err(CommandError::Session(SessionError::NoActiveSource))
    );

    let timeout = Duration::from_secs(5);
    let load = fixture.queue.submit(SessionFixture::load(&cid), timeout).unwrap();
    let play = fixture.queue.submit(Command::Play, timeout).unwrap();
    let pause = fixture.queue.submit(Command::Pause, timeout).unwrap();

    assert!(load.outcome().await.is_ok());
    assert_eq!(play.outcome().await, Ok(CommandOutcome::Playing));
    assert_eq!(pause.outcome().await, Ok(CommandOutcome::Paused));
    assert_eq!(fixture.status.get().state, PlayerState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_next_skips_recently_invalid_cid() {
    let bad = test_cid(500);
    let good = test_cid(501);
    let fixture = SessionFixture::new(&[bad.clone(), good.clone()]).await;
    fixture.serve(fake_mp4(CHUNK_SIZE as usize), Duration::ZERO);
    fixture.services.invalidation.mark_invalid(&bad).await.unwrap();

    let outcome = fixture
        .queue
        .enqueue_default(Command::Load(LoadTarget::Next))
        .await
        .unwrap();

    assert!(matches!(outcome, CommandOutcome::Loaded { cid, .. } if cid == good));
    assert_eq!(fixture.observer.failed_loads(), vec![bad.to_string()]);
    assert_eq!(fixture.rotation.cids(), vec![good.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_next_resets_stats_when_every_provider_disqualified() {
    let cid = test_cid(600);
    let fixture = SessionFixture::new(std::slice::from_ref(&cid)).await;
    fixture.serve(fake_mp4(CHUNK_SIZE as usize), Duration::ZERO);

    for key in ["gw0", "gw1"] {
        for _ in 0..3 {
            fixture
                .services
                .registry
                .record_outcome(
                    &ProviderKey::new(key),
                    cidstream_core::provider::Outcome::Failure {
                        kind: cidstream_core::provider::FailureKind::Timeout,
                    },
                )
                .unwrap();
        }
    }
    assert!(fixture.services.registry.all_disqualified());

    let outcome = fixture
        .queue
        .enqueue(Command::Load(LoadTarget::Next), Duration::from_secs(30))
        .await
        .unwrap();

    assert!(matches!(outcome, CommandOutcome::Loaded { cid: loaded, .. } if loaded == cid));
    assert!(!fixture.services.registry.all_disqualified());
}
