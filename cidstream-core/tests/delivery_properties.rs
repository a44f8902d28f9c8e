//! Integration tests for chunk delivery and source selection properties.

use std::sync::Arc;
use std::time::Duration;

use cidstream_core::config::{INVALID_CID_WINDOW, SchedulerConfig};
use cidstream_core::testing::{
    MockGateway, MockResolver, MockTransport, fake_mp4, test_cid, test_network, test_registry,
};
use cidstream_core::{
    ChunkScheduler, ChunkStream, CidStreamConfig, CidValidator, Clock, InvalidationCache,
    ManualClock, MemoryStore, Priority, ProviderKey, ProviderRegistry, ValidationError,
};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

fn chain(keys: &[&str]) -> Vec<ProviderKey> {
    keys.iter().map(|key| ProviderKey::new(*key)).collect()
}

fn scheduler(
    registry: Arc<ProviderRegistry>,
    transport: Arc<MockTransport>,
    config: SchedulerConfig,
) -> Arc<ChunkScheduler> {
    Arc::new(ChunkScheduler::new(
        registry,
        transport,
        Arc::new(ManualClock::default()),
        config,
    ))
}

/// Drains `stream`, returning delivered chunk indices and bytes by index.
async fn drain(stream: &mut ChunkStream) -> Vec<(u64, bytes::Bytes)> {
    let mut delivered = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        delivered.push((chunk.index, chunk.data));
    }
    delivered.sort_by_key(|(index, _)| *index);
    delivered
}

#[tokio::test(start_paused = true)]
async fn test_no_duplicate_concurrent_fetches_under_failures() {
    let transport = Arc::new(MockTransport::new());
    let content = fake_mp4(40 * 512);
    transport.set_gateway(
        "gw0.test",
        MockGateway::serving(content.clone())
            .with_latency(Duration::from_millis(40))
            .failing_first(5),
    );
    transport.set_gateway(
        "gw1.test",
        MockGateway::serving(content.clone()).with_latency(Duration::from_millis(70)),
    );

    let config = SchedulerConfig {
        chunk_size: 512,
        lookahead: 4,
        max_in_flight: 4,
        ..Default::default()
    };
    let scheduler = scheduler(Arc::new(test_registry(2)), Arc::clone(&transport), config);
    let cid = test_cid(1);
    let mut stream = ChunkStream::start(
        scheduler,
        cid,
        chain(&["gw0", "gw1"]),
        &CancellationToken::new(),
    );

    let delivered = drain(&mut stream).await;

    assert_eq!(delivered.len(), 40);
    assert!(
        delivered
            .iter()
            .enumerate()
            .all(|(i, (index, _))| *index == i as u64)
    );
    assert_eq!(transport.max_concurrent_per_range(), 1);
    assert!(transport.max_concurrent() <= 4);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_mark_window_through_validator() {
    let clock = ManualClock::default();
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let transport = Arc::new(MockTransport::new());
    transport.set_gateway("gw0.test", MockGateway::serving(fake_mp4(4096)));
    let invalidation = Arc::new(
        InvalidationCache::load(
            Arc::new(MemoryStore::new()),
            Arc::clone(&shared_clock),
            INVALID_CID_WINDOW,
        )
        .await
        .unwrap(),
    );
    let validator = CidValidator::new(
        Arc::new(test_registry(1)),
        Arc::clone(&invalidation),
        test_network(Arc::clone(&transport), Arc::new(MockResolver::new())),
        shared_clock,
        CidStreamConfig::for_testing().validation,
    );
    let cid = test_cid(7);
    let cancel = CancellationToken::new();

    invalidation.mark_invalid(&cid).await.unwrap();

    clock.advance(Duration::from_secs(60 * 60));
    assert!(matches!(
        validator.validate_cid(&cid, &cancel).await,
        Err(ValidationError::MarkedInvalid { .. })
    ));
    assert_eq!(transport.total_fetches(), 0);

    clock.advance(Duration::from_secs(48 * 60 * 60));
    let validation = validator.validate_cid(&cid, &cancel).await.unwrap();
    assert_eq!(validation.provider, ProviderKey::new("gw0"));
    assert_eq!(transport.total_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preload_fetch_waits_for_active_stream() {
    let transport = Arc::new(MockTransport::new());
    transport.set_gateway(
        "gw0.test",
        MockGateway::serving(fake_mp4(4 * 512)).with_latency(Duration::from_millis(100)),
    );
    transport.set_gateway("gw1.test", MockGateway::serving(fake_mp4(4 * 512)));
    let config = SchedulerConfig {
        chunk_size: 512,
        lookahead: 2,
        ..Default::default()
    };
    let scheduler = scheduler(Arc::new(test_registry(2)), Arc::clone(&transport), config);
    let cancel = CancellationToken::new();

    let streaming = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = ChunkStream::start(scheduler, test_cid(1), chain(&["gw0"]), &cancel);
            drain(&mut stream).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.fetch_count("gw0.test"), 2);

    let preloading = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            scheduler
                .fetch_chunk_from(
                    &test_cid(2),
                    0,
                    Priority::Preload,
                    &chain(&["gw1"]),
                    &cancel,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(transport.fetch_count("gw1.test"), 0);
    assert_eq!(scheduler.admission().waiting(), 1);

    assert_eq!(streaming.await.unwrap().len(), 4);
    let warmed = preloading.await.unwrap().unwrap();
    assert_eq!(warmed.priority, Priority::Preload);
    assert_eq!(transport.fetch_count("gw1.test"), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_stream_delivers_every_byte_once(
        len in 1usize..12_000,
        chunk_size in 256u64..2048,
        lookahead in 1u64..5,
        max_in_flight in 1usize..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let delivered = runtime.block_on(async {
            let transport = Arc::new(MockTransport::new());
            transport.set_gateway("gw0.test", MockGateway::serving(fake_mp4(len)));
            let config = SchedulerConfig {
                chunk_size,
                lookahead,
                max_in_flight,
                ..Default::default()
            };
            let scheduler = scheduler(Arc::new(test_registry(1)), transport, config);
            let mut stream = ChunkStream::start(
                scheduler,
                test_cid(3),
                chain(&["gw0"]),
                &CancellationToken::new(),
            );
            drain(&mut stream).await
        });

        let expected_chunks = (len as u64).div_ceil(chunk_size);
        prop_assert_eq!(delivered.len() as u64, expected_chunks);

        let joined: Vec<u8> = delivered
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();
        prop_assert_eq!(joined, fake_mp4(len).to_vec());
    }
}
