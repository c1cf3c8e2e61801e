//! End-to-end bus scenarios against the in-process channel adapter.
//!
//! Run with: cargo test --test bus_in_process --features test-utils

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use computer_bus::test_utils::{
    reading_mappers, reading_registry, wait_until, MockChannelAdapter, Reading, ReadingDto,
    Stranger,
};
use computer_bus::{
    erase, reply_subject, BusClient, BusError, DomainBus, DomainRequestService,
    InProcessChannelAdapter, ProstSerializer, RequestService, TypeTagged,
};
use computer_bus::utils::bootstrap::try_init_tracing;
use tokio_util::sync::CancellationToken;

fn client(adapter: &InProcessChannelAdapter) -> BusClient {
    try_init_tracing();
    BusClient::new(
        Arc::new(adapter.clone()),
        Arc::new(ProstSerializer::new().with::<ReadingDto>()),
    )
}

#[tokio::test]
async fn test_fifty_signals_fifty_callbacks() {
    let adapter = InProcessChannelAdapter::new();
    let bus = client(&adapter);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let _sub = bus
        .subscribe_signal(
            "seed.signal",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            None,
        )
        .await
        .expect("Failed to subscribe");

    for _ in 0..50 {
        bus.publish_signal("seed.signal", None, None)
            .await
            .expect("Failed to publish");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 50).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 50, "no duplicates");
}

#[tokio::test]
async fn test_panicking_callback_does_not_lose_later_signals() {
    let adapter = InProcessChannelAdapter::new();
    let bus = client(&adapter);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sub = bus
        .subscribe_signal(
            "seed.volatile",
            move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first signal explodes");
                }
                async { Ok(()) }
            },
            None,
        )
        .await
        .expect("Failed to subscribe");

    for _ in 0..3 {
        bus.publish_signal("seed.volatile", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // The panicked signal is redelivered once, the other two arrive normally
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 4).await);
    assert!(sub.is_active());
    assert_eq!(adapter.consumer_count("seed.volatile"), 1);
}

#[tokio::test]
async fn test_each_subscriber_sees_each_publish_once() {
    let adapter = InProcessChannelAdapter::new();
    let bus = client(&adapter);

    let counts: Vec<_> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut subs = Vec::new();
    for count in &counts {
        let count = count.clone();
        subs.push(
            bus.subscribe_signal(
                "seed.fanout",
                move |_, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                None,
            )
            .await
            .expect("Failed to subscribe"),
        );
    }

    for _ in 0..10 {
        bus.publish_signal("seed.fanout", None, None).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || counts
            .iter()
            .all(|c| c.load(Ordering::SeqCst) == 10))
        .await
    );

    // Dropping one subscription leaves the rest receiving
    subs.pop();
    assert_eq!(adapter.consumer_count("seed.fanout"), 3);
}

#[tokio::test]
async fn test_request_five_gets_six_on_scoped_reply_subject() {
    let adapter = InProcessChannelAdapter::new();
    let requests = RequestService::new(client(&adapter));

    // Record the subject each reply is published on
    let reply_subjects = Arc::new(Mutex::new(Vec::new()));
    let sink = reply_subjects.clone();
    let _listener = requests
        .listen_typed::<ReadingDto, ReadingDto, _, _>(
            "seed.increment",
            "seed.incremented",
            move |request| {
                sink.lock()
                    .unwrap()
                    .push(reply_subject("seed.incremented", &request.correlation_id));
                let value = request.payload.map(|r| r.value).unwrap_or_default();
                async move {
                    Ok(Some(ReadingDto {
                        value: value + 1,
                        label: "incremented".to_string(),
                    }))
                }
            },
            None,
        )
        .await
        .expect("Failed to listen");

    let response = requests
        .request_typed::<ReadingDto, ReadingDto>(
            Some(ReadingDto {
                value: 5,
                label: "five".to_string(),
            }),
            "seed.increment",
            "seed.incremented",
            None,
            Some("seed-cid"),
            &CancellationToken::new(),
        )
        .await
        .expect("Request failed");

    assert_eq!(response.payload.expect("payload").value, 6);
    assert_eq!(response.correlation_id, "seed-cid");
    assert_eq!(
        reply_subjects.lock().unwrap().as_slice(),
        ["seed.incremented:seed-cid".to_string()]
    );
    assert_eq!(adapter.consumer_count("seed.incremented:seed-cid"), 0);
}

#[tokio::test]
async fn test_one_second_cancellation_without_responder() {
    let adapter = InProcessChannelAdapter::new();
    let requests = RequestService::new(client(&adapter));

    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = requests
        .request_typed::<ReadingDto, ReadingDto>(
            Some(ReadingDto::default()),
            "seed.nobody",
            "seed.silence",
            None,
            Some("abandoned"),
            &cancel,
        )
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(BusError::Cancelled)));
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
    assert_eq!(adapter.consumer_count("seed.silence:abandoned"), 0, "leaked reply consumer");
}

#[tokio::test]
async fn test_domain_type_mismatch_sends_no_bytes() {
    let adapter = Arc::new(MockChannelAdapter::new());
    let bus = DomainBus::new(
        BusClient::new(
            adapter.clone(),
            Arc::new(ProstSerializer::new().with::<ReadingDto>()),
        ),
        Arc::new(reading_registry(&["seed.readings"], &[])),
        Arc::new(reading_mappers()),
    );

    let result = bus
        .publish(
            "seed.readings",
            &erase(Stranger),
            Stranger::TYPE_TAG,
            None,
            None,
        )
        .await;

    assert!(matches!(result, Err(BusError::TypeMismatch { .. })));
    assert_eq!(adapter.published_count().await, 0);
}

#[tokio::test]
async fn test_domain_request_reply() {
    let adapter = InProcessChannelAdapter::new();
    let registry = Arc::new(reading_registry(&["seed.ask", "seed.answer"], &[]));
    let requests = DomainRequestService::new(
        RequestService::new(client(&adapter)),
        registry,
        Arc::new(reading_mappers()),
    );

    let _listener = requests
        .listen_typed::<Reading, Reading, _, _>(
            "seed.ask",
            "seed.answer",
            |request| async move {
                let request = request.payload.expect("request payload");
                Ok(Some(Reading {
                    value: request.value * 2,
                    label: format!("{} doubled", request.label),
                }))
            },
            None,
        )
        .await
        .expect("Failed to listen");

    let response = requests
        .request_typed::<Reading, Reading>(
            Some(Reading {
                value: 21,
                label: "half".to_string(),
            }),
            "seed.ask",
            "seed.answer",
            None,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("Request failed");

    let reading = response.payload.expect("response payload");
    assert_eq!(reading.value, 42);
    assert_eq!(reading.label, "half doubled");
}
