use super::*;
use crate::adapter::InProcessChannelAdapter;
use crate::codec::ProstSerializer;
use crate::test_utils::{wait_until, MockChannelAdapter, OtherDto, ReadingDto};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn serializer() -> Arc<dyn Serializer> {
    Arc::new(ProstSerializer::new().with::<ReadingDto>().with::<OtherDto>())
}

fn in_process_client() -> (BusClient, InProcessChannelAdapter) {
    let adapter = InProcessChannelAdapter::with_settings(
        crate::adapter::DEFAULT_ROUTING_PREFIX,
        Duration::from_millis(5),
    );
    (
        BusClient::new(Arc::new(adapter.clone()), serializer()),
        adapter,
    )
}

fn collecting_errors() -> (ErrorCallback, Arc<Mutex<Vec<DeliveryFailure>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let callback: ErrorCallback = Arc::new(move |failure: DeliveryFailure| sink.lock().unwrap().push(failure));
    (callback, failures)
}

#[tokio::test]
async fn test_publish_generates_missing_ids() {
    let adapter = Arc::new(MockChannelAdapter::new());
    let client = BusClient::new(adapter.clone(), serializer());

    let published = client.publish_signal("ping", None, None).await.unwrap();
    assert!(!published.event_id.is_empty());
    assert!(!published.correlation_id.is_empty());
    assert_ne!(published.event_id, published.correlation_id);

    let sent = adapter.take_published().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "ping");

    let event = serializer()
        .deserialize(sent[0].1.as_ref().unwrap(), None)
        .unwrap();
    assert_eq!(event.event_id, published.event_id);
    assert_eq!(event.correlation_id, published.correlation_id);
}

#[tokio::test]
async fn test_publish_keeps_given_ids() {
    let adapter = Arc::new(MockChannelAdapter::new());
    let client = BusClient::new(adapter.clone(), serializer());

    let published = client
        .publish_typed(
            "readings",
            Some(ReadingDto {
                value: 3,
                label: "three".to_string(),
            }),
            Some("evt-1"),
            Some("cor-1"),
        )
        .await
        .unwrap();

    assert_eq!(published.event_id, "evt-1");
    assert_eq!(published.correlation_id, "cor-1");
    assert_eq!(adapter.published_count().await, 1);
}

#[tokio::test]
async fn test_publish_transport_failure_is_value() {
    let adapter = Arc::new(MockChannelAdapter::new());
    adapter.set_fail_on_publish(true).await;
    let client = BusClient::new(adapter.clone(), serializer());

    let err = client.publish_signal("ping", None, None).await.unwrap_err();
    assert!(matches!(err, BusError::Transport(_)));
}

#[tokio::test]
async fn test_publish_unregistered_type_sends_nothing() {
    #[derive(Debug)]
    struct Unknown;
    impl TypeTagged for Unknown {
        const TYPE_TAG: TypeTag = TypeTag::new("computer.bus.test.Unknown");
    }

    let adapter = Arc::new(MockChannelAdapter::new());
    let client = BusClient::new(adapter.clone(), serializer());

    let err = client
        .publish_typed("x", Some(Unknown), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Serialization(_)));
    assert_eq!(adapter.published_count().await, 0);
}

#[tokio::test]
async fn test_typed_subscribe_receives_payload() {
    let (client, _adapter) = in_process_client();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let _sub = client
        .subscribe_typed::<ReadingDto, _, _>(
            "readings",
            move |event| {
                let value = event.payload.map(|p| p.value);
                sink.lock().unwrap().push((value, event.correlation_id));
                async { Ok(()) }
            },
            None,
        )
        .await
        .unwrap();

    client
        .publish_typed(
            "readings",
            Some(ReadingDto {
                value: 42,
                label: "answer".to_string(),
            }),
            None,
            Some("cor-42"),
        )
        .await
        .unwrap();

    assert!(wait_until(WAIT, || received.lock().unwrap().len() == 1).await);
    assert_eq!(
        received.lock().unwrap()[0],
        (Some(42), "cor-42".to_string())
    );
}

#[tokio::test]
async fn test_typed_subscribe_null_payload() {
    let (client, _adapter) = in_process_client();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let _sub = client
        .subscribe_typed::<ReadingDto, _, _>(
            "readings",
            move |event| {
                sink.lock().unwrap().push(event.payload.is_none());
                async { Ok(()) }
            },
            None,
        )
        .await
        .unwrap();

    client
        .publish_typed::<ReadingDto>("readings", None, None, None)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || received.lock().unwrap().len() == 1).await);
    assert!(received.lock().unwrap()[0]);
}

#[tokio::test]
async fn test_signal_subscribe() {
    let (client, _adapter) = in_process_client();
    let ids = Arc::new(Mutex::new(Vec::new()));
    let sink = ids.clone();

    let _sub = client
        .subscribe_signal(
            "ping",
            move |event_id, correlation_id| {
                sink.lock().unwrap().push((event_id, correlation_id));
                async { Ok(()) }
            },
            None,
        )
        .await
        .unwrap();

    client
        .publish_signal("ping", Some("e"), Some("c"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || ids.lock().unwrap().len() == 1).await);
    assert_eq!(ids.lock().unwrap()[0], ("e".to_string(), "c".to_string()));
}

#[tokio::test]
async fn test_malformed_delivery_reported_not_delivered() {
    let (client, adapter) = in_process_client();
    let (on_error, failures) = collecting_errors();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let _sub = client
        .subscribe(
            "readings",
            ReadingDto::TYPE_TAG,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            Some(on_error),
        )
        .await
        .unwrap();

    adapter
        .publish("readings", Some(Bytes::from_static(&[0xff, 0xff, 0xff])))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || failures.lock().unwrap().len() == 1).await);
    let failure = failures.lock().unwrap()[0].clone();
    assert_eq!(failure.subject, "readings");
    assert_eq!(failure.type_tag, Some(ReadingDto::TYPE_TAG));
    assert!(matches!(failure.error, BusError::MalformedEnvelope(_)));
    assert_eq!(failure.raw.as_deref(), Some(&[0xff, 0xff, 0xff][..]));

    // Rejected, so never redelivered
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(failures.lock().unwrap().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_typed_event_downcast_mismatch() {
    let event = BusEvent {
        payload: Some(erase(ReadingDto::default())),
        type_tag: Some(ReadingDto::TYPE_TAG),
        event_id: "e".to_string(),
        correlation_id: "c".to_string(),
    };

    let err = TypedEvent::<OtherDto>::from_event(event).unwrap_err();
    assert!(matches!(err, BusError::TypeMismatch { expected, .. } if expected == OtherDto::TYPE_TAG));
}

#[tokio::test]
async fn test_handler_fault_reported_and_redelivered() {
    let (client, _adapter) = in_process_client();
    let (on_error, failures) = collecting_errors();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let _sub = client
        .subscribe_signal(
            "flaky",
            move |_, _| {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if seen == 0 {
                        Err(BusError::handler("first attempt fails"))
                    } else {
                        Ok(())
                    }
                }
            },
            Some(on_error),
        )
        .await
        .unwrap();

    let published = client.publish_signal("flaky", None, None).await.unwrap();

    assert!(wait_until(WAIT, || calls.load(Ordering::SeqCst) == 2).await);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason(), "handler failed: first attempt fails");
    assert_eq!(failures[0].event_id.as_deref(), Some(published.event_id.as_str()));
}

#[tokio::test]
async fn test_each_subscriber_gets_each_publish() {
    let (client, _adapter) = in_process_client();
    let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let mut subs = Vec::new();
    for count in &counts {
        let count = count.clone();
        subs.push(
            client
                .subscribe_signal(
                    "broadcast",
                    move |_, _| {
                        count.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    },
                    None,
                )
                .await
                .unwrap(),
        );
    }

    for _ in 0..5 {
        client.publish_signal("broadcast", None, None).await.unwrap();
    }

    assert!(
        wait_until(WAIT, || counts
            .iter()
            .all(|c| c.load(Ordering::SeqCst) == 5))
        .await
    );
}
