//! computer-bus-probe: broker smoke test
//!
//! Connects to the configured broker, publishes a burst of parameterless
//! events to one subscriber and runs one request/reply round trip. Exits
//! non-zero if any event is lost or the reply does not arrive in time.
//!
//! ## Configuration
//! - COMPUTER_BUS_CONFIG / computer-bus.yaml / COMPUTER_BUS__*: bus config
//! - COMPUTER_BUS_PROBE_SUBJECT: subject to exercise (default: computer.bus.probe)
//! - COMPUTER_BUS_PROBE_COUNT: events to publish (default: 50)
//! - COMPUTER_BUS_PROBE_INTERVAL_MS: pause between publishes (default: 100)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use computer_bus::utils::bootstrap::init_tracing;
use computer_bus::{
    init_channel_adapter, BusClient, Config, ProstSerializer, Reply, RequestService, TypeTag,
};

const DEFAULT_SUBJECT: &str = "computer.bus.probe";
const DEFAULT_COUNT: usize = 50;
const DEFAULT_INTERVAL_MS: u64 = 100;

/// Payload-free marker type for the probe round trip.
const PROBE_SIGNAL: TypeTag = TypeTag::new("computer.bus.probe.Signal");

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let subject = std::env::var("COMPUTER_BUS_PROBE_SUBJECT")
        .unwrap_or_else(|_| DEFAULT_SUBJECT.to_string());
    let count = env_or("COMPUTER_BUS_PROBE_COUNT", DEFAULT_COUNT);
    let interval = Duration::from_millis(env_or("COMPUTER_BUS_PROBE_INTERVAL_MS", DEFAULT_INTERVAL_MS));

    let adapter = init_channel_adapter(&config.messaging).await?;
    let client = BusClient::new(adapter, Arc::new(ProstSerializer::new()));

    // Fan-in: one subscriber counts every publish
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let subscription = client
        .subscribe_signal(
            &subject,
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            None,
        )
        .await?;

    info!(subject = %subject, count, "Publishing probe events");
    for _ in 0..count {
        client.publish_signal(&subject, None, None).await?;
        tokio::time::sleep(interval).await;
    }

    let deadline = tokio::time::Instant::now() + config.request.timeout();
    while received.load(Ordering::SeqCst) < count && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    subscription.unsubscribe();

    let delivered = received.load(Ordering::SeqCst);
    info!(published = count, delivered, "Probe events delivered");

    // Request/reply round trip
    let requests = RequestService::new(client);
    let request_subject = format!("{}.request", subject);
    let response_subject = format!("{}.response", subject);
    let _listener = requests
        .listen(
            &request_subject,
            PROBE_SIGNAL,
            &response_subject,
            PROBE_SIGNAL,
            |_| async { Ok(Reply::empty(PROBE_SIGNAL)) },
            None,
        )
        .await?;

    let reply = requests
        .request_with_timeout(
            None,
            PROBE_SIGNAL,
            &request_subject,
            PROBE_SIGNAL,
            &response_subject,
            None,
            None,
            config.request.timeout(),
        )
        .await;

    match (&reply, delivered == count) {
        (Ok(event), true) => {
            info!(correlation_id = %event.correlation_id, "Probe passed");
            Ok(())
        }
        (Ok(_), false) => {
            error!(published = count, delivered, "Probe lost events");
            Err(format!("delivered {} of {} events", delivered, count).into())
        }
        (Err(e), _) => {
            error!(error = %e, "Probe request failed");
            Err(e.to_string().into())
        }
    }
}
