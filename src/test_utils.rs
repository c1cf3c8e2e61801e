//! Test utilities and mock implementations.
//!
//! Sample dto/domain/mapper types plus a recording channel adapter, for
//! exercising the bus without a broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::adapter::{ChannelAdapter, DeliveryHandler, Subscription};
use crate::error::{BusError, Result};
use crate::mapper::{FnMapper, MapperTable};
use crate::registry::{MapRegistration, Registry, SubjectRegistration};
use crate::types::{TypeTag, TypeTagged};

// ============================================================================
// Sample types
// ============================================================================

/// Wire representation of a reading.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadingDto {
    #[prost(int64, tag = "1")]
    pub value: i64,
    #[prost(string, tag = "2")]
    pub label: String,
}

impl TypeTagged for ReadingDto {
    const TYPE_TAG: TypeTag = TypeTag::new("computer.bus.test.ReadingDto");
}

/// A second, unrelated wire type.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OtherDto {
    #[prost(string, tag = "1")]
    pub note: String,
}

impl TypeTagged for OtherDto {
    const TYPE_TAG: TypeTag = TypeTag::new("computer.bus.test.OtherDto");
}

/// Domain representation of a reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub value: i64,
    pub label: String,
}

impl TypeTagged for Reading {
    const TYPE_TAG: TypeTag = TypeTag::new("computer.bus.test.Reading");
}

/// Domain type with no registration anywhere.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stranger;

impl TypeTagged for Stranger {
    const TYPE_TAG: TypeTag = TypeTag::new("computer.bus.test.Stranger");
}

pub const READING_MAPPER: TypeTag = TypeTag::new("computer.bus.test.ReadingMapper");

/// Mapper between [`Reading`] and [`ReadingDto`].
///
/// Refuses to map readings labelled `"unmappable"`.
pub fn reading_mapper() -> FnMapper<Reading, ReadingDto> {
    FnMapper::new(
        |r: &Reading| {
            (r.label != "unmappable").then(|| ReadingDto {
                value: r.value,
                label: r.label.clone(),
            })
        },
        |d: &ReadingDto| {
            Some(Reading {
                value: d.value,
                label: d.label.clone(),
            })
        },
    )
}

/// Registry with `subjects` bound to the reading types plus one untyped
/// subject per name in `signals`.
pub fn reading_registry(subjects: &[&str], signals: &[&str]) -> Registry {
    let mut registrations: Vec<SubjectRegistration> = subjects
        .iter()
        .map(|s| SubjectRegistration::typed(*s, ReadingDto::TYPE_TAG))
        .collect();
    registrations.extend(signals.iter().map(|s| SubjectRegistration::signal(*s)));

    Registry::register(
        registrations,
        vec![MapRegistration::new(
            Reading::TYPE_TAG,
            ReadingDto::TYPE_TAG,
            READING_MAPPER,
        )],
    )
    .expect("valid test registry")
}

pub fn reading_mappers() -> MapperTable {
    MapperTable::new().with(READING_MAPPER, reading_mapper())
}

// ============================================================================
// Mock adapter
// ============================================================================

/// Channel adapter that records publishes and refuses subscriptions.
#[derive(Default)]
pub struct MockChannelAdapter {
    published: RwLock<Vec<(String, Option<Bytes>)>>,
    fail_on_publish: RwLock<bool>,
}

impl MockChannelAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<(String, Option<Bytes>)> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl ChannelAdapter for MockChannelAdapter {
    async fn publish(&self, subject: &str, body: Option<Bytes>) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Transport("mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((subject.to_string(), body));
        Ok(())
    }

    async fn subscribe(
        &self,
        _subject: &str,
        _handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        Err(BusError::Transport("mock adapter does not subscribe".to_string()))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Delivery handler that counts calls and fails the first `failures` of them.
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
    failures: usize,
    error: BusError,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::failing(0, BusError::handler("unused"))
    }

    pub fn failing(failures: usize, error: BusError) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            failures,
            error,
        }
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl Default for CountingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryHandler for CountingHandler {
    fn handle(&self, _body: Bytes) -> BoxFuture<'static, Result<()>> {
        let seen = self.count.fetch_add(1, Ordering::SeqCst);
        let result = if seen < self.failures {
            Err(self.error.clone())
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
