//! Process-local backend holding objects in a map. Used by tests and for
//! running the gateway without any storage service.

use super::{BackendError, BackendResult, ObjectBackend, ReadinessCheck};
use crate::models::object::{ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{
    collections::BTreeMap,
    io,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of storage operations served so far.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &ObjectKey, payload: ObjectPayload) -> BackendResult<()> {
        self.record_call();
        let object = StoredObject {
            bytes: payload.bytes,
            content_type: payload.content_type,
            last_modified: Utc::now(),
        };
        self.objects.write().await.insert(key.to_string(), object);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> BackendResult<ObjectDownload> {
        self.record_call();
        let object = self
            .objects
            .read()
            .await
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| BackendError::not_found(key))?;

        Ok(ObjectDownload {
            content_type: object.content_type,
            content_length: Some(object.bytes.len() as u64),
            body: stream::once(async move { Ok::<_, io::Error>(object.bytes) }).boxed(),
        })
    }

    async fn delete(&self, key: &ObjectKey) -> BackendResult<()> {
        self.record_call();
        match self.objects.write().await.remove(key.as_str()) {
            Some(_) => Ok(()),
            None => Err(BackendError::not_found(key)),
        }
    }

    async fn list(&self) -> BackendResult<Vec<ObjectSummary>> {
        self.record_call();
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                size: obj.bytes.len() as i64,
                last_modified: obj.last_modified,
            })
            .collect())
    }

    async fn check(&self) -> Vec<ReadinessCheck> {
        vec![ReadinessCheck::passed("memory")]
    }
}
