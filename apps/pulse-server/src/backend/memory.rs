use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{Backend, PushCallback, Subscription};
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// In-memory bucketed key/value store (binary default / tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KeyRequest {
    bucket: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    bucket: String,
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct BucketRequest {
    bucket: String,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, Value>>,
    /// bucket → (subscriber id → callback)
    subscribers: HashMap<String, HashMap<u64, PushCallback>>,
}

/// Minimal store backend: `get`, `set`, `delete`, `list` and bucket
/// subscriptions that push the whole bucket after every change.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_subscriber: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Number of live subscriptions across all buckets.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.values().map(HashMap::len).sum()
    }

    fn snapshot(inner: &Inner, bucket: &str) -> Value {
        let entries: Map<String, Value> = inner
            .buckets
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Value::Object(entries)
    }

    /// Push the current bucket snapshot to every subscriber. Callbacks run
    /// outside the lock.
    fn notify(&self, bucket: &str) {
        let (snapshot, callbacks) = {
            let inner = self.inner.lock();
            let callbacks: Vec<PushCallback> = inner
                .subscribers
                .get(bucket)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default();
            (Self::snapshot(&inner, bucket), callbacks)
        };
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn call(&self, operation: &str, request: &Value) -> Result<Value, GatewayError> {
        match operation {
            "get" => {
                let req: KeyRequest = serde_json::from_value(request.clone())?;
                let inner = self.inner.lock();
                Ok(inner
                    .buckets
                    .get(&req.bucket)
                    .and_then(|b| b.get(&req.key))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "set" => {
                let req: SetRequest = serde_json::from_value(request.clone())?;
                self.inner
                    .lock()
                    .buckets
                    .entry(req.bucket.clone())
                    .or_default()
                    .insert(req.key, req.value.clone());
                self.notify(&req.bucket);
                Ok(req.value)
            }
            "delete" => {
                let req: KeyRequest = serde_json::from_value(request.clone())?;
                let removed = self
                    .inner
                    .lock()
                    .buckets
                    .get_mut(&req.bucket)
                    .and_then(|b| b.remove(&req.key))
                    .is_some();
                if removed {
                    self.notify(&req.bucket);
                }
                Ok(serde_json::json!({ "deleted": removed }))
            }
            "list" => {
                let req: BucketRequest = serde_json::from_value(request.clone())?;
                Ok(Self::snapshot(&self.inner.lock(), &req.bucket))
            }
            other => Err(GatewayError::unknown_operation(&format!("store.{other}"))),
        }
    }

    async fn subscribe(
        &self,
        query: &str,
        _params: Option<&Value>,
        callback: PushCallback,
    ) -> Result<Subscription, GatewayError> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let bucket = query.to_string();

        let initial = {
            let mut inner = self.inner.lock();
            inner
                .subscribers
                .entry(bucket.clone())
                .or_default()
                .insert(id, callback);
            Self::snapshot(&inner, &bucket)
        };

        let inner = Arc::clone(&self.inner);
        Ok(Subscription {
            initial: Some(initial),
            unsubscribe: Box::new(move || {
                let mut inner = inner.lock();
                let removed = inner
                    .subscribers
                    .get_mut(&bucket)
                    .and_then(|subs| subs.remove(&id))
                    .is_some();
                if removed {
                    Ok(())
                } else {
                    Err(GatewayError::not_found("Subscription already released"))
                }
            }),
        })
    }
}
