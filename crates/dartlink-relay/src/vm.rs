//! Thin helpers for talking to a Dart VM Service endpoint through an
//! [`RpcClient`]. Extension payloads stay opaque; only the isolate plumbing
//! is interpreted.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{ClientEvent, RpcClient};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct IsolateRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "isSystemIsolate", default)]
    pub is_system_isolate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub isolates: Vec<IsolateRef>,
}

/// Merge `isolateId` into an opaque argument object, as service-extension
/// calls require.
pub fn extension_params(isolate_id: &str, args: Value) -> Value {
    match args {
        Value::Object(mut map) => {
            map.insert(
                "isolateId".to_string(),
                Value::String(isolate_id.to_string()),
            );
            Value::Object(map)
        }
        Value::Null => serde_json::json!({"isolateId": isolate_id}),
        other => serde_json::json!({"isolateId": isolate_id, "args": other}),
    }
}

/// Tracks the debugged app's main isolate across hot restarts.
///
/// The id is cached after the first `getVM` round trip and dropped whenever
/// the underlying connection is re-established, since a restarted VM hands
/// out fresh isolate ids.
pub struct IsolateTracker {
    client: RpcClient,
    cache: Arc<Mutex<Option<String>>>,
}

impl IsolateTracker {
    pub fn new(client: RpcClient) -> Self {
        let cache: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        {
            let cache = cache.clone();
            let mut events = client.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if matches!(event, ClientEvent::Connected) {
                        let mut guard = cache.lock().await;
                        if guard.take().is_some() {
                            debug!("cleared isolate id cache after reconnect");
                        }
                    }
                }
            });
        }

        Self { client, cache }
    }

    /// The main isolate id, discovering it via `getVM` when not cached.
    pub async fn main_isolate_id(&self) -> Result<String> {
        {
            let cache = self.cache.lock().await;
            if let Some(id) = cache.as_ref() {
                return Ok(id.clone());
            }
        }

        let result = self.client.call_method("getVM", None).await?;
        let vm: VmInfo = serde_json::from_value(result)?;
        let isolate = vm
            .isolates
            .iter()
            .find(|iso| !iso.is_system_isolate.unwrap_or(false))
            .ok_or_else(|| Error::Connection("no non-system isolate found".to_string()))?;

        let mut cache = self.cache.lock().await;
        *cache = Some(isolate.id.clone());
        debug!("cached main isolate id {}", isolate.id);
        Ok(isolate.id.clone())
    }

    /// Drop the cached id so the next call re-discovers it.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        *cache = None;
    }

    /// Call a service extension on the main isolate, with an optional
    /// deadline.
    pub async fn call_extension(
        &self,
        method: &str,
        args: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let isolate_id = self.main_isolate_id().await?;
        let params = extension_params(&isolate_id, args);
        self.client
            .call_method_with_timeout(method, Some(params), deadline)
            .await
    }
}
