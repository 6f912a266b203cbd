use std::{collections::HashMap, time::Duration};

use {
    serde_json::Value,
    tokio::sync::{Mutex, oneshot},
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

type Waiter = oneshot::Sender<Result<Value>>;

/// Correlates outgoing requests with responses that arrive on the read loop.
///
/// A waiter is inserted before the request is sent and removed exactly once:
/// by [`CallBridge::resolve`], by timeout, by a failed send, or by
/// [`CallBridge::fail_all`] when the connection drops.
#[derive(Default)]
pub struct CallBridge {
    pending: Mutex<HashMap<String, Waiter>>,
}

impl CallBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request_id`, run `send`, then wait up to `timeout` for the response.
    pub async fn call<F>(&self, request_id: &str, timeout: Duration, send: F) -> Result<Value>
    where
        F: Future<Output = Result<()>>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(request_id) {
                return Err(Error::Protocol(format!(
                    "request id {request_id} is already in flight"
                )));
            }
            pending.insert(request_id.to_string(), tx);
        }

        if let Err(e) = send.await {
            self.pending.lock().await.remove(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(
                "connection closed while waiting for a response".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(request_id);
                debug!(request_id, "call timed out");
                Err(Error::CallTimeout {
                    request_id: request_id.to_string(),
                    timeout,
                })
            },
        }
    }

    /// Hand a response to its waiter. Returns `false` for unknown or
    /// already-settled request ids.
    pub async fn resolve(&self, request_id: &str, payload: Value) -> bool {
        let waiter = self.pending.lock().await.remove(request_id);
        match waiter {
            Some(tx) => tx.send(Ok(payload)).is_ok(),
            None => {
                warn!(request_id, "dropping response for unknown request");
                false
            },
        }
    }

    /// Fail every pending call with a connection error.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::Connection(reason.to_string())));
        }
        if count > 0 {
            warn!(count, reason, "failed pending calls");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
