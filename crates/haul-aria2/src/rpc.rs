//! JSON-RPC transport to the aria2 daemon.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RpcError, RpcResult};

/// Minimal call surface the engine needs from the daemon.
#[async_trait]
pub trait Aria2Rpc: Send + Sync {
    /// Invoke `method` with positional `params`. Authentication is added by the
    /// transport.
    async fn call(&self, method: &'static str, params: Vec<Value>) -> RpcResult<Value>;

    /// Drop any broken connection and dial again.
    async fn reconnect(&self) -> RpcResult<()> {
        Ok(())
    }
}

/// Call `method` and decode the result into `T`.
pub(crate) async fn call_as<T: DeserializeOwned>(
    rpc: &dyn Aria2Rpc,
    method: &'static str,
    params: Vec<Value>,
) -> RpcResult<T> {
    let value = rpc.call(method, params).await?;
    serde_json::from_value(value).map_err(|source| RpcError::Decode { method, source })
}

/// WebSocket transport built on `jsonrpsee`.
pub struct WsRpc {
    url: String,
    secret: Option<String>,
    timeout: Duration,
    client: RwLock<Option<Arc<WsClient>>>,
}

impl WsRpc {
    /// Create a transport; the connection is dialled lazily on first use.
    #[must_use]
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            secret: secret.filter(|value| !value.is_empty()),
            timeout,
            client: RwLock::new(None),
        }
    }

    async fn dial(&self) -> RpcResult<Arc<WsClient>> {
        let client = WsClientBuilder::default()
            .request_timeout(self.timeout)
            .connection_timeout(self.timeout)
            .build(&self.url)
            .await
            .map_err(|source| RpcError::Connect {
                url: self.url.clone(),
                source,
            })?;
        info!(url = %self.url, "connected to aria2 rpc");
        Ok(Arc::new(client))
    }

    async fn connected(&self) -> RpcResult<Arc<WsClient>> {
        if let Some(client) = self.client.read().await.as_ref() {
            if client.is_connected() {
                return Ok(Arc::clone(client));
            }
        }
        let mut slot = self.client.write().await;
        if let Some(client) = slot.as_ref() {
            if client.is_connected() {
                return Ok(Arc::clone(client));
            }
        }
        let client = self.dial().await?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    fn params(&self, method: &'static str, params: Vec<Value>) -> RpcResult<ArrayParams> {
        let mut out = ArrayParams::new();
        if let Some(secret) = &self.secret {
            out.insert(format!("token:{secret}"))
                .map_err(|source| RpcError::Decode { method, source })?;
        }
        for param in params {
            out.insert(param)
                .map_err(|source| RpcError::Decode { method, source })?;
        }
        Ok(out)
    }
}

#[async_trait]
impl Aria2Rpc for WsRpc {
    async fn call(&self, method: &'static str, params: Vec<Value>) -> RpcResult<Value> {
        let client = self.connected().await?;
        let params = self.params(method, params)?;
        let response = tokio::time::timeout(
            self.timeout,
            client.request::<Value, _>(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?;
        match response {
            Ok(value) => Ok(value),
            Err(ClientError::Call(object)) => Err(RpcError::Daemon {
                method,
                code: object.code(),
                message: object.message().to_string(),
            }),
            Err(ClientError::RequestTimeout) => Err(RpcError::Timeout { method }),
            Err(source) => {
                if matches!(source, ClientError::RestartNeeded(_)) {
                    self.client.write().await.take();
                }
                Err(RpcError::Call { method, source })
            }
        }
    }

    async fn reconnect(&self) -> RpcResult<()> {
        let mut slot = self.client.write().await;
        slot.take();
        debug!(url = %self.url, "redialling aria2 rpc");
        *slot = Some(self.dial().await?);
        Ok(())
    }
}

/// Exponential delay between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8))
    }
}

impl Backoff {
    /// Backoff starting at `initial` and doubling up to `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call returns a doubled value.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Return to the initial delay after a success.
    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u128> = (0..8).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn secret_is_prepended_as_token() -> anyhow::Result<()> {
        let rpc = WsRpc::new("ws://127.0.0.1:1/jsonrpc", Some("s3cret".into()), Duration::from_secs(1));
        let params = rpc.params("aria2.tellActive", vec![Value::from("gid")])?;
        let rendered = jsonrpsee::core::traits::ToRpcParams::to_rpc_params(params)?
            .map(|raw| raw.get().to_string());
        assert_eq!(rendered.as_deref(), Some(r#"["token:s3cret","gid"]"#));
        Ok(())
    }

    #[test]
    fn blank_secret_is_ignored() -> anyhow::Result<()> {
        let rpc = WsRpc::new("ws://127.0.0.1:1/jsonrpc", Some(String::new()), Duration::from_secs(1));
        let params = rpc.params("aria2.getVersion", Vec::new())?;
        let rendered = jsonrpsee::core::traits::ToRpcParams::to_rpc_params(params)?;
        assert!(rendered.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_daemon_reports_connect_error() {
        let rpc = WsRpc::new("ws://127.0.0.1:1/jsonrpc", None, Duration::from_millis(200));
        let err = rpc
            .call("aria2.getVersion", Vec::new())
            .await
            .expect_err("nothing listens on port 1");
        assert!(matches!(
            err,
            RpcError::Connect { .. } | RpcError::Timeout { .. }
        ));
    }
}
