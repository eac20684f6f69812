//! JSON-RPC client for the upstream node.
//!
//! Two HTTP clients are kept: a short-timeout one for ordinary calls and a
//! long-timeout one for long-poll `getblocktemplate`, so a blocking
//! long-poll can never starve the regular poll path.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::template::BlockTemplate;
use crate::tracing::prelude::*;

/// The node surface the job manager depends on. Abstracted so tests can
/// feed templates without a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_block_template(&self, longpoll_id: Option<&str>) -> Result<BlockTemplate>;

    /// `Ok(None)` means the node accepted the block; `Ok(Some(reason))`
    /// carries the node's rejection value.
    async fn submit_block(&self, block_hex: &str, work_id: Option<&str>) -> Result<Option<Value>>;

    async fn validate_address(&self, address: &str) -> Result<AddressInfo>;

    async fn get_mining_info(&self) -> Result<MiningInfo>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressInfo {
    pub isvalid: bool,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MiningInfo {
    #[serde(default)]
    pub pow_algo: Option<String>,
    #[serde(default)]
    pub algo: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub pow_algo_id: Option<Value>,
}

impl MiningInfo {
    pub fn pow_algo_name(&self) -> Option<&str> {
        [&self.pow_algo, &self.algo, &self.algorithm]
            .into_iter()
            .find_map(|f| f.as_deref().filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub struct NodeRpcClient {
    url: String,
    user: String,
    pass: String,
    client: reqwest::Client,
    longpoll_client: reqwest::Client,
    gbt_rules: Vec<String>,
    pow_algo: String,
    id_seq: AtomicU64,
}

impl NodeRpcClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.node.rpc_timeout_ms))
            .build()
            .map_err(|e| Error::Rpc(format!("building RPC client: {e}")))?;
        let longpoll_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.node.rpc_longpoll_timeout_ms,
            ))
            .build()
            .map_err(|e| Error::Rpc(format!("building longpoll RPC client: {e}")))?;

        Ok(Self {
            url: config.node.rpc_url(),
            user: config.node.rpc_user.clone(),
            pass: config.node.rpc_pass.clone(),
            client,
            longpoll_client,
            gbt_rules: config.jobs.gbt_rules.clone(),
            pow_algo: config.pool.pow_algo.clone(),
            id_seq: AtomicU64::new(0),
        })
    }

    async fn call(&self, method: &str, params: Value, longpoll: bool) -> Result<Value> {
        let id = self.id_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let client = if longpoll {
            &self.longpoll_client
        } else {
            &self.client
        };

        let response = client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: reading body: {e}")))?;
        if !status.is_success() {
            return Err(Error::Rpc(format!("{method}: HTTP {status}: {text}")));
        }

        let envelope: RpcEnvelope = serde_json::from_str(&text)
            .map_err(|e| Error::Rpc(format!("{method}: JSON parse failed: {e}")))?;
        if let Some(err) = envelope.error {
            if !err.is_null() {
                return Err(Error::Rpc(format!("{method}: {err}")));
            }
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodeClient for NodeRpcClient {
    async fn get_block_template(&self, longpoll_id: Option<&str>) -> Result<BlockTemplate> {
        let mut request = json!({
            "capabilities": ["coinbasevalue", "workid", "longpoll", "proposal"],
            "rules": self.gbt_rules,
            // Multi-algo nodes disagree on the field name; send all three.
            "algo": self.pow_algo,
            "pow_algo": self.pow_algo,
            "algorithm": self.pow_algo,
        });
        if let Some(id) = longpoll_id {
            request["longpollid"] = json!(id);
        }
        let result = self
            .call("getblocktemplate", json!([request]), longpoll_id.is_some())
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Template(format!("getblocktemplate result: {e}")))
    }

    async fn submit_block(&self, block_hex: &str, work_id: Option<&str>) -> Result<Option<Value>> {
        let params = match work_id {
            Some(id) => json!([block_hex, { "workid": id }]),
            None => json!([block_hex]),
        };
        let result = self.call("submitblock", params, false).await?;
        if result.is_null() {
            Ok(None)
        } else {
            Ok(Some(result))
        }
    }

    async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        let result = self.call("validateaddress", json!([address]), false).await?;
        serde_json::from_value(result).map_err(|e| {
            warn!(error = %e, "validateaddress returned an unexpected shape");
            Error::Rpc(format!("validateaddress result: {e}"))
        })
    }

    async fn get_mining_info(&self) -> Result<MiningInfo> {
        let result = self.call("getmininginfo", json!([]), false).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Rpc(format!("getmininginfo result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_error_detection() {
        let ok: RpcEnvelope = serde_json::from_str(r#"{"result": 5, "error": null}"#).unwrap();
        assert!(ok.error.as_ref().is_some_and(Value::is_null));
        assert_eq!(ok.result, Some(json!(5)));

        let err: RpcEnvelope =
            serde_json::from_str(r#"{"result": null, "error": {"code": -32600}}"#).unwrap();
        assert!(err.error.as_ref().is_some_and(|e| !e.is_null()));
    }

    #[test]
    fn mining_info_algo_aliases() {
        let info: MiningInfo =
            serde_json::from_str(r#"{"algorithm": "sha256d", "blocks": 100}"#).unwrap();
        assert_eq!(info.pow_algo_name(), Some("sha256d"));
        let info: MiningInfo = serde_json::from_str(r#"{"blocks": 100}"#).unwrap();
        assert_eq!(info.pow_algo_name(), None);
    }
}
