use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::chain::abi::{RawLog, classify_log, event_topic, format_quantity, parse_quantity};
use crate::chain::{ChainError, ChainLog, ChainSource};
use crate::config::ChainSyncTarget;

const MAX_LOGS_PER_FETCH: usize = 10_000;

/// JSON-RPC adapter for an Ethereum-compatible node, scoped to one contract.
#[derive(Clone)]
pub struct RpcChainClient {
    inner: HttpClient,
    contract_address: String,
    timeout: Duration,
}

impl RpcChainClient {
    pub fn new(target: &ChainSyncTarget, timeout: Duration) -> Result<Self, ChainError> {
        assert!(!target.rpc_url.is_empty(), "RPC endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(&target.rpc_url)
            .map_err(|err| {
                ChainError::Connection(format!(
                    "failed to build RPC client for {}: {err}",
                    target.rpc_url
                ))
            })?;

        Ok(Self {
            inner: client,
            contract_address: target.contract_address.clone(),
            timeout,
        })
    }

    /// Builds the client and verifies the node answers before handing it out.
    pub async fn connect(target: &ChainSyncTarget, timeout: Duration) -> Result<Self, ChainError> {
        let client = Self::new(target, timeout)?;
        let height = client.current_block_number().await?;
        info!(
            "Connected to chain node at height {height}, following contract {}",
            client.contract_address
        );
        Ok(client)
    }

    pub async fn is_connected(&self) -> bool {
        match self.call::<String>("eth_chainId", rpc_params![]).await {
            Ok(chain_id) => {
                debug!("Chain node reachable (chain id {chain_id})");
                true
            }
            Err(err) => {
                debug!("Chain node check failed: {err}");
                false
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<R>(&self, method: &'static str, params: ArrayParams) -> Result<R, ChainError>
    where
        R: DeserializeOwned,
    {
        self.inner
            .request(method, params)
            .await
            .map_err(|err| classify_error(method, err))
    }
}

#[async_trait]
impl ChainSource for RpcChainClient {
    async fn current_block_number(&self) -> Result<u64, ChainError> {
        let response: String = self.call("eth_blockNumber", rpc_params![]).await?;
        checked_height(parse_quantity(&response)?)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<i64, ChainError> {
        let response: Option<BlockHeader> = self
            .call(
                "eth_getBlockByNumber",
                rpc_params![format_quantity(block_number), false],
            )
            .await?;
        let header = response.ok_or(ChainError::BlockNotFound(block_number))?;
        let timestamp = parse_quantity(&header.timestamp)?;
        i64::try_from(timestamp).map_err(|_| ChainError::decode("block timestamp", "exceeds i64"))
    }

    async fn fetch_events(
        &self,
        event_name: &str,
        from_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError> {
        let topic = event_topic(event_name)?;
        let filter = json!({
            "fromBlock": format_quantity(from_block),
            "toBlock": "latest",
            "address": self.contract_address,
            "topics": [topic],
        });
        let logs: Vec<RawLog> = self.call("eth_getLogs", rpc_params![filter]).await?;
        if logs.len() > MAX_LOGS_PER_FETCH {
            warn!(
                "eth_getLogs returned {} entries from block {from_block}",
                logs.len()
            );
        }

        let mut entries = Vec::with_capacity(logs.len());
        for log in &logs {
            if !log.address.is_empty() && !log.address.eq_ignore_ascii_case(&self.contract_address)
            {
                warn!(
                    "Ignoring log from unexpected contract {} (tx {:?})",
                    log.address, log.transaction_hash
                );
                continue;
            }
            entries.extend(classify_log(log));
        }
        Ok(entries)
    }
}

/// Heights are stored as `BIGINT`.
fn checked_height(height: u64) -> Result<u64, ChainError> {
    if height > i64::MAX as u64 {
        return Err(ChainError::decode(
            "block height",
            format!("{height} exceeds storage bounds"),
        ));
    }
    Ok(height)
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: String,
}

fn classify_error(method: &'static str, err: ClientError) -> ChainError {
    match err {
        ClientError::Transport(inner) => {
            ChainError::Connection(format!("{method}: {inner}"))
        }
        ClientError::RequestTimeout => ChainError::Connection(format!("{method}: request timed out")),
        ClientError::RestartNeeded(inner) => ChainError::Connection(format!("{method}: {inner}")),
        other => ChainError::Rpc {
            method,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ChainSyncTarget {
        ChainSyncTarget {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string(),
        }
    }

    #[tokio::test]
    async fn builds_client_without_contacting_node() {
        let client =
            RpcChainClient::new(&target(), Duration::from_secs(5)).expect("client builds");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn timeouts_are_connection_errors() {
        assert!(matches!(
            classify_error("eth_blockNumber", ClientError::RequestTimeout),
            ChainError::Connection(_)
        ));
        assert!(matches!(
            classify_error("eth_getLogs", ClientError::Custom("bad filter".to_string())),
            ChainError::Rpc { method: "eth_getLogs", .. }
        ));
    }

    #[test]
    fn out_of_range_height_is_a_decode_error() {
        assert_eq!(checked_height(1_000).unwrap(), 1_000);
        assert_eq!(checked_height(i64::MAX as u64).unwrap(), i64::MAX as u64);
        assert!(matches!(
            checked_height(u64::MAX),
            Err(ChainError::Decode { what: "block height", .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_node_fails_to_connect() {
        let unreachable = ChainSyncTarget {
            rpc_url: "http://127.0.0.1:9".to_string(),
            ..target()
        };
        let result = RpcChainClient::connect(&unreachable, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
