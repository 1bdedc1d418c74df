use std::collections::HashMap;
use std::env;
use std::sync::Mutex;

use bitcoincore_rpc::{Auth, Client, RpcApi};
use log::{debug, info, warn};
use serde_json::Value;

use crate::config::{env as config_env, network, vault};
use crate::error::{VaultError, VaultResult};
use crate::types::{tx_from_bytes, PreviousTransactions, Utxo};

/// Chain access needed by the transition builders. Implemented by the
/// Bitcoin Core client below and by in-memory fakes in tests.
pub trait ChainClient: Send + Sync {
    /// Raw bytes of a confirmed or mempool transaction
    fn get_transaction_bytes(&self, txid: &str) -> VaultResult<Vec<u8>>;

    /// Whether `txid:vout` is still unspent
    fn is_utxo_unspent(&self, txid: &str, vout: u32) -> VaultResult<bool>;

    /// A fresh wallet address for change
    fn get_new_address(&self) -> VaultResult<String>;

    /// A spendable wallet UTXO large enough to fund a commitment transaction
    fn get_funding_utxo(&self) -> VaultResult<Utxo>;

    /// Wallet-sign a raw transaction, optionally with a named sighash type
    fn sign_transaction_with_wallet(
        &self,
        tx_bytes: &[u8],
        sighash_type: Option<&str>,
    ) -> VaultResult<Vec<u8>>;

    /// Broadcast raw transaction bytes, returning the txid
    fn send_raw_transaction(&self, tx_bytes: &[u8]) -> VaultResult<String>;

    /// Fetch several transactions, keyed by txid
    fn get_transactions_map(&self, txids: &[String]) -> VaultResult<PreviousTransactions> {
        let mut map = PreviousTransactions::new();
        for txid in txids {
            if !map.contains_key(txid) {
                map.insert(txid.clone(), self.get_transaction_bytes(txid)?);
            }
        }
        Ok(map)
    }
}

/// Process-lifetime cache of fetched transactions. Confirmed transactions
/// are immutable, so entries never need invalidation; the cache grows with
/// the set of distinct txids touched and is dropped with the client.
#[derive(Debug, Default)]
pub struct TxCache {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl TxCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, txid: &str) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.get(txid).cloned()
    }

    fn put(&self, txid: &str, bytes: Vec<u8>) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(txid.to_string(), bytes);
        }
    }
}

/// Bitcoin Core RPC client backing the [`ChainClient`] trait
pub struct BitcoinRpcClient {
    client: Client,
    cache: TxCache,
    wallet_name: String,
}

impl BitcoinRpcClient {
    /// Create a client from environment variables, falling back to the
    /// regtest defaults. Loads the wallet if it is not loaded yet.
    pub fn new() -> VaultResult<Self> {
        dotenv::dotenv().ok();

        let rpc_url = env::var(config_env::BTC_NODE_URL)
            .unwrap_or_else(|_| network::DEFAULT_RPC_URL.to_string());
        let rpc_user = env::var(config_env::BTC_NODE_USERNAME)
            .unwrap_or_else(|_| network::DEFAULT_RPC_USER.to_string());
        let rpc_password = env::var(config_env::BTC_NODE_PASSWORD)
            .unwrap_or_else(|_| network::DEFAULT_RPC_PASSWORD.to_string());
        let wallet_name = env::var(config_env::BTC_WALLET_NAME)
            .unwrap_or_else(|_| network::DEFAULT_WALLET_NAME.to_string());

        let auth = Auth::UserPass(rpc_user, rpc_password);
        let url = format!("{rpc_url}/wallet/{wallet_name}");
        let client = Client::new(&url, auth)?;

        let this = BitcoinRpcClient {
            client,
            cache: TxCache::new(),
            wallet_name,
        };
        this.ensure_wallet_loaded()?;
        Ok(this)
    }

    pub fn wallet_name(&self) -> &str {
        &self.wallet_name
    }

    fn ensure_wallet_loaded(&self) -> VaultResult<()> {
        match self
            .client
            .call::<Value>("loadwallet", &[self.wallet_name.clone().into()])
        {
            Ok(_) => {
                info!("Loaded wallet {}", self.wallet_name);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("already loaded") || msg.contains("Database already opened") {
                    debug!("Wallet {} already loaded", self.wallet_name);
                    Ok(())
                } else {
                    warn!("Could not load wallet {}: {msg}", self.wallet_name);
                    Err(VaultError::Rpc { source: e })
                }
            }
        }
    }
}

impl ChainClient for BitcoinRpcClient {
    fn get_transaction_bytes(&self, txid: &str) -> VaultResult<Vec<u8>> {
        if let Some(bytes) = self.cache.get(txid) {
            return Ok(bytes);
        }
        let hex = self
            .client
            .call::<String>("getrawtransaction", &[txid.into()])
            .map_err(|_| VaultError::TransactionNotFound {
                txid: txid.to_string(),
            })?;
        let bytes = hex::decode(&hex).map_err(|e| VaultError::TxDecode {
            message: e.to_string(),
        })?;
        self.cache.put(txid, bytes.clone());
        Ok(bytes)
    }

    fn is_utxo_unspent(&self, txid: &str, vout: u32) -> VaultResult<bool> {
        let result = self
            .client
            .call::<Value>("gettxout", &[txid.into(), vout.into()])?;
        Ok(!result.is_null())
    }

    fn get_new_address(&self) -> VaultResult<String> {
        Ok(self.client.call::<String>("getnewaddress", &[])?)
    }

    fn get_funding_utxo(&self) -> VaultResult<Utxo> {
        let unspent = self
            .client
            .call::<Vec<Value>>("listunspent", &[0.into(), 9_999_999.into()])?;
        for entry in unspent {
            let spendable = entry["spendable"].as_bool().unwrap_or(false);
            let sats = (entry["amount"].as_f64().unwrap_or(0.0) * 100_000_000.0).round() as u64;
            if spendable && sats >= vault::MIN_FUNDING_SATS {
                let txid = entry["txid"]
                    .as_str()
                    .ok_or_else(|| VaultError::operation("get_funding_utxo", "missing txid"))?
                    .to_string();
                let vout = entry["vout"].as_u64().unwrap_or(0) as u32;
                debug!("Selected funding UTXO {txid}:{vout} ({sats} sats)");
                return Ok(Utxo {
                    txid,
                    vout,
                    value: Some(sats),
                });
            }
        }
        Err(VaultError::operation(
            "get_funding_utxo",
            format!(
                "no spendable wallet UTXO of at least {} sats",
                vault::MIN_FUNDING_SATS
            ),
        ))
    }

    fn sign_transaction_with_wallet(
        &self,
        tx_bytes: &[u8],
        sighash_type: Option<&str>,
    ) -> VaultResult<Vec<u8>> {
        let mut params: Vec<Value> = vec![hex::encode(tx_bytes).into(), Value::Null];
        if let Some(sighash) = sighash_type {
            params.push(sighash.into());
        }
        let result = self
            .client
            .call::<Value>("signrawtransactionwithwallet", &params)?;
        let hex = result["hex"].as_str().ok_or_else(|| {
            VaultError::operation("sign_transaction", "wallet returned no hex")
        })?;
        hex::decode(hex).map_err(|e| VaultError::TxDecode {
            message: e.to_string(),
        })
    }

    fn send_raw_transaction(&self, tx_bytes: &[u8]) -> VaultResult<String> {
        // Validate locally before handing to the node.
        let tx = tx_from_bytes(tx_bytes)?;
        let txid = self
            .client
            .call::<String>("sendrawtransaction", &[hex::encode(tx_bytes).into()])?;
        debug!("Broadcast {} as {txid}", tx.compute_txid());
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_cache_roundtrip() {
        let cache = TxCache::new();
        assert!(cache.get("aa").is_none());
        cache.put("aa", vec![1, 2, 3]);
        assert_eq!(cache.get("aa"), Some(vec![1, 2, 3]));
        // Overwrites keep the latest bytes.
        cache.put("aa", vec![4]);
        assert_eq!(cache.get("aa"), Some(vec![4]));
    }
}
