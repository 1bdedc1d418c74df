//! # Operation Context
//!
//! Bundles the deployed app identity, the network, the session-ephemeral
//! fee-bump secret and the service handles every transition build needs.
//! Services are trait objects so tests can substitute in-memory fakes.

use std::sync::Arc;

use bitcoin::Network;
use log::{info, warn};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};
use crate::services::{BitcoinRpcClient, CharmsProver, ChainClient, SpellProver};
use crate::spell::SpellMetadata;
use crate::types::Utxo;

/// Inputs for building a [`Context`]. `app_id`/`app_vk` may be omitted where
/// a constructor can derive or fetch them.
pub struct ContextParams {
    pub charms_bin: String,
    pub zkapp_bin: String,
    pub app_id: Option<String>,
    pub app_vk: Option<String>,
    pub ticker: String,
    pub network: Network,
    pub mock_proof: bool,
    /// Override the chain client, primarily for tests
    pub chain: Option<Arc<dyn ChainClient>>,
    /// Override the prover, primarily for tests
    pub prover: Option<Arc<dyn SpellProver>>,
}

/// Everything a vault operation runs against
pub struct Context {
    pub app_id: String,
    pub app_vk: String,
    pub ticker: String,
    pub network: Network,
    /// Session-ephemeral secret re-signing the fee-bump commitment input
    pub temporary_secret: [u8; 32],
    pub chain: Arc<dyn ChainClient>,
    pub prover: Arc<dyn SpellProver>,
}

impl Context {
    pub async fn create(params: ContextParams) -> VaultResult<Self> {
        let app_id = params
            .app_id
            .ok_or_else(|| VaultError::operation("create_context", "app id is required"))?;
        if params.ticker.is_empty() {
            return Err(VaultError::operation("create_context", "ticker is required"));
        }
        info!("App ID: {app_id}");

        let prover: Arc<dyn SpellProver> = match params.prover {
            Some(prover) => prover,
            None => Arc::new(CharmsProver::new(
                params.charms_bin,
                params.zkapp_bin,
                params.mock_proof,
            )),
        };
        let app_vk = match params.app_vk {
            Some(vk) => vk,
            None => {
                warn!("App VK not provided, retrieving it from the prover");
                prover.verification_key().await?
            }
        };
        info!("App verification key: {app_vk}");

        let chain: Arc<dyn ChainClient> = match params.chain {
            Some(chain) => chain,
            None => Arc::new(BitcoinRpcClient::new()?),
        };

        let mut temporary_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut temporary_secret);

        Ok(Context {
            app_id,
            app_vk,
            ticker: params.ticker,
            network: params.network,
            temporary_secret,
            chain,
            prover,
        })
    }

    /// Build a context for deploying a fresh vault: the app id is the hash
    /// of the funding UTXO id, making every deployment unique.
    pub async fn create_for_deploy(
        mut params: ContextParams,
        funding_utxo: &Utxo,
    ) -> VaultResult<Self> {
        let digest = Sha256::digest(funding_utxo.utxo_id().as_bytes());
        params.app_id = Some(hex::encode(digest));
        Self::create(params).await
    }

    /// Fetch a transaction and read its embedded metadata back
    pub async fn show_spell_by_txid(&self, txid: &str) -> VaultResult<SpellMetadata> {
        let tx_bytes = self.chain.get_transaction_bytes(txid)?;
        self.prover.show_spell(&hex::encode(tx_bytes), &[]).await
    }
}
