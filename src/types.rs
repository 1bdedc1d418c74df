//! # Core Data Model
//!
//! Shared types for vault states, UTXOs, transition requests and the
//! threshold-signature exchange. Transactions are carried as raw bytes and
//! txids as hex strings so the model stays independent of any one client
//! library; the builders decode with `bitcoin::consensus` where needed.

use std::collections::HashMap;

use bitcoin::consensus;
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// A plain transaction output reference, optionally annotated with its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

impl Utxo {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
            value: None,
        }
    }

    /// Parse a `txid:vout` identifier
    pub fn from_utxo_id(s: &str) -> VaultResult<Self> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or_else(|| VaultError::operation("parse_utxo_id", format!("invalid UTXO ID: {s}")))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|e| VaultError::operation("parse_utxo_id", e.to_string()))?;
        Ok(Self::new(txid, vout))
    }

    /// Format as a `txid:vout` identifier
    pub fn utxo_id(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// The cosigner set and threshold governing one vault output.
///
/// Public keys are hex-encoded 32-byte x-only keys. Callers may supply them
/// in any order; every script and address derivation sorts them first, so
/// the on-chain artifacts are independent of the supplied ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrailState {
    pub public_keys: Vec<String>,
    pub threshold: usize,
}

impl GrailState {
    pub fn new(public_keys: Vec<String>, threshold: usize) -> Self {
        Self {
            public_keys,
            threshold,
        }
    }

    /// Enforce `1 <= threshold <= public_keys.len()`
    pub fn validate(&self) -> VaultResult<()> {
        if self.threshold == 0 || self.threshold > self.public_keys.len() {
            return Err(VaultError::InvalidThreshold {
                threshold: self.threshold,
                cosigners: self.public_keys.len(),
            });
        }
        Ok(())
    }

    /// Public keys in the canonical (lexicographic) order used by scripts
    pub fn sorted_public_keys(&self) -> Vec<String> {
        let mut keys = self.public_keys.clone();
        keys.sort();
        keys
    }

    /// Whether an output locked under `self` can still be unlocked after
    /// rotating to `next`: at least `self.threshold` of our cosigners must
    /// survive into the next cosigner set.
    pub fn spendable_by(&self, next: &GrailState) -> bool {
        let surviving = self
            .public_keys
            .iter()
            .filter(|pk| next.public_keys.contains(pk))
            .count();
        surviving >= self.threshold
    }
}

/// A user payment locked under a two-leaf script: the vault spending path
/// plus a timelocked recovery path back to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPaymentDetails {
    pub recovery_public_key: String,
    pub timelock_blocks: u32,
    pub txid: String,
    pub vout: u32,
    pub grail_state: GrailState,
    pub user_wallet_address: String,
}

impl UserPaymentDetails {
    pub fn utxo(&self) -> Utxo {
        Utxo::new(self.txid.clone(), self.vout)
    }
}

/// An outgoing BTC or charms leg of a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outgoing {
    pub amount: u64,
    pub address: String,
}

/// Everything a generalized transition moves, besides the vault NFT itself.
///
/// `outgoing_grail_btc` is computed by the builder and must be left unset by
/// callers. `disable_sanity` skips the conservation checks (mint operations
/// intentionally create charms out of nothing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralizedInfo {
    pub incoming_user_btc: Vec<UserPaymentDetails>,
    pub incoming_grail_btc: Vec<Utxo>,
    pub incoming_user_charms: Vec<UserPaymentDetails>,
    pub outgoing_user_btc: Vec<Outgoing>,
    pub outgoing_user_charms: Vec<Outgoing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outgoing_grail_btc: Option<Outgoing>,
    #[serde(default)]
    pub disable_sanity: bool,
}

impl GeneralizedInfo {
    /// An empty transition: a pure cosigner-rotation update
    pub fn blank() -> Self {
        Self::default()
    }
}

/// A token-carrying UTXO with its tracked amount in satoshis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
}

/// The fee-bump commitment transaction and the main transition transaction
/// produced by the external prover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spell {
    pub commitment_tx_bytes: Vec<u8>,
    pub spell_tx_bytes: Vec<u8>,
}

/// Raw transaction bytes keyed by txid
pub type PreviousTransactions = HashMap<String, Vec<u8>>;

/// One input of a signature request: the input index, the grail state that
/// governs its spending script, and the committed tapleaf script bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequestInput {
    pub index: usize,
    pub state: GrailState,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

/// Everything a cosigner needs to produce its signatures for one spell
#[derive(Debug, Clone)]
pub struct SignatureRequest {
    pub transaction_bytes: Vec<u8>,
    pub previous_transactions: PreviousTransactions,
    pub inputs: Vec<SignatureRequestInput>,
}

/// One Schnorr signature for one spell input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub index: usize,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// All signatures produced by one cosigner key, one per request input
pub type CosignerSignatures = Vec<InputSignature>;

/// A cosigner's signatures labeled with its x-only public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub public_key: String,
    pub signatures: CosignerSignatures,
}

/// A Schnorr keypair held as hex strings for serialization compatibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// X-only public key (hex-encoded, 32 bytes)
    pub public_key: String,
    /// Secret key (hex-encoded, 32 bytes)
    pub private_key: String,
}

/// Decode raw transaction bytes
pub fn tx_from_bytes(bytes: &[u8]) -> VaultResult<Transaction> {
    consensus::deserialize(bytes).map_err(|e| VaultError::TxDecode {
        message: e.to_string(),
    })
}

/// Compute the txid of raw transaction bytes
pub fn tx_bytes_to_txid(bytes: &[u8]) -> VaultResult<String> {
    Ok(tx_from_bytes(bytes)?.compute_txid().to_string())
}

/// Hex (de)serialization for byte vectors inside serde structs
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
