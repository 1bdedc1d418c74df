//! # Error Types for the Grail Vault
//!
//! This module provides error handling for transition building, Taproot
//! construction, threshold signing and service communication. Every
//! validation failure is fatal to the current build and carries the
//! offending identifiers (txid, input index, address) so the caller can
//! decide whether to retry with different inputs.

use thiserror::Error;

/// Main error type for all vault-related operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// A referenced transaction could not be resolved
    #[error("Transaction not found: {txid}")]
    TransactionNotFound { txid: String },

    /// A UTXO references an output index past the end of its transaction
    #[error("Output index {vout} out of bounds for transaction {txid}")]
    OutputIndexOutOfBounds { txid: String, vout: u32 },

    /// Incoming/outgoing BTC and charms legs do not balance
    #[error("Conservation violation: {message}")]
    ConservationViolation { message: String },

    /// An outgoing amount is below the dust limit
    #[error("Outgoing amount for address {address} is below dust limit: {amount} < {limit}")]
    DustLimitViolation {
        address: String,
        amount: u64,
        limit: u64,
    },

    /// A grail state's threshold is outside `1..=public_keys.len()`
    #[error("Invalid threshold {threshold} for {cosigners} cosigners")]
    InvalidThreshold { threshold: usize, cosigners: usize },

    /// Fewer valid cosigner signatures than the governing threshold
    #[error("Not enough signatures for input {input_index}: required {required}, provided {provided}")]
    InsufficientSignatures {
        input_index: usize,
        required: usize,
        provided: usize,
    },

    /// One cosigner supplied more than one signature for the same input
    #[error("Multiple signatures for input {input_index} from cosigner {public_key}")]
    AmbiguousCosignerSignature {
        input_index: usize,
        public_key: String,
    },

    /// The vault history does not cover the requested payout amount
    #[error("Not enough locked BTC found: required {required} sats, available {available} sats")]
    InsufficientLockedBtc { required: u64, available: u64 },

    /// The fee-bump re-signature failed self-verification
    #[error("Temporary signature verification failed")]
    TemporarySignatureVerificationFailed,

    /// Invalid field element or point at infinity during tweak computation
    #[error("Cryptographic operation failed: {message}")]
    Crypto { message: String },

    /// Address parsing and validation errors
    #[error("Invalid address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    /// Transaction or script decoding failures
    #[error("Transaction decoding failed: {message}")]
    TxDecode { message: String },

    /// External prover subprocess failures and malformed prover output
    #[error("Prover error: {message}")]
    Prover { message: String },

    /// Bitcoin RPC communication failures
    #[error("RPC communication failed: {source}")]
    Rpc {
        #[from]
        source: bitcoincore_rpc::Error,
    },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Generic operation failures with context
    #[error("Operation failed: {operation} - {message}")]
    OperationFailed { operation: String, message: String },
}

/// Result type alias for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Create a cryptography error with a message
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a conservation violation with a message
    pub fn conservation(message: impl Into<String>) -> Self {
        Self::ConservationViolation {
            message: message.into(),
        }
    }

    /// Create a prover error with a message
    pub fn prover(message: impl Into<String>) -> Self {
        Self::Prover {
            message: message.into(),
        }
    }

    /// Create an operation failed error
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable (network/temporary issues)
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Rpc { .. })
    }

    /// Check if this error indicates internal corruption rather than bad input
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::Crypto { .. } | VaultError::TemporarySignatureVerificationFailed
        )
    }
}
