//! # Configuration Constants
//!
//! This module contains only the configuration values that are actually used
//! throughout the grail vault system.

/// Network and RPC configuration
pub mod network {
    use std::time::Duration;

    /// Default Bitcoin node RPC URL (regtest)
    pub const DEFAULT_RPC_URL: &str = "http://localhost:18443";

    /// Default RPC username
    pub const DEFAULT_RPC_USER: &str = "bitcoin";

    /// Default RPC password
    pub const DEFAULT_RPC_PASSWORD: &str = "1234";

    /// Default wallet name for funding and signing operations
    pub const DEFAULT_WALLET_NAME: &str = "default";

    /// Request timeout for RPC operations
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Vault operation constants
///
/// These constants define the economic parameters for vault transitions.
pub mod vault {
    /// Network dust limit in satoshis. No outgoing user leg (BTC or charms)
    /// may be below this value.
    pub const DUST_LIMIT: u64 = 546;

    /// Minimum amount worth relocking into a new vault output (the P2TR
    /// dust bound). A computed relock amount at or below this threshold is
    /// absorbed into network fees instead of creating a sub-threshold
    /// output; the locked-BTC selector ignores historical outputs below it
    /// and uses it as the safety margin on top of the requested amount.
    pub const MIN_LOCKABLE_SATS: u64 = 330;

    /// Minimum value of a wallet UTXO acceptable for funding the fee-bump
    /// commitment transaction.
    pub const MIN_FUNDING_SATS: u64 = 10_000;

    /// Transition description document version understood by the prover.
    pub const SPELL_VERSION: u32 = 4;
}

/// Spell document labels
///
/// Short labels name the apps inside a transition description; the prover's
/// show-spell output uses the expanded four-digit forms.
pub mod labels {
    /// NFT (vault state) app label in a transition description
    pub const APP_NFT: &str = "$00";

    /// Token (charms) app label in a transition description
    pub const APP_TOKEN: &str = "$01";

    /// NFT charm key in show-spell metadata
    pub const CHARM_NFT: &str = "$0000";

    /// Token charm key in show-spell metadata
    pub const CHARM_TOKEN: &str = "$0001";
}

/// Environment variable names
pub mod env {
    /// Bitcoin node RPC URL override
    pub const BTC_NODE_URL: &str = "BTC_NODE_URL";

    /// Bitcoin node RPC username override
    pub const BTC_NODE_USERNAME: &str = "BTC_NODE_USERNAME";

    /// Bitcoin node RPC password override
    pub const BTC_NODE_PASSWORD: &str = "BTC_NODE_PASSWORD";

    /// Wallet name override
    pub const BTC_WALLET_NAME: &str = "BTC_WALLET_NAME";

    /// Path to the charms prover binary
    pub const CHARMS_BIN: &str = "CHARMS_BIN";

    /// Path to the compiled zkapp binary handed to the prover
    pub const ZKAPP_BIN: &str = "ZKAPP_BIN";
}
