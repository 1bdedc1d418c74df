//! # Grail Vault: Bitcoin-Native Custodial Vault Library
//!
//! Core library for a threshold-multisig vault whose ownership lives in a
//! chain of Taproot-locked UTXOs. Each vault output embeds the current
//! cosigner set and threshold; transitions rotate cosigners, absorb user
//! deposits into charms, and redeem charms back into locked BTC.

pub mod config;
pub mod context;
pub mod error;
pub mod services;
pub mod spell;
pub mod taproot;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use context::{Context, ContextParams};
pub use error::{VaultError, VaultResult};
pub use types::{GeneralizedInfo, GrailState, Spell, TokenUtxo, UserPaymentDetails, Utxo};
pub use vault::{
    build_recovery_transaction, create_transition, deploy_vault, find_locked_btc_utxos,
    inject_signatures_into_spell, mint_charms, pegin, pegout, sign_as_cosigner, transfer_charms,
    transmit_spell, update_vault, TransitionResult,
};
