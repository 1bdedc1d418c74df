//! # Vault Transitions and Threshold Signing
//!
//! The transition builder, the cosigner signature protocol, the locked-BTC
//! selector over the vault's transaction history, and the high-level
//! deploy/update/peg operations.

pub mod operations;
pub mod selector;
pub mod signing;
pub mod transition;

pub use operations::{
    build_recovery_transaction, deploy_vault, find_user_payment_vout, mint_charms, pegin, pegout,
    previous_transactions_for_spell, transfer_charms, transmit_spell, update_vault,
};
pub use selector::find_locked_btc_utxos;
pub use signing::{
    filter_valid_cosigner_signatures, inject_signatures_into_spell, sign_as_cosigner,
};
pub use transition::{charms_amount_for_utxo, create_transition, TransitionResult};
