//! # Locked-BTC Selection
//!
//! Walks the vault's transaction history backwards from the current NFT,
//! collecting unspent relocked outputs until a requested amount is covered.
//! The walk stops at the first historical state the next cosigner set can
//! no longer unlock, since everything older is locked under states with
//! even less overlap.

use log::debug;

use crate::config::vault::MIN_LOCKABLE_SATS;
use crate::context::Context;
use crate::error::{VaultError, VaultResult};
use crate::taproot::grail_address;
use crate::types::{tx_from_bytes, GrailState, Utxo};

/// Collect unspent vault-locked outputs worth at least `min_amount` plus a
/// relock margin, newest first, starting from the transaction holding the
/// current vault NFT.
///
/// Output 0 of every vault transaction is the NFT itself and is never
/// selected. Outputs below [`MIN_LOCKABLE_SATS`] are skipped.
pub async fn find_locked_btc_utxos(
    context: &Context,
    last_vault_txid: &str,
    min_amount: u64,
    next_state: &GrailState,
) -> VaultResult<Vec<Utxo>> {
    let target = min_amount.saturating_add(MIN_LOCKABLE_SATS);
    let mut selected: Vec<Utxo> = Vec::new();
    let mut total: u64 = 0;
    let mut txid = last_vault_txid.to_string();
    let mut depth = 0u32;

    loop {
        depth += 1;
        let tx_bytes = match context.chain.get_transaction_bytes(&txid) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!("History walk reached an unknown transaction at depth {depth}");
                break;
            }
        };
        let state = match context
            .prover
            .show_spell(&hex::encode(&tx_bytes), &[])
            .await
            .and_then(|metadata| metadata.grail_state())
        {
            Ok(state) => state,
            Err(_) => {
                debug!("No vault state at {txid}, history walk ends at depth {depth}");
                break;
            }
        };
        if !state.spendable_by(next_state) {
            debug!(
                "Vault state at {txid} is not spendable by the next cosigner set, \
                 stopping at depth {depth}"
            );
            break;
        }

        let locked_spk = grail_address(&state, context.network)?.script_pubkey();
        let tx = tx_from_bytes(&tx_bytes)?;
        for (vout, output) in tx.output.iter().enumerate().skip(1) {
            let value = output.value.to_sat();
            if output.script_pubkey != locked_spk || value < MIN_LOCKABLE_SATS {
                continue;
            }
            if !context.chain.is_utxo_unspent(&txid, vout as u32)? {
                continue;
            }
            debug!("Selected locked output {txid}:{vout} ({value} sats)");
            total += value;
            selected.push(Utxo {
                txid: txid.clone(),
                vout: vout as u32,
                value: Some(value),
            });
            if total >= target {
                return Ok(selected);
            }
        }

        // Input 0 of every vault transaction spends the previous NFT.
        let Some(parent) = tx.input.first() else {
            break;
        };
        txid = parent.previous_output.txid.to_string();
    }

    Err(VaultError::InsufficientLockedBtc {
        required: min_amount,
        available: total,
    })
}
