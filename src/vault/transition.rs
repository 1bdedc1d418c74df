//! # Vault Transition Builder
//!
//! Assembles a generalized state transition: resolves the previous vault
//! state from chain metadata, computes the conserved relock amount, runs
//! the value-conservation sanity checks, hands the transition description
//! to the prover, stubs script-path witnesses onto the unsigned spell
//! transaction, and builds the matching [`SignatureRequest`].

use std::collections::HashMap;

use bitcoin::consensus;
use bitcoin::Transaction;
use log::{debug, info};

use crate::config::vault::{DUST_LIMIT, MIN_LOCKABLE_SATS};
use crate::context::Context;
use crate::error::{VaultError, VaultResult};
use crate::services::ProveRequest;
use crate::spell::{generalized_document, TransitionDocumentParams};
use crate::taproot::{grail_address, grail_spending_script, user_payment_scripts, SpendingScript};
use crate::types::{
    tx_bytes_to_txid, tx_from_bytes, GeneralizedInfo, GrailState, Outgoing, PreviousTransactions,
    SignatureRequest, SignatureRequestInput, Spell, Utxo,
};

/// A built transition: the unsigned transaction pair and the signature
/// request its cosigners must answer.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub spell: Spell,
    pub signature_request: SignatureRequest,
}

/// The BTC value of a referenced output, read from the lookup table
pub(crate) fn amount_from_utxo(
    previous: &PreviousTransactions,
    utxo: &Utxo,
) -> VaultResult<u64> {
    let bytes = previous
        .get(&utxo.txid)
        .ok_or_else(|| VaultError::TransactionNotFound {
            txid: utxo.txid.clone(),
        })?;
    let tx = tx_from_bytes(bytes)?;
    let out = tx
        .output
        .get(utxo.vout as usize)
        .ok_or(VaultError::OutputIndexOutOfBounds {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
        })?;
    Ok(out.value.to_sat())
}

/// The tracked token amount carried by a UTXO, via the prover's metadata
pub async fn charms_amount_for_utxo(context: &Context, utxo: &Utxo) -> VaultResult<u64> {
    let metadata = context.show_spell_by_txid(&utxo.txid).await?;
    metadata.charms_amount(utxo.vout)
}

/// BTC flowing in minus user BTC flowing out; the amount relocked under the
/// next vault state.
fn relock_amount(
    previous: &PreviousTransactions,
    info: &GeneralizedInfo,
) -> VaultResult<u64> {
    let mut incoming: i128 = 0;
    for payment in &info.incoming_user_btc {
        incoming += amount_from_utxo(previous, &payment.utxo())? as i128;
    }
    for utxo in &info.incoming_grail_btc {
        incoming += amount_from_utxo(previous, utxo)? as i128;
    }
    let outgoing: i128 = info
        .outgoing_user_btc
        .iter()
        .map(|o| o.amount as i128)
        .sum();
    let relock = incoming - outgoing;
    if relock < 0 {
        if info.disable_sanity {
            return Ok(0);
        }
        return Err(VaultError::conservation(format!(
            "outgoing BTC exceeds incoming by {} sats",
            -relock
        )));
    }
    let relock = relock as u64;
    // A sub-threshold remainder is ceded to fees instead of creating an
    // uneconomical vault output.
    if !info.disable_sanity && relock <= MIN_LOCKABLE_SATS {
        return Ok(0);
    }
    Ok(relock)
}

async fn sanity_check(
    context: &Context,
    previous: &PreviousTransactions,
    info: &GeneralizedInfo,
) -> VaultResult<()> {
    if info.outgoing_grail_btc.is_none() {
        return Err(VaultError::conservation(
            "relock output has not been computed",
        ));
    }

    // Every BTC payout is backed 1:1 by an incoming charm of equal amount.
    for outgoing in &info.outgoing_user_btc {
        let payment = info
            .incoming_user_charms
            .iter()
            .find(|p| p.user_wallet_address == outgoing.address)
            .ok_or_else(|| {
                VaultError::conservation(format!(
                    "outgoing BTC to {} not matched by incoming charms",
                    outgoing.address
                ))
            })?;
        let token_amount = charms_amount_for_utxo(context, &payment.utxo()).await?;
        if token_amount != outgoing.amount {
            return Err(VaultError::conservation(format!(
                "outgoing BTC amount {} does not match incoming charms {} for address {}",
                outgoing.amount, token_amount, outgoing.address
            )));
        }
    }

    // Every charm payout is backed 1:1 by incoming BTC of equal value.
    for outgoing in &info.outgoing_user_charms {
        let payment = info
            .incoming_user_btc
            .iter()
            .find(|p| p.user_wallet_address == outgoing.address)
            .ok_or_else(|| {
                VaultError::conservation(format!(
                    "outgoing charms to {} not matched by incoming BTC",
                    outgoing.address
                ))
            })?;
        let btc_amount = amount_from_utxo(previous, &payment.utxo())?;
        if btc_amount != outgoing.amount {
            return Err(VaultError::conservation(format!(
                "outgoing charms amount {} does not match incoming BTC {} for address {}",
                outgoing.amount, btc_amount, outgoing.address
            )));
        }
    }

    for outgoing in info
        .outgoing_user_btc
        .iter()
        .chain(info.outgoing_user_charms.iter())
    {
        if outgoing.amount < DUST_LIMIT {
            return Err(VaultError::DustLimitViolation {
                address: outgoing.address.clone(),
                amount: outgoing.amount,
                limit: DUST_LIMIT,
            });
        }
    }

    Ok(())
}

fn stub_witness(
    tx: &mut Transaction,
    index: usize,
    bundle: &SpendingScript,
) -> VaultResult<()> {
    let txin = tx.input.get_mut(index).ok_or_else(|| {
        VaultError::operation(
            "stub_witness",
            format!("input {index} not present in the spell transaction"),
        )
    })?;
    let mut witness = bitcoin::Witness::new();
    witness.push(bundle.script.as_bytes());
    witness.push(&bundle.control_block);
    txin.witness = witness;
    Ok(())
}

/// Build a generalized transition from the previous vault NFT to
/// `next_state`, moving the BTC and charm legs described by `info`.
///
/// `info.outgoing_grail_btc` must be unset; the relock output belongs to
/// the builder.
pub async fn create_transition(
    context: &Context,
    fee_rate: f64,
    previous_nft_txid: &str,
    next_state: &GrailState,
    mut info: GeneralizedInfo,
    funding_utxo: Option<Utxo>,
) -> VaultResult<TransitionResult> {
    next_state.validate()?;
    if info.outgoing_grail_btc.is_some() {
        return Err(VaultError::operation(
            "create_transition",
            "outgoing_grail_btc is computed by the builder and must not be supplied",
        ));
    }

    let mut all_txids: Vec<String> = vec![previous_nft_txid.to_string()];
    all_txids.extend(info.incoming_user_btc.iter().map(|p| p.txid.clone()));
    all_txids.extend(info.incoming_user_charms.iter().map(|p| p.txid.clone()));
    all_txids.extend(info.incoming_grail_btc.iter().map(|u| u.txid.clone()));
    let mut previous_transactions = context.chain.get_transactions_map(&all_txids)?;

    let next_address = grail_address(next_state, context.network)?.to_string();

    let relock = relock_amount(&previous_transactions, &info)?;
    debug!("Relocking {relock} sats under the next vault state");
    info.outgoing_grail_btc = Some(Outgoing {
        amount: relock,
        address: next_address.clone(),
    });

    if !info.disable_sanity {
        sanity_check(context, &previous_transactions, &info).await?;
    }

    let funding_change_address = context.chain.get_new_address()?;
    let funding_utxo = match funding_utxo {
        Some(utxo) => utxo,
        None => context.chain.get_funding_utxo()?,
    };

    let previous_state = context
        .show_spell_by_txid(previous_nft_txid)
        .await?
        .grail_state()?;
    info!(
        "Transitioning vault from {} cosigners (threshold {}) to {} cosigners (threshold {})",
        previous_state.public_keys.len(),
        previous_state.threshold,
        next_state.public_keys.len(),
        next_state.threshold
    );

    // Historical states governing each previously relocked output.
    let mut historical_states: HashMap<String, GrailState> = HashMap::new();
    for utxo in &info.incoming_grail_btc {
        if !historical_states.contains_key(&utxo.txid) {
            let state = context
                .show_spell_by_txid(&utxo.txid)
                .await?
                .grail_state()?;
            historical_states.insert(utxo.txid.clone(), state);
        }
    }

    let document = generalized_document(&TransitionDocumentParams {
        app_id: &context.app_id,
        app_vk: &context.app_vk,
        ticker: &context.ticker,
        previous_nft_txid,
        previous_state: &previous_state,
        next_state,
        next_nft_address: &next_address,
        info: &info,
    });

    let mut seen = std::collections::HashSet::new();
    let prev_tx_list: Vec<Vec<u8>> = all_txids
        .iter()
        .filter(|txid| seen.insert(txid.as_str()))
        .filter_map(|txid| previous_transactions.get(txid).cloned())
        .collect();

    let spell = context
        .prover
        .prove_spell(&ProveRequest {
            document: &document,
            funding_utxo: &funding_utxo,
            change_address: &funding_change_address,
            fee_rate,
            previous_transactions: prev_tx_list,
            temporary_secret: &context.temporary_secret,
        })
        .await?;

    previous_transactions.insert(
        tx_bytes_to_txid(&spell.commitment_tx_bytes)?,
        spell.commitment_tx_bytes.clone(),
    );

    // Stub every script-path input with [script, controlBlock] so cosigners
    // have a concrete tapleaf committed for sighash computation.
    let mut spell_tx = tx_from_bytes(&spell.spell_tx_bytes)?;
    let previous_bundle = grail_spending_script(&previous_state, context.network)?;
    stub_witness(&mut spell_tx, 0, &previous_bundle)?;

    let mut request_inputs = vec![SignatureRequestInput {
        index: 0,
        state: previous_state,
        script: previous_bundle.script.to_bytes(),
    }];
    let mut index = 1;
    for payment in info
        .incoming_user_btc
        .iter()
        .chain(info.incoming_user_charms.iter())
    {
        let scripts = user_payment_scripts(payment, context.network)?;
        stub_witness(&mut spell_tx, index, &scripts.grail)?;
        request_inputs.push(SignatureRequestInput {
            index,
            state: payment.grail_state.clone(),
            script: scripts.grail.script.to_bytes(),
        });
        index += 1;
    }
    for utxo in &info.incoming_grail_btc {
        let state = historical_states
            .get(&utxo.txid)
            .cloned()
            .ok_or_else(|| VaultError::TransactionNotFound {
                txid: utxo.txid.clone(),
            })?;
        let bundle = grail_spending_script(&state, context.network)?;
        stub_witness(&mut spell_tx, index, &bundle)?;
        request_inputs.push(SignatureRequestInput {
            index,
            state,
            script: bundle.script.to_bytes(),
        });
        index += 1;
    }

    let spell = Spell {
        commitment_tx_bytes: spell.commitment_tx_bytes,
        spell_tx_bytes: consensus::serialize(&spell_tx),
    };

    let signature_request = SignatureRequest {
        transaction_bytes: spell.spell_tx_bytes.clone(),
        previous_transactions,
        inputs: request_inputs,
    };

    Ok(TransitionResult {
        spell,
        signature_request,
    })
}
