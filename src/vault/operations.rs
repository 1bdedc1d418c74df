//! # High-Level Vault Operations
//!
//! Deploy, cosigner rotation, peg-in, peg-out, mint, and token transfer,
//! plus broadcasting and the user's unilateral recovery path. The state
//! transitions are expressed as calls into the generalized builder.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use log::info;

use crate::config::vault::DUST_LIMIT;
use crate::context::Context;
use crate::error::{VaultError, VaultResult};
use crate::services::ProveRequest;
use crate::spell::{deploy_document, transfer_document};
use crate::taproot::{grail_address, user_payment_address, user_payment_scripts};
use crate::types::{
    tx_bytes_to_txid, tx_from_bytes, GeneralizedInfo, GrailState, Outgoing, PreviousTransactions,
    Spell, TokenUtxo, UserPaymentDetails, Utxo,
};
use crate::vault::selector::find_locked_btc_utxos;
use crate::vault::signing::{keypair_from_hex, resolve_prevouts, script_spend_sighash};
use crate::vault::transition::{charms_amount_for_utxo, create_transition, TransitionResult};

/// Deploy a fresh vault NFT under `initial_state`. The context must have
/// been built with [`Context::create_for_deploy`] so the app id matches the
/// funding UTXO.
///
/// The returned pair needs no cosigner signatures; hand it straight to
/// [`transmit_spell`].
pub async fn deploy_vault(
    context: &Context,
    fee_rate: f64,
    funding_utxo: Option<Utxo>,
    initial_state: &GrailState,
) -> VaultResult<Spell> {
    initial_state.validate()?;
    let funding_utxo = match funding_utxo {
        Some(utxo) => utxo,
        None => context.chain.get_funding_utxo()?,
    };
    let nft_address = grail_address(initial_state, context.network)?.to_string();
    info!("Deploying vault NFT to {nft_address}");

    let document = deploy_document(
        &context.app_id,
        &context.app_vk,
        &context.ticker,
        &funding_utxo,
        initial_state,
        &nft_address,
    );
    let change_address = context.chain.get_new_address()?;
    context
        .prover
        .prove_spell(&ProveRequest {
            document: &document,
            funding_utxo: &funding_utxo,
            change_address: &change_address,
            fee_rate,
            previous_transactions: Vec::new(),
            temporary_secret: &context.temporary_secret,
        })
        .await
}

/// A pure cosigner rotation: no BTC or charms move
pub async fn update_vault(
    context: &Context,
    fee_rate: f64,
    previous_nft_txid: &str,
    next_state: &GrailState,
    funding_utxo: Option<Utxo>,
) -> VaultResult<TransitionResult> {
    create_transition(
        context,
        fee_rate,
        previous_nft_txid,
        next_state,
        GeneralizedInfo::blank(),
        funding_utxo,
    )
    .await
}

/// Peg BTC in: the user's payment is absorbed into the vault and charms of
/// equal amount are issued to the user's wallet address.
pub async fn pegin(
    context: &Context,
    fee_rate: f64,
    previous_nft_txid: &str,
    next_state: &GrailState,
    payment: UserPaymentDetails,
    funding_utxo: Option<Utxo>,
) -> VaultResult<TransitionResult> {
    let previous = context
        .chain
        .get_transactions_map(&[payment.txid.clone()])?;
    let amount = crate::vault::transition::amount_from_utxo(&previous, &payment.utxo())?;
    info!("Pegging in {amount} sats from {}", payment.txid);

    let info = GeneralizedInfo {
        outgoing_user_charms: vec![Outgoing {
            amount,
            address: payment.user_wallet_address.clone(),
        }],
        incoming_user_btc: vec![payment],
        ..GeneralizedInfo::blank()
    };
    create_transition(
        context,
        fee_rate,
        previous_nft_txid,
        next_state,
        info,
        funding_utxo,
    )
    .await
}

/// Peg BTC out: the user's charms are burned and locked vault BTC of equal
/// amount is paid to the user's wallet address. Locked outputs are gathered
/// by walking the vault history from the current NFT.
pub async fn pegout(
    context: &Context,
    fee_rate: f64,
    previous_nft_txid: &str,
    next_state: &GrailState,
    payment: UserPaymentDetails,
    funding_utxo: Option<Utxo>,
) -> VaultResult<TransitionResult> {
    let amount = charms_amount_for_utxo(context, &payment.utxo()).await?;
    info!("Pegging out {amount} sats to {}", payment.user_wallet_address);
    let locked = find_locked_btc_utxos(context, previous_nft_txid, amount, next_state).await?;

    let info = GeneralizedInfo {
        outgoing_user_btc: vec![Outgoing {
            amount,
            address: payment.user_wallet_address.clone(),
        }],
        incoming_grail_btc: locked,
        incoming_user_charms: vec![payment],
        ..GeneralizedInfo::blank()
    };
    create_transition(
        context,
        fee_rate,
        previous_nft_txid,
        next_state,
        info,
        funding_utxo,
    )
    .await
}

/// Mint charms to an address without moving BTC. The cosigner set is left
/// unchanged and the conservation checks are intentionally skipped.
pub async fn mint_charms(
    context: &Context,
    fee_rate: f64,
    previous_nft_txid: &str,
    amount: u64,
    recipient_address: &str,
    funding_utxo: Option<Utxo>,
) -> VaultResult<TransitionResult> {
    let state = context
        .show_spell_by_txid(previous_nft_txid)
        .await?
        .grail_state()?;
    let info = GeneralizedInfo {
        outgoing_user_charms: vec![Outgoing {
            amount,
            address: recipient_address.to_string(),
        }],
        disable_sanity: true,
        ..GeneralizedInfo::blank()
    };
    create_transition(context, fee_rate, previous_nft_txid, &state, info, funding_utxo).await
}

/// Transfer charms between user wallets, without touching the vault NFT.
/// The recipient receives `amount` token units and the remainder of the
/// inputs returns to `change_address`.
///
/// The returned pair needs no cosigner signatures; the token inputs are
/// plain wallet outputs.
pub async fn transfer_charms(
    context: &Context,
    fee_rate: f64,
    input_utxos: &[TokenUtxo],
    recipient_address: &str,
    change_address: &str,
    amount: u64,
    funding_utxo: Option<Utxo>,
) -> VaultResult<Spell> {
    let input_total: u64 = input_utxos.iter().map(|utxo| utxo.amount).sum();
    if input_utxos.is_empty() || input_total == 0 {
        return Err(VaultError::operation(
            "transfer_charms",
            "no token inputs supplied",
        ));
    }
    let change_amount = input_total.checked_sub(amount).ok_or_else(|| {
        VaultError::conservation(format!(
            "transfer of {amount} exceeds the {input_total} token units held by the inputs"
        ))
    })?;
    info!("Transferring {amount} charms to {recipient_address}, {change_amount} change");

    let funding_utxo = match funding_utxo {
        Some(utxo) => utxo,
        None => context.chain.get_funding_utxo()?,
    };
    let document = transfer_document(
        &context.app_id,
        &context.app_vk,
        input_utxos,
        recipient_address,
        amount,
        change_address,
        change_amount,
    );

    let input_txids: Vec<String> = input_utxos.iter().map(|utxo| utxo.txid.clone()).collect();
    let previous = context.chain.get_transactions_map(&input_txids)?;
    let mut seen = std::collections::HashSet::new();
    let previous_transactions: Vec<Vec<u8>> = input_txids
        .iter()
        .filter(|txid| seen.insert(txid.as_str()))
        .filter_map(|txid| previous.get(txid).cloned())
        .collect();

    let funding_change_address = context.chain.get_new_address()?;
    context
        .prover
        .prove_spell(&ProveRequest {
            document: &document,
            funding_utxo: &funding_utxo,
            change_address: &funding_change_address,
            fee_rate,
            previous_transactions,
            temporary_secret: &context.temporary_secret,
        })
        .await
}

/// Wallet-sign the commitment transaction and broadcast the pair, returning
/// `(commitment_txid, spell_txid)`.
///
/// The commitment is signed `ALL|ANYONECANPAY`: its single wallet input
/// stands alone while the spell transaction it funds varies per transition.
pub fn transmit_spell(context: &Context, spell: &Spell) -> VaultResult<(String, String)> {
    let signed_commitment = context
        .chain
        .sign_transaction_with_wallet(&spell.commitment_tx_bytes, Some("ALL|ANYONECANPAY"))?;
    let commitment_txid = context.chain.send_raw_transaction(&signed_commitment)?;
    info!("Broadcast commitment transaction {commitment_txid}");
    let spell_txid = context.chain.send_raw_transaction(&spell.spell_tx_bytes)?;
    info!("Broadcast spell transaction {spell_txid}");
    Ok((commitment_txid, spell_txid))
}

/// Locate the output of `txid` paying the user payment address described by
/// `details`. The caller supplies the details a payer reported; this pins
/// down which output actually carries the funds.
pub fn find_user_payment_vout(
    context: &Context,
    txid: &str,
    details: &UserPaymentDetails,
) -> VaultResult<u32> {
    let expected = user_payment_address(
        &details.grail_state,
        &details.recovery_public_key,
        details.timelock_blocks,
        context.network,
    )?
    .script_pubkey();
    let tx = tx_from_bytes(&context.chain.get_transaction_bytes(txid)?)?;
    tx.output
        .iter()
        .position(|out| out.script_pubkey == expected)
        .map(|vout| vout as u32)
        .ok_or_else(|| {
            VaultError::operation(
                "find_user_payment_vout",
                format!("no output of {txid} pays the expected payment address"),
            )
        })
}

/// Fetch the previous transaction of every spell input, keyed by txid. The
/// unbroadcast commitment transaction, if supplied, is taken from memory
/// instead of the chain.
pub fn previous_transactions_for_spell(
    context: &Context,
    spell_tx_bytes: &[u8],
    commitment_tx_bytes: Option<&[u8]>,
) -> VaultResult<PreviousTransactions> {
    let tx = tx_from_bytes(spell_tx_bytes)?;
    let mut map = PreviousTransactions::new();
    if let Some(bytes) = commitment_tx_bytes {
        map.insert(tx_bytes_to_txid(bytes)?, bytes.to_vec());
    }
    for txin in &tx.input {
        let txid = txin.previous_output.txid.to_string();
        if !map.contains_key(&txid) {
            map.insert(txid.clone(), context.chain.get_transaction_bytes(&txid)?);
        }
    }
    Ok(map)
}

/// Build and sign the user's unilateral recovery transaction, spending the
/// payment output through the timelocked leaf once `timelock_blocks` have
/// passed. Returns raw transaction bytes ready to broadcast.
pub fn build_recovery_transaction(
    context: &Context,
    details: &UserPaymentDetails,
    recovery_private_key: &str,
    destination_address: &str,
    fee: u64,
) -> VaultResult<Vec<u8>> {
    let utxo = details.utxo();
    let prev_bytes = context.chain.get_transaction_bytes(&utxo.txid)?;
    let prev_tx = tx_from_bytes(&prev_bytes)?;
    let prev_out = prev_tx
        .output
        .get(utxo.vout as usize)
        .ok_or(VaultError::OutputIndexOutOfBounds {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
        })?;
    let value = prev_out.value.to_sat();
    let recovered = value.saturating_sub(fee);
    if recovered < DUST_LIMIT {
        return Err(VaultError::DustLimitViolation {
            address: destination_address.to_string(),
            amount: recovered,
            limit: DUST_LIMIT,
        });
    }

    let timelock = u16::try_from(details.timelock_blocks).map_err(|_| {
        VaultError::operation(
            "build_recovery_transaction",
            format!("timelock of {} blocks exceeds the CSV range", details.timelock_blocks),
        )
    })?;
    let destination = Address::from_str(destination_address)
        .map_err(|e| VaultError::InvalidAddress {
            address: destination_address.to_string(),
            message: e.to_string(),
        })?
        .require_network(context.network)
        .map_err(|e| VaultError::InvalidAddress {
            address: destination_address.to_string(),
            message: e.to_string(),
        })?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(
                Txid::from_str(&utxo.txid).map_err(|e| VaultError::TxDecode {
                    message: e.to_string(),
                })?,
                utxo.vout,
            ),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(timelock),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(recovered),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let scripts = user_payment_scripts(details, context.network)?;
    let prevouts = vec![prev_out.clone()];
    let sighash = script_spend_sighash(&tx, &prevouts, 0, &scripts.recovery.script)?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let secp = Secp256k1::new();
    let kp = keypair_from_hex(&secp, recovery_private_key)?;
    let signature = secp.sign_schnorr(&msg, &kp);

    let mut witness = Witness::new();
    witness.push(signature.as_ref());
    witness.push(scripts.recovery.script.as_bytes());
    witness.push(&scripts.recovery.control_block);
    tx.input[0].witness = witness;

    Ok(consensus::serialize(&tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::testutil::{keypair, TestHarness};
    use bitcoin::secp256k1::schnorr;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        let _ = env_logger::builder().is_test(true).try_init();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn payment(
        txid: &str,
        state: &GrailState,
        recovery_key: &str,
        user_address: &str,
    ) -> UserPaymentDetails {
        UserPaymentDetails {
            recovery_public_key: recovery_key.to_string(),
            timelock_blocks: 144,
            txid: txid.to_string(),
            vout: 0,
            grail_state: state.clone(),
            user_wallet_address: user_address.to_string(),
        }
    }

    #[test]
    fn test_deploy_produces_a_single_nft_output() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a], 1);
            let context = harness.context().await;

            let spell = deploy_vault(&context, 1.0, Some(harness.funding_utxo()), &state)
                .await
                .unwrap();
            let tx = tx_from_bytes(&spell.spell_tx_bytes).unwrap();
            // One NFT output, one commitment input appended by the prover.
            assert_eq!(tx.output.len(), 1);
            assert_eq!(
                tx.output[0].script_pubkey,
                grail_address(&state, context.network)
                    .unwrap()
                    .script_pubkey()
            );

            let metadata = context
                .prover
                .show_spell(&hex::encode(&spell.spell_tx_bytes), &[])
                .await
                .unwrap();
            assert_eq!(metadata.grail_state().unwrap(), state);
        });
    }

    #[test]
    fn test_transmit_broadcasts_both_transactions() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a], 1);
            let context = harness.context().await;

            let spell = deploy_vault(&context, 1.0, Some(harness.funding_utxo()), &state)
                .await
                .unwrap();
            let (commitment_txid, spell_txid) = transmit_spell(&context, &spell).unwrap();
            assert_eq!(
                commitment_txid,
                tx_bytes_to_txid(&spell.commitment_tx_bytes).unwrap()
            );
            assert_eq!(spell_txid, tx_bytes_to_txid(&spell.spell_tx_bytes).unwrap());
        });
    }

    #[test]
    fn test_deploy_then_update_end_to_end() {
        run(async {
            let (pair_a, key_a) = keypair(1);
            let (_, key_b) = keypair(2);
            let harness = TestHarness::new();
            let initial = GrailState::new(vec![key_a.clone()], 1);
            let context = harness.context().await;

            let spell = deploy_vault(&context, 1.0, Some(harness.funding_utxo()), &initial)
                .await
                .unwrap();
            let (_, nft_txid) = transmit_spell(&context, &spell).unwrap();

            let next = GrailState::new(vec![key_a.clone(), key_b], 1);
            let result = update_vault(&context, 1.0, &nft_txid, &next, None)
                .await
                .unwrap();

            // One cosigner meets the threshold.
            let signatures =
                crate::vault::signing::sign_as_cosigner(&result.signature_request, &pair_a)
                    .unwrap();
            let completed = crate::vault::signing::inject_signatures_into_spell(
                &result.spell,
                &result.signature_request,
                &[crate::types::SignatureResponse {
                    public_key: key_a,
                    signatures,
                }],
                &context.temporary_secret,
            )
            .unwrap();
            let tx = tx_from_bytes(&completed.spell_tx_bytes).unwrap();
            assert_eq!(
                tx.output[0].script_pubkey,
                grail_address(&next, context.network).unwrap().script_pubkey()
            );

            // Without any responses the same update cannot be completed.
            let err = crate::vault::signing::inject_signatures_into_spell(
                &result.spell,
                &result.signature_request,
                &[],
                &context.temporary_secret,
            )
            .unwrap_err();
            assert!(matches!(err, VaultError::InsufficientSignatures { .. }));
        });
    }

    #[test]
    fn test_pegin_issues_charms_and_relocks_the_payment() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let nft_txid = harness.add_vault_tx(&state, 2_000, &[]);
            let context = harness.context().await;

            let user_address = harness.user_address();
            let payment_txid = harness.add_user_payment_tx(&state, &key_a, 100_000);
            let result = pegin(
                &context,
                1.0,
                &nft_txid,
                &state,
                payment(&payment_txid, &state, &key_a, &user_address),
                None,
            )
            .await
            .unwrap();

            // NFT out, charm out, relock out.
            let tx = tx_from_bytes(&result.spell.spell_tx_bytes).unwrap();
            assert_eq!(tx.output.len(), 3);
            assert_eq!(tx.output[2].value.to_sat(), 100_000);
            // NFT input plus the user payment are both signature targets.
            assert_eq!(result.signature_request.inputs.len(), 2);

            let metadata = context
                .prover
                .show_spell(&hex::encode(&result.spell.spell_tx_bytes), &[])
                .await
                .unwrap();
            assert_eq!(metadata.charms_amount(1).unwrap(), 100_000);
        });
    }

    #[test]
    fn test_pegout_pays_from_locked_outputs() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let nft_txid = harness.add_vault_tx(&state, 2_000, &[50_000]);
            let context = harness.context().await;

            let user_address = harness.user_address();
            let charm_txid = harness.add_charms_tx(&state, &key_a, 1_000, 20_000);
            let result = pegout(
                &context,
                1.0,
                &nft_txid,
                &state,
                payment(&charm_txid, &state, &key_a, &user_address),
                None,
            )
            .await
            .unwrap();

            // NFT out, 20_000 to the user, 30_000 relocked.
            let tx = tx_from_bytes(&result.spell.spell_tx_bytes).unwrap();
            assert_eq!(tx.output.len(), 3);
            assert_eq!(tx.output[1].value.to_sat(), 20_000);
            assert_eq!(tx.output[2].value.to_sat(), 30_000);
            // NFT, the charm payment, and the locked output all get signed.
            assert_eq!(result.signature_request.inputs.len(), 3);
        });
    }

    #[test]
    fn test_pegout_fails_without_enough_locked_btc() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let nft_txid = harness.add_vault_tx(&state, 2_000, &[5_000]);
            let context = harness.context().await;

            let charm_txid = harness.add_charms_tx(&state, &key_a, 1_000, 20_000);
            let err = pegout(
                &context,
                1.0,
                &nft_txid,
                &state,
                payment(&charm_txid, &state, &key_a, &harness.user_address()),
                None,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, VaultError::InsufficientLockedBtc { .. }));
        });
    }

    #[test]
    fn test_mint_reuses_the_current_state() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let nft_txid = harness.add_vault_tx(&state, 2_000, &[]);
            let context = harness.context().await;

            let result = mint_charms(
                &context,
                1.0,
                &nft_txid,
                5_000,
                &harness.user_address(),
                None,
            )
            .await
            .unwrap();
            let tx = tx_from_bytes(&result.spell.spell_tx_bytes).unwrap();
            assert_eq!(tx.output.len(), 2);

            let metadata = context
                .prover
                .show_spell(&hex::encode(&result.spell.spell_tx_bytes), &[])
                .await
                .unwrap();
            assert_eq!(metadata.grail_state().unwrap(), state);
            assert_eq!(metadata.charms_amount(1).unwrap(), 5_000);
        });
    }

    #[test]
    fn test_transfer_pays_recipient_and_change() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let context = harness.context().await;

            let txid_1 = harness.add_charms_tx(&state, &key_a, 1_000, 600);
            let txid_2 = harness.add_charms_tx(&state, &key_a, 1_000, 400);
            let inputs = vec![
                TokenUtxo {
                    txid: txid_1,
                    vout: 0,
                    amount: 600,
                },
                TokenUtxo {
                    txid: txid_2,
                    vout: 0,
                    amount: 400,
                },
            ];

            let recipient = harness.user_address();
            let change = context.chain.get_new_address().unwrap();
            let spell = transfer_charms(&context, 1.0, &inputs, &recipient, &change, 700, None)
                .await
                .unwrap();

            // Recipient output first, change output second, and both token
            // inputs spent.
            let tx = tx_from_bytes(&spell.spell_tx_bytes).unwrap();
            assert_eq!(tx.output.len(), 2);
            assert_eq!(
                tx.output[0].script_pubkey,
                Address::from_str(&recipient)
                    .unwrap()
                    .assume_checked()
                    .script_pubkey()
            );
            assert_eq!(tx.input.len(), 3); // two token inputs plus the commitment

            let metadata = context
                .prover
                .show_spell(&hex::encode(&spell.spell_tx_bytes), &[])
                .await
                .unwrap();
            assert_eq!(metadata.outs[0].charms["$0000"], serde_json::json!(700));
            assert_eq!(metadata.outs[1].charms["$0000"], serde_json::json!(300));
        });
    }

    #[test]
    fn test_transfer_rejects_overdraw_and_empty_inputs() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let context = harness.context().await;

            let txid = harness.add_charms_tx(&state, &key_a, 1_000, 500);
            let inputs = vec![TokenUtxo {
                txid,
                vout: 0,
                amount: 500,
            }];
            let recipient = harness.user_address();

            let err = transfer_charms(&context, 1.0, &inputs, &recipient, &recipient, 501, None)
                .await
                .unwrap_err();
            assert!(matches!(err, VaultError::ConservationViolation { .. }));

            let err = transfer_charms(&context, 1.0, &[], &recipient, &recipient, 1, None)
                .await
                .unwrap_err();
            assert!(matches!(err, VaultError::OperationFailed { .. }));
        });
    }

    #[test]
    fn test_find_user_payment_vout() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let context = harness.context().await;

            let txid = harness.add_user_payment_tx(&state, &key_a, 10_000);
            let details = payment(&txid, &state, &key_a, "ignored");
            assert_eq!(find_user_payment_vout(&context, &txid, &details).unwrap(), 0);

            // A different recovery key derives a different address.
            let (_, key_b) = keypair(2);
            let mismatched = payment(&txid, &state, &key_b, "ignored");
            assert!(find_user_payment_vout(&context, &txid, &mismatched).is_err());
        });
    }

    #[test]
    fn test_previous_transactions_cover_every_spell_input() {
        run(async {
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a.clone()], 1);
            let nft_txid = harness.add_vault_tx(&state, 2_000, &[]);
            let context = harness.context().await;

            let result = update_vault(&context, 1.0, &nft_txid, &state, None)
                .await
                .unwrap();
            let map = previous_transactions_for_spell(
                &context,
                &result.spell.spell_tx_bytes,
                Some(&result.spell.commitment_tx_bytes),
            )
            .unwrap();

            let tx = tx_from_bytes(&result.spell.spell_tx_bytes).unwrap();
            for txin in &tx.input {
                assert!(map.contains_key(&txin.previous_output.txid.to_string()));
            }
        });
    }

    #[test]
    fn test_recovery_transaction_spends_the_timelocked_leaf() {
        run(async {
            let (pair_r, key_r) = keypair(5);
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a], 1);
            let context = harness.context().await;

            let txid = harness.add_user_payment_tx(&state, &key_r, 100_000);
            let details = payment(&txid, &state, &key_r, "ignored");
            let destination = harness.user_address();
            let bytes = build_recovery_transaction(
                &context,
                &details,
                &pair_r.private_key,
                &destination,
                1_000,
            )
            .unwrap();

            let tx = tx_from_bytes(&bytes).unwrap();
            assert_eq!(tx.input[0].sequence, Sequence::from_height(144));
            assert_eq!(tx.output[0].value.to_sat(), 99_000);
            let witness: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|e| e.to_vec()).collect();
            assert_eq!(witness.len(), 3);

            // The signature verifies against the recovery key under the
            // recovery leaf sighash.
            let scripts = user_payment_scripts(&details, context.network).unwrap();
            assert_eq!(witness[1], scripts.recovery.script.to_bytes());
            let mut previous = PreviousTransactions::new();
            previous.insert(
                txid.clone(),
                context.chain.get_transaction_bytes(&txid).unwrap(),
            );
            let prevouts = resolve_prevouts(&tx, &previous).unwrap();
            let sighash =
                script_spend_sighash(&tx, &prevouts, 0, &scripts.recovery.script).unwrap();
            let msg = Message::from_digest(sighash.to_byte_array());
            let secp = Secp256k1::verification_only();
            let pubkey = bitcoin::secp256k1::XOnlyPublicKey::from_str(&key_r).unwrap();
            let signature = schnorr::Signature::from_slice(&witness[0]).unwrap();
            assert!(secp.verify_schnorr(&signature, &msg, &pubkey).is_ok());
        });
    }

    #[test]
    fn test_recovery_rejects_dust_remainder() {
        run(async {
            let (pair_r, key_r) = keypair(5);
            let (_, key_a) = keypair(1);
            let harness = TestHarness::new();
            let state = GrailState::new(vec![key_a], 1);
            let context = harness.context().await;

            let txid = harness.add_user_payment_tx(&state, &key_r, 1_200);
            let details = payment(&txid, &state, &key_r, "ignored");
            let err = build_recovery_transaction(
                &context,
                &details,
                &pair_r.private_key,
                &harness.user_address(),
                1_000,
            )
            .unwrap_err();
            assert!(matches!(err, VaultError::DustLimitViolation { .. }));
        });
    }
}
