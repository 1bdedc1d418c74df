//! # Threshold Signature Protocol
//!
//! Cosigners receive a [`SignatureRequest`] and answer with one Schnorr
//! signature per request input. The coordinator verifies and filters the
//! responses, selects exactly `threshold` signatures per input in canonical
//! (sorted public key) order, splices them into the witness, and finally
//! re-signs the fee-bump commitment input with the session-ephemeral key.

use std::str::FromStr;

use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{schnorr, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Script, ScriptBuf, TapSighash, Transaction, TxOut, Witness};
use log::warn;

use crate::error::{VaultError, VaultResult};
use crate::types::{
    tx_bytes_to_txid, tx_from_bytes, CosignerSignatures, InputSignature, KeyPair,
    PreviousTransactions, SignatureRequest, SignatureResponse, Spell,
};

/// Resolve the previous output of every transaction input from the lookup
/// table. The table must be complete; a missing entry is fatal.
pub(crate) fn resolve_prevouts(
    tx: &Transaction,
    previous: &PreviousTransactions,
) -> VaultResult<Vec<TxOut>> {
    let mut prevouts = Vec::with_capacity(tx.input.len());
    for txin in &tx.input {
        let txid = txin.previous_output.txid.to_string();
        let vout = txin.previous_output.vout;
        let bytes = previous
            .get(&txid)
            .ok_or_else(|| VaultError::TransactionNotFound { txid: txid.clone() })?;
        let prev_tx = tx_from_bytes(bytes)?;
        let out = prev_tx
            .output
            .get(vout as usize)
            .ok_or(VaultError::OutputIndexOutOfBounds {
                txid: txid.clone(),
                vout,
            })?;
        prevouts.push(out.clone());
    }
    Ok(prevouts)
}

/// BIP-341 script-spend sighash for one input under the given tapleaf
pub(crate) fn script_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    script: &Script,
) -> VaultResult<TapSighash> {
    let leaf_hash = TapLeafHash::from_script(script, LeafVersion::TapScript);
    let mut cache = SighashCache::new(tx);
    cache
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| VaultError::crypto(format!("sighash computation failed: {e}")))
}

pub(crate) fn keypair_from_hex(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    hex_key: &str,
) -> VaultResult<Keypair> {
    let bytes =
        hex::decode(hex_key).map_err(|e| VaultError::crypto(format!("invalid secret hex: {e}")))?;
    let secret = SecretKey::from_slice(&bytes)
        .map_err(|e| VaultError::crypto(format!("invalid secret key: {e}")))?;
    Ok(Keypair::from_secret_key(secp, &secret))
}

/// Produce one Schnorr signature per request input with the given key.
///
/// The request's previous-transaction table must cover every input of the
/// transaction, not only the ones being signed: the BIP-341 sighash commits
/// to all previous output values and scripts.
pub fn sign_as_cosigner(
    request: &SignatureRequest,
    keypair: &KeyPair,
) -> VaultResult<CosignerSignatures> {
    let tx = tx_from_bytes(&request.transaction_bytes)?;
    let prevouts = resolve_prevouts(&tx, &request.previous_transactions)?;
    let secp = Secp256k1::new();
    let kp = keypair_from_hex(&secp, &keypair.private_key)?;

    request
        .inputs
        .iter()
        .map(|input| {
            let script = ScriptBuf::from_bytes(input.script.clone());
            let sighash = script_spend_sighash(&tx, &prevouts, input.index, &script)?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr(&msg, &kp);
            Ok(InputSignature {
                index: input.index,
                signature: signature.as_ref().to_vec(),
            })
        })
        .collect()
}

/// Re-derive each sighash and drop signatures that do not verify against
/// the claimed public key. Invalid signatures are logged, not fatal.
pub fn filter_valid_cosigner_signatures(
    request: &SignatureRequest,
    signatures: CosignerSignatures,
    public_key: &str,
) -> VaultResult<CosignerSignatures> {
    let tx = tx_from_bytes(&request.transaction_bytes)?;
    let prevouts = resolve_prevouts(&tx, &request.previous_transactions)?;
    let secp = Secp256k1::verification_only();
    let pubkey = XOnlyPublicKey::from_str(public_key)
        .map_err(|e| VaultError::crypto(format!("invalid public key {public_key}: {e}")))?;

    let mut valid = Vec::with_capacity(signatures.len());
    for sig in signatures {
        let Some(input) = request.inputs.iter().find(|i| i.index == sig.index) else {
            warn!("Dropping signature for unknown input {}", sig.index);
            continue;
        };
        let script = ScriptBuf::from_bytes(input.script.clone());
        let sighash = script_spend_sighash(&tx, &prevouts, input.index, &script)?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let parsed = match schnorr::Signature::from_slice(&sig.signature) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping malformed signature for input {}: {e}", sig.index);
                continue;
            }
        };
        if secp.verify_schnorr(&parsed, &msg, &pubkey).is_ok() {
            valid.push(sig);
        } else {
            warn!(
                "Dropping signature for input {} that does not verify against {public_key}",
                sig.index
            );
        }
    }
    Ok(valid)
}

/// Splice cosigner signatures into the spell transaction witness.
///
/// For every request input: collect at most one signature per cosigner in
/// that input's state, require at least `threshold` of them, keep exactly
/// `threshold` in canonical order, and prepend one witness slot per sorted
/// public key (empty for cosigners that did not make the cut) ahead of the
/// already-stubbed `[script, controlBlock]` elements. The commitment input
/// is then re-signed with the session-ephemeral secret.
pub fn inject_signatures_into_spell(
    spell: &Spell,
    request: &SignatureRequest,
    responses: &[SignatureResponse],
    temporary_secret: &[u8; 32],
) -> VaultResult<Spell> {
    let mut tx = tx_from_bytes(&spell.spell_tx_bytes)?;

    for input in &request.inputs {
        let mut labeled: Vec<(String, Vec<u8>)> = Vec::new();
        for response in responses
            .iter()
            .filter(|r| input.state.public_keys.contains(&r.public_key))
        {
            let mut for_input = response.signatures.iter().filter(|s| s.index == input.index);
            if let Some(sig) = for_input.next() {
                if for_input.next().is_some() {
                    return Err(VaultError::AmbiguousCosignerSignature {
                        input_index: input.index,
                        public_key: response.public_key.clone(),
                    });
                }
                labeled.push((response.public_key.clone(), sig.signature.clone()));
            }
        }
        if labeled.len() < input.state.threshold {
            return Err(VaultError::InsufficientSignatures {
                input_index: input.index,
                required: input.state.threshold,
                provided: labeled.len(),
            });
        }
        // Canonical selection: every coordinator given the same responses
        // produces the same witness bytes.
        labeled.sort_by(|a, b| a.0.cmp(&b.0));
        labeled.truncate(input.state.threshold);

        let txin = tx.input.get_mut(input.index).ok_or_else(|| {
            VaultError::operation(
                "inject_signatures",
                format!("input {} not present in the spell transaction", input.index),
            )
        })?;
        let stubbed: Vec<Vec<u8>> = txin.witness.iter().map(|e| e.to_vec()).collect();
        let mut witness = Witness::new();
        for pk in input.state.sorted_public_keys() {
            match labeled.iter().find(|(key, _)| *key == pk) {
                Some((_, sig)) => witness.push(sig),
                None => witness.push([]),
            }
        }
        for element in stubbed {
            witness.push(element);
        }
        txin.witness = witness;
    }

    let mut previous = request.previous_transactions.clone();
    previous.insert(
        tx_bytes_to_txid(&spell.commitment_tx_bytes)?,
        spell.commitment_tx_bytes.clone(),
    );
    let spell_tx_bytes =
        resign_with_temporary_secret(&consensus::serialize(&tx), &previous, temporary_secret)?;

    Ok(Spell {
        commitment_tx_bytes: spell.commitment_tx_bytes.clone(),
        spell_tx_bytes,
    })
}

/// Re-sign the last (fee-bump commitment) input with the session-ephemeral
/// secret and self-verify the result before accepting it.
pub fn resign_with_temporary_secret(
    spell_tx_bytes: &[u8],
    previous: &PreviousTransactions,
    temporary_secret: &[u8; 32],
) -> VaultResult<Vec<u8>> {
    let mut tx = tx_from_bytes(spell_tx_bytes)?;
    if tx.input.is_empty() {
        return Err(VaultError::TxDecode {
            message: "spell transaction has no inputs".to_string(),
        });
    }
    let input_index = tx.input.len() - 1;
    let prevouts = resolve_prevouts(&tx, previous)?;

    let script_bytes = tx.input[input_index]
        .witness
        .nth(1)
        .ok_or_else(|| {
            VaultError::operation("resign_commitment", "commitment witness carries no script")
        })?
        .to_vec();
    let script = ScriptBuf::from_bytes(script_bytes);
    let sighash = script_spend_sighash(&tx, &prevouts, input_index, &script)?;
    let msg = Message::from_digest(sighash.to_byte_array());

    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(temporary_secret)
        .map_err(|e| VaultError::crypto(format!("invalid temporary secret: {e}")))?;
    let kp = Keypair::from_secret_key(&secp, &secret);
    let signature = secp.sign_schnorr(&msg, &kp);
    let (pubkey, _) = kp.x_only_public_key();
    if secp.verify_schnorr(&signature, &msg, &pubkey).is_err() {
        return Err(VaultError::TemporarySignatureVerificationFailed);
    }

    let mut elements: Vec<Vec<u8>> = tx.input[input_index]
        .witness
        .iter()
        .map(|e| e.to_vec())
        .collect();
    if elements.is_empty() {
        return Err(VaultError::operation(
            "resign_commitment",
            "commitment witness is empty",
        ));
    }
    elements[0] = signature.as_ref().to_vec();
    let mut witness = Witness::new();
    for element in elements {
        witness.push(element);
    }
    tx.input[input_index].witness = witness;

    Ok(consensus::serialize(&tx))
}
