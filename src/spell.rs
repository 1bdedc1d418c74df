//! # Transition Description Documents
//!
//! The wire format handed to the external prover, and the metadata it
//! reads back out of a committed transaction. Documents are pure values:
//! building one performs no I/O, so the exact bytes a given transition
//! produces can be asserted in tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{labels, vault::SPELL_VERSION};
use crate::error::{VaultError, VaultResult};
use crate::types::{GeneralizedInfo, GrailState, TokenUtxo, Utxo};

/// One input of a transition description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellInput {
    pub utxo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charms: Option<Map<String, Value>>,
}

/// One output of a transition description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charms: Option<Map<String, Value>>,
}

/// A complete transition description, serialized as JSON for the prover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellDocument {
    pub version: u32,
    pub apps: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_inputs: Option<BTreeMap<String, String>>,
    pub public_inputs: BTreeMap<String, Value>,
    pub ins: Vec<SpellInput>,
    pub outs: Vec<SpellOutput>,
}

/// Everything a generalized transition document is built from
#[derive(Debug, Clone)]
pub struct TransitionDocumentParams<'a> {
    pub app_id: &'a str,
    pub app_vk: &'a str,
    pub ticker: &'a str,
    pub previous_nft_txid: &'a str,
    pub previous_state: &'a GrailState,
    pub next_state: &'a GrailState,
    pub next_nft_address: &'a str,
    pub info: &'a GeneralizedInfo,
}

fn nft_charm(ticker: &str, state: &GrailState) -> Map<String, Value> {
    let mut charms = Map::new();
    charms.insert(
        labels::APP_NFT.to_string(),
        json!({
            "ticker": ticker,
            "current_cosigners": state.public_keys.join(","),
            "current_threshold": state.threshold,
        }),
    );
    charms
}

fn marker_charm(kind: &str) -> Map<String, Value> {
    let mut charms = Map::new();
    charms.insert(labels::APP_NFT.to_string(), json!({ "type": kind }));
    charms
}

/// The document for a generalized transition.
///
/// Input order is fixed: the previous vault NFT first, then incoming
/// user-BTC payments, then incoming user-charm payments, then previously
/// relocked vault outputs. The signature request indices rely on this.
pub fn generalized_document(p: &TransitionDocumentParams) -> SpellDocument {
    let mut apps = BTreeMap::new();
    apps.insert(
        labels::APP_NFT.to_string(),
        format!("n/{}/{}", p.app_id, p.app_vk),
    );
    apps.insert(
        labels::APP_TOKEN.to_string(),
        format!("t/{}/{}", p.app_id, p.app_vk),
    );

    let mut public_inputs = BTreeMap::new();
    public_inputs.insert(labels::APP_NFT.to_string(), json!({ "action": "update" }));
    public_inputs.insert(labels::APP_TOKEN.to_string(), json!({ "action": "mint" }));

    let mut ins = vec![SpellInput {
        utxo_id: format!("{}:0", p.previous_nft_txid),
        charms: Some(nft_charm(p.ticker, p.previous_state)),
    }];
    ins.extend(p.info.incoming_user_btc.iter().map(|payment| SpellInput {
        utxo_id: payment.utxo().utxo_id(),
        charms: None,
    }));
    ins.extend(p.info.incoming_user_charms.iter().map(|payment| SpellInput {
        utxo_id: payment.utxo().utxo_id(),
        charms: None,
    }));
    ins.extend(p.info.incoming_grail_btc.iter().map(|utxo| SpellInput {
        utxo_id: utxo.utxo_id(),
        charms: None,
    }));

    let mut outs = vec![SpellOutput {
        address: Some(p.next_nft_address.to_string()),
        amount: None,
        charms: Some(nft_charm(p.ticker, p.next_state)),
    }];
    outs.extend(p.info.outgoing_user_btc.iter().map(|outgoing| SpellOutput {
        address: Some(outgoing.address.clone()),
        amount: Some(outgoing.amount),
        charms: Some(marker_charm("user_btc")),
    }));
    outs.extend(p.info.outgoing_user_charms.iter().map(|outgoing| {
        let mut charms = marker_charm("user_charms");
        charms.insert(
            labels::APP_TOKEN.to_string(),
            json!({ "amount": outgoing.amount }),
        );
        // The amount is in token units, not satoshis; the BTC backing it is
        // carried by the relock output.
        SpellOutput {
            address: Some(outgoing.address.clone()),
            amount: None,
            charms: Some(charms),
        }
    }));
    if let Some(relock) = &p.info.outgoing_grail_btc {
        if relock.amount > 0 {
            outs.push(SpellOutput {
                address: Some(relock.address.clone()),
                amount: Some(relock.amount),
                charms: Some(marker_charm("grail_btc")),
            });
        }
    }

    SpellDocument {
        version: SPELL_VERSION,
        apps,
        private_inputs: None,
        public_inputs,
        ins,
        outs,
    }
}

/// The document for a user-to-user token transfer. A single-app document:
/// the token app takes the first label, and every charm value is a plain
/// token amount.
///
/// The recipient output comes first; a change output follows only when
/// `change_amount` is non-zero.
pub fn transfer_document(
    app_id: &str,
    app_vk: &str,
    input_utxos: &[TokenUtxo],
    recipient_address: &str,
    amount: u64,
    change_address: &str,
    change_amount: u64,
) -> SpellDocument {
    let mut apps = BTreeMap::new();
    apps.insert(labels::APP_NFT.to_string(), format!("t/{app_id}/{app_vk}"));

    let mut public_inputs = BTreeMap::new();
    public_inputs.insert(labels::APP_NFT.to_string(), json!({ "action": "transfer" }));

    let token_charm = |amount: u64| {
        let mut charms = Map::new();
        charms.insert(labels::APP_NFT.to_string(), json!(amount));
        charms
    };

    let ins = input_utxos
        .iter()
        .map(|utxo| SpellInput {
            utxo_id: format!("{}:{}", utxo.txid, utxo.vout),
            charms: Some(token_charm(utxo.amount)),
        })
        .collect();

    let mut outs = vec![SpellOutput {
        address: Some(recipient_address.to_string()),
        amount: None,
        charms: Some(token_charm(amount)),
    }];
    if change_amount > 0 {
        outs.push(SpellOutput {
            address: Some(change_address.to_string()),
            amount: None,
            charms: Some(token_charm(change_amount)),
        });
    }

    SpellDocument {
        version: SPELL_VERSION,
        apps,
        private_inputs: None,
        public_inputs,
        ins,
        outs,
    }
}

/// The document deploying a fresh vault NFT. The funding UTXO id is the
/// private input the app id was derived from.
pub fn deploy_document(
    app_id: &str,
    app_vk: &str,
    ticker: &str,
    funding_utxo: &Utxo,
    initial_state: &GrailState,
    nft_address: &str,
) -> SpellDocument {
    let mut apps = BTreeMap::new();
    apps.insert(
        labels::APP_NFT.to_string(),
        format!("n/{app_id}/{app_vk}"),
    );

    let mut private_inputs = BTreeMap::new();
    private_inputs.insert(labels::APP_NFT.to_string(), funding_utxo.utxo_id());

    let mut public_inputs = BTreeMap::new();
    public_inputs.insert(labels::APP_NFT.to_string(), json!({ "action": "deploy" }));

    SpellDocument {
        version: SPELL_VERSION,
        apps,
        private_inputs: Some(private_inputs),
        public_inputs,
        ins: Vec::new(),
        outs: vec![SpellOutput {
            address: Some(nft_address.to_string()),
            amount: None,
            charms: Some(nft_charm(ticker, initial_state)),
        }],
    }
}

/// One output in the prover's show-spell report
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataOutput {
    pub address: Option<String>,
    pub amount: Option<u64>,
    #[serde(default)]
    pub charms: Map<String, Value>,
}

/// The metadata a committed transaction carries, as reported by the prover
#[derive(Debug, Clone, Deserialize)]
pub struct SpellMetadata {
    #[serde(default)]
    pub ins: Vec<MetadataOutput>,
    pub outs: Vec<MetadataOutput>,
}

impl SpellMetadata {
    /// The vault state embedded in the first output's NFT charm
    pub fn grail_state(&self) -> VaultResult<GrailState> {
        let charm = self
            .outs
            .first()
            .and_then(|out| out.charms.get(labels::CHARM_NFT))
            .ok_or_else(|| {
                VaultError::operation("read_vault_state", "no vault NFT charm in output 0")
            })?;
        let cosigners = charm
            .get("current_cosigners")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                VaultError::operation("read_vault_state", "missing current_cosigners")
            })?;
        let threshold = charm
            .get("current_threshold")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                VaultError::operation("read_vault_state", "missing current_threshold")
            })?;
        let state = GrailState::new(
            cosigners.split(',').map(str::to_string).collect(),
            threshold as usize,
        );
        state.validate()?;
        Ok(state)
    }

    /// The tracked token amount carried by output `vout`
    pub fn charms_amount(&self, vout: u32) -> VaultResult<u64> {
        self.outs
            .get(vout as usize)
            .and_then(|out| out.charms.get(labels::CHARM_TOKEN))
            .and_then(|charm| charm.get("amount"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                VaultError::operation(
                    "charms_amount",
                    format!("no token charm with a numeric amount at output {vout}"),
                )
            })
    }
}
