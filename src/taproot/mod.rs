//! # Taproot Construction
//!
//! Everything needed to turn a vault state into on-chain artifacts: the
//! threshold multisig tapscript, the timelocked recovery tapscript, and the
//! script trees, control blocks and addresses committing to them.

pub mod encoding;
pub mod point;
pub mod taptree;

use std::str::FromStr;

use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CSV, OP_DROP, OP_NUMEQUAL};
use bitcoin::script::Builder;
use bitcoin::{Address, Network, ScriptBuf, XOnlyPublicKey};

use crate::error::{VaultError, VaultResult};
use crate::types::{GrailState, UserPaymentDetails};

pub use taptree::{Compressor, TapTree};

/// A tapleaf script together with the control block proving its inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingScript {
    pub script: ScriptBuf,
    pub control_block: Vec<u8>,
}

/// Both spending paths of a user payment output, plus the combined address
#[derive(Debug, Clone)]
pub struct UserPaymentScripts {
    /// Leaf 0: the vault's threshold multisig path
    pub grail: SpendingScript,
    /// Leaf 1: the user's timelocked recovery path
    pub recovery: SpendingScript,
    pub address: Address,
}

fn parse_x_only(key: &str) -> VaultResult<XOnlyPublicKey> {
    XOnlyPublicKey::from_str(key)
        .map_err(|e| VaultError::crypto(format!("invalid public key {key}: {e}")))
}

/// The threshold multisig tapscript for a vault state.
///
/// Keys are sorted first, so the script bytes do not depend on the order
/// the caller supplied them in. The witness provides one element per key in
/// the same sorted order: a signature, or an empty push for a cosigner that
/// did not sign. `OP_CHECKSIGADD` counts the valid ones and `OP_NUMEQUAL`
/// compares against the threshold.
pub fn multisig_script(state: &GrailState) -> VaultResult<ScriptBuf> {
    state.validate()?;
    let mut builder = Builder::new();
    for (i, key) in state.sorted_public_keys().iter().enumerate() {
        builder = builder.push_x_only_key(&parse_x_only(key)?);
        builder = builder.push_opcode(if i == 0 { OP_CHECKSIG } else { OP_CHECKSIGADD });
    }
    Ok(builder
        .push_int(state.threshold as i64)
        .push_opcode(OP_NUMEQUAL)
        .into_script())
}

/// The timelocked recovery tapscript:
/// `<timelock> OP_CHECKSEQUENCEVERIFY OP_DROP <recoveryKey> OP_CHECKSIG`
pub fn recovery_script(recovery_public_key: &str, timelock_blocks: u32) -> VaultResult<ScriptBuf> {
    Ok(Builder::new()
        .push_int(timelock_blocks as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_x_only_key(&parse_x_only(recovery_public_key)?)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// The single-leaf spending bundle for a vault output
pub fn grail_spending_script(state: &GrailState, network: Network) -> VaultResult<SpendingScript> {
    let script = multisig_script(state)?;
    let tree = TapTree::new(vec![script.clone()], network);
    let control_block = tree.control_block(0)?;
    Ok(SpendingScript {
        script,
        control_block,
    })
}

/// The vault address for a state: a one-leaf tree over the multisig script
pub fn grail_address(state: &GrailState, network: Network) -> VaultResult<Address> {
    let script = multisig_script(state)?;
    TapTree::new(vec![script], network).address()
}

/// Both spending bundles of a user payment output. Leaf 0 is the vault
/// multisig path, leaf 1 the timelocked recovery path.
pub fn user_payment_scripts(
    details: &UserPaymentDetails,
    network: Network,
) -> VaultResult<UserPaymentScripts> {
    let grail = multisig_script(&details.grail_state)?;
    let recovery = recovery_script(&details.recovery_public_key, details.timelock_blocks)?;
    let tree = TapTree::new(vec![grail.clone(), recovery.clone()], network);
    Ok(UserPaymentScripts {
        grail: SpendingScript {
            script: grail,
            control_block: tree.control_block(0)?,
        },
        recovery: SpendingScript {
            script: recovery,
            control_block: tree.control_block(1)?,
        },
        address: tree.address()?,
    })
}

/// The two-leaf address a user pays into
pub fn user_payment_address(
    grail_state: &GrailState,
    recovery_public_key: &str,
    timelock_blocks: u32,
    network: Network,
) -> VaultResult<Address> {
    let grail = multisig_script(grail_state)?;
    let recovery = recovery_script(recovery_public_key, timelock_blocks)?;
    TapTree::new(vec![grail, recovery], network).address()
}
