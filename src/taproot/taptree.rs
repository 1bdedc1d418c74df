//! # Taproot Script Tree Construction
//!
//! Builds the Merkle tree over tapleaf scripts, computes the output-key
//! tweak and derives control blocks and addresses. The tweak arithmetic is
//! done with the in-crate EC operations and then cross-checked against
//! `rust-bitcoin`'s own tweak derivation before an address is handed out.
//!
//! Two builders are provided: [`TapTree`] holds every leaf in memory, and
//! [`Compressor`] streams leaf hashes through a log2-depth frontier for
//! large trees, retaining only the sibling set needed for one leaf's proof.

use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Address, Network, ScriptBuf, XOnlyPublicKey};
use lazy_static::lazy_static;
use num_bigint::BigInt;

use crate::error::{VaultError, VaultResult};
use crate::taproot::encoding::{
    bigint_from_bytes_be, bigint_to_32_bytes, compact_size, tagged_hash,
};
use crate::taproot::point::{
    has_even_y, lift_x, point_add, point_mul, CURVE_ORDER, GENERATOR,
};

/// Tapscript leaf version
pub const TAPROOT_LEAF_VERSION: u8 = 0xc0;

lazy_static! {
    /// The BIP-341 "nothing up my sleeve" internal key. No one knows its
    /// discrete log, so the key-path spend of every vault output is dead.
    pub static ref INTERNAL_PUBLIC_KEY: BigInt = BigInt::parse_bytes(
        b"50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0",
        16
    )
    .expect("valid hex constant");

    /// Sentinel root for a tree with no spendable leaves: the leaf hash of
    /// a bare OP_RETURN script.
    pub static ref DEAD_ROOT_HASH: [u8; 32] = tapleaf_hash(&[0x6a]);

    /// Distinct sentinel for two dead leaves combined. Two unspendable
    /// placeholders must not collapse back into the single-leaf sentinel.
    pub static ref DEAD_ROOT_PAIR: [u8; 32] = tap_branch(&DEAD_ROOT_HASH, &DEAD_ROOT_HASH);
}

/// Tapleaf hash of a script: `taggedHash("TapLeaf", version || size || script)`
pub fn tapleaf_hash(script: &[u8]) -> [u8; 32] {
    let mut msg = Vec::with_capacity(script.len() + 10);
    msg.push(TAPROOT_LEAF_VERSION);
    msg.extend_from_slice(&compact_size(script.len()));
    msg.extend_from_slice(script);
    tagged_hash("TapLeaf", &msg)
}

fn tap_branch(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut msg = [0u8; 64];
    if left <= right {
        msg[..32].copy_from_slice(left);
        msg[32..].copy_from_slice(right);
    } else {
        msg[..32].copy_from_slice(right);
        msg[32..].copy_from_slice(left);
    }
    tagged_hash("TapBranch", &msg)
}

/// Order-independent pairwise combine of two node hashes
pub fn combine_hashes(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    if left == &*DEAD_ROOT_HASH && right == &*DEAD_ROOT_HASH {
        return *DEAD_ROOT_PAIR;
    }
    tap_branch(left, right)
}

/// Tweak an x-only internal key by a Merkle root.
///
/// Returns the parity of the tweaked point and its 32-byte x coordinate.
/// `Q = lift_x(P) + t*G` with `t = taggedHash("TapTweak", P.x || root)`.
pub fn taproot_tweak_pubkey(internal_x: &BigInt, root: &[u8]) -> VaultResult<(u8, [u8; 32])> {
    let key_bytes = bigint_to_32_bytes(internal_x)?;
    let mut msg = Vec::with_capacity(32 + root.len());
    msg.extend_from_slice(&key_bytes);
    msg.extend_from_slice(root);
    let t = bigint_from_bytes_be(&tagged_hash("TapTweak", &msg));
    if t >= *CURVE_ORDER {
        return Err(VaultError::crypto("tweak scalar exceeds curve order"));
    }
    let p = lift_x(internal_x)?;
    let t_g = point_mul(&GENERATOR, &t);
    let q = point_add(Some(&p), t_g.as_ref())
        .ok_or_else(|| VaultError::crypto("tweaked key is the point at infinity"))?;
    let parity = if has_even_y(&q) { 0 } else { 1 };
    Ok((parity, bigint_to_32_bytes(&q.x)?))
}

/// Derive the network address for a tweaked output key, cross-checking the
/// in-crate tweak arithmetic against `rust-bitcoin`'s derivation.
fn checked_address(
    internal_x: &BigInt,
    root: &[u8; 32],
    network: Network,
) -> VaultResult<Address> {
    let (parity, q_x) = taproot_tweak_pubkey(internal_x, root)?;
    let internal = XOnlyPublicKey::from_slice(&bigint_to_32_bytes(internal_x)?)
        .map_err(|e| VaultError::crypto(format!("invalid internal key: {e}")))?;
    let secp = Secp256k1::verification_only();
    let merkle_root = TapNodeHash::from_byte_array(*root);
    let (tweaked, lib_parity) = internal.tap_tweak(&secp, Some(merkle_root));
    if tweaked.serialize() != q_x || lib_parity.to_u8() != parity {
        return Err(VaultError::crypto(
            "output key disagrees with library derivation",
        ));
    }
    Ok(Address::p2tr_tweaked(tweaked, network))
}

/// A fully materialized script tree over an ordered list of leaf scripts
#[derive(Debug, Clone)]
pub struct TapTree {
    leaves: Vec<ScriptBuf>,
    internal_pubkey: BigInt,
    network: Network,
}

impl TapTree {
    pub fn new(leaves: Vec<ScriptBuf>, network: Network) -> Self {
        Self {
            leaves,
            internal_pubkey: INTERNAL_PUBLIC_KEY.clone(),
            network,
        }
    }

    fn leaf_hashes(&self) -> Vec<[u8; 32]> {
        self.leaves
            .iter()
            .map(|s| tapleaf_hash(s.as_bytes()))
            .collect()
    }

    /// Merkle root over the leaf hashes, pairing the last odd node with
    /// itself at each level. Zero leaves yield the dead sentinel.
    pub fn root(&self) -> [u8; 32] {
        let mut level = self.leaf_hashes();
        if level.is_empty() {
            return *DEAD_ROOT_HASH;
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| combine_hashes(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
        }
        level[0]
    }

    /// Sibling hashes on the path from leaf `index` to the root, leaf level
    /// first. An odd node at any level is its own sibling.
    pub fn proof(&self, index: usize) -> VaultResult<Vec<u8>> {
        if index >= self.leaves.len() {
            return Err(VaultError::operation(
                "taptree_proof",
                format!("leaf index {index} out of range"),
            ));
        }
        let mut level = self.leaf_hashes();
        let mut index = index;
        let mut proof = Vec::new();
        while level.len() > 1 {
            let sibling = level.get(index ^ 1).unwrap_or(&level[index]);
            proof.extend_from_slice(sibling);
            level = level
                .chunks(2)
                .map(|pair| combine_hashes(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            index >>= 1;
        }
        Ok(proof)
    }

    /// BIP-341 control block for leaf `index`:
    /// `(leafVersion | parity) || internalKey.x || proof(index)`
    pub fn control_block(&self, index: usize) -> VaultResult<Vec<u8>> {
        let proof = self.proof(index)?;
        let (parity, _) = taproot_tweak_pubkey(&self.internal_pubkey, &self.root())?;
        let mut block = Vec::with_capacity(33 + proof.len());
        block.push(TAPROOT_LEAF_VERSION | parity);
        block.extend_from_slice(&bigint_to_32_bytes(&self.internal_pubkey)?);
        block.extend_from_slice(&proof);
        Ok(block)
    }

    /// Taproot address committing to this tree
    pub fn address(&self) -> VaultResult<Address> {
        checked_address(&self.internal_pubkey, &self.root(), self.network)
    }
}

/// Streaming tree builder for large leaf counts.
///
/// Leaves are appended one at a time; only the per-level frontier and the
/// sibling hashes relevant to one chosen leaf's proof are retained. The
/// leaf count is padded up to the next power of two by repeating the last
/// appended hash, which reproduces [`TapTree`]'s odd-node self-pairing for
/// the final partial level.
pub struct Compressor {
    depth: usize,
    total: usize,
    data: Vec<Vec<[u8; 32]>>,
    next_index: usize,
    count: usize,
    last_hash: [u8; 32],
    index_to_save: Option<usize>,
    // Flipped-bit path prefixes of the saved leaf, one per tree level.
    indexes_for_proof: Vec<(usize, u64)>,
    proof: Vec<[u8; 32]>,
    internal_pubkey: BigInt,
    network: Network,
}

impl Compressor {
    /// `total_leaves` is the number of leaves that will be appended;
    /// `index_to_save` selects the leaf whose proof is tracked.
    pub fn new(
        total_leaves: usize,
        index_to_save: Option<usize>,
        network: Network,
    ) -> VaultResult<Self> {
        if total_leaves == 0 {
            return Err(VaultError::operation(
                "compressor",
                "at least one leaf is required",
            ));
        }
        if let Some(i) = index_to_save {
            if i >= total_leaves {
                return Err(VaultError::operation(
                    "compressor",
                    format!("saved index {i} out of range for {total_leaves} leaves"),
                ));
            }
        }
        let log2 = usize::BITS as usize - (total_leaves - 1).leading_zeros() as usize;
        let log2 = if total_leaves == 1 { 0 } else { log2 };
        let depth = log2 + 1;
        let indexes_for_proof = match index_to_save {
            Some(index) => (0..log2)
                .map(|i| {
                    let prefix_len = i + 1;
                    let prefix = (index as u64) >> (log2 - prefix_len);
                    (prefix_len, prefix ^ 1)
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(Self {
            depth,
            total: 1 << log2,
            data: vec![Vec::new(); depth],
            next_index: 0,
            count: 0,
            last_hash: [0u8; 32],
            index_to_save,
            indexes_for_proof,
            proof: vec![[0u8; 32]; log2],
            internal_pubkey: INTERNAL_PUBLIC_KEY.clone(),
            network,
        })
    }

    /// Append the next leaf script
    pub fn add_leaf(&mut self, script: &ScriptBuf) -> VaultResult<()> {
        self.add_hash(tapleaf_hash(script.as_bytes()))
    }

    /// Append the next leaf hash
    pub fn add_hash(&mut self, hash: [u8; 32]) -> VaultResult<()> {
        if self.count >= self.total {
            return Err(VaultError::operation(
                "compressor",
                "more leaves than the declared total",
            ));
        }
        if self.index_to_save == Some(self.next_index ^ 1) {
            self.proof[0] = hash;
        }
        self.data[self.depth - 1].push(hash);
        self.last_hash = hash;
        self.next_index += 1;
        self.count += 1;
        self.compress();
        Ok(())
    }

    // The path position of the next node to be produced at `level`,
    // encoded as (bit-length, value) so it compares against the saved
    // leaf's flipped-bit prefixes.
    fn index_at_level(&self, level: usize) -> (usize, u64) {
        let mut n: u64 = 0;
        for i in 0..=level {
            n = n * 2 + self.data[i].len() as u64;
        }
        (level, n)
    }

    fn compress(&mut self) {
        for i in (1..self.depth).rev() {
            if self.data[i].len() == 2 {
                let hash = combine_hashes(&self.data[i][0], &self.data[i][1]);
                if self.index_to_save.is_some()
                    && i >= 2
                    && self.index_at_level(i - 1) == self.indexes_for_proof[i - 2]
                {
                    self.proof[self.depth - i] = hash;
                }
                self.data[i].clear();
                self.data[i - 1].push(hash);
            }
        }
    }

    /// Merkle root; pads the leaf count to the declared power-of-two total
    /// by repeating the last appended hash.
    pub fn root(&mut self) -> VaultResult<[u8; 32]> {
        if self.count == 0 {
            return Ok(*DEAD_ROOT_HASH);
        }
        while self.count < self.total {
            let pad = self.last_hash;
            self.add_hash(pad)?;
        }
        Ok(self.data[0][0])
    }

    /// Control block for the saved leaf
    pub fn control_block(&mut self) -> VaultResult<Vec<u8>> {
        if self.index_to_save.is_none() {
            return Err(VaultError::operation(
                "compressor",
                "no leaf index was selected for proof tracking",
            ));
        }
        let root = self.root()?;
        let (parity, _) = taproot_tweak_pubkey(&self.internal_pubkey, &root)?;
        let mut block = Vec::with_capacity(33 + 32 * self.proof.len());
        block.push(TAPROOT_LEAF_VERSION | parity);
        block.extend_from_slice(&bigint_to_32_bytes(&self.internal_pubkey)?);
        for sibling in &self.proof {
            block.extend_from_slice(sibling);
        }
        Ok(block)
    }

    /// Taproot address committing to the streamed tree
    pub fn address(&mut self) -> VaultResult<Address> {
        let root = self.root()?;
        checked_address(&self.internal_pubkey, &root, self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::Builder;
    use bitcoin::taproot::TaprootBuilder;

    fn leaf(n: u8) -> ScriptBuf {
        Builder::new().push_slice([n; 4]).into_script()
    }

    #[test]
    fn test_dead_sentinels_are_distinct() {
        assert_ne!(*DEAD_ROOT_HASH, *DEAD_ROOT_PAIR);
        assert_eq!(
            combine_hashes(&DEAD_ROOT_HASH, &DEAD_ROOT_HASH),
            *DEAD_ROOT_PAIR
        );
    }

    #[test]
    fn test_combine_is_order_independent() {
        let a = tapleaf_hash(&[1]);
        let b = tapleaf_hash(&[2]);
        assert_eq!(combine_hashes(&a, &b), combine_hashes(&b, &a));
    }

    #[test]
    fn test_empty_tree_root_is_dead_sentinel() {
        let tree = TapTree::new(vec![], Network::Regtest);
        assert_eq!(tree.root(), *DEAD_ROOT_HASH);
    }

    #[test]
    fn test_single_leaf_matches_library_derivation() {
        let tree = TapTree::new(vec![leaf(1)], Network::Regtest);
        let address = tree.address().unwrap();

        let secp = Secp256k1::new();
        let internal =
            XOnlyPublicKey::from_slice(&bigint_to_32_bytes(&INTERNAL_PUBLIC_KEY).unwrap())
                .unwrap();
        let info = TaprootBuilder::new()
            .add_leaf(0, leaf(1))
            .unwrap()
            .finalize(&secp, internal)
            .unwrap();
        let expected = Address::p2tr_tweaked(info.output_key(), Network::Regtest);
        assert_eq!(address, expected);
    }

    #[test]
    fn test_two_leaf_tree_matches_library_derivation() {
        let tree = TapTree::new(vec![leaf(1), leaf(2)], Network::Regtest);
        let address = tree.address().unwrap();

        let secp = Secp256k1::new();
        let internal =
            XOnlyPublicKey::from_slice(&bigint_to_32_bytes(&INTERNAL_PUBLIC_KEY).unwrap())
                .unwrap();
        let info = TaprootBuilder::new()
            .add_leaf(1, leaf(1))
            .unwrap()
            .add_leaf(1, leaf(2))
            .unwrap()
            .finalize(&secp, internal)
            .unwrap();
        let expected = Address::p2tr_tweaked(info.output_key(), Network::Regtest);
        assert_eq!(address, expected);
    }

    #[test]
    fn test_control_block_layout() {
        // depth 0: a single leaf has an empty proof.
        let single = TapTree::new(vec![leaf(1)], Network::Regtest);
        assert_eq!(single.control_block(0).unwrap().len(), 33);

        // depth 2: four leaves.
        let scripts: Vec<ScriptBuf> = (0..4).map(leaf).collect();
        let tree = TapTree::new(scripts, Network::Regtest);
        for i in 0..4 {
            let block = tree.control_block(i).unwrap();
            assert_eq!(block.len(), 33 + 32 * 2);
            assert_eq!(block[0] & 0xfe, TAPROOT_LEAF_VERSION);
            assert_eq!(
                block[1..33],
                bigint_to_32_bytes(&INTERNAL_PUBLIC_KEY).unwrap()
            );
        }
    }

    #[test]
    fn test_odd_leaf_is_its_own_sibling() {
        let scripts: Vec<ScriptBuf> = (0..3).map(leaf).collect();
        let tree = TapTree::new(scripts, Network::Regtest);
        let proof = tree.proof(2).unwrap();
        // Leaf 2 has no sibling, so the first proof entry is its own hash.
        assert_eq!(proof[..32], tapleaf_hash(leaf(2).as_bytes()));
    }

    #[test]
    fn test_address_derivation_is_deterministic() {
        let scripts: Vec<ScriptBuf> = (0..3).map(leaf).collect();
        let a = TapTree::new(scripts.clone(), Network::Testnet);
        let b = TapTree::new(scripts, Network::Testnet);
        assert_eq!(a.address().unwrap(), b.address().unwrap());
    }

    #[test]
    fn test_compressor_matches_taptree_roots() {
        // Counts where last-leaf padding reproduces odd-node self-pairing.
        for count in [1usize, 2, 3, 4, 5, 8] {
            let scripts: Vec<ScriptBuf> = (0..count as u8).map(leaf).collect();
            let tree = TapTree::new(scripts.clone(), Network::Regtest);

            let mut compressor = Compressor::new(count, None, Network::Regtest).unwrap();
            for script in &scripts {
                compressor.add_leaf(script).unwrap();
            }
            assert_eq!(compressor.root().unwrap(), tree.root(), "count {count}");
            assert_eq!(
                compressor.address().unwrap(),
                tree.address().unwrap(),
                "count {count}"
            );
        }
    }

    #[test]
    fn test_compressor_proof_matches_taptree() {
        let scripts: Vec<ScriptBuf> = (0..4).map(leaf).collect();
        let tree = TapTree::new(scripts.clone(), Network::Regtest);
        for index in 0..4 {
            let mut compressor =
                Compressor::new(4, Some(index), Network::Regtest).unwrap();
            for script in &scripts {
                compressor.add_leaf(script).unwrap();
            }
            assert_eq!(
                compressor.control_block().unwrap(),
                tree.control_block(index).unwrap(),
                "index {index}"
            );
        }
    }

    #[test]
    fn test_compressor_rejects_overflow_and_bad_index() {
        assert!(Compressor::new(2, Some(2), Network::Regtest).is_err());

        let mut compressor = Compressor::new(2, None, Network::Regtest).unwrap();
        compressor.add_hash([1u8; 32]).unwrap();
        compressor.add_hash([2u8; 32]).unwrap();
        assert!(compressor.add_hash([3u8; 32]).is_err());
    }
}
