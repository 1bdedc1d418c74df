//! External services: the Bitcoin node and the charms prover subprocess.
//! Both are reached through traits so the builders can be exercised against
//! in-memory fakes.

pub mod prover;
pub mod rpc_client;

pub use prover::{CharmsProver, ProveRequest, SpellProver};
pub use rpc_client::{BitcoinRpcClient, ChainClient, TxCache};
