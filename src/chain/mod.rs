//! Chain interaction: JSON-RPC transport, write-path ABI, signing, the
//! oracle contract reference model and the submitter.

pub mod abi;
pub mod contract;
pub mod rpc;
pub mod signer;
pub mod sim_rpc;
pub mod submitter;

pub use contract::{ContractError, OracleContractConfig, OracleEvent, SentimentOracle};
pub use rpc::{BlockTag, CallRequest, EthRpc, HttpRpc, RpcError};
pub use signer::{LocalSigner, RemoteSigner, SignerError, TxSigner};
pub use sim_rpc::SimRpc;
pub use submitter::{SubmitError, SubmitOutcome, Submitter, SubmitterConfig};
