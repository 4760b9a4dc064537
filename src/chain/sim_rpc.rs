//! In-process chain for development and end-to-end tests.
//!
//! Executes signed raw transactions against the contract reference model
//! with real nonce and gas-price acceptance rules. Every accepted
//! transaction mines a block; every `block_number` poll advances the head
//! by one so confirmation counts grow without wall-clock waits.

use crate::chain::abi::{self, OracleCall};
use crate::chain::contract::SentimentOracle;
use crate::chain::rpc::{BlockTag, CallRequest, EthRpc, RpcError};
use crate::types::OracleEntry;
use async_trait::async_trait;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, NameOrAddress, TransactionReceipt, H256, U256, U64};
use ethers_core::utils::keccak256;
use ethers_core::utils::rlp::Rlp;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

struct SimChain {
    contract: SentimentOracle,
    contract_address: Address,
    chain_id: u64,
    block_number: u64,
    /// Chain-side clock, seconds
    now: u64,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<H256, TransactionReceipt>,
    gas_price: U256,
    /// Transactions priced below this are refused as underpriced
    min_gas_price: U256,
}

/// `EthRpc` backed by the contract model instead of a node.
pub struct SimRpc {
    chain: Mutex<SimChain>,
}

impl SimRpc {
    pub fn new(chain_id: u64, contract_address: Address, contract: SentimentOracle) -> Self {
        Self {
            chain: Mutex::new(SimChain {
                contract,
                contract_address,
                chain_id,
                block_number: 1,
                now: 1_700_000_000,
                nonces: HashMap::new(),
                receipts: HashMap::new(),
                gas_price: U256::from(1_000_000_000u64),
                min_gas_price: U256::zero(),
            }),
        }
    }

    /// Move the chain clock forward.
    pub fn advance_time(&self, seconds: u64) {
        self.chain.lock().unwrap().now += seconds;
    }

    /// Pin the chain clock.
    pub fn set_time(&self, now: u64) {
        self.chain.lock().unwrap().now = now;
    }

    pub fn time(&self) -> u64 {
        self.chain.lock().unwrap().now
    }

    /// Refuse transactions priced below `floor`, as a congested pool would.
    pub fn set_min_gas_price(&self, floor: U256) {
        self.chain.lock().unwrap().min_gas_price = floor;
    }

    /// Inspect or mutate the underlying contract state.
    pub fn with_contract<R>(&self, f: impl FnOnce(&mut SentimentOracle) -> R) -> R {
        f(&mut self.chain.lock().unwrap().contract)
    }

    fn execute_call(
        chain: &mut SimChain,
        sender: Address,
        to: Address,
        data: &[u8],
    ) -> bool {
        if to != chain.contract_address {
            return false;
        }
        let now = chain.now;
        match abi::decode_call(data) {
            Ok(OracleCall::Update {
                asset,
                score_fp,
                sample_size,
                confidence_bp,
            }) => chain
                .contract
                .update_sentiment(sender, now, asset, score_fp, sample_size, confidence_bp)
                .is_ok(),
            Ok(OracleCall::BatchUpdate {
                assets,
                scores_fp,
                sample_sizes,
                confidences_bp,
            }) => chain
                .contract
                .batch_update_sentiment(
                    sender,
                    now,
                    &assets,
                    &scores_fp,
                    &sample_sizes,
                    &confidences_bp,
                )
                .is_ok(),
            // Reads sent as transactions burn gas but change nothing.
            Ok(OracleCall::Get { .. }) => true,
            Err(_) => false,
        }
    }
}

fn rpc_error(message: &str) -> RpcError {
    RpcError::Rpc {
        code: -32000,
        message: message.to_string(),
    }
}

#[async_trait]
impl EthRpc for SimRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.chain.lock().unwrap().chain_id)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let mut chain = self.chain.lock().unwrap();
        // The simulated chain keeps producing blocks while polled.
        chain.block_number += 1;
        Ok(chain.block_number)
    }

    async fn transaction_count(&self, address: Address, _tag: BlockTag) -> Result<u64, RpcError> {
        Ok(*self.chain.lock().unwrap().nonces.get(&address).unwrap_or(&0))
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        Ok(self.chain.lock().unwrap().gas_price)
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256, RpcError> {
        let data = call.data.as_ref().map(|d| d.as_ref()).unwrap_or_default();
        match abi::decode_call(data) {
            Ok(OracleCall::Update { .. }) | Ok(OracleCall::Get { .. }) => {
                Ok(U256::from(80_000u64))
            }
            Ok(OracleCall::BatchUpdate { assets, .. }) => {
                Ok(U256::from(50_000 + 30_000 * assets.len() as u64))
            }
            Err(_) => Err(rpc_error("execution reverted")),
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        let rlp = Rlp::new(raw.as_ref());
        let (tx, signature) = TypedTransaction::decode_signed(&rlp)
            .map_err(|e| rpc_error(&format!("invalid raw transaction: {}", e)))?;
        let sender = signature
            .recover(tx.sighash())
            .map_err(|e| rpc_error(&format!("invalid signature: {}", e)))?;

        let mut chain = self.chain.lock().unwrap();
        if tx.gas_price().unwrap_or_default() < chain.min_gas_price {
            return Err(rpc_error("transaction underpriced"));
        }

        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();
        let expected = *chain.nonces.get(&sender).unwrap_or(&0);
        if nonce < expected {
            return Err(rpc_error("nonce too low"));
        }
        if nonce > expected {
            return Err(rpc_error("nonce too high"));
        }

        let to = match tx.to() {
            Some(NameOrAddress::Address(address)) => *address,
            _ => Address::zero(),
        };
        let data = tx.data().map(|d| d.to_vec()).unwrap_or_default();
        let success = Self::execute_call(&mut chain, sender, to, &data);

        chain.nonces.insert(sender, expected + 1);
        chain.block_number += 1;
        let hash = H256::from(keccak256(raw.as_ref()));
        let mut receipt = TransactionReceipt::default();
        receipt.transaction_hash = hash;
        receipt.status = Some(U64::from(u64::from(success)));
        receipt.block_number = Some(U64::from(chain.block_number));
        chain.receipts.insert(hash, receipt);

        debug!(
            "sim chain mined tx {:?} at block {} (success: {})",
            hash, chain.block_number, success
        );
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        Ok(self.chain.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn call(&self, call: &CallRequest, _tag: BlockTag) -> Result<Bytes, RpcError> {
        let chain = self.chain.lock().unwrap();
        let data = call.data.as_ref().map(|d| d.as_ref()).unwrap_or_default();
        match abi::decode_call(data) {
            Ok(OracleCall::Get { asset }) => {
                let entry = chain.contract.get_sentiment(asset).unwrap_or(OracleEntry {
                    score_fp: 0,
                    timestamp: 0,
                    sample_size: 0,
                    confidence_bp: 0,
                });
                Ok(abi::encode_entry(&entry))
            }
            Ok(_) => Err(rpc_error("state-changing call over eth_call")),
            Err(_) => Err(rpc_error("execution reverted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::{encode_get, encode_update};
    use crate::chain::contract::OracleContractConfig;
    use crate::chain::signer::{apply_eip155, LocalSigner, TxSigner};
    use ethers_core::types::TransactionRequest;

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const CHAIN_ID: u64 = 31_337;

    fn contract_address() -> Address {
        Address::repeat_byte(0xcc)
    }

    async fn signed_update_tx(
        signer: &LocalSigner,
        nonce: u64,
        asset: Address,
        score_fp: i128,
    ) -> Bytes {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(signer.address())
            .to(contract_address())
            .gas(100_000u64)
            .gas_price(1_000_000_000u64)
            .nonce(nonce)
            .chain_id(CHAIN_ID)
            .data(encode_update(asset, score_fp, 10, 3124))
            .into();
        let signature = apply_eip155(signer.sign_digest(tx.sighash()).await.unwrap(), CHAIN_ID);
        tx.rlp_signed(&signature)
    }

    fn create_sim(signer: &LocalSigner) -> SimRpc {
        let contract = SentimentOracle::new(signer.address(), OracleContractConfig::default());
        SimRpc::new(CHAIN_ID, contract_address(), contract)
    }

    #[tokio::test]
    async fn test_signed_update_executes() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        let asset = Address::repeat_byte(0xaa);

        let raw = signed_update_tx(&signer, 0, asset, 42).await;
        let hash = sim.send_raw_transaction(raw).await.unwrap();

        let receipt = sim.transaction_receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, Some(U64::one()));
        assert_eq!(sim.with_contract(|c| c.get_sentiment(asset)).unwrap().score_fp, 42);
        assert_eq!(
            sim.transaction_count(signer.address(), BlockTag::Pending)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_nonce_discipline() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        let asset = Address::repeat_byte(0xaa);

        // A gap is refused.
        let raw = signed_update_tx(&signer, 5, asset, 1).await;
        let error = sim.send_raw_transaction(raw).await.unwrap_err();
        assert!(matches!(error, RpcError::Rpc { .. }));

        // The expected nonce lands, after which it is "too low".
        let raw = signed_update_tx(&signer, 0, asset, 1).await;
        sim.send_raw_transaction(raw.clone()).await.unwrap();
        let error = sim.send_raw_transaction(raw).await.unwrap_err();
        assert!(error.is_nonce_too_low());
    }

    #[tokio::test]
    async fn test_underpriced_rejection() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        sim.set_min_gas_price(U256::from(2_000_000_000u64));

        let raw = signed_update_tx(&signer, 0, Address::repeat_byte(0xaa), 1).await;
        let error = sim.send_raw_transaction(raw).await.unwrap_err();
        assert!(error.is_underpriced());
    }

    #[tokio::test]
    async fn test_reverting_update_mines_with_failed_status() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        let asset = Address::repeat_byte(0xaa);

        // Second update inside the minimum interval reverts on-chain but
        // still consumes the nonce.
        let raw = signed_update_tx(&signer, 0, asset, 10).await;
        sim.send_raw_transaction(raw).await.unwrap();
        let raw = signed_update_tx(&signer, 1, asset, 20).await;
        let hash = sim.send_raw_transaction(raw).await.unwrap();

        let receipt = sim.transaction_receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, Some(U64::zero()));
        assert_eq!(
            sim.transaction_count(signer.address(), BlockTag::Pending)
                .await
                .unwrap(),
            2
        );
        assert_eq!(sim.with_contract(|c| c.get_sentiment(asset)).unwrap().score_fp, 10);
    }

    #[tokio::test]
    async fn test_eth_call_reads_latest() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        let asset = Address::repeat_byte(0xaa);

        let raw = signed_update_tx(&signer, 0, asset, 600_000_000_000_000_000).await;
        sim.send_raw_transaction(raw).await.unwrap();

        let result = sim
            .call(
                &CallRequest {
                    from: None,
                    to: contract_address(),
                    data: Some(encode_get(asset)),
                },
                BlockTag::Latest,
            )
            .await
            .unwrap();
        let entry = abi::decode_entry(&result).unwrap();
        assert_eq!(entry.score_fp, 600_000_000_000_000_000);
        assert_eq!(entry.sample_size, 10);
        assert_eq!(entry.confidence_bp, 3124);
    }

    #[tokio::test]
    async fn test_block_number_advances_on_poll() {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let sim = create_sim(&signer);
        let first = sim.block_number().await.unwrap();
        let second = sim.block_number().await.unwrap();
        assert_eq!(second, first + 1);
    }
}
