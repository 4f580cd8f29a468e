//! Test doubles shared across modules

use crate::chain::{HtlcAdapter, HtlcParams, HtlcReceipt, HtlcState, TxReceipt};
use crate::error::ChainError;
use crate::swap::{Chain, Hashlock, Preimage, SwapDirection, SwapRequest};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// The secret used throughout the scenario tests
pub fn secret() -> Preimage {
    Preimage::new(b"secret".to_vec()).unwrap()
}

pub fn swap_request(direction: SwapDirection, timelock: u64) -> SwapRequest {
    SwapRequest {
        direction,
        sender: "0x1111111111111111111111111111111111111111".into(),
        recipient: "0x2222222222222222222222222222222222222222".into(),
        from_token_address: "0x3333333333333333333333333333333333333333".into(),
        to_token_address: "0xa".into(),
        amount: "1000".parse().unwrap(),
        hashlock: Hashlock::from_preimage(&secret()),
        timelock,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Withdraw,
    Refund,
    Query,
}

#[derive(Debug, Clone)]
pub struct FakeHtlc {
    pub sender: String,
    pub params: HtlcParams,
    pub state: HtlcState,
}

/// In-memory HTLC contract for one chain.
///
/// Enforces the same guards as the real contracts, minus time checks.
pub struct FakeChain {
    chain: Chain,
    relayer: String,
    htlcs: Mutex<HashMap<String, FakeHtlc>>,
    failures: Mutex<HashMap<FakeOp, VecDeque<ChainError>>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    withdrawals: AtomicUsize,
    refunds: AtomicUsize,
}

impl FakeChain {
    pub fn new(chain: Chain) -> Self {
        let relayer = match chain {
            Chain::Evm => "0x9999999999999999999999999999999999999999",
            Chain::Aptos => "0x7deeccb1080854f499ec8b4c1b213b82c5e34b925cf6875fec02d4b77adbd2d6",
        };
        Self {
            chain,
            relayer: relayer.to_string(),
            htlcs: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            creates: AtomicUsize::new(0),
            withdrawals: AtomicUsize::new(0),
            refunds: AtomicUsize::new(0),
        }
    }

    fn new_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self.chain {
            Chain::Evm => format!("0x{:064x}", n),
            Chain::Aptos => n.to_string(),
        }
    }

    /// Lock funds as some other account, returning the contract id
    pub fn lock(&self, sender: &str, params: HtlcParams) -> String {
        let id = self.new_id();
        self.htlcs.lock().unwrap().insert(
            id.clone(),
            FakeHtlc {
                sender: sender.to_string(),
                params,
                state: HtlcState::Locked,
            },
        );
        id
    }

    /// Withdraw as the receiver would, outside the relayer
    pub fn reveal(&self, contract_id: &str, preimage: &Preimage) {
        let mut htlcs = self.htlcs.lock().unwrap();
        let htlc = htlcs.get_mut(contract_id).unwrap();
        assert!(preimage.verify(&htlc.params.hashlock));
        htlc.state = HtlcState::Withdrawn {
            preimage: Some(preimage.clone()),
        };
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: FakeOp, error: ChainError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn htlc(&self, contract_id: &str) -> Option<FakeHtlc> {
        self.htlcs.lock().unwrap().get(contract_id).cloned()
    }

    pub fn htlc_count(&self) -> usize {
        self.htlcs.lock().unwrap().len()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn withdrawals(&self) -> usize {
        self.withdrawals.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> usize {
        self.refunds.load(Ordering::SeqCst)
    }

    fn injected(&self, op: FakeOp) -> Result<(), ChainError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn receipt(&self, contract_id: &str) -> TxReceipt {
        TxReceipt {
            tx_hash: format!("{}-tx-{}", self.chain, contract_id),
            block_number: Some(1),
        }
    }

    fn not_found(&self, contract_id: &str) -> ChainError {
        ChainError::Rejected {
            chain: self.chain,
            reason: format!("contract does not exist: {}", contract_id),
        }
    }
}

#[async_trait]
impl HtlcAdapter for FakeChain {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn relayer_address(&self) -> String {
        self.relayer.clone()
    }

    async fn create_htlc(&self, params: &HtlcParams) -> Result<HtlcReceipt, ChainError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.injected(FakeOp::Create)?;
        let contract_id = self.lock(&self.relayer, params.clone());
        Ok(HtlcReceipt {
            tx_hash: format!("{}-create-{}", self.chain, contract_id),
            contract_id,
        })
    }

    async fn withdraw(&self, contract_id: &str, preimage: &Preimage) -> Result<TxReceipt, ChainError> {
        self.withdrawals.fetch_add(1, Ordering::SeqCst);
        self.injected(FakeOp::Withdraw)?;

        let mut htlcs = self.htlcs.lock().unwrap();
        let htlc = htlcs
            .get_mut(contract_id)
            .ok_or_else(|| self.not_found(contract_id))?;
        match htlc.state {
            HtlcState::Withdrawn { .. } => Err(ChainError::AlreadyWithdrawn {
                chain: self.chain,
                contract_id: contract_id.to_string(),
            }),
            HtlcState::Refunded => Err(ChainError::AlreadyRefunded {
                chain: self.chain,
                contract_id: contract_id.to_string(),
            }),
            _ if !preimage.verify(&htlc.params.hashlock) => Err(ChainError::Rejected {
                chain: self.chain,
                reason: "hashlock hash must match".into(),
            }),
            _ => {
                htlc.state = HtlcState::Withdrawn {
                    preimage: Some(preimage.clone()),
                };
                Ok(self.receipt(contract_id))
            }
        }
    }

    async fn refund(&self, contract_id: &str) -> Result<TxReceipt, ChainError> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        self.injected(FakeOp::Refund)?;

        let mut htlcs = self.htlcs.lock().unwrap();
        let htlc = htlcs
            .get_mut(contract_id)
            .ok_or_else(|| self.not_found(contract_id))?;
        match htlc.state {
            HtlcState::Withdrawn { .. } => Err(ChainError::AlreadyWithdrawn {
                chain: self.chain,
                contract_id: contract_id.to_string(),
            }),
            HtlcState::Refunded => Err(ChainError::AlreadyRefunded {
                chain: self.chain,
                contract_id: contract_id.to_string(),
            }),
            _ => {
                htlc.state = HtlcState::Refunded;
                Ok(self.receipt(contract_id))
            }
        }
    }

    async fn get_htlc_state(&self, contract_id: &str) -> Result<HtlcState, ChainError> {
        self.injected(FakeOp::Query)?;
        Ok(self
            .htlcs
            .lock()
            .unwrap()
            .get(contract_id)
            .map(|htlc| htlc.state.clone())
            .unwrap_or(HtlcState::Missing))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
