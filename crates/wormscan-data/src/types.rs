//! Type definitions for the indexed chain data.
//!
//! Chain-level records keep alloy primitives; they are rendered as lowercase
//! hex (and amounts as decimal strings) only at the storage boundary.
//! Wormholes domain records carry string addresses because SNFT identifiers
//! are address *prefixes* of varying length.

use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Block header as stored for both canonical blocks and uncles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub miner: Address,
    /// Unix seconds.
    pub timestamp: u64,
    pub difficulty: U256,
    pub extra_data: Bytes,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub mix_hash: B256,
    pub nonce: u64,
    pub receipts_root: B256,
    pub sha3_uncles: B256,
    pub size: u64,
    pub state_root: B256,
    pub transactions_root: B256,
    pub uncles_count: u64,
}

/// Canonical block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub total_difficulty: U256,
    /// Number of transactions in the block body.
    pub total_transaction: u64,
}

/// Uncle header plus the height of the block that included it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uncle {
    pub header: Header,
    pub included_in: u64,
    pub position: u64,
}

/// Transaction merged with its receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub timestamp: u64,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: U256,
    pub status: Option<u64>,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub tx_index: u64,
}

impl Transaction {
    /// First 4 bytes of the calldata, when the input is long enough to hold
    /// a selector (at least `0x` + 8 hex chars).
    pub fn method_id(&self) -> Option<FixedBytes<4>> {
        (self.input.len() >= 4).then(|| FixedBytes::from_slice(&self.input[..4]))
    }

    /// Recipient the top-level call executes in: `to`, or the created
    /// contract for deployments.
    pub fn effective_to(&self) -> Option<Address> {
        self.to.or(self.contract_address)
    }

    pub fn succeeded(&self) -> bool {
        self.status != Some(0)
    }
}

/// Event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub block_number: u64,
    pub tx_hash: B256,
    /// Position of the log in the block.
    pub index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub removed: bool,
}

/// Call-like opcode that produced an internal transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallOp {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    Create,
    Create2,
    SelfDestruct,
}

impl CallOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op.to_ascii_uppercase().as_str() {
            "CALL" => Some(CallOp::Call),
            "CALLCODE" => Some(CallOp::CallCode),
            "DELEGATECALL" => Some(CallOp::DelegateCall),
            "STATICCALL" => Some(CallOp::StaticCall),
            "CREATE" => Some(CallOp::Create),
            "CREATE2" => Some(CallOp::Create2),
            "SELFDESTRUCT" => Some(CallOp::SelfDestruct),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallOp::Call => "CALL",
            CallOp::CallCode => "CALLCODE",
            CallOp::DelegateCall => "DELEGATECALL",
            CallOp::StaticCall => "STATICCALL",
            CallOp::Create => "CREATE",
            CallOp::Create2 => "CREATE2",
            CallOp::SelfDestruct => "SELFDESTRUCT",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, CallOp::Create | CallOp::Create2)
    }
}

/// Message call made from inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTx {
    pub tx_hash: B256,
    pub block_number: u64,
    pub depth: u64,
    pub op: CallOp,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
}

/// Token movement unpacked from a Transfer-style event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "standard", rename_all = "lowercase")]
pub enum TransferRecord {
    Erc20 {
        tx_hash: B256,
        log_index: u64,
        address: Address,
        from: Address,
        to: Address,
        value: U256,
    },
    Erc721 {
        tx_hash: B256,
        log_index: u64,
        address: Address,
        from: Address,
        to: Address,
        token_id: U256,
    },
    Erc1155 {
        tx_hash: B256,
        log_index: u64,
        /// Position inside a TransferBatch payload; 0 for TransferSingle.
        batch_index: u64,
        address: Address,
        operator: Address,
        from: Address,
        to: Address,
        token_id: U256,
        value: U256,
    },
}

impl TransferRecord {
    /// Contract that emitted the event.
    pub fn contract(&self) -> Address {
        match self {
            TransferRecord::Erc20 { address, .. }
            | TransferRecord::Erc721 { address, .. }
            | TransferRecord::Erc1155 { address, .. } => *address,
        }
    }

    /// Contract kind the emitter must have for the record to be kept.
    pub fn required_kind(&self) -> ContractKind {
        match self {
            TransferRecord::Erc20 { .. } => ContractKind::Erc20,
            TransferRecord::Erc721 { .. } => ContractKind::Erc721,
            TransferRecord::Erc1155 { .. } => ContractKind::Erc1155,
        }
    }
}

/// Result of probing a contract with `eth_call`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    /// Has code but matches no known interface.
    Other,
    Erc20,
    Erc165,
    Erc721,
    Erc1155,
}

impl ContractKind {
    /// Stable integer code persisted in `accounts.contract_type`.
    pub fn code(&self) -> i64 {
        match self {
            ContractKind::Other => 0,
            ContractKind::Erc20 => 1,
            ContractKind::Erc165 => 2,
            ContractKind::Erc721 => 3,
            ContractKind::Erc1155 => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ContractKind::Other),
            1 => Some(ContractKind::Erc20),
            2 => Some(ContractKind::Erc165),
            3 => Some(ContractKind::Erc721),
            4 => Some(ContractKind::Erc1155),
            _ => None,
        }
    }
}

/// Account state after the block that last modified it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
    /// Height this snapshot was taken at.
    pub number: u64,
    /// keccak256 of the runtime code, for contracts.
    pub code_hash: Option<B256>,
    pub kind: Option<ContractKind>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub creator: Option<Address>,
    pub created_tx: Option<B256>,
    /// SNFT vote weight reported by `eth_getAccountInfo`.
    pub snft_value: U256,
}

/// How an NFT transaction refers to its token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NftRef {
    /// An NFT or SNFT (prefix) that already exists.
    Address(String),
    /// The `n`-th NFT minted by the same block; its address is assigned at
    /// commit time.
    Minted(usize),
}

/// User-minted NFT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nft {
    pub royalty_ratio: u32,
    pub meta_url: String,
    pub raw_meta_url: String,
    pub exchanger: String,
    pub creator: String,
    pub owner: String,
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: String,
}

/// NFT/SNFT trade, transfer or recycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftTx {
    pub tx_type: u8,
    pub nft: NftRef,
    pub exchanger: Option<String>,
    /// Empty when the seller is the current owner, resolved at commit.
    pub from: String,
    /// Empty for SNFT recycles.
    pub to: String,
    /// Decimal wei; `"0"` when no price is attached.
    pub price: String,
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: String,
}

impl NftTx {
    pub fn is_recycle(&self) -> bool {
        self.to.is_empty()
    }
}

/// First SNFT batch of a new epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// First 39 hex chars of the SNFT address, `0x` included.
    pub id: String,
    pub creator: String,
    pub royalty_ratio: u32,
    pub dir: String,
    pub exchanger: String,
    pub vote_weight: String,
    /// Block at which the epoch's start index took effect.
    pub number: u64,
    pub start_number: u64,
    pub start_time: u64,
    pub reward: String,
}

/// Per-block beneficiary record. Exactly one of `snft` / `amount` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub address: String,
    /// 1: block producer, 2: validator, 3: exchanger.
    pub identity: u8,
    pub block_number: u64,
    pub snft: Option<String>,
    pub amount: Option<String>,
}

/// Validator pledge/proxy/weight delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorChange {
    pub address: String,
    /// Signed decimal delta.
    pub amount: String,
    pub proxy: Option<String>,
    pub weight: Option<i64>,
}

/// Validator pledge ledger entry (types 9/10).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pledge {
    pub address: String,
    pub pledge_type: u8,
    pub amount: String,
    pub number: u64,
    pub timestamp: u64,
    pub tx_hash: String,
}

/// Exchanger lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangerChange {
    Open {
        address: String,
        name: String,
        url: String,
        fee_ratio: u32,
        timestamp: u64,
        block_number: u64,
        tx_hash: String,
        amount: String,
    },
    Close {
        address: String,
        timestamp: u64,
        block_number: u64,
    },
    /// Signed decimal delta on the exchanger stake.
    Pledge { address: String, amount: String },
}

/// SNFT stake toggle for every SNFT under `prefix`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnftPledge {
    pub owner: String,
    pub prefix: String,
    pub pledge: bool,
}

/// SNFT pieces merged into a higher-level SNFT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnftMerge {
    pub address: String,
    pub owner: String,
    pub pieces: u64,
    pub number: u64,
    pub timestamp: u64,
}

/// Validator weight recorded for a black-hole block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub address: String,
    pub weight: i64,
}

/// Domain-level deltas derived from rewards and wormholes transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDelta {
    pub epoch: Option<Epoch>,
    pub nfts: Vec<Nft>,
    pub nft_txs: Vec<NftTx>,
    pub rewards: Vec<Reward>,
    pub validators: Vec<ValidatorChange>,
    pub pledges: Vec<Pledge>,
    pub exchangers: Vec<ExchangerChange>,
    pub snft_pledges: Vec<SnftPledge>,
    pub merges: Vec<SnftMerge>,
    pub penalties: Vec<Penalty>,
    pub proposers: Vec<String>,
}

/// Everything decoded for one height. Produced by the decoder, consumed
/// read-only by the writer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parsed {
    pub block: Block,
    pub txs: Vec<Transaction>,
    pub internal_txs: Vec<InternalTx>,
    pub uncles: Vec<Uncle>,
    pub logs: Vec<Log>,
    pub transfers: Vec<TransferRecord>,
    pub accounts: Vec<Account>,
    pub domain: DomainDelta,
}

impl Parsed {
    pub fn number(&self) -> u64 {
        self.block.header.number
    }

    pub fn hash(&self) -> B256 {
        self.block.header.hash
    }

    pub fn parent_hash(&self) -> B256 {
        self.block.header.parent_hash
    }
}

/// Lowercase `0x`-prefixed hex of a fixed-size value.
pub fn lower_hex<T: std::fmt::LowerHex>(value: &T) -> String {
    format!("{value:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with_input(input: &[u8]) -> Transaction {
        Transaction {
            hash: B256::ZERO,
            block_hash: B256::ZERO,
            block_number: 1,
            timestamp: 0,
            from: Address::ZERO,
            to: None,
            input: Bytes::copy_from_slice(input),
            value: U256::ZERO,
            nonce: 0,
            gas: 21_000,
            gas_price: U256::ZERO,
            status: Some(1),
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            contract_address: Some(Address::with_last_byte(7)),
            tx_index: 0,
        }
    }

    #[test]
    fn method_id_needs_four_bytes() {
        assert_eq!(tx_with_input(&[0xa9, 0x05, 0x9c]).method_id(), None);
        assert_eq!(
            tx_with_input(&[0xa9, 0x05, 0x9c, 0xbb, 0x00]).method_id(),
            Some(FixedBytes::from([0xa9, 0x05, 0x9c, 0xbb]))
        );
    }

    #[test]
    fn effective_to_falls_back_to_created_contract() {
        let tx = tx_with_input(&[]);
        assert_eq!(tx.effective_to(), Some(Address::with_last_byte(7)));
    }

    #[test]
    fn lower_hex_renders_prefixed_lowercase() {
        let addr = Address::with_last_byte(0xAB);
        assert_eq!(
            lower_hex(&addr),
            "0x00000000000000000000000000000000000000ab"
        );
    }

    #[test]
    fn contract_kind_codes_round_trip() {
        for kind in [
            ContractKind::Other,
            ContractKind::Erc20,
            ContractKind::Erc165,
            ContractKind::Erc721,
            ContractKind::Erc1155,
        ] {
            assert_eq!(ContractKind::from_code(kind.code()), Some(kind));
        }
    }
}
