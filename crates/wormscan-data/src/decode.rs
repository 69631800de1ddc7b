//! Block decoder: composes the per-height RPC calls into one [`Parsed`].
//!
//! For a height `N` the decoder reads the block body, the receipts and logs,
//! the uncles, the internal transactions, the modified accounts and the
//! Wormholes domain data. It is stateless apart from a classifier cache and
//! can be shared across workers.

use alloy::primitives::{keccak256, Address, Bytes, B256, B64, U256, U64};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::amount::{de_decimal, parse_unsigned};
use crate::classify::{self, ContractInfo};
use crate::error::{DecodeError, RpcError};
use crate::logs::unpack_transfer_log;
use crate::node::{hex_quantity, BlockTag, Capabilities, Node, Request};
use crate::trace::{trace_transaction, TraceStrategy, DEFAULT_STRUCT_LOG_CAP};
use crate::types::{
    lower_hex, Account, Block, Header, InternalTx, Log, Parsed, Transaction, Uncle,
};
use crate::wormholes::{self, AccountInfo, BATCH_CHUNK};

/// Concurrent `debug_traceTransaction` calls per block.
const TRACE_CONCURRENCY: usize = 4;

/// Header fields as returned by `eth_getBlockByNumber` and the uncle lookups.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub miner: Address,
    pub timestamp: U64,
    #[serde(default)]
    pub difficulty: U256,
    #[serde(default)]
    pub extra_data: Bytes,
    pub gas_limit: U64,
    pub gas_used: U64,
    #[serde(default)]
    pub mix_hash: B256,
    #[serde(default)]
    pub nonce: Option<B64>,
    #[serde(default)]
    pub receipts_root: B256,
    #[serde(default)]
    pub sha3_uncles: B256,
    #[serde(default)]
    pub size: Option<U64>,
    #[serde(default)]
    pub state_root: B256,
    #[serde(default)]
    pub transactions_root: B256,
    #[serde(default)]
    pub uncles: Vec<B256>,
}

impl RpcHeader {
    pub fn into_header(self) -> Header {
        Header {
            number: self.number.to(),
            hash: self.hash,
            parent_hash: self.parent_hash,
            miner: self.miner,
            timestamp: self.timestamp.to(),
            difficulty: self.difficulty,
            extra_data: self.extra_data,
            gas_limit: self.gas_limit.to(),
            gas_used: self.gas_used.to(),
            mix_hash: self.mix_hash,
            nonce: self.nonce.map(|n| u64::from_be_bytes(n.0)).unwrap_or_default(),
            receipts_root: self.receipts_root,
            sha3_uncles: self.sha3_uncles,
            size: self.size.map(|s| s.to()).unwrap_or_default(),
            state_root: self.state_root,
            transactions_root: self.transactions_root,
            uncles_count: self.uncles.len() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    #[serde(flatten)]
    header: RpcHeader,
    #[serde(default)]
    total_difficulty: Option<U256>,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    input: Bytes,
    value: U256,
    nonce: U64,
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    #[serde(default)]
    status: Option<U64>,
    cumulative_gas_used: U64,
    gas_used: U64,
    #[serde(default)]
    contract_address: Option<Address>,
    transaction_index: U64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    #[serde(default)]
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    block_number: U64,
    transaction_hash: B256,
    log_index: U64,
    #[serde(default)]
    removed: bool,
}

impl From<RpcLog> for Log {
    fn from(log: RpcLog) -> Self {
        Log {
            block_number: log.block_number.to(),
            tx_hash: log.transaction_hash,
            index: log.log_index.to(),
            address: log.address,
            topics: log.topics,
            data: log.data,
            removed: log.removed,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AccountRange {
    #[serde(default)]
    accounts: HashMap<String, RangeAccount>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeAccount {
    #[serde(default, deserialize_with = "de_decimal")]
    balance: String,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    code: Option<Bytes>,
    #[serde(default)]
    address: Option<Address>,
}

/// Turns heights into [`Parsed`] aggregates.
#[derive(Clone)]
pub struct BlockDecoder {
    node: Node,
    caps: Capabilities,
    strategy: TraceStrategy,
    trace_cap: usize,
    classified: Arc<DashMap<Address, ContractInfo>>,
}

impl BlockDecoder {
    pub fn new(node: Node, caps: Capabilities) -> Self {
        Self {
            node,
            caps,
            strategy: TraceStrategy::default(),
            trace_cap: DEFAULT_STRUCT_LOG_CAP,
            classified: Arc::new(DashMap::new()),
        }
    }

    /// Overrides how internal transactions are traced.
    pub fn with_trace(mut self, strategy: TraceStrategy, cap: usize) -> Self {
        self.strategy = strategy;
        self.trace_cap = cap;
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Decodes height `number`.
    ///
    /// # Errors
    /// - [`DecodeError::NotFound`] if the node does not have the block yet
    /// - [`DecodeError::ReceiptNotReady`] if a receipt is missing or empty
    /// - any RPC, payload or signature error
    #[tracing::instrument(skip(self), fields(block_number = number))]
    pub async fn decode(&self, number: u64) -> Result<Parsed, DecodeError> {
        let raw: Option<RpcBlock> = self
            .node
            .call("eth_getBlockByNumber", json!([hex_quantity(number), true]))
            .await?;
        let Some(raw) = raw else {
            return Err(DecodeError::NotFound(number));
        };

        let total_difficulty = raw.total_difficulty.unwrap_or_default();
        let uncle_hashes = raw.header.uncles.clone();
        let header = raw.header.into_header();
        let rpc_txs = raw.transactions;

        let mut parsed = Parsed {
            block: Block {
                header,
                total_difficulty,
                total_transaction: rpc_txs.len() as u64,
            },
            ..Parsed::default()
        };

        if !rpc_txs.is_empty() {
            parsed.txs = self.receipts(&parsed.block.header, rpc_txs).await?;
            parsed.logs = self.logs(parsed.hash()).await?;
        }
        parsed.uncles = self.uncles(&parsed.block.header, uncle_hashes.len()).await?;
        parsed.transfers = parsed.logs.iter().flat_map(unpack_transfer_log).collect();

        if self.caps.debug {
            parsed.internal_txs = self.internal_txs(&parsed.txs).await?;
        }
        parsed.accounts = self.accounts(&parsed).await?;

        let node = self.caps.domain.then_some(&self.node);
        parsed.domain = wormholes::decode_domain(
            node,
            &parsed.block.header,
            &parsed.txs,
            &parsed.logs,
            &parsed.accounts,
        )
        .await?;

        tracing::debug!(
            txs = parsed.txs.len(),
            internal_txs = parsed.internal_txs.len(),
            logs = parsed.logs.len(),
            accounts = parsed.accounts.len(),
            "block decoded"
        );
        Ok(parsed)
    }

    /// Header of `number`, or `None` if the node does not have it.
    ///
    /// # Errors
    /// Returns the RPC failure.
    pub async fn header(&self, number: u64) -> Result<Option<Header>, RpcError> {
        let raw: Option<RpcHeader> = self
            .node
            .call("eth_getBlockByNumber", json!([hex_quantity(number), false]))
            .await?;
        Ok(raw.map(RpcHeader::into_header))
    }

    async fn receipts(
        &self,
        header: &Header,
        rpc_txs: Vec<RpcTransaction>,
    ) -> Result<Vec<Transaction>, DecodeError> {
        let requests: Vec<Request> = rpc_txs
            .iter()
            .map(|tx| Request::new("eth_getTransactionReceipt", json!([tx.hash])))
            .collect();
        let receipts = self.node.batch_as::<Option<RpcReceipt>>(&requests).await?;

        rpc_txs
            .into_iter()
            .zip(receipts)
            .map(|(tx, receipt)| -> Result<Transaction, DecodeError> {
                let receipt = receipt?
                    .filter(|r| r.gas_used.to::<u64>() > 0)
                    .ok_or_else(|| DecodeError::ReceiptNotReady(lower_hex(&tx.hash)))?;
                Ok(Transaction {
                    hash: tx.hash,
                    block_hash: header.hash,
                    block_number: header.number,
                    timestamp: header.timestamp,
                    from: tx.from,
                    to: tx.to,
                    input: tx.input,
                    value: tx.value,
                    nonce: tx.nonce.to(),
                    gas: tx.gas.to(),
                    gas_price: tx.gas_price.unwrap_or_default(),
                    status: receipt.status.map(|s| s.to()),
                    cumulative_gas_used: receipt.cumulative_gas_used.to(),
                    gas_used: receipt.gas_used.to(),
                    contract_address: receipt.contract_address,
                    tx_index: receipt.transaction_index.to(),
                })
            })
            .collect()
    }

    /// Logs are queried by block hash; a height query can race a reorg.
    async fn logs(&self, block_hash: B256) -> Result<Vec<Log>, DecodeError> {
        let logs: Option<Vec<RpcLog>> = self
            .node
            .call("eth_getLogs", json!([{ "blockHash": block_hash }]))
            .await?;
        Ok(logs.unwrap_or_default().into_iter().map(Log::from).collect())
    }

    async fn uncles(&self, header: &Header, count: usize) -> Result<Vec<Uncle>, DecodeError> {
        let requests: Vec<Request> = (0..count as u64)
            .map(|i| {
                Request::new(
                    "eth_getUncleByBlockHashAndIndex",
                    json!([header.hash, hex_quantity(i)]),
                )
            })
            .collect();
        let uncles = self.node.batch_as::<RpcHeader>(&requests).await?;

        uncles
            .into_iter()
            .enumerate()
            .map(|(position, uncle)| -> Result<Uncle, DecodeError> {
                Ok(Uncle {
                    header: uncle?.into_header(),
                    included_in: header.number,
                    position: position as u64,
                })
            })
            .collect()
    }

    async fn internal_txs(&self, txs: &[Transaction]) -> Result<Vec<InternalTx>, DecodeError> {
        let traces: Vec<_> = txs
            .iter()
            .map(|tx| trace_transaction(&self.node, tx, self.strategy, self.trace_cap))
            .collect();
        let per_tx: Vec<Vec<InternalTx>> = futures::stream::iter(traces)
            .buffered(TRACE_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(per_tx.into_iter().flatten().collect())
    }

    async fn accounts(&self, parsed: &Parsed) -> Result<Vec<Account>, DecodeError> {
        if parsed.number() == 0 && self.caps.debug {
            return self.genesis_accounts().await;
        }

        let number = parsed.number();
        let created = created_contracts(parsed);
        let touched = if self.caps.debug {
            let modified: Option<Vec<Address>> = self
                .node
                .call("debug_getModifiedAccountsByHash", json!([parsed.hash()]))
                .await?;
            modified
                .unwrap_or_default()
                .into_iter()
                .filter(|a| !is_reserved(a))
                .collect()
        } else {
            touched_without_debug(parsed)
        };
        if touched.is_empty() {
            return Ok(Vec::new());
        }

        let mut accounts = self.refresh_accounts(&touched, number).await?;
        let tag = BlockTag::Number(number);
        for account in accounts.iter_mut() {
            let Some((creator, created_tx)) = created.get(&account.address) else {
                continue;
            };
            account.creator = Some(*creator);
            account.created_tx = Some(*created_tx);

            let code = self.code(account.address, tag).await?;
            account.code_hash = Some(keccak256(&code));
            if !code.is_empty() {
                let info = self.inspect(account.address, tag).await?;
                account.kind = Some(info.kind);
                account.name = info.name;
                account.symbol = info.symbol;
            }
        }
        Ok(accounts)
    }

    /// Balance, nonce and SNFT weight of `addresses` as of `number`.
    ///
    /// Used both for freshly modified accounts and to roll accounts back
    /// after a reorg.
    ///
    /// # Errors
    /// Returns error if any element of the batches fails.
    pub async fn refresh_accounts(
        &self,
        addresses: &[Address],
        number: u64,
    ) -> Result<Vec<Account>, DecodeError> {
        let tag = hex_quantity(number);
        let mut accounts = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(BATCH_CHUNK / 2) {
            let requests: Vec<Request> = chunk
                .iter()
                .flat_map(|address| {
                    [
                        Request::new("eth_getBalance", json!([address, tag])),
                        Request::new("eth_getTransactionCount", json!([address, tag])),
                    ]
                })
                .collect();
            let values = self.node.batch_as::<U256>(&requests).await?;
            let mut values = values.into_iter();

            for address in chunk {
                let (Some(balance), Some(nonce)) = (values.next(), values.next()) else {
                    break;
                };
                accounts.push(Account {
                    address: *address,
                    balance: balance?,
                    nonce: nonce?.saturating_to(),
                    number,
                    ..Account::default()
                });
            }
        }

        if self.caps.domain {
            for chunk in accounts.chunks_mut(BATCH_CHUNK) {
                let requests: Vec<Request> = chunk
                    .iter()
                    .map(|a| Request::new("eth_getAccountInfo", json!([a.address, tag])))
                    .collect();
                let infos = self.node.batch_as::<AccountInfo>(&requests).await?;
                for (account, info) in chunk.iter_mut().zip(infos) {
                    if let Some(worm) = info?.worm {
                        account.snft_value = parse_unsigned(&worm.vote_weight).unwrap_or_default();
                    }
                }
            }
        }
        Ok(accounts)
    }

    /// Pages through the genesis allocation.
    #[tracing::instrument(skip(self))]
    async fn genesis_accounts(&self) -> Result<Vec<Account>, DecodeError> {
        let mut state: BTreeMap<Address, RangeAccount> = BTreeMap::new();
        let mut next = Some(String::new());
        let mut pages = 0usize;

        while let Some(cursor) = next.take() {
            let page: Option<AccountRange> = self
                .node
                .call(
                    "debug_accountRange",
                    json!([hex_quantity(0), cursor, Value::Null, false, true, true]),
                )
                .await?;
            let page = page.unwrap_or_default();
            pages += 1;
            for (key, account) in page.accounts {
                let address = match account.address {
                    Some(address) => address,
                    None => match key.parse::<Address>() {
                        Ok(address) => address,
                        Err(_) => {
                            tracing::warn!(key = %key, "genesis account without address, skipped");
                            continue;
                        }
                    },
                };
                state.insert(address, account);
            }
            next = page.next.filter(|n| !n.is_empty());
        }
        tracing::info!(accounts = state.len(), pages, "genesis allocation loaded");

        let tag = BlockTag::Number(0);
        let mut accounts = Vec::with_capacity(state.len());
        for (address, raw) in state {
            let mut account = Account {
                address,
                balance: parse_unsigned(&raw.balance).unwrap_or_default(),
                nonce: raw.nonce,
                number: 0,
                ..Account::default()
            };
            if let Some(code) = raw.code.filter(|c| !c.is_empty()) {
                account.code_hash = Some(keccak256(&code));
                let info = self.inspect(address, tag).await?;
                account.kind = Some(info.kind);
                account.name = info.name;
                account.symbol = info.symbol;
            }
            accounts.push(account);
        }
        Ok(accounts)
    }

    async fn code(&self, address: Address, tag: BlockTag) -> Result<Bytes, DecodeError> {
        Ok(self
            .node
            .call("eth_getCode", json!([address, tag.as_param()]))
            .await?)
    }

    async fn inspect(&self, address: Address, tag: BlockTag) -> Result<ContractInfo, DecodeError> {
        if let Some(info) = self.classified.get(&address) {
            return Ok(info.clone());
        }
        let info = classify::inspect(&self.node, address, tag).await?;
        self.classified.insert(address, info.clone());
        Ok(info)
    }
}

/// System-reserved ranges the node reports as modified on every block.
pub fn is_reserved(address: &Address) -> bool {
    if address.is_zero() {
        return false;
    }
    let bytes = address.as_slice();
    bytes[..5] == [0u8; 5] || bytes[..5] == [0x80, 0, 0, 0, 0]
}

/// Contracts created by the block, with their creator and creating tx.
fn created_contracts(parsed: &Parsed) -> HashMap<Address, (Address, B256)> {
    let mut created = HashMap::new();
    for tx in &parsed.txs {
        if let Some(address) = tx.contract_address {
            created.insert(address, (tx.from, tx.hash));
        }
    }
    for internal in &parsed.internal_txs {
        if internal.op.is_create() {
            created.insert(internal.to, (internal.from, internal.tx_hash));
        }
    }
    created
}

/// Without the debug namespace the touched set is approximated from the
/// block body.
fn touched_without_debug(parsed: &Parsed) -> Vec<Address> {
    let mut touched = vec![parsed.block.header.miner];
    for tx in &parsed.txs {
        touched.push(tx.from);
        touched.extend(tx.to);
        touched.extend(tx.contract_address);
    }
    touched.sort();
    touched.dedup();
    touched
}
