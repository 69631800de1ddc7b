//! Shared test helpers and utilities.
//!
//! [`FakeChain`] is an in-process node: it mines blocks of plain value
//! transfers, keeps a balance snapshot per height, and answers the JSON-RPC
//! methods the decoder uses through a [`ScriptedTransport`]. Rewinding it and
//! mining again produces a competing branch with different hashes.

#![allow(dead_code)]

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wormscan_data::node::scripted::ScriptedTransport;
use wormscan_data::node::{hex_quantity, Capabilities, Node};
use wormscan_data::pipeline::PipelineOptions;
use wormscan_data::store::Store;
use wormscan_data::BlockDecoder;

pub const CHAIN_ID: u64 = 0x51e;
pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_TIME: u64 = 5;

/// Creates an in-memory SQLite Store for tests.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Store {
    Store::new(":memory:").expect("in-memory store should always open")
}

pub fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}

/// Ether amount in wei.
pub fn eth(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

/// One transaction of a fake block.
#[derive(Debug, Clone)]
pub struct FakeTx {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    /// Raw struct-log steps served by `debug_traceTransaction`.
    pub struct_logs: Vec<Value>,
    /// `(address, topics, data)` of the logs the transaction emits.
    pub logs: Vec<(Address, Vec<B256>, Bytes)>,
}

impl FakeTx {
    pub fn transfer(from: Address, to: Address, value: U256) -> Self {
        Self {
            from,
            to: Some(to),
            value,
            input: Bytes::new(),
            struct_logs: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_struct_logs(mut self, steps: Vec<Value>) -> Self {
        self.struct_logs = steps;
        self
    }

    pub fn with_log(mut self, address: Address, topics: Vec<B256>, data: Vec<u8>) -> Self {
        self.logs.push((address, topics, Bytes::from(data)));
        self
    }
}

#[derive(Debug, Clone)]
struct MinedTx {
    hash: B256,
    index: u64,
    tx: FakeTx,
}

#[derive(Debug, Clone)]
struct FakeBlock {
    number: u64,
    hash: B256,
    parent_hash: B256,
    miner: Address,
    timestamp: u64,
    txs: Vec<MinedTx>,
    /// Balances after the block.
    balances: BTreeMap<Address, U256>,
    nonces: BTreeMap<Address, u64>,
    modified: Vec<Address>,
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<FakeBlock>,
    branch: u64,
}

impl ChainState {
    fn at(&self, tag: &Value) -> Option<&FakeBlock> {
        let number = match tag.as_str()? {
            "latest" | "pending" => return self.blocks.last(),
            hex => u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()?,
        };
        self.blocks.get(number as usize)
    }

    fn by_hash(&self, hash: &Value) -> Option<&FakeBlock> {
        let hash: B256 = serde_json::from_value(hash.clone()).ok()?;
        self.blocks.iter().find(|b| b.hash == hash)
    }

    fn tx(&self, hash: &Value) -> Option<(&FakeBlock, &MinedTx)> {
        let hash: B256 = serde_json::from_value(hash.clone()).ok()?;
        self.blocks
            .iter()
            .find_map(|b| b.txs.iter().find(|t| t.hash == hash).map(|t| (b, t)))
    }
}

/// Shared handle; clones see the same chain.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    /// Genesis allocating `alloc` to the given accounts.
    pub fn new(alloc: &[(Address, U256)]) -> Self {
        let balances: BTreeMap<Address, U256> = alloc.iter().copied().collect();
        let genesis = FakeBlock {
            number: 0,
            hash: keccak256(format!("genesis:{balances:?}")),
            parent_hash: B256::ZERO,
            miner: Address::ZERO,
            timestamp: GENESIS_TIME,
            txs: Vec::new(),
            modified: balances.keys().copied().collect(),
            balances,
            nonces: BTreeMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(ChainState {
                blocks: vec![genesis],
                branch: 0,
            })),
        }
    }

    pub fn height(&self) -> u64 {
        self.lock().blocks.len() as u64 - 1
    }

    pub fn hash(&self, number: u64) -> B256 {
        self.lock().blocks[number as usize].hash
    }

    pub fn balance(&self, number: u64, address: Address) -> U256 {
        self.lock().blocks[number as usize]
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Mines one block on top of the current head and returns its hash.
    pub fn mine(&self, miner: Address, txs: Vec<FakeTx>) -> B256 {
        let mut state = self.lock();
        let branch = state.branch;
        let parent = state.blocks.last().cloned().expect("genesis always exists");
        let number = parent.number + 1;
        let hash = block_hash(number, branch, parent.hash);

        let mut balances = parent.balances.clone();
        let mut nonces = parent.nonces.clone();
        let mut modified = vec![miner];
        let mut mined = Vec::with_capacity(txs.len());
        for (index, tx) in txs.into_iter().enumerate() {
            let nonce = nonces.entry(tx.from).or_default();
            let tx_hash = keccak256(format!("{branch}:{number}:{index}:{}:{nonce}", tx.from));
            *nonce += 1;

            let sender = balances.entry(tx.from).or_default();
            *sender = sender.saturating_sub(tx.value);
            if let Some(to) = tx.to {
                *balances.entry(to).or_default() += tx.value;
                modified.push(to);
            }
            modified.push(tx.from);
            mined.push(MinedTx {
                hash: tx_hash,
                index: index as u64,
                tx,
            });
        }
        modified.sort();
        modified.dedup();

        state.blocks.push(FakeBlock {
            number,
            hash,
            parent_hash: parent.hash,
            miner,
            timestamp: parent.timestamp + BLOCK_TIME,
            txs: mined,
            balances,
            nonces,
            modified,
        });
        hash
    }

    pub fn mine_empty(&self, count: u64) {
        for _ in 0..count {
            self.mine(addr(0x99), Vec::new());
        }
    }

    /// Drops every block above `height`. Blocks mined afterwards belong to a
    /// new branch.
    pub fn rewind(&self, height: u64) {
        let mut state = self.lock();
        state.blocks.truncate(height as usize + 1);
        state.branch += 1;
    }

    /// Hash of the `index`-th transaction of `number`.
    pub fn tx_hash(&self, number: u64, index: usize) -> B256 {
        self.lock().blocks[number as usize].txs[index].hash
    }

    /// Node handle with the debug namespace and without Wormholes extensions.
    pub fn node(&self) -> Node {
        Node::scripted(self.transport(), Duration::from_secs(5))
    }

    pub fn decoder(&self) -> BlockDecoder {
        BlockDecoder::new(
            self.node(),
            Capabilities {
                debug: true,
                domain: false,
            },
        )
    }

    pub fn transport(&self) -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());

        transport.on("eth_chainId", |_| Ok(json!(hex_quantity(CHAIN_ID))));
        transport.on("debug_gcStats", |_| Ok(json!({})));

        let state = self.state.clone();
        transport.on("eth_blockNumber", move |_| {
            let state = state.lock().expect("chain lock");
            Ok(json!(hex_quantity(state.blocks.len() as u64 - 1)))
        });

        let state = self.state.clone();
        transport.on("eth_getBlockByNumber", move |params| {
            let state = state.lock().expect("chain lock");
            let full = params[1].as_bool().unwrap_or(false);
            Ok(state
                .at(&params[0])
                .map(|block| block_json(block, full))
                .unwrap_or(Value::Null))
        });

        let state = self.state.clone();
        transport.on("eth_getTransactionReceipt", move |params| {
            let state = state.lock().expect("chain lock");
            Ok(state
                .tx(&params[0])
                .map(|(_, mined)| {
                    json!({
                        "status": "0x1",
                        "cumulativeGasUsed": hex_quantity(21_000 * (mined.index + 1)),
                        "gasUsed": hex_quantity(21_000),
                        "contractAddress": Value::Null,
                        "transactionIndex": hex_quantity(mined.index),
                    })
                })
                .unwrap_or(Value::Null))
        });

        let state = self.state.clone();
        transport.on("eth_getLogs", move |params| {
            let state = state.lock().expect("chain lock");
            let Some(block) = state.by_hash(&params[0]["blockHash"]) else {
                return Ok(json!([]));
            };
            let mut logs = Vec::new();
            for mined in &block.txs {
                for (address, topics, data) in &mined.tx.logs {
                    logs.push(json!({
                        "address": address,
                        "topics": topics,
                        "data": data,
                        "blockNumber": hex_quantity(block.number),
                        "transactionHash": mined.hash,
                        "logIndex": hex_quantity(logs.len() as u64),
                        "removed": false,
                    }));
                }
            }
            Ok(Value::Array(logs))
        });

        let state = self.state.clone();
        transport.on("eth_getBalance", move |params| {
            let state = state.lock().expect("chain lock");
            let address: Address = serde_json::from_value(params[0].clone()).unwrap_or_default();
            let balance = state
                .at(&params[1])
                .and_then(|b| b.balances.get(&address).copied())
                .unwrap_or_default();
            Ok(json!(balance))
        });

        let state = self.state.clone();
        transport.on("eth_getTransactionCount", move |params| {
            let state = state.lock().expect("chain lock");
            let address: Address = serde_json::from_value(params[0].clone()).unwrap_or_default();
            let nonce = state
                .at(&params[1])
                .and_then(|b| b.nonces.get(&address).copied())
                .unwrap_or_default();
            Ok(json!(hex_quantity(nonce)))
        });

        let state = self.state.clone();
        transport.on("debug_getModifiedAccountsByHash", move |params| {
            let state = state.lock().expect("chain lock");
            Ok(state
                .by_hash(&params[0])
                .map(|b| json!(b.modified))
                .unwrap_or(Value::Null))
        });

        let state = self.state.clone();
        transport.on("debug_accountRange", move |_| {
            let state = state.lock().expect("chain lock");
            let genesis = &state.blocks[0];
            let accounts: serde_json::Map<String, Value> = genesis
                .balances
                .iter()
                .map(|(address, balance)| {
                    (
                        format!("{address:#x}"),
                        json!({
                            "address": address,
                            "balance": balance.to_string(),
                            "nonce": 0,
                        }),
                    )
                })
                .collect();
            Ok(json!({ "accounts": accounts, "next": Value::Null }))
        });

        let state = self.state.clone();
        transport.on("debug_traceTransaction", move |params| {
            let state = state.lock().expect("chain lock");
            match state.tx(&params[0]) {
                Some((_, mined)) => Ok(json!({
                    "gas": 21_000,
                    "failed": false,
                    "returnValue": "",
                    "structLogs": mined.tx.struct_logs,
                })),
                None => Err((-32000, "transaction not found".to_string())),
            }
        });

        transport.on("eth_getCode", |_| Ok(json!("0x")));
        transport.on("eth_call", |_| Err((3, "execution reverted".to_string())));

        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().expect("chain lock")
    }
}

fn block_hash(number: u64, branch: u64, parent: B256) -> B256 {
    keccak256(format!("block:{number}:{branch}:{parent:#x}"))
}

fn block_json(block: &FakeBlock, full: bool) -> Value {
    let txs: Vec<Value> = block
        .txs
        .iter()
        .map(|mined| {
            if !full {
                return json!(mined.hash);
            }
            let nonce = block
                .txs
                .iter()
                .take_while(|other| other.hash != mined.hash)
                .filter(|other| other.tx.from == mined.tx.from)
                .count() as u64;
            json!({
                "hash": mined.hash,
                "from": mined.tx.from,
                "to": mined.tx.to,
                "input": mined.tx.input,
                "value": mined.tx.value,
                "nonce": hex_quantity(nonce),
                "gas": hex_quantity(100_000),
                "gasPrice": "0x0",
            })
        })
        .collect();

    json!({
        "number": hex_quantity(block.number),
        "hash": block.hash,
        "parentHash": block.parent_hash,
        "miner": block.miner,
        "timestamp": hex_quantity(block.timestamp),
        "difficulty": "0x1",
        "totalDifficulty": hex_quantity(block.number + 1),
        "extraData": "0x",
        "gasLimit": hex_quantity(30_000_000),
        "gasUsed": hex_quantity(21_000 * block.txs.len() as u64),
        "size": "0x220",
        "transactions": txs,
        "uncles": [],
    })
}

/// Struct-log step as the struct logger reports it. `stack` is bottom first.
pub fn step(op: &str, depth: u64, stack: &[String]) -> Value {
    json!({
        "pc": 0,
        "op": op,
        "gas": 100_000,
        "gasCost": 0,
        "depth": depth,
        "stack": stack,
    })
}

/// `CALL` at `depth` to `callee` moving `value`.
pub fn call_step(depth: u64, callee: Address, value: u64) -> Value {
    step(
        "CALL",
        depth,
        &[format!("0x{value:x}"), word(callee), "0x5208".to_string()],
    )
}

pub fn word(address: Address) -> String {
    format!("{:#x}", address.into_word())
}

/// Pipeline knobs for fast tests: short intervals, bounded height.
pub fn options(stop_at: u64) -> PipelineOptions {
    PipelineOptions {
        workers: 4,
        interval: Duration::from_millis(5),
        backoff: Duration::from_millis(5),
        stop_at: Some(stop_at),
    }
}
