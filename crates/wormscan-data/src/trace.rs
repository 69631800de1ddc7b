//! Internal transaction reconstruction from `debug_traceTransaction`.
//!
//! The default strategy asks the node for the raw opcode stream (struct
//! logs) and walks it with an explicit caller stack. The alternative injects
//! a JS tracer so the node hands back call frames directly.
//!
//! Depth convention: an internal transaction's `depth` is the depth of the
//! struct-log entry that issued it. The transaction's own frame is depth 1,
//! so a CALL made directly by `tx.to` is recorded at depth 1 with `from` set
//! to `tx.to`.

use alloy::primitives::{Address, B256, U256};
use serde::Deserialize;
use serde_json::json;

use crate::error::RpcError;
use crate::node::{hex_quantity, Node, Request};
use crate::types::{CallOp, InternalTx, Transaction};

/// Struct logs above this count make the whole transaction's internals skipped.
pub const DEFAULT_STRUCT_LOG_CAP: usize = 81_920;

/// Frame count above which the injected tracer gives up on a transaction.
const TRACER_FRAME_LIMIT: usize = 256;

const CALL_FRAME_TRACER: &str = r#"{
    frames: [],
    depth: 1,
    enter: function (frame) {
        var op = frame.getType();
        var value = frame.getValue();
        this.frames.push({
            op: op,
            depth: this.depth,
            from: toHex(frame.getFrom()),
            to: toHex(frame.getTo()),
            gas: frame.getGas(),
            value: (op === 'DELEGATECALL' || op === 'STATICCALL' || value === undefined) ? '0x0' : '0x' + value.toString(16)
        });
        this.depth++;
    },
    exit: function () { this.depth--; },
    step: function () {},
    fault: function () {},
    result: function (ctx) {
        if (this.frames.length >= LIMIT) { return { frames: null, error: ctx.error }; }
        return { frames: this.frames, error: ctx.error };
    }
}"#;

/// How internal transactions are obtained from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceStrategy {
    /// Walk raw struct logs locally.
    #[default]
    StructLogs,
    /// Let the node reduce frames with an injected JS tracer.
    Tracer,
}

/// One opcode step as returned by the struct logger.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    #[serde(default)]
    pub pc: u64,
    pub op: String,
    #[serde(default)]
    pub gas: u64,
    #[serde(default)]
    pub gas_cost: u64,
    pub depth: u64,
    #[serde(default)]
    pub error: Option<String>,
    /// Stack words, bottom first. Nodes emit them with or without `0x`.
    #[serde(default)]
    pub stack: Option<Vec<String>>,
}

impl StructLog {
    /// `n`-th word from the top of the stack (1 = top).
    fn stack_word(&self, n: usize) -> Option<U256> {
        let stack = self.stack.as_ref()?;
        let word = stack.get(stack.len().checked_sub(n)?)?;
        let digits = word.trim_start_matches("0x");
        if digits.is_empty() {
            return Some(U256::ZERO);
        }
        U256::from_str_radix(digits, 16).ok()
    }

    fn stack_address(&self, n: usize) -> Option<Address> {
        self.stack_word(n)
            .map(|word| Address::from_word(B256::from(word)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructLogTrace {
    #[serde(default)]
    struct_logs: Vec<StructLog>,
}

#[derive(Debug, Deserialize)]
struct TracerFrame {
    op: String,
    depth: u64,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    gas: u64,
    value: U256,
}

#[derive(Debug, Deserialize)]
struct TracerResult {
    frames: Option<Vec<TracerFrame>>,
}

/// Who is executing a frame. Frames opened by CREATE are bound to their
/// address once the constructor returns.
#[derive(Debug, Clone, Copy)]
enum Caller {
    Known(Address),
    Created(usize),
}

struct Pending {
    op: CallOp,
    depth: u64,
    from: Caller,
    to: Caller,
    value: U256,
    gas_limit: u64,
}

/// Turns a struct-log stream into internal transactions.
///
/// `to` is the top-level recipient (or the created contract for
/// deployments). Entries with a stack too short for their opcode are dropped;
/// the walk continues. A stream longer than `cap` yields nothing.
pub fn reduce_struct_logs(
    logs: &[StructLog],
    to: Address,
    tx_hash: B256,
    block_number: u64,
    cap: usize,
) -> Vec<InternalTx> {
    if logs.len() > cap {
        tracing::debug!(tx_hash = %tx_hash, steps = logs.len(), cap, "trace exceeds cap, skipping internals");
        return Vec::new();
    }

    let mut callers: Vec<Caller> = vec![Caller::Known(to)];
    let mut created: Vec<Option<Address>> = Vec::new();
    // (frame depth of the CREATE op, slot, index of the CREATE entry)
    let mut open_creates: Vec<(u64, usize, usize)> = Vec::new();
    let mut out: Vec<Pending> = Vec::new();

    for (i, log) in logs.iter().enumerate() {
        let depth = log.depth.max(1);
        if let Some(op) = CallOp::parse(&log.op) {
            align(&mut callers, depth as usize);
            let from = callers[depth as usize - 1];

            let record = match op {
                CallOp::Call | CallOp::CallCode => log
                    .stack_address(2)
                    .zip(log.stack_word(3))
                    .map(|(callee, value)| (Caller::Known(callee), value)),
                CallOp::DelegateCall | CallOp::StaticCall => log
                    .stack_address(2)
                    .map(|callee| (Caller::Known(callee), U256::ZERO)),
                CallOp::Create | CallOp::Create2 => log.stack_word(1).map(|value| {
                    created.push(None);
                    let slot = created.len() - 1;
                    open_creates.push((depth, slot, i));
                    (Caller::Created(slot), value)
                }),
                // value is the balance being swept, filled in by the caller
                CallOp::SelfDestruct => log
                    .stack_address(1)
                    .map(|beneficiary| (Caller::Known(beneficiary), U256::ZERO)),
            };

            match record {
                Some((callee, value)) => {
                    out.push(Pending {
                        op,
                        depth,
                        from,
                        to: callee,
                        value,
                        gas_limit: log.gas,
                    });
                    match op {
                        CallOp::SelfDestruct => {}
                        CallOp::DelegateCall => callers.push(from),
                        _ => callers.push(callee),
                    }
                }
                None => {
                    tracing::debug!(tx_hash = %tx_hash, pc = log.pc, op = %log.op, "stack too short, dropping call");
                    if op != CallOp::SelfDestruct {
                        callers.push(Caller::Known(Address::ZERO));
                    }
                }
            }
        } else if matches!(
            log.op.to_ascii_uppercase().as_str(),
            "RETURN" | "STOP" | "REVERT"
        ) {
            // the frame at `depth` ends; depth is at least 1 here
            callers.truncate((depth as usize).saturating_sub(1));
        }

        bind_created(logs, i, &mut open_creates, &mut created);
    }

    let resolve = |caller: Caller| match caller {
        Caller::Known(addr) => addr,
        Caller::Created(slot) => created.get(slot).copied().flatten().unwrap_or(Address::ZERO),
    };

    out.into_iter()
        .map(|p| InternalTx {
            tx_hash,
            block_number,
            depth: p.depth,
            op: p.op,
            from: resolve(p.from),
            to: resolve(p.to),
            value: p.value,
            gas_limit: p.gas_limit,
        })
        .collect()
}

/// Keeps `callers` in step with the VM depth: one entry per live frame.
fn align(callers: &mut Vec<Caller>, depth: usize) {
    if callers.len() > depth {
        callers.truncate(depth);
    }
    while callers.len() < depth {
        let last = callers
            .last()
            .copied()
            .unwrap_or(Caller::Known(Address::ZERO));
        callers.push(last);
    }
}

/// When control comes back to the depth of an open CREATE, the first entry
/// there has the new address on top of its stack.
fn bind_created(
    logs: &[StructLog],
    i: usize,
    open: &mut Vec<(u64, usize, usize)>,
    created: &mut [Option<Address>],
) {
    let Some(next) = logs.get(i + 1) else {
        return;
    };
    while let Some(&(depth, slot, at)) = open.last() {
        if next.depth < depth {
            // Parent frame aborted before the constructor finished.
            open.pop();
            continue;
        }
        let returned = next.depth == depth && (at == i || logs[i].depth > depth);
        if !returned {
            break;
        }
        created[slot] = next.stack_address(1);
        open.pop();
        break;
    }
}

/// Converts frames reported by the injected tracer.
fn frames_to_internal(frames: Vec<TracerFrame>, tx_hash: B256, block_number: u64) -> Vec<InternalTx> {
    frames
        .into_iter()
        .filter_map(|frame| {
            let op = CallOp::parse(&frame.op)?;
            Some(InternalTx {
                tx_hash,
                block_number,
                depth: frame.depth,
                op,
                from: frame.from,
                to: frame.to.unwrap_or(Address::ZERO),
                value: frame.value,
                gas_limit: frame.gas,
            })
        })
        .collect()
}

/// Fetches and reduces the internal transactions of `tx`.
///
/// Node-side failures specific to this transaction (trace too large,
/// execution timeout, undecodable result) drop its internals and are logged;
/// only network failures propagate.
///
/// # Errors
/// Returns the RPC error if the node could not be reached.
#[tracing::instrument(skip(node, tx), fields(tx_hash = %tx.hash))]
pub async fn trace_transaction(
    node: &Node,
    tx: &Transaction,
    strategy: TraceStrategy,
    cap: usize,
) -> Result<Vec<InternalTx>, RpcError> {
    let Some(to) = tx.effective_to() else {
        return Ok(Vec::new());
    };

    let outcome = match strategy {
        TraceStrategy::StructLogs => node
            .call::<StructLogTrace>(
                "debug_traceTransaction",
                json!([tx.hash, {
                    "disableStorage": true,
                    "disableMemory": true,
                    "limit": cap + 1,
                }]),
            )
            .await
            .map(|trace| reduce_struct_logs(&trace.struct_logs, to, tx.hash, tx.block_number, cap)),
        TraceStrategy::Tracer => {
            let tracer = CALL_FRAME_TRACER.replace("LIMIT", &TRACER_FRAME_LIMIT.to_string());
            node.call::<TracerResult>(
                "debug_traceTransaction",
                json!([tx.hash, { "tracer": tracer }]),
            )
            .await
            .map(|result| {
                frames_to_internal(result.frames.unwrap_or_default(), tx.hash, tx.block_number)
            })
        }
    };

    match outcome {
        Ok(mut internals) => {
            if strategy == TraceStrategy::StructLogs {
                sweep_values(node, &mut internals, tx.block_number).await?;
            }
            Ok(internals)
        }
        Err(e) if e.is_network() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "trace unavailable, skipping internal txs");
            Ok(Vec::new())
        }
    }
}

/// Sets the value of every SELFDESTRUCT entry to the destroyed contract's
/// balance at `block_number`.
async fn sweep_values(
    node: &Node,
    internals: &mut [InternalTx],
    block_number: u64,
) -> Result<(), RpcError> {
    let swept: Vec<usize> = internals
        .iter()
        .enumerate()
        .filter(|(_, itx)| itx.op == CallOp::SelfDestruct)
        .map(|(i, _)| i)
        .collect();
    if swept.is_empty() {
        return Ok(());
    }

    let requests: Vec<Request> = swept
        .iter()
        .map(|&i| {
            Request::new(
                "eth_getBalance",
                json!([internals[i].from, hex_quantity(block_number)]),
            )
        })
        .collect();
    let balances = node.batch_as::<U256>(&requests).await?;
    for (&i, balance) in swept.iter().zip(balances) {
        match balance {
            Ok(value) => internals[i].value = value,
            Err(e) if e.is_network() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, contract = %internals[i].from, "self-destruct balance unavailable");
            }
        }
    }
    Ok(())
}
