//! Benchmarks for the CPU-bound parts of block decoding.
//!
//! Inputs are synthetic; no node is needed.
//! Run with: `cargo bench --package wormscan-data`

use alloy::primitives::{Address, Bytes, B256, U256};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use wormscan_data::logs::{unpack_transfer_log, TRANSFER_BATCH_TOPIC0};
use wormscan_data::trace::{reduce_struct_logs, StructLog, DEFAULT_STRUCT_LOG_CAP};
use wormscan_data::types::Log;

fn word(value: u64) -> String {
    format!("0x{value:x}")
}

fn step(op: &str, depth: u64, stack: Vec<String>) -> StructLog {
    StructLog {
        pc: 0,
        op: op.to_string(),
        gas: 100_000,
        gas_cost: 3,
        depth,
        error: None,
        stack: Some(stack),
    }
}

/// A call tree fanning out `width` CALLs at each of `depth` levels, padded
/// with PUSH steps the way real traces are.
fn struct_logs(width: u64, depth: u64) -> Vec<StructLog> {
    let mut logs = Vec::new();
    for d in 1..=depth {
        for i in 0..width {
            for _ in 0..20 {
                logs.push(step("PUSH1", d, vec![word(1)]));
            }
            // gas, to, value, argsOffset, argsLength, retOffset, retLength; top last
            let callee = 0x1000 + d * width + i;
            logs.push(step(
                "CALL",
                d,
                vec![word(0), word(0), word(0), word(0), word(i), word(callee), word(50_000)],
            ));
        }
    }
    logs
}

fn batch_log(n: u64) -> Log {
    let mut data = Vec::new();
    let push = |data: &mut Vec<u8>, v: u64| data.extend_from_slice(&U256::from(v).to_be_bytes::<32>());
    push(&mut data, 0x40);
    push(&mut data, 0x40 + 32 * (n + 1));
    push(&mut data, n);
    for i in 0..n {
        push(&mut data, i);
    }
    push(&mut data, n);
    for i in 0..n {
        push(&mut data, i + 1);
    }

    let topic = |byte: u8| Address::repeat_byte(byte).into_word();
    Log {
        block_number: 1,
        tx_hash: B256::ZERO,
        index: 0,
        address: Address::repeat_byte(0xcc),
        topics: vec![TRANSFER_BATCH_TOPIC0, topic(1), topic(2), topic(3)],
        data: Bytes::from(data),
        removed: false,
    }
}

/// Benchmark: reduce a 10x8 call tree (~1.7k struct logs).
fn bench_reduce_struct_logs(c: &mut Criterion) {
    let logs = struct_logs(10, 8);
    let to = Address::repeat_byte(0xaa);
    c.bench_function("reduce_struct_logs_10x8", |b| {
        b.iter(|| {
            reduce_struct_logs(
                black_box(&logs),
                to,
                B256::ZERO,
                1,
                DEFAULT_STRUCT_LOG_CAP,
            )
        });
    });
}

/// Benchmark: unpack a 32-item TransferBatch.
fn bench_unpack_transfer_batch(c: &mut Criterion) {
    c.bench_function("unpack_transfer_batch_32", |b| {
        b.iter_batched(
            || batch_log(32),
            |log| unpack_transfer_log(black_box(&log)),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_reduce_struct_logs, bench_unpack_transfer_batch);
criterion_main!(benches);
