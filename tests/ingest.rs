//! End-to-end ingestion against the fake chain: pipeline, decoder and store
//! together.

mod common;

use common::*;
use tokio::sync::watch;
use wormscan_data::pipeline::{boot_check, Finished, Pipeline};
use wormscan_data::store::Store;

async fn ingest(chain: &FakeChain, store: Store, until: u64) -> Finished {
    let pipeline =
        Pipeline::new(chain.decoder(), store, options(until)).expect("pipeline should build");
    let (_stop, shutdown) = watch::channel(false);
    pipeline.run(shutdown).await.expect("pipeline should reach the target height")
}

/// Genesis is seeded from the account range and counts as the first block.
#[tokio::test]
async fn genesis_seeds_accounts_without_rewards() {
    let chain = FakeChain::new(&[(addr(1), eth(100)), (addr(2), eth(50))]);

    let finished = ingest(&chain, test_store(), 0).await;
    let store = &finished.store;

    assert_eq!(finished.next_height, 1);
    assert_eq!(store.count("accounts").expect("count"), 2);
    assert_eq!(store.count("rewards").expect("count"), 0);
    let rich = store
        .account(&addr(1))
        .expect("query")
        .expect("genesis account stored");
    assert_eq!(rich.balance, eth(100).to_string());
    assert_eq!(rich.code_hash, None, "plain accounts are not probed");
    assert_eq!(finished.stats.genesis_balance, eth(150).to_string());
    assert_eq!(finished.stats.total_balance, eth(150).to_string());
}

/// Height 42 has no transactions, uncles or logs.
#[tokio::test]
async fn empty_block_adds_one_block_row() {
    let chain = FakeChain::new(&[(addr(1), eth(1))]);
    chain.mine_empty(42);

    let finished = ingest(&chain, test_store(), 41).await;
    let before = finished.stats.clone();
    let finished = ingest(&chain, finished.store, 42).await;
    let store = &finished.store;

    assert_eq!(store.block_tx_counts(42).expect("query"), Some((0, 0)));
    assert_eq!(store.count("logs").expect("count"), 0);
    assert_eq!(store.count("transactions").expect("count"), 0);
    assert_eq!(finished.stats.total_block, before.total_block + 1);
    assert_eq!(finished.stats.total_transaction, before.total_transaction);
}

/// Every stored block extends its predecessor, stores all its transactions,
/// and the running balance sum matches the account table.
#[tokio::test]
async fn chain_invariants_hold_for_every_block() -> eyre::Result<()> {
    let chain = FakeChain::new(&[(addr(1), eth(100)), (addr(2), eth(100))]);
    for i in 0..12u64 {
        let txs = (0..i % 4)
            .map(|j| FakeTx::transfer(addr(1 + (j % 2) as u8), addr(3 + j as u8), eth(1)))
            .collect();
        chain.mine(addr(0x99), txs);
    }

    let finished = ingest(&chain, test_store(), 12).await;
    let store = &finished.store;

    for n in 1..=12 {
        assert_eq!(store.parent_hash(n)?, store.block_hash(n - 1)?, "parent link at {n}");
        assert_eq!(store.block_hash(n)?, Some(chain.hash(n)));
        let (declared, stored) = store.block_tx_counts(n)?.expect("block row exists");
        assert_eq!(declared, stored, "transaction rows at {n}");
    }

    let recounted = store.recount_stats(&finished.stats)?;
    assert_eq!(recounted.total_balance, finished.stats.total_balance);
    assert_eq!(finished.stats.total_balance, eth(200).to_string());
    assert_eq!(finished.stats.total_transaction, 18);
    assert_eq!(finished.stats.total_transfer_tx, 18);

    for n in 3..=5u8 {
        let row = store.account(&addr(n))?.expect("recipient stored");
        assert_eq!(row.balance, chain.balance(12, addr(n)).to_string());
    }
    Ok(())
}

/// Restarting resumes above the stored head instead of re-ingesting.
#[tokio::test]
async fn restart_resumes_after_head() {
    let chain = FakeChain::new(&[(addr(1), eth(10))]);
    chain.mine_empty(5);

    let finished = ingest(&chain, test_store(), 3).await;
    assert_eq!(finished.next_height, 4);

    chain.mine_empty(2);
    let finished = ingest(&chain, finished.store, 7).await;
    assert_eq!(finished.next_height, 8);
    assert_eq!(finished.stats.total_block, 8);
    assert_eq!(finished.store.head().expect("head").map(|(n, _)| n), Some(7));
}

#[tokio::test]
async fn boot_check_pins_the_chain_identity() {
    let chain = FakeChain::new(&[(addr(1), eth(10))]);
    chain.mine_empty(2);
    let finished = ingest(&chain, test_store(), 2).await;

    let identity = boot_check(&chain.node(), &finished.store)
        .await
        .expect("same chain passes");
    assert_eq!(identity.chain_id, CHAIN_ID);
    assert_eq!(identity.genesis_hash, chain.hash(0));

    let other = FakeChain::new(&[(addr(7), eth(1))]);
    let err = boot_check(&other.node(), &finished.store)
        .await
        .expect_err("a different genesis must be rejected");
    assert!(err.to_string().contains("do not match"));
}
