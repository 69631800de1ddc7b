//! Dispatcher → decoder workers → ordered writer.
//!
//! - the dispatcher polls `eth_blockNumber` and hands out ascending heights
//! - `W` workers decode heights concurrently, retrying until they succeed
//! - the writer buffers results by height and commits them strictly in
//!   order, rewinding the store when a block does not extend the head
//!
//! Both channels are bounded to `W`, so a slow writer stalls the workers and
//! a slow worker pool stalls the dispatcher.

use alloy::primitives::{B256, U64};
use eyre::{eyre, Context, Result};
use indicatif::ProgressBar;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::decode::{BlockDecoder, RpcHeader};
use crate::node::{hex_quantity, Node};
use crate::stats::Stats;
use crate::store::{CommitOutcome, Store};
use crate::types::Parsed;

/// Fixed pause before retrying a failed decode or commit.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

const CHAIN_ID_KEY: &str = "chain_id";
const GENESIS_HASH_KEY: &str = "genesis_hash";

/// Chain identity checked at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIdentity {
    pub chain_id: u64,
    pub genesis_hash: B256,
}

/// Compares the node against what the store was built from.
///
/// A fresh store adopts the node's identity. A store holding blocks must
/// match it.
///
/// # Errors
/// Returns error if the node cannot be reached, has no genesis block, or
/// belongs to a different chain than the stored data.
#[tracing::instrument(skip_all)]
pub async fn boot_check(node: &Node, store: &Store) -> Result<ChainIdentity> {
    let chain_id: U64 = node
        .call("eth_chainId", json!([]))
        .await
        .wrap_err("failed to read chain id")?;
    let genesis: Option<RpcHeader> = node
        .call("eth_getBlockByNumber", json!([hex_quantity(0), false]))
        .await
        .wrap_err("failed to read genesis header")?;
    let genesis = genesis.ok_or_else(|| eyre!("node has no genesis block"))?;
    let identity = ChainIdentity {
        chain_id: chain_id.to(),
        genesis_hash: genesis.hash,
    };

    if store.head()?.is_some() {
        let stored_id = store.cache_get(CHAIN_ID_KEY)?;
        let stored_genesis = match store.block_hash(0)? {
            Some(hash) => Some(format!("{hash:#x}")),
            None => store.cache_get(GENESIS_HASH_KEY)?,
        };
        let id_matches = stored_id.map_or(true, |id| id == identity.chain_id.to_string());
        let genesis_matches =
            stored_genesis.map_or(true, |hash| hash == format!("{:#x}", identity.genesis_hash));
        if !id_matches || !genesis_matches {
            tracing::error!(
                chain_id = identity.chain_id,
                genesis = %identity.genesis_hash,
                "node does not serve the chain stored in the database"
            );
            return Err(eyre!("stored data and chain node information do not match"));
        }
    }

    store.cache_put(CHAIN_ID_KEY, &identity.chain_id.to_string())?;
    store.cache_put(GENESIS_HASH_KEY, &format!("{:#x}", identity.genesis_hash))?;
    tracing::info!(
        chain_id = identity.chain_id,
        genesis = %identity.genesis_hash,
        "boot check passed"
    );
    Ok(identity)
}

/// Knobs of [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    /// Dispatcher poll interval and not-found retry delay.
    pub interval: Duration,
    pub backoff: Duration,
    /// Stop once this height is committed.
    pub stop_at: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::default_threads(),
            interval: crate::config::DEFAULT_INTERVAL,
            backoff: RETRY_BACKOFF,
            stop_at: None,
        }
    }
}

/// What a finished run hands back.
pub struct Finished {
    pub store: Store,
    pub stats: Stats,
    /// First height not committed.
    pub next_height: u64,
}

enum Step {
    Committed,
    Rewound(u64),
    Stopped,
}

pub struct Pipeline {
    decoder: BlockDecoder,
    store: Store,
    stats: Stats,
    options: PipelineOptions,
    stats_tx: watch::Sender<Stats>,
    progress: Option<ProgressBar>,
}

impl Pipeline {
    /// # Errors
    /// Returns error if the persisted stats cannot be loaded.
    pub fn new(decoder: BlockDecoder, store: Store, options: PipelineOptions) -> Result<Self> {
        let stats = store.load_stats()?;
        let (stats_tx, _) = watch::channel(stats.clone());
        Ok(Self {
            decoder,
            store,
            stats,
            options,
            stats_tx,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Records the chain id in the stats snapshot.
    pub fn set_chain_id(&mut self, chain_id: u64) {
        self.stats.chain_id = chain_id;
        self.stats_tx.send_replace(self.stats.clone());
    }

    /// Snapshot of the totals, updated after every commit.
    pub fn subscribe(&self) -> watch::Receiver<Stats> {
        self.stats_tx.subscribe()
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped), or
    /// until `stop_at` is committed.
    ///
    /// # Errors
    /// Returns error if a fork cannot be resolved against the stored chain.
    #[tracing::instrument(skip_all, fields(workers = self.options.workers))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<Finished> {
        let workers = self.options.workers.max(1);
        let mut next = self.store.head()?.map_or(0, |(head, _)| head + 1);
        tracing::info!(start = next, "pipeline starting");

        // results carry the generation they were dispatched in; a rewind
        // starts a new one and everything older is discarded
        let mut generation = 0u64;
        let (height_tx, height_rx) = mpsc::channel::<(u64, u64)>(workers);
        let (result_tx, mut result_rx) = mpsc::channel::<(u64, Parsed)>(workers);
        let (rewind_tx, rewind_rx) = watch::channel((generation, next));
        let height_rx = Arc::new(Mutex::new(height_rx));

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(dispatch(
            self.decoder.node().clone(),
            next,
            height_tx,
            rewind_rx,
            shutdown.clone(),
            self.options.clone(),
            self.progress.clone(),
        )));
        for id in 0..workers {
            tasks.push(tokio::spawn(work(
                id,
                self.decoder.clone(),
                height_rx.clone(),
                result_tx.clone(),
                shutdown.clone(),
                self.options.clone(),
            )));
        }
        drop(result_tx);

        let mut pending: BTreeMap<u64, Parsed> = BTreeMap::new();
        'receive: loop {
            if self.options.stop_at.is_some_and(|stop| next > stop) {
                break;
            }
            let (dispatched_in, parsed) = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = result_rx.recv() => match received {
                    Some(received) => received,
                    None => break,
                },
            };
            if dispatched_in != generation || parsed.number() < next {
                tracing::debug!(block_number = parsed.number(), "stale result dropped");
                continue;
            }
            pending.insert(parsed.number(), parsed);

            while let Some(parsed) = pending.remove(&next) {
                match self.commit(&parsed, &mut shutdown).await? {
                    Step::Committed => next += 1,
                    Step::Rewound(height) => {
                        pending.clear();
                        next = height + 1;
                        generation += 1;
                        rewind_tx.send_replace((generation, next));
                        break;
                    }
                    Step::Stopped => {
                        pending.insert(parsed.number(), parsed);
                        break 'receive;
                    }
                }
                if let Some(pb) = &self.progress {
                    pb.set_position(next);
                }
            }
        }

        // best-effort drain of what is already contiguous
        while let Some(parsed) = pending.remove(&next) {
            if self.options.stop_at.is_some_and(|stop| next > stop) {
                break;
            }
            match self.store.commit(&parsed, &mut self.stats) {
                Ok(CommitOutcome::Committed(_)) | Ok(CommitOutcome::AlreadyCommitted) => next += 1,
                Ok(CommitOutcome::ParentMismatch { .. }) => break,
                Err(e) => {
                    tracing::warn!(block_number = next, error = %e, "drain commit failed");
                    break;
                }
            }
        }
        self.stats_tx.send_replace(self.stats.clone());

        drop(result_rx);
        for task in &tasks {
            task.abort();
        }
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        tracing::info!(next_height = next, "pipeline stopped");

        Ok(Finished {
            store: self.store,
            stats: self.stats,
            next_height: next,
        })
    }

    async fn commit(&mut self, parsed: &Parsed, shutdown: &mut watch::Receiver<bool>) -> Result<Step> {
        let number = parsed.number();
        loop {
            match self.store.commit(parsed, &mut self.stats) {
                Ok(CommitOutcome::Committed(_)) => {
                    tracing::info!(
                        block_number = number,
                        txs = parsed.txs.len(),
                        internal_txs = parsed.internal_txs.len(),
                        "block committed"
                    );
                    self.stats_tx.send_replace(self.stats.clone());
                    return Ok(Step::Committed);
                }
                Ok(CommitOutcome::AlreadyCommitted) => return Ok(Step::Committed),
                Ok(CommitOutcome::ParentMismatch { head, stored }) => {
                    tracing::warn!(
                        block_number = number,
                        head,
                        stored = %stored,
                        parent = %parsed.parent_hash(),
                        "fork detected"
                    );
                    let height = self.rewind(number, shutdown).await?;
                    return Ok(match height {
                        Some(height) => Step::Rewound(height),
                        None => Step::Stopped,
                    });
                }
                Err(e) => {
                    tracing::error!(block_number = number, error = ?e, "commit failed, retrying");
                    if !pause(self.options.backoff, shutdown).await {
                        return Ok(Step::Stopped);
                    }
                }
            }
        }
    }

    /// Walks back from `incoming - 2` to the newest height whose stored hash
    /// the node still agrees with, refreshes the accounts touched above it and
    /// moves the head there. `None` if shut down midway.
    async fn rewind(
        &mut self,
        incoming: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<u64>> {
        let mut height = incoming.saturating_sub(2);
        loop {
            let Some(stored) = self.store.block_hash(height)? else {
                return Err(eyre!(
                    "fork at {incoming} reaches below the first stored block ({height})"
                ));
            };
            match self.decoder.header(height).await {
                Ok(Some(header)) if header.hash == stored => break,
                Ok(_) => {
                    if height == 0 {
                        return Err(eyre!("no common ancestor with the node below {incoming}"));
                    }
                    height -= 1;
                }
                Err(e) => {
                    tracing::warn!(height, error = %e, "header lookup failed during rewind");
                    if !pause(self.options.backoff, shutdown).await {
                        return Ok(None);
                    }
                }
            }
        }

        let addresses = self.store.accounts_above(height)?;
        let refreshed = loop {
            match self.decoder.refresh_accounts(&addresses, height).await {
                Ok(accounts) => break accounts,
                Err(e) => {
                    tracing::warn!(height, error = %e, "account refresh failed during rewind");
                    if !pause(self.options.backoff, shutdown).await {
                        return Ok(None);
                    }
                }
            }
        };

        let chain_id = self.stats.chain_id;
        self.stats = self.store.set_head(height, &refreshed)?;
        self.stats.chain_id = chain_id;
        self.stats_tx.send_replace(self.stats.clone());
        tracing::warn!(
            head = height,
            incoming,
            accounts = refreshed.len(),
            "rewound to common ancestor"
        );
        Ok(Some(height))
    }
}

/// Sleeps for `duration`; `false` if shutdown was requested meanwhile.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn dispatch(
    node: Node,
    mut next: u64,
    heights: mpsc::Sender<(u64, u64)>,
    mut rewinds: watch::Receiver<(u64, u64)>,
    mut shutdown: watch::Receiver<bool>,
    options: PipelineOptions,
    progress: Option<ProgressBar>,
) {
    let mut generation = 0u64;
    'poll: loop {
        if rewinds.has_changed().unwrap_or(false) {
            (generation, next) = *rewinds.borrow_and_update();
            tracing::debug!(generation, next, "dispatcher rewound");
        }
        let height = match node.chain_height().await {
            Ok(height) => height,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read chain height");
                if !pause(options.interval, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };
        let target = options.stop_at.map_or(height, |stop| stop.min(height));
        if let Some(pb) = &progress {
            pb.set_length(target + 1);
        }

        while next <= target {
            if rewinds.has_changed().unwrap_or(false) {
                continue 'poll;
            }
            tokio::select! {
                sent = heights.send((generation, next)) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            tracing::debug!(block_number = next, "dispatched");
            next += 1;
        }

        if !pause(options.interval, &mut shutdown).await {
            return;
        }
    }
}

async fn work(
    id: usize,
    decoder: BlockDecoder,
    heights: Arc<Mutex<mpsc::Receiver<(u64, u64)>>>,
    results: mpsc::Sender<(u64, Parsed)>,
    mut shutdown: watch::Receiver<bool>,
    options: PipelineOptions,
) {
    loop {
        let next = heights.lock().await.recv().await;
        let Some((generation, number)) = next else {
            break;
        };

        let mut attempt = 0u32;
        let parsed = loop {
            match decoder.decode(number).await {
                Ok(parsed) => break parsed,
                Err(e) if e.is_not_found() => {
                    if !pause(options.interval, &mut shutdown).await {
                        return;
                    }
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(worker = id, block_number = number, attempt, error = %e, "decode failed, retrying");
                    if !pause(options.backoff, &mut shutdown).await {
                        return;
                    }
                }
            }
        };
        if results.send((generation, parsed)).await.is_err() {
            break;
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}
