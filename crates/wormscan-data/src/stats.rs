//! Running chain totals.
//!
//! The writer is the only mutator: every committed block is folded in with
//! [`Stats::apply`], and the result is persisted in the same database
//! transaction. Readers get clones through a `tokio::sync::watch` channel.

use alloy::primitives::{I256, U256};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::amount;
use crate::types::{NftRef, Parsed};
use crate::wormholes::domain_payload;

/// Number of richest accounts tracked.
pub const TOP_N: usize = 50;

/// Side effects of a commit that only the store can observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitEffects {
    /// Accounts inserted for the first time.
    pub new_accounts: u64,
    /// Sum of `new_balance - previous_balance` over the block's accounts.
    pub balance_delta: I256,
    pub exchangers_opened: u64,
    pub exchangers_closed: u64,
    /// SNFT rows removed by recycle transactions.
    pub recycled: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopAccount {
    pub address: String,
    pub balance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub chain_id: u64,
    pub genesis_balance: String,
    pub total_block: u64,
    /// Blocks produced by the zero address.
    pub total_black_hole: u64,
    pub total_transaction: u64,
    pub total_internal_tx: u64,
    /// Transactions with empty input.
    pub total_transfer_tx: u64,
    /// Transactions carrying a `wormholes:` / `erbie:` payload.
    pub total_wormholes_tx: u64,
    pub total_uncle: u64,
    pub total_account: u64,
    pub total_balance: String,
    pub total_exchanger: u64,
    pub total_nft: u64,
    pub total_snft: u64,
    pub total_nft_tx: u64,
    pub total_snft_tx: u64,
    pub total_amount: String,
    pub total_nft_amount: String,
    pub total_snft_amount: String,
    pub total_reward_coin: u64,
    pub total_reward_snft: u64,
    pub total_recycle: u64,
    pub total_pledge: String,
    pub first_block_time: u64,
    pub last_block_time: u64,
    pub avg_block_time_ms: u64,
    /// Transactions per UTC day (`YYYY-MM-DD`).
    pub daily_tx: BTreeMap<String, u64>,
    pub top_accounts: Vec<TopAccount>,
}

impl Stats {
    /// Folds one committed block into the totals.
    pub fn apply(&mut self, parsed: &Parsed, effects: &CommitEffects) {
        let header = &parsed.block.header;

        if self.total_block == 0 {
            self.first_block_time = header.timestamp;
        }
        self.total_block += 1;
        self.last_block_time = header.timestamp;
        if self.total_block > 1 {
            let span = self.last_block_time.saturating_sub(self.first_block_time);
            self.avg_block_time_ms = span * 1000 / (self.total_block - 1);
        }
        if header.miner.is_zero() && header.number > 0 {
            self.total_black_hole += 1;
        }

        self.total_transaction += parsed.txs.len() as u64;
        self.total_internal_tx += parsed.internal_txs.len() as u64;
        self.total_uncle += parsed.uncles.len() as u64;

        let mut moved = U256::ZERO;
        for tx in &parsed.txs {
            if tx.input.is_empty() {
                self.total_transfer_tx += 1;
            } else if domain_payload(&tx.input).is_some() {
                self.total_wormholes_tx += 1;
            }
            moved = moved.saturating_add(tx.value);
        }
        self.total_amount = add_or_keep(&self.total_amount, &moved.to_string());
        if !parsed.txs.is_empty() {
            let day = day_of(header.timestamp);
            *self.daily_tx.entry(day).or_default() += parsed.txs.len() as u64;
        }

        self.total_account += effects.new_accounts;
        self.total_balance = add_or_keep(&self.total_balance, &effects.balance_delta.to_string());
        if header.number == 0 {
            self.genesis_balance = self.total_balance.clone();
        }
        self.total_exchanger = (self.total_exchanger + effects.exchangers_opened)
            .saturating_sub(effects.exchangers_closed);

        let domain = &parsed.domain;
        self.total_nft += domain.nfts.len() as u64;
        for reward in &domain.rewards {
            if reward.snft.is_some() {
                self.total_reward_snft += 1;
                self.total_snft += 1;
            } else {
                self.total_reward_coin += 1;
            }
        }
        for tx in domain.nft_txs.iter().filter(|tx| !tx.is_recycle()) {
            let snft = matches!(&tx.nft, NftRef::Address(a) if is_snft(a));
            if snft {
                self.total_snft_tx += 1;
                self.total_snft_amount = add_or_keep(&self.total_snft_amount, &tx.price);
            } else {
                self.total_nft_tx += 1;
                self.total_nft_amount = add_or_keep(&self.total_nft_amount, &tx.price);
            }
        }
        self.total_recycle += effects.recycled;
        self.total_snft = self.total_snft.saturating_sub(effects.recycled);
        for pledge in &domain.pledges {
            self.total_pledge = add_or_keep(&self.total_pledge, &pledge.amount);
        }

        for account in &parsed.accounts {
            self.track_balance(
                &crate::types::lower_hex(&account.address),
                account.balance,
            );
        }
    }

    /// Keeps `top_accounts` sorted by balance, richest first.
    pub fn track_balance(&mut self, address: &str, balance: U256) {
        self.top_accounts.retain(|a| a.address != address);
        if !balance.is_zero() {
            self.top_accounts.push(TopAccount {
                address: address.to_string(),
                balance: balance.to_string(),
            });
        }
        self.top_accounts
            .sort_by_key(|a| std::cmp::Reverse(amount::parse_unsigned(&a.balance).unwrap_or_default()));
        self.top_accounts.truncate(TOP_N);
    }
}

/// SNFT identifiers live in the `0x8…` address range.
pub fn is_snft(address: &str) -> bool {
    address.len() > 3 && address.starts_with("0x8")
}

pub fn day_of(timestamp: u64) -> String {
    DateTime::from_timestamp(timestamp as i64, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn add_or_keep(current: &str, delta: &str) -> String {
    match amount::add(current, delta) {
        Ok(total) => total,
        Err(e) => {
            tracing::warn!(current, delta, error = %e, "unparseable amount in stats, ignored");
            current.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, Header, NftTx, Reward, Transaction};
    use alloy::primitives::{Address, Bytes, B256};

    fn block(number: u64, timestamp: u64) -> Parsed {
        Parsed {
            block: Block {
                header: Header {
                    number,
                    timestamp,
                    miner: Address::with_last_byte(1),
                    ..Header::default()
                },
                ..Block::default()
            },
            ..Parsed::default()
        }
    }

    fn tx(input: &[u8], value: u64) -> Transaction {
        Transaction {
            hash: B256::ZERO,
            block_hash: B256::ZERO,
            block_number: 1,
            timestamp: 86_400,
            from: Address::ZERO,
            to: Some(Address::with_last_byte(2)),
            input: Bytes::copy_from_slice(input),
            value: U256::from(value),
            nonce: 0,
            gas: 21_000,
            gas_price: U256::ZERO,
            status: Some(1),
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            contract_address: None,
            tx_index: 0,
        }
    }

    #[test]
    fn empty_block_only_counts_the_block() {
        let mut stats = Stats::default();
        stats.apply(&block(42, 100), &CommitEffects::default());

        assert_eq!(stats.total_block, 1);
        assert_eq!(stats.total_transaction, 0);
        assert!(stats.daily_tx.is_empty());
    }

    #[test]
    fn average_block_time_spans_first_to_last() {
        let mut stats = Stats::default();
        for (n, ts) in [(0, 1_000), (1, 1_005), (2, 1_016)] {
            stats.apply(&block(n, ts), &CommitEffects::default());
        }
        assert_eq!(stats.avg_block_time_ms, 8_000);
    }

    #[test]
    fn transactions_are_split_by_kind_and_day() {
        let mut parsed = block(1, 86_400);
        parsed.txs = vec![
            tx(b"", 5),
            tx(b"wormholes:{\"type\":1}", 0),
            tx(&[0xa9, 0x05, 0x9c, 0xbb], 7),
        ];
        let mut stats = Stats::default();
        stats.apply(&parsed, &CommitEffects::default());

        assert_eq!(stats.total_transaction, 3);
        assert_eq!(stats.total_transfer_tx, 1);
        assert_eq!(stats.total_wormholes_tx, 1);
        assert_eq!(stats.total_amount, "12");
        assert_eq!(stats.daily_tx.get("1970-01-02"), Some(&3));
    }

    #[test]
    fn rewards_and_recycles_move_snft_totals() {
        let mut parsed = block(5, 10);
        parsed.domain.rewards = vec![
            Reward {
                address: "0x01".into(),
                identity: 2,
                block_number: 5,
                snft: Some(format!("0x8{}", "0".repeat(39))),
                amount: None,
            },
            Reward {
                address: "0x02".into(),
                identity: 1,
                block_number: 5,
                snft: None,
                amount: Some("100".into()),
            },
        ];
        parsed.domain.nft_txs = vec![NftTx {
            tx_type: 9,
            nft: NftRef::Address(format!("0x8{}", "1".repeat(39))),
            exchanger: None,
            from: "0x01".into(),
            to: "0x03".into(),
            price: "250".into(),
            timestamp: 10,
            block_number: 5,
            tx_hash: "0xaa".into(),
        }];
        let mut stats = Stats::default();
        stats.apply(
            &parsed,
            &CommitEffects {
                recycled: 1,
                ..CommitEffects::default()
            },
        );

        assert_eq!(stats.total_reward_snft, 1);
        assert_eq!(stats.total_reward_coin, 1);
        assert_eq!(stats.total_snft, 0);
        assert_eq!(stats.total_recycle, 1);
        assert_eq!(stats.total_snft_tx, 1);
        assert_eq!(stats.total_snft_amount, "250");
    }

    #[test]
    fn balance_delta_accumulates_and_seeds_genesis() {
        let mut stats = Stats::default();
        stats.apply(
            &block(0, 0),
            &CommitEffects {
                new_accounts: 2,
                balance_delta: I256::try_from(1_000i64).expect("fits"),
                ..CommitEffects::default()
            },
        );
        stats.apply(
            &block(1, 5),
            &CommitEffects {
                balance_delta: I256::try_from(-300i64).expect("fits"),
                ..CommitEffects::default()
            },
        );

        assert_eq!(stats.genesis_balance, "1000");
        assert_eq!(stats.total_balance, "700");
        assert_eq!(stats.total_account, 2);
    }

    #[test]
    fn top_accounts_stay_sorted_and_bounded() {
        let mut stats = Stats::default();
        for i in 0..(TOP_N as u64 + 5) {
            stats.track_balance(&format!("0x{i:040x}"), U256::from(i + 1));
        }
        assert_eq!(stats.top_accounts.len(), TOP_N);
        assert_eq!(stats.top_accounts[0].balance, (TOP_N as u64 + 5).to_string());

        stats.track_balance(&format!("0x{:040x}", TOP_N as u64 + 4), U256::ZERO);
        assert_eq!(stats.top_accounts[0].balance, (TOP_N as u64 + 4).to_string());
    }
}
