//! SQLite storage for committed blocks and Wormholes domain state.
//!
//! Every block is written inside one transaction, in a fixed order: logs and
//! token transfers, transactions, internal transactions, uncles, accounts,
//! contracts, the block row, then domain entities. The running [`Stats`] are
//! persisted in the `cache` table as part of the same transaction.

use alloy::primitives::{hex, Address, B256, I256, U256};
use eyre::{eyre, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::amount;
use crate::stats::{self, CommitEffects, Stats, TopAccount, TOP_N};
use crate::types::{
    lower_hex, Account, ContractKind, ExchangerChange, NftRef, Parsed, TransferRecord,
};

/// Every table owned by the writer, in creation order.
pub const TABLES: &[&str] = &[
    "blocks",
    "uncles",
    "transactions",
    "internal_txs",
    "logs",
    "erc20_transfers",
    "erc721_transfers",
    "erc1155_transfers",
    "accounts",
    "nfts",
    "snfts",
    "epochs",
    "collections",
    "fnfts",
    "nft_txs",
    "exchangers",
    "validators",
    "pledges",
    "rewards",
    "penalties",
    "cache",
];

/// Height-scoped tables and the column holding the height, for rewinds.
const HEIGHT_COLUMNS: &[(&str, &str)] = &[
    ("blocks", "number"),
    ("uncles", "included_in"),
    ("transactions", "block_number"),
    ("internal_txs", "block_number"),
    ("logs", "block_number"),
    ("erc20_transfers", "block_number"),
    ("erc721_transfers", "block_number"),
    ("erc1155_transfers", "block_number"),
    ("accounts", "first_number"),
    ("nfts", "block_number"),
    ("snfts", "block_number"),
    ("epochs", "block_number"),
    ("collections", "block_number"),
    ("fnfts", "block_number"),
    ("nft_txs", "block_number"),
    ("exchangers", "block_number"),
    ("pledges", "number"),
    ("rewards", "block_number"),
    ("penalties", "block_number"),
];

const STATS_KEY: &str = "stats";
/// Hex of the ASCII `wormholes:` and `erbie:` markers, for SQL prefix scans.
const WORMHOLES_INPUT_HEX: &str = "0x776f726d686f6c65733a";
const ERBIE_INPUT_HEX: &str = "0x65726269653a";

/// Result of [`Store::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitEffects),
    /// The same hash is already stored at this height.
    AlreadyCommitted,
    /// The block does not extend the stored head.
    ParentMismatch { head: u64, stored: B256 },
}

/// Stored account fields read back for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    pub address: String,
    pub balance: String,
    pub nonce: u64,
    pub number: u64,
    pub code_hash: Option<String>,
    pub kind: Option<ContractKind>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub creator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftRow {
    pub address: String,
    pub creator: String,
    pub owner: String,
    pub last_price: Option<String>,
    pub royalty_ratio: u32,
    pub meta_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangerRow {
    pub address: String,
    pub name: String,
    pub fee_ratio: u32,
    pub amount: String,
    pub tx_amount: String,
    pub close_at: Option<u64>,
}

pub struct Store {
    conn: RefCell<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        Self::open(path, false)
    }

    /// Like [`Store::new`], dropping every table first when `reset` is set.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn open(path: &str, reset: bool) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if path != ":memory:" && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path).wrap_err_with(|| format!("failed to open {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        if reset {
            store.drop_tables()?;
        }
        store.run_migrations()?;
        Ok(store)
    }

    fn drop_tables(&self) -> Result<()> {
        let conn = self.conn.borrow();
        for table in TABLES {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
        }
        tracing::warn!(tables = TABLES.len(), "database reset");
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blocks (
                number INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                parent_hash TEXT NOT NULL,
                miner TEXT,
                timestamp INTEGER,
                difficulty TEXT,
                total_difficulty TEXT,
                extra_data TEXT,
                gas_limit INTEGER,
                gas_used INTEGER,
                mix_hash TEXT,
                nonce TEXT,
                receipts_root TEXT,
                sha3_uncles TEXT,
                size INTEGER,
                state_root TEXT,
                transactions_root TEXT,
                uncles_count INTEGER,
                total_transaction INTEGER,
                proposers TEXT
            );

            CREATE TABLE IF NOT EXISTS uncles (
                hash TEXT PRIMARY KEY,
                number INTEGER,
                included_in INTEGER,
                position INTEGER,
                parent_hash TEXT,
                miner TEXT,
                timestamp INTEGER,
                difficulty TEXT,
                gas_limit INTEGER,
                gas_used INTEGER,
                extra_data TEXT,
                size INTEGER
            );

            CREATE TABLE IF NOT EXISTS transactions (
                hash TEXT PRIMARY KEY,
                block_hash TEXT,
                block_number INTEGER,
                tx_index INTEGER,
                timestamp INTEGER,
                from_address TEXT,
                to_address TEXT,
                value TEXT,
                nonce INTEGER,
                gas INTEGER,
                gas_price TEXT,
                input TEXT,
                method_id TEXT,
                status INTEGER,
                gas_used INTEGER,
                cumulative_gas_used INTEGER,
                contract_address TEXT
            );
            CREATE INDEX IF NOT EXISTS transactions_block ON transactions (block_number);

            CREATE TABLE IF NOT EXISTS internal_txs (
                tx_hash TEXT,
                seq INTEGER,
                block_number INTEGER,
                depth INTEGER,
                op TEXT,
                from_address TEXT,
                to_address TEXT,
                value TEXT,
                gas_limit INTEGER,
                PRIMARY KEY (tx_hash, seq)
            );

            CREATE TABLE IF NOT EXISTS logs (
                tx_hash TEXT,
                idx INTEGER,
                block_number INTEGER,
                address TEXT,
                topic0 TEXT,
                topic1 TEXT,
                topic2 TEXT,
                topic3 TEXT,
                data TEXT,
                removed INTEGER,
                PRIMARY KEY (tx_hash, idx)
            );

            CREATE TABLE IF NOT EXISTS erc20_transfers (
                tx_hash TEXT,
                log_index INTEGER,
                block_number INTEGER,
                contract TEXT,
                from_address TEXT,
                to_address TEXT,
                value TEXT,
                PRIMARY KEY (tx_hash, log_index)
            );

            CREATE TABLE IF NOT EXISTS erc721_transfers (
                tx_hash TEXT,
                log_index INTEGER,
                block_number INTEGER,
                contract TEXT,
                from_address TEXT,
                to_address TEXT,
                token_id TEXT,
                PRIMARY KEY (tx_hash, log_index)
            );

            CREATE TABLE IF NOT EXISTS erc1155_transfers (
                tx_hash TEXT,
                log_index INTEGER,
                batch_index INTEGER,
                block_number INTEGER,
                contract TEXT,
                operator TEXT,
                from_address TEXT,
                to_address TEXT,
                token_id TEXT,
                value TEXT,
                PRIMARY KEY (tx_hash, log_index, batch_index)
            );

            CREATE TABLE IF NOT EXISTS accounts (
                address TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                nonce INTEGER,
                number INTEGER,
                first_number INTEGER,
                code_hash TEXT,
                contract_type INTEGER,
                name TEXT,
                symbol TEXT,
                creator TEXT,
                created_tx TEXT,
                snft_value TEXT
            );

            CREATE TABLE IF NOT EXISTS nfts (
                address TEXT PRIMARY KEY,
                royalty_ratio INTEGER,
                meta_url TEXT,
                raw_meta_url TEXT,
                exchanger TEXT,
                creator TEXT,
                owner TEXT,
                last_price TEXT,
                timestamp INTEGER,
                block_number INTEGER,
                tx_hash TEXT
            );

            CREATE TABLE IF NOT EXISTS snfts (
                address TEXT PRIMARY KEY,
                epoch_id TEXT,
                owner TEXT,
                awardee TEXT,
                last_price TEXT,
                reward_at INTEGER,
                block_number INTEGER,
                pledge_number INTEGER,
                pieces INTEGER
            );

            CREATE TABLE IF NOT EXISTS epochs (
                id TEXT PRIMARY KEY,
                creator TEXT,
                royalty_ratio INTEGER,
                dir TEXT,
                exchanger TEXT,
                vote_weight TEXT,
                number INTEGER,
                start_number INTEGER,
                start_time INTEGER,
                reward TEXT,
                block_number INTEGER
            );

            CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                epoch_id TEXT,
                block_number INTEGER
            );

            CREATE TABLE IF NOT EXISTS fnfts (
                id TEXT PRIMARY KEY,
                collection_id TEXT,
                epoch_id TEXT,
                meta_url TEXT,
                block_number INTEGER
            );

            CREATE TABLE IF NOT EXISTS nft_txs (
                tx_hash TEXT,
                seq INTEGER,
                tx_type INTEGER,
                nft_address TEXT,
                exchanger TEXT,
                from_address TEXT,
                to_address TEXT,
                price TEXT,
                fee TEXT,
                recycled INTEGER,
                recycle_value TEXT,
                timestamp INTEGER,
                block_number INTEGER,
                PRIMARY KEY (tx_hash, seq)
            );

            CREATE TABLE IF NOT EXISTS exchangers (
                address TEXT PRIMARY KEY,
                name TEXT,
                url TEXT,
                fee_ratio INTEGER,
                amount TEXT,
                tx_amount TEXT,
                timestamp INTEGER,
                block_number INTEGER,
                tx_hash TEXT,
                close_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS validators (
                address TEXT PRIMARY KEY,
                amount TEXT,
                proxy TEXT,
                weight INTEGER,
                number INTEGER
            );

            CREATE TABLE IF NOT EXISTS pledges (
                tx_hash TEXT,
                address TEXT,
                pledge_type INTEGER,
                amount TEXT,
                number INTEGER,
                timestamp INTEGER,
                PRIMARY KEY (tx_hash, address)
            );

            CREATE TABLE IF NOT EXISTS rewards (
                block_number INTEGER,
                idx INTEGER,
                address TEXT,
                identity INTEGER,
                snft TEXT,
                amount TEXT,
                PRIMARY KEY (block_number, idx)
            );

            CREATE TABLE IF NOT EXISTS penalties (
                block_number INTEGER,
                address TEXT,
                weight INTEGER,
                PRIMARY KEY (block_number, address)
            );

            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Highest stored block and its hash.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn head(&self) -> Result<Option<(u64, B256)>> {
        let conn = self.conn.borrow();
        let row: Option<(u64, String)> = conn
            .query_row(
                "SELECT number, hash FROM blocks ORDER BY number DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((number, hash)) => Ok(Some((number, parse_hash(&hash)?))),
            None => Ok(None),
        }
    }

    /// Stored hash at `number`.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn block_hash(&self, number: u64) -> Result<Option<B256>> {
        let conn = self.conn.borrow();
        let hash: Option<String> = conn
            .query_row(
                "SELECT hash FROM blocks WHERE number = ?",
                rusqlite::params![number],
                |row| row.get(0),
            )
            .optional()?;
        hash.as_deref().map(parse_hash).transpose()
    }

    /// Persists `parsed` and folds it into `stats`, atomically.
    ///
    /// `stats` is only updated when the transaction commits.
    ///
    /// # Errors
    /// Returns error if the block would leave a gap above the head or any
    /// write fails. Nothing is persisted in that case.
    #[tracing::instrument(skip_all, fields(block_number = parsed.number()))]
    pub fn commit(&self, parsed: &Parsed, stats: &mut Stats) -> Result<CommitOutcome> {
        let number = parsed.number();
        match self.head()? {
            Some((head, _)) if number <= head => {
                return match self.block_hash(number)? {
                    Some(stored) if stored == parsed.hash() => Ok(CommitOutcome::AlreadyCommitted),
                    _ => Err(eyre!("block {number} conflicts with stored head {head}")),
                };
            }
            Some((head, stored)) if number == head + 1 => {
                if parsed.parent_hash() != stored {
                    return Ok(CommitOutcome::ParentMismatch { head, stored });
                }
            }
            Some((head, _)) => return Err(eyre!("block {number} skips heights above head {head}")),
            None => {}
        }

        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        let mut effects = CommitEffects::default();

        insert_logs(&tx, parsed)?;
        insert_transactions(&tx, parsed)?;
        insert_internal_txs(&tx, parsed)?;
        insert_uncles(&tx, parsed)?;
        upsert_accounts(&tx, &parsed.accounts, number, &mut effects)?;
        upsert_contracts(&tx, &parsed.accounts)?;
        insert_block(&tx, parsed)?;
        apply_domain(&tx, parsed, &mut effects)?;

        let mut next = stats.clone();
        next.apply(parsed, &effects);
        put_cache(&tx, STATS_KEY, &serde_json::to_string(&next)?)?;
        tx.commit().wrap_err_with(|| format!("failed to commit block {number}"))?;

        *stats = next;
        tracing::debug!(
            txs = parsed.txs.len(),
            accounts = parsed.accounts.len(),
            new_accounts = effects.new_accounts,
            "block persisted"
        );
        Ok(CommitOutcome::Committed(effects))
    }

    /// Accounts last touched above `height`.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn accounts_above(&self, height: u64) -> Result<Vec<Address>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT address FROM accounts WHERE number > ? AND first_number <= ? ORDER BY address",
        )?;
        let addresses: Vec<String> = stmt
            .query_map(rusqlite::params![height, height], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        addresses
            .iter()
            .map(|a| a.parse::<Address>().wrap_err_with(|| format!("bad stored address {a}")))
            .collect()
    }

    /// Rewinds the store to `height`.
    ///
    /// Deletes everything recorded above `height`, restores NFT ownership
    /// from the surviving transfer history, writes the `refreshed` account
    /// snapshots and recomputes the stats, which are returned.
    ///
    /// # Errors
    /// Returns error if any statement fails; the rewind is then rolled back.
    #[tracing::instrument(skip(self, refreshed), fields(accounts = refreshed.len()))]
    pub fn set_head(&self, height: u64, refreshed: &[Account]) -> Result<Stats> {
        let previous = self.load_stats()?;
        {
            let mut conn = self.conn.borrow_mut();
            let tx = conn.transaction()?;

            let moved_nfts: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT nft_address FROM nft_txs WHERE block_number > ?",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![height], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut removed = 0usize;
            for (table, column) in HEIGHT_COLUMNS {
                removed += tx.execute(
                    &format!("DELETE FROM {table} WHERE {column} > ?"),
                    rusqlite::params![height],
                )?;
            }
            tx.execute(
                "UPDATE exchangers SET close_at = NULL WHERE close_at > ?",
                rusqlite::params![height],
            )?;
            tx.execute(
                "UPDATE snfts SET pledge_number = NULL WHERE pledge_number > ?",
                rusqlite::params![height],
            )?;

            for address in &moved_nfts {
                let last: Option<(String, String)> = tx
                    .query_row(
                        "SELECT to_address, price FROM nft_txs
                         WHERE nft_address = ? AND to_address != ''
                         ORDER BY block_number DESC, seq DESC LIMIT 1",
                        rusqlite::params![address],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (owner, price) = last.unzip();
                tx.execute(
                    "UPDATE nfts SET owner = COALESCE(?, creator), last_price = ? WHERE address = ?",
                    rusqlite::params![owner, price, address],
                )?;
                tx.execute(
                    "UPDATE snfts SET owner = COALESCE(?, awardee), last_price = ? WHERE address = ?",
                    rusqlite::params![owner, price, address],
                )?;
            }

            for account in refreshed {
                tx.execute(
                    "UPDATE accounts SET balance = ?, nonce = ?, number = ?, snft_value = ?
                     WHERE address = ?",
                    rusqlite::params![
                        account.balance.to_string(),
                        account.nonce,
                        account.number,
                        account.snft_value.to_string(),
                        lower_hex(&account.address),
                    ],
                )?;
            }
            tx.commit()?;
            tracing::warn!(height, removed, nfts = moved_nfts.len(), "store rewound");
        }

        let stats = self.recount_stats(&previous)?;
        self.cache_put(STATS_KEY, &serde_json::to_string(&stats)?)?;
        Ok(stats)
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT value FROM cache WHERE key = ?",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// # Errors
    /// Returns error if the write fails.
    pub fn cache_put(&self, key: &str, value: &str) -> Result<()> {
        put_cache(&self.conn.borrow(), key, value)
    }

    /// Stats persisted by the last commit, or zeroes for a fresh database.
    ///
    /// # Errors
    /// Returns error if the stored snapshot cannot be parsed.
    pub fn load_stats(&self) -> Result<Stats> {
        match self.cache_get(STATS_KEY)? {
            Some(json) => serde_json::from_str(&json).wrap_err("stored stats are corrupt"),
            None => Ok(Stats::default()),
        }
    }

    /// Recomputes every total from the tables.
    ///
    /// `previous` supplies what the tables cannot: chain id and the genesis
    /// balance.
    ///
    /// # Errors
    /// Returns error if a query fails or a stored amount does not parse.
    pub fn recount_stats(&self, previous: &Stats) -> Result<Stats> {
        let conn = self.conn.borrow();
        let count = |sql: &str| -> Result<u64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
        let sum = |sql: &str| -> Result<String> {
            let mut stmt = conn.prepare(sql)?;
            let values = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            values
                .iter()
                .try_fold("0".to_string(), |total, v| amount::add(&total, v))
        };

        let mut stats = Stats {
            chain_id: previous.chain_id,
            genesis_balance: previous.genesis_balance.clone(),
            ..Stats::default()
        };
        stats.total_block = count("SELECT COUNT(*) FROM blocks")?;
        stats.total_black_hole = count(
            format!(
                "SELECT COUNT(*) FROM blocks WHERE number > 0 AND miner = '{}'",
                lower_hex(&Address::ZERO)
            )
            .as_str(),
        )?;
        stats.total_transaction = count("SELECT COUNT(*) FROM transactions")?;
        stats.total_internal_tx = count("SELECT COUNT(*) FROM internal_txs")?;
        stats.total_transfer_tx = count("SELECT COUNT(*) FROM transactions WHERE input = '0x'")?;
        stats.total_wormholes_tx = count(
            format!(
                "SELECT COUNT(*) FROM transactions
                 WHERE input LIKE '{WORMHOLES_INPUT_HEX}%' OR input LIKE '{ERBIE_INPUT_HEX}%'"
            )
            .as_str(),
        )?;
        stats.total_uncle = count("SELECT COUNT(*) FROM uncles")?;
        stats.total_account = count("SELECT COUNT(*) FROM accounts")?;
        stats.total_balance = sum("SELECT balance FROM accounts")?;
        stats.total_exchanger = count("SELECT COUNT(*) FROM exchangers WHERE close_at IS NULL")?;
        stats.total_nft = count("SELECT COUNT(*) FROM nfts")?;
        stats.total_recycle = count("SELECT COALESCE(SUM(recycled), 0) FROM nft_txs")?;
        stats.total_reward_snft = count("SELECT COUNT(*) FROM rewards WHERE snft IS NOT NULL")?;
        stats.total_reward_coin = count("SELECT COUNT(*) FROM rewards WHERE snft IS NULL")?;
        stats.total_snft = stats.total_reward_snft.saturating_sub(stats.total_recycle);
        stats.total_nft_tx = count(
            "SELECT COUNT(*) FROM nft_txs WHERE to_address != '' AND nft_address NOT LIKE '0x8%'",
        )?;
        stats.total_snft_tx = count(
            "SELECT COUNT(*) FROM nft_txs WHERE to_address != '' AND nft_address LIKE '0x8%'",
        )?;
        stats.total_amount = sum("SELECT value FROM transactions")?;
        stats.total_nft_amount = sum(
            "SELECT price FROM nft_txs WHERE to_address != '' AND nft_address NOT LIKE '0x8%'",
        )?;
        stats.total_snft_amount =
            sum("SELECT price FROM nft_txs WHERE to_address != '' AND nft_address LIKE '0x8%'")?;
        stats.total_pledge = sum("SELECT amount FROM pledges")?;

        let times: Option<(u64, u64)> = conn
            .query_row(
                "SELECT (SELECT timestamp FROM blocks ORDER BY number ASC LIMIT 1),
                        (SELECT timestamp FROM blocks ORDER BY number DESC LIMIT 1)
                 WHERE EXISTS (SELECT 1 FROM blocks)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((first, last)) = times {
            stats.first_block_time = first;
            stats.last_block_time = last;
            if stats.total_block > 1 {
                stats.avg_block_time_ms =
                    last.saturating_sub(first) * 1000 / (stats.total_block - 1);
            }
        }

        let mut stmt = conn.prepare("SELECT timestamp FROM transactions")?;
        for ts in stmt.query_map([], |row| row.get::<_, u64>(0))? {
            *stats.daily_tx.entry(stats::day_of(ts?)).or_default() += 1;
        }

        let mut stmt = conn.prepare(
            "SELECT address, balance FROM accounts WHERE balance != '0'
             ORDER BY length(balance) DESC, balance DESC LIMIT ?",
        )?;
        stats.top_accounts = stmt
            .query_map(rusqlite::params![TOP_N as u64], |row| {
                Ok(TopAccount {
                    address: row.get(0)?,
                    balance: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stats)
    }

    /// Row count of one of [`TABLES`].
    ///
    /// # Errors
    /// Returns error for an unknown table or a failed query.
    pub fn count(&self, table: &str) -> Result<u64> {
        if !TABLES.contains(&table) {
            return Err(eyre!("unknown table `{table}`"));
        }
        let conn = self.conn.borrow();
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    }

    /// Stored `total_transaction` and actual transaction rows of a block.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn block_tx_counts(&self, number: u64) -> Result<Option<(u64, u64)>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT total_transaction,
                        (SELECT COUNT(*) FROM transactions WHERE block_number = blocks.number)
                 FROM blocks WHERE number = ?",
                rusqlite::params![number],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Stored parent hash at `number`.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn parent_hash(&self, number: u64) -> Result<Option<B256>> {
        let conn = self.conn.borrow();
        let hash: Option<String> = conn
            .query_row(
                "SELECT parent_hash FROM blocks WHERE number = ?",
                rusqlite::params![number],
                |row| row.get(0),
            )
            .optional()?;
        hash.as_deref().map(parse_hash).transpose()
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn account(&self, address: &Address) -> Result<Option<AccountRow>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT address, balance, nonce, number, code_hash, contract_type, name, symbol, creator
                 FROM accounts WHERE address = ?",
                rusqlite::params![lower_hex(address)],
                |row| {
                    Ok(AccountRow {
                        address: row.get(0)?,
                        balance: row.get(1)?,
                        nonce: row.get(2)?,
                        number: row.get(3)?,
                        code_hash: row.get(4)?,
                        kind: row.get::<_, Option<i64>>(5)?.and_then(ContractKind::from_code),
                        name: row.get(6)?,
                        symbol: row.get(7)?,
                        creator: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn nft(&self, address: &str) -> Result<Option<NftRow>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT address, creator, owner, last_price, royalty_ratio, meta_url
                 FROM nfts WHERE address = ?",
                rusqlite::params![address],
                |row| {
                    Ok(NftRow {
                        address: row.get(0)?,
                        creator: row.get(1)?,
                        owner: row.get(2)?,
                        last_price: row.get(3)?,
                        royalty_ratio: row.get(4)?,
                        meta_url: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    /// Owner of the SNFT stored at exactly `address`.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn snft_owner(&self, address: &str) -> Result<Option<String>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT owner FROM snfts WHERE address = ?",
                rusqlite::params![address],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn exchanger(&self, address: &str) -> Result<Option<ExchangerRow>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT address, name, fee_ratio, amount, tx_amount, close_at
                 FROM exchangers WHERE address = ?",
                rusqlite::params![address],
                |row| {
                    Ok(ExchangerRow {
                        address: row.get(0)?,
                        name: row.get(1)?,
                        fee_ratio: row.get(2)?,
                        amount: row.get(3)?,
                        tx_amount: row.get(4)?,
                        close_at: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    /// Pledged amount of a validator.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn validator_amount(&self, address: &str) -> Result<Option<String>> {
        let conn = self.conn.borrow();
        Ok(conn
            .query_row(
                "SELECT amount FROM validators WHERE address = ?",
                rusqlite::params![address],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// `(depth, op, from, to)` of the internal transactions of `tx_hash`,
    /// in trace order.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn internal_txs(&self, tx_hash: &B256) -> Result<Vec<(u64, String, String, String)>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT depth, op, from_address, to_address FROM internal_txs
             WHERE tx_hash = ? ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![lower_hex(tx_hash)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_hash(value: &str) -> Result<B256> {
    value
        .parse::<B256>()
        .wrap_err_with(|| format!("bad stored hash {value}"))
}

fn put_cache(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO cache (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

/// Contract kind of `address`: freshly classified in this block, or stored.
fn known_kind(
    conn: &Connection,
    fresh: &HashMap<Address, ContractKind>,
    address: &Address,
) -> Result<Option<ContractKind>> {
    if let Some(kind) = fresh.get(address) {
        return Ok(Some(*kind));
    }
    let code: Option<Option<i64>> = conn
        .query_row(
            "SELECT contract_type FROM accounts WHERE address = ?",
            rusqlite::params![lower_hex(address)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(code.flatten().and_then(ContractKind::from_code))
}

fn insert_logs(conn: &Connection, parsed: &Parsed) -> Result<()> {
    let number = parsed.number();
    {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO logs (
                tx_hash, idx, block_number, address, topic0, topic1, topic2, topic3, data, removed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for log in &parsed.logs {
            let topic = |i: usize| log.topics.get(i).map(lower_hex);
            stmt.execute(rusqlite::params![
                lower_hex(&log.tx_hash),
                log.index,
                number,
                lower_hex(&log.address),
                topic(0),
                topic(1),
                topic(2),
                topic(3),
                hex::encode_prefixed(&log.data),
                log.removed,
            ])?;
        }
    }

    let fresh: HashMap<Address, ContractKind> = parsed
        .accounts
        .iter()
        .filter_map(|a| a.kind.map(|k| (a.address, k)))
        .collect();
    let mut kinds: HashMap<Address, Option<ContractKind>> = HashMap::new();
    let mut skipped = 0usize;

    for record in &parsed.transfers {
        let contract = record.contract();
        let kind = match kinds.get(&contract) {
            Some(kind) => *kind,
            None => {
                let kind = known_kind(conn, &fresh, &contract)?;
                kinds.insert(contract, kind);
                kind
            }
        };
        if kind != Some(record.required_kind()) {
            skipped += 1;
            continue;
        }
        insert_transfer(conn, record, number)?;
    }
    if skipped > 0 {
        tracing::debug!(skipped, "transfer events from unclassified contracts dropped");
    }
    Ok(())
}

fn insert_transfer(conn: &Connection, record: &TransferRecord, number: u64) -> Result<()> {
    match record {
        TransferRecord::Erc20 {
            tx_hash,
            log_index,
            address,
            from,
            to,
            value,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO erc20_transfers (
                    tx_hash, log_index, block_number, contract, from_address, to_address, value
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    lower_hex(tx_hash),
                    log_index,
                    number,
                    lower_hex(address),
                    lower_hex(from),
                    lower_hex(to),
                    value.to_string(),
                ],
            )?;
        }
        TransferRecord::Erc721 {
            tx_hash,
            log_index,
            address,
            from,
            to,
            token_id,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO erc721_transfers (
                    tx_hash, log_index, block_number, contract, from_address, to_address, token_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    lower_hex(tx_hash),
                    log_index,
                    number,
                    lower_hex(address),
                    lower_hex(from),
                    lower_hex(to),
                    token_id.to_string(),
                ],
            )?;
        }
        TransferRecord::Erc1155 {
            tx_hash,
            log_index,
            batch_index,
            address,
            operator,
            from,
            to,
            token_id,
            value,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO erc1155_transfers (
                    tx_hash, log_index, batch_index, block_number, contract, operator,
                    from_address, to_address, token_id, value
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    lower_hex(tx_hash),
                    log_index,
                    batch_index,
                    number,
                    lower_hex(address),
                    lower_hex(operator),
                    lower_hex(from),
                    lower_hex(to),
                    token_id.to_string(),
                    value.to_string(),
                ],
            )?;
        }
    }
    Ok(())
}

fn insert_transactions(conn: &Connection, parsed: &Parsed) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO transactions (
            hash, block_hash, block_number, tx_index, timestamp, from_address, to_address,
            value, nonce, gas, gas_price, input, method_id, status, gas_used,
            cumulative_gas_used, contract_address
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for t in &parsed.txs {
        stmt.execute(rusqlite::params![
            lower_hex(&t.hash),
            lower_hex(&t.block_hash),
            t.block_number,
            t.tx_index,
            t.timestamp,
            lower_hex(&t.from),
            t.to.as_ref().map(lower_hex),
            t.value.to_string(),
            t.nonce,
            t.gas,
            t.gas_price.to_string(),
            hex::encode_prefixed(&t.input),
            t.method_id().as_ref().map(lower_hex),
            t.status,
            t.gas_used,
            t.cumulative_gas_used,
            t.contract_address.as_ref().map(lower_hex),
        ])?;
    }
    Ok(())
}

fn insert_internal_txs(conn: &Connection, parsed: &Parsed) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO internal_txs (
            tx_hash, seq, block_number, depth, op, from_address, to_address, value, gas_limit
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    let mut seq: HashMap<B256, u64> = HashMap::new();
    for itx in &parsed.internal_txs {
        let n = seq.entry(itx.tx_hash).or_default();
        stmt.execute(rusqlite::params![
            lower_hex(&itx.tx_hash),
            *n,
            itx.block_number,
            itx.depth,
            itx.op.as_str(),
            lower_hex(&itx.from),
            lower_hex(&itx.to),
            itx.value.to_string(),
            itx.gas_limit,
        ])?;
        *n += 1;
    }
    Ok(())
}

fn insert_uncles(conn: &Connection, parsed: &Parsed) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO uncles (
            hash, number, included_in, position, parent_hash, miner, timestamp,
            difficulty, gas_limit, gas_used, extra_data, size
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for uncle in &parsed.uncles {
        let h = &uncle.header;
        stmt.execute(rusqlite::params![
            lower_hex(&h.hash),
            h.number,
            uncle.included_in,
            uncle.position,
            lower_hex(&h.parent_hash),
            lower_hex(&h.miner),
            h.timestamp,
            h.difficulty.to_string(),
            h.gas_limit,
            h.gas_used,
            hex::encode_prefixed(&h.extra_data),
            h.size,
        ])?;
    }
    Ok(())
}

fn upsert_accounts(
    conn: &Connection,
    accounts: &[Account],
    number: u64,
    effects: &mut CommitEffects,
) -> Result<()> {
    let mut previous = conn.prepare("SELECT balance FROM accounts WHERE address = ?")?;
    let mut upsert = conn.prepare(
        "INSERT INTO accounts (
            address, balance, nonce, number, first_number, code_hash, snft_value
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(address) DO UPDATE SET
            balance = excluded.balance,
            nonce = excluded.nonce,
            number = excluded.number,
            code_hash = COALESCE(excluded.code_hash, accounts.code_hash),
            snft_value = excluded.snft_value",
    )?;

    let mut delta = I256::ZERO;
    for account in accounts {
        let address = lower_hex(&account.address);
        let old: Option<String> = previous
            .query_row(rusqlite::params![address], |row| row.get(0))
            .optional()?;
        let old = match old {
            Some(balance) => amount::parse_signed(&balance)?,
            None => {
                effects.new_accounts += 1;
                I256::ZERO
            }
        };
        let new = I256::try_from(account.balance)
            .map_err(|_| eyre!("balance of {address} overflows"))?;
        delta = delta.saturating_add(new.saturating_sub(old));

        upsert.execute(rusqlite::params![
            address,
            account.balance.to_string(),
            account.nonce,
            account.number,
            number,
            account.code_hash.as_ref().map(lower_hex),
            account.snft_value.to_string(),
        ])?;
    }
    effects.balance_delta = delta;
    Ok(())
}

fn upsert_contracts(conn: &Connection, accounts: &[Account]) -> Result<()> {
    let mut stmt = conn.prepare(
        "UPDATE accounts SET
            contract_type = ?,
            name = COALESCE(?, name),
            symbol = COALESCE(?, symbol),
            creator = COALESCE(?, creator),
            created_tx = COALESCE(?, created_tx)
        WHERE address = ?",
    )?;
    for account in accounts {
        let Some(kind) = account.kind else {
            continue;
        };
        stmt.execute(rusqlite::params![
            kind.code(),
            account.name,
            account.symbol,
            account.creator.as_ref().map(lower_hex),
            account.created_tx.as_ref().map(lower_hex),
            lower_hex(&account.address),
        ])?;
    }
    Ok(())
}

fn insert_block(conn: &Connection, parsed: &Parsed) -> Result<()> {
    let h = &parsed.block.header;
    let proposers = if parsed.domain.proposers.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&parsed.domain.proposers)?)
    };
    conn.execute(
        "INSERT INTO blocks (
            number, hash, parent_hash, miner, timestamp, difficulty, total_difficulty,
            extra_data, gas_limit, gas_used, mix_hash, nonce, receipts_root, sha3_uncles,
            size, state_root, transactions_root, uncles_count, total_transaction, proposers
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            h.number,
            lower_hex(&h.hash),
            lower_hex(&h.parent_hash),
            lower_hex(&h.miner),
            h.timestamp,
            h.difficulty.to_string(),
            parsed.block.total_difficulty.to_string(),
            hex::encode_prefixed(&h.extra_data),
            h.gas_limit,
            h.gas_used,
            lower_hex(&h.mix_hash),
            format!("{:#018x}", h.nonce),
            lower_hex(&h.receipts_root),
            lower_hex(&h.sha3_uncles),
            h.size,
            lower_hex(&h.state_root),
            lower_hex(&h.transactions_root),
            h.uncles_count,
            parsed.block.total_transaction,
            proposers,
        ],
    )?;
    Ok(())
}

/// Address assigned to the `index`-th user NFT ever minted.
pub fn user_nft_address(index: u64) -> String {
    format!("0x{index:040x}")
}

fn apply_domain(conn: &Connection, parsed: &Parsed, effects: &mut CommitEffects) -> Result<()> {
    let number = parsed.number();
    let timestamp = parsed.block.header.timestamp;
    let domain = &parsed.domain;

    // NFT creations
    let minted: u64 = conn.query_row("SELECT COUNT(*) FROM nfts", [], |row| row.get(0))?;
    let mut assigned = Vec::with_capacity(domain.nfts.len());
    for (i, nft) in domain.nfts.iter().enumerate() {
        let address = user_nft_address(minted + 1 + i as u64);
        conn.execute(
            "INSERT INTO nfts (
                address, royalty_ratio, meta_url, raw_meta_url, exchanger, creator, owner,
                timestamp, block_number, tx_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                address,
                nft.royalty_ratio,
                nft.meta_url,
                nft.raw_meta_url,
                nft.exchanger,
                nft.creator,
                nft.owner,
                nft.timestamp,
                nft.block_number,
                nft.tx_hash,
            ],
        )?;
        assigned.push(address);
    }

    // SNFT rewards
    for (idx, reward) in domain.rewards.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO rewards (block_number, idx, address, identity, snft, amount)
             VALUES (?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                number,
                idx as u64,
                reward.address,
                reward.identity,
                reward.snft,
                reward.amount,
            ],
        )?;
        if let Some(snft) = &reward.snft {
            conn.execute(
                "INSERT OR IGNORE INTO snfts (
                    address, epoch_id, owner, awardee, reward_at, block_number, pieces
                ) VALUES (?, ?, ?, ?, ?, ?, 1)",
                rusqlite::params![
                    snft,
                    epoch_id(snft),
                    reward.address,
                    reward.address,
                    timestamp,
                    number,
                ],
            )?;
        }
    }

    if let Some(epoch) = &domain.epoch {
        insert_epoch(conn, epoch, number)?;
    }

    // NFT transfers, trades and recycles
    let mut fee_ratios: HashMap<String, Option<u32>> = HashMap::new();
    for (seq, nft_tx) in domain.nft_txs.iter().enumerate() {
        let address = match &nft_tx.nft {
            NftRef::Address(address) => address.clone(),
            NftRef::Minted(i) => assigned
                .get(*i)
                .cloned()
                .ok_or_else(|| eyre!("nft tx {} refers to unminted #{i}", nft_tx.tx_hash))?,
        };
        let from = if nft_tx.from.is_empty() {
            current_owner(conn, &address)?.unwrap_or_default()
        } else {
            nft_tx.from.clone()
        };

        let mut recycled = 0u64;
        let mut recycle_value = None;
        let mut fee = None;
        if nft_tx.is_recycle() {
            let pieces = snfts_under(conn, &address)?;
            let mut value = "0".to_string();
            for piece in &pieces {
                value = amount::add(&value, &amount::snft_value(piece, 1))?;
            }
            recycled = conn.execute(
                "DELETE FROM snfts WHERE address = ?1 OR address LIKE ?1 || '%'",
                rusqlite::params![address],
            )? as u64;
            recycle_value = Some(value);
        } else {
            conn.execute(
                "UPDATE nfts SET owner = ?, last_price = ? WHERE address = ?",
                rusqlite::params![nft_tx.to, nft_tx.price, address],
            )?;
            conn.execute(
                "UPDATE snfts SET owner = ?1, last_price = ?2 WHERE address = ?3 OR address LIKE ?3 || '%'",
                rusqlite::params![nft_tx.to, nft_tx.price, address],
            )?;

            if let Some(exchanger) = nft_tx.exchanger.as_deref() {
                if !amount::is_zero(&nft_tx.price) {
                    let ratio = match fee_ratios.get(exchanger) {
                        Some(ratio) => *ratio,
                        None => {
                            let ratio: Option<u32> = conn
                                .query_row(
                                    "SELECT fee_ratio FROM exchangers WHERE address = ?",
                                    rusqlite::params![exchanger],
                                    |row| row.get(0),
                                )
                                .optional()?;
                            fee_ratios.insert(exchanger.to_string(), ratio);
                            ratio
                        }
                    };
                    if let Some(ratio) = ratio {
                        fee = amount::tx_fee(&nft_tx.price, ratio);
                        add_column(conn, "exchangers", "tx_amount", exchanger, &nft_tx.price)?;
                    }
                }
            }
        }

        conn.execute(
            "INSERT OR IGNORE INTO nft_txs (
                tx_hash, seq, tx_type, nft_address, exchanger, from_address, to_address,
                price, fee, recycled, recycle_value, timestamp, block_number
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                nft_tx.tx_hash,
                seq as u64,
                nft_tx.tx_type,
                address,
                nft_tx.exchanger,
                from,
                nft_tx.to,
                nft_tx.price,
                fee,
                recycled,
                recycle_value,
                nft_tx.timestamp,
                nft_tx.block_number,
            ],
        )?;
        effects.recycled += recycled;
    }

    // exchangers
    for change in &domain.exchangers {
        match change {
            ExchangerChange::Open {
                address,
                name,
                url,
                fee_ratio,
                timestamp,
                block_number,
                tx_hash,
                amount: stake,
            } => {
                let current: Option<(String, Option<u64>)> = conn
                    .query_row(
                        "SELECT amount, close_at FROM exchangers WHERE address = ?",
                        rusqlite::params![address],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (total, reopened) = match &current {
                    Some((old, close_at)) => (amount::add(old, stake)?, close_at.is_some()),
                    None => (amount::add("0", stake)?, true),
                };
                if reopened {
                    effects.exchangers_opened += 1;
                }
                conn.execute(
                    "INSERT INTO exchangers (
                        address, name, url, fee_ratio, amount, tx_amount, timestamp,
                        block_number, tx_hash, close_at
                    ) VALUES (?, ?, ?, ?, ?, '0', ?, ?, ?, NULL)
                    ON CONFLICT(address) DO UPDATE SET
                        name = excluded.name,
                        url = excluded.url,
                        fee_ratio = excluded.fee_ratio,
                        amount = excluded.amount,
                        timestamp = excluded.timestamp,
                        tx_hash = excluded.tx_hash,
                        close_at = NULL",
                    rusqlite::params![
                        address,
                        name,
                        url,
                        fee_ratio,
                        total,
                        timestamp,
                        block_number,
                        tx_hash,
                    ],
                )?;
                fee_ratios.remove(address);
            }
            ExchangerChange::Close {
                address,
                block_number,
                ..
            } => {
                effects.exchangers_closed += conn.execute(
                    "UPDATE exchangers SET close_at = ? WHERE address = ? AND close_at IS NULL",
                    rusqlite::params![block_number, address],
                )? as u64;
            }
            ExchangerChange::Pledge {
                address,
                amount: delta,
            } => {
                add_column(conn, "exchangers", "amount", address, delta)?;
            }
        }
    }

    // validators and pledges
    for change in &domain.validators {
        let old: Option<String> = conn
            .query_row(
                "SELECT amount FROM validators WHERE address = ?",
                rusqlite::params![change.address],
                |row| row.get(0),
            )
            .optional()?;
        let total = amount::add(old.as_deref().unwrap_or("0"), &change.amount)?;
        conn.execute(
            "INSERT INTO validators (address, amount, proxy, weight, number)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                amount = excluded.amount,
                proxy = COALESCE(excluded.proxy, validators.proxy),
                weight = COALESCE(excluded.weight, validators.weight),
                number = excluded.number",
            rusqlite::params![change.address, total, change.proxy, change.weight, number],
        )?;
    }
    for pledge in &domain.pledges {
        conn.execute(
            "INSERT OR IGNORE INTO pledges (tx_hash, address, pledge_type, amount, number, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                pledge.tx_hash,
                pledge.address,
                pledge.pledge_type,
                pledge.amount,
                pledge.number,
                pledge.timestamp,
            ],
        )?;
    }

    // SNFT staking and merges
    for pledge in &domain.snft_pledges {
        let pledge_number = pledge.pledge.then_some(number);
        conn.execute(
            "UPDATE snfts SET pledge_number = ?1
             WHERE owner = ?2 AND (address = ?3 OR address LIKE ?3 || '%')",
            rusqlite::params![pledge_number, pledge.owner, pledge.prefix],
        )?;
    }
    for merge in &domain.merges {
        conn.execute(
            "DELETE FROM snfts WHERE address LIKE ?1 || '%' AND length(address) > length(?1)",
            rusqlite::params![merge.address],
        )?;
        conn.execute(
            "INSERT INTO snfts (address, epoch_id, owner, awardee, reward_at, block_number, pieces)
             VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6)
             ON CONFLICT(address) DO UPDATE SET owner = excluded.owner, pieces = excluded.pieces",
            rusqlite::params![
                merge.address,
                epoch_id(&merge.address),
                merge.owner,
                merge.timestamp,
                number,
                merge.pieces,
            ],
        )?;
    }

    for penalty in &domain.penalties {
        conn.execute(
            "INSERT OR IGNORE INTO penalties (block_number, address, weight) VALUES (?, ?, ?)",
            rusqlite::params![number, penalty.address, penalty.weight],
        )?;
    }
    Ok(())
}

fn insert_epoch(conn: &Connection, epoch: &crate::types::Epoch, number: u64) -> Result<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO epochs (
            id, creator, royalty_ratio, dir, exchanger, vote_weight, number,
            start_number, start_time, reward, block_number
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            epoch.id,
            epoch.creator,
            epoch.royalty_ratio,
            epoch.dir,
            epoch.exchanger,
            epoch.vote_weight,
            epoch.number,
            epoch.start_number,
            epoch.start_time,
            epoch.reward,
            number,
        ],
    )?;
    if inserted == 0 {
        return Ok(());
    }

    let mut collection = conn.prepare(
        "INSERT OR IGNORE INTO collections (id, epoch_id, block_number) VALUES (?, ?, ?)",
    )?;
    let mut fnft = conn.prepare(
        "INSERT OR IGNORE INTO fnfts (id, collection_id, epoch_id, meta_url, block_number)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for i in 0..16u8 {
        let collection_id = format!("{}{i:x}", epoch.id);
        collection.execute(rusqlite::params![collection_id, epoch.id, number])?;
        for j in 0..16u8 {
            let id = format!("{collection_id}{j:x}");
            let meta_url = if epoch.dir.is_empty() {
                String::new()
            } else {
                format!("{}{i:x}{j:x}", epoch.dir)
            };
            fnft.execute(rusqlite::params![id, collection_id, epoch.id, meta_url, number])?;
        }
    }
    tracing::info!(epoch = %epoch.id, start = epoch.start_number, "epoch recorded");
    Ok(())
}

/// The 39-char prefix shared by every SNFT of an epoch.
fn epoch_id(snft: &str) -> &str {
    &snft[..snft.len().min(39)]
}

fn current_owner(conn: &Connection, address: &str) -> Result<Option<String>> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT owner FROM nfts WHERE address = ?",
            rusqlite::params![address],
            |row| row.get(0),
        )
        .optional()?;
    if owner.is_some() {
        return Ok(owner);
    }
    Ok(conn
        .query_row(
            "SELECT owner FROM snfts WHERE address = ?1 OR address LIKE ?1 || '%' LIMIT 1",
            rusqlite::params![address],
            |row| row.get(0),
        )
        .optional()?)
}

fn snfts_under(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT address FROM snfts WHERE address = ?1 OR address LIKE ?1 || '%'")?;
    let rows = stmt
        .query_map(rusqlite::params![prefix], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `table.column += delta` for the row keyed by `address`, clamped at zero.
/// Missing rows are created with the delta as their value.
fn add_column(conn: &Connection, table: &str, column: &str, address: &str, delta: &str) -> Result<()> {
    let old: Option<Option<String>> = conn
        .query_row(
            &format!("SELECT {column} FROM {table} WHERE address = ?"),
            rusqlite::params![address],
            |row| row.get(0),
        )
        .optional()?;
    match old {
        Some(old) => {
            let total = amount::add(old.as_deref().unwrap_or("0"), delta)?;
            conn.execute(
                &format!("UPDATE {table} SET {column} = ? WHERE address = ?"),
                rusqlite::params![total, address],
            )?;
        }
        None => {
            let total = amount::add("0", delta)?;
            conn.execute(
                &format!("INSERT INTO {table} (address, {column}) VALUES (?, ?)"),
                rusqlite::params![address, total],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, Header, Log, Nft, NftTx, Reward, Transaction, ValidatorChange};
    use alloy::primitives::Bytes;

    fn hash(n: u8) -> B256 {
        B256::with_last_byte(n)
    }

    fn parsed(number: u64, parent: u8) -> Parsed {
        Parsed {
            block: Block {
                header: Header {
                    number,
                    hash: hash(number as u8),
                    parent_hash: hash(parent),
                    miner: Address::with_last_byte(0x99),
                    timestamp: 1_000 + number * 5,
                    ..Header::default()
                },
                ..Block::default()
            },
            ..Parsed::default()
        }
    }

    fn account(byte: u8, balance: u64, number: u64) -> Account {
        Account {
            address: Address::with_last_byte(byte),
            balance: U256::from(balance),
            nonce: 1,
            number,
            ..Account::default()
        }
    }

    #[test]
    fn migrations_create_tables() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let conn = store.conn.borrow();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("query should prepare");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query_map should succeed")
            .collect::<Result<Vec<_>, _>>()
            .expect("all rows should parse");

        for table in TABLES {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn empty_block_commits_one_row() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();

        let outcome = store
            .commit(&parsed(42, 41), &mut stats)
            .expect("commit should succeed");

        assert!(matches!(outcome, CommitOutcome::Committed(_)));
        assert_eq!(store.count("blocks").expect("count"), 1);
        assert_eq!(store.count("transactions").expect("count"), 0);
        assert_eq!(stats.total_block, 1);
        assert_eq!(store.load_stats().expect("stats persisted"), stats);
    }

    #[test]
    fn recommitting_the_same_block_is_a_no_op() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let block = parsed(1, 0);

        store.commit(&block, &mut stats).expect("first commit");
        let outcome = store.commit(&block, &mut stats).expect("second commit");

        assert_eq!(outcome, CommitOutcome::AlreadyCommitted);
        assert_eq!(stats.total_block, 1);
    }

    #[test]
    fn parent_mismatch_is_reported_without_writing() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        store.commit(&parsed(1, 0), &mut stats).expect("commit 1");

        let outcome = store
            .commit(&parsed(2, 0xee), &mut stats)
            .expect("mismatch is not an error");

        assert_eq!(
            outcome,
            CommitOutcome::ParentMismatch {
                head: 1,
                stored: hash(1)
            }
        );
        assert_eq!(store.count("blocks").expect("count"), 1);
    }

    #[test]
    fn gaps_are_rejected() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        store.commit(&parsed(1, 0), &mut stats).expect("commit 1");

        assert!(store.commit(&parsed(3, 2), &mut stats).is_err());
    }

    #[test]
    fn transfers_need_a_matching_contract_kind() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let token = Address::with_last_byte(0x20);
        let nft = Address::with_last_byte(0x21);

        let mut block = parsed(1, 0);
        block.accounts = vec![
            Account {
                kind: Some(ContractKind::Erc20),
                ..account(0x20, 0, 1)
            },
            Account {
                kind: Some(ContractKind::Erc20),
                ..account(0x21, 0, 1)
            },
        ];
        block.logs = vec![Log {
            block_number: 1,
            tx_hash: hash(0xaa),
            index: 0,
            address: token,
            topics: vec![],
            data: Bytes::new(),
            removed: false,
        }];
        block.transfers = vec![
            TransferRecord::Erc20 {
                tx_hash: hash(0xaa),
                log_index: 0,
                address: token,
                from: Address::with_last_byte(1),
                to: Address::with_last_byte(2),
                value: U256::from(5),
            },
            TransferRecord::Erc721 {
                tx_hash: hash(0xaa),
                log_index: 1,
                address: nft,
                from: Address::with_last_byte(1),
                to: Address::with_last_byte(2),
                token_id: U256::from(9),
            },
        ];
        store.commit(&block, &mut stats).expect("commit");

        assert_eq!(store.count("logs").expect("count"), 1);
        assert_eq!(store.count("erc20_transfers").expect("count"), 1);
        assert_eq!(store.count("erc721_transfers").expect("count"), 0);
    }

    #[test]
    fn lazy_mint_then_trade_moves_ownership() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let mut block = parsed(1, 0);
        block.domain.nfts = vec![Nft {
            royalty_ratio: 200,
            meta_url: "ipfs://meta".into(),
            raw_meta_url: "ipfs://meta".into(),
            exchanger: String::new(),
            creator: "0xcreator".into(),
            owner: "0xcreator".into(),
            timestamp: 1_005,
            block_number: 1,
            tx_hash: "0xt".into(),
        }];
        block.domain.nft_txs = vec![NftTx {
            tx_type: 4,
            nft: NftRef::Minted(0),
            exchanger: None,
            from: "0xcreator".into(),
            to: "0xbuyer".into(),
            price: "1000".into(),
            timestamp: 1_005,
            block_number: 1,
            tx_hash: "0xt".into(),
        }];
        store.commit(&block, &mut stats).expect("commit");

        let nft = store
            .nft(&user_nft_address(1))
            .expect("query")
            .expect("nft minted at the first sequential address");
        assert_eq!(nft.creator, "0xcreator");
        assert_eq!(nft.owner, "0xbuyer");
        assert_eq!(nft.last_price.as_deref(), Some("1000"));
        assert_eq!(stats.total_nft, 1);
        assert_eq!(stats.total_nft_tx, 1);
    }

    #[test]
    fn exchanger_trades_accrue_tx_amount() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let mut block = parsed(1, 0);
        block.domain.exchangers = vec![ExchangerChange::Open {
            address: "0xex".into(),
            name: "market".into(),
            url: "https://market".into(),
            fee_ratio: 250,
            timestamp: 1_005,
            block_number: 1,
            tx_hash: "0xo".into(),
            amount: "100".into(),
        }];
        store.commit(&block, &mut stats).expect("commit 1");

        let mut block = parsed(2, 1);
        block.domain.nft_txs = vec![NftTx {
            tx_type: 3,
            nft: NftRef::Address("0xnft".into()),
            exchanger: Some("0xex".into()),
            from: "0xa".into(),
            to: "0xb".into(),
            price: "10000".into(),
            timestamp: 1_010,
            block_number: 2,
            tx_hash: "0xt".into(),
        }];
        store.commit(&block, &mut stats).expect("commit 2");

        let exchanger = store.exchanger("0xex").expect("query").expect("opened");
        assert_eq!(exchanger.amount, "100");
        assert_eq!(exchanger.tx_amount, "10000");
        assert_eq!(stats.total_exchanger, 1);
    }

    #[test]
    fn validator_pledges_never_go_negative() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let mut block = parsed(1, 0);
        block.domain.validators = vec![
            ValidatorChange {
                address: "0xv".into(),
                amount: "70".into(),
                proxy: Some("0xp".into()),
                weight: None,
            },
            ValidatorChange {
                address: "0xv".into(),
                amount: "-100".into(),
                proxy: None,
                weight: Some(10),
            },
        ];
        store.commit(&block, &mut stats).expect("commit");

        assert_eq!(store.validator_amount("0xv").expect("query").as_deref(), Some("0"));
    }

    #[test]
    fn recycle_deletes_snfts_and_records_value() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let snft = format!("0x8{}", "0".repeat(39));

        let mut block = parsed(1, 0);
        block.domain.rewards = vec![Reward {
            address: "0xminer".into(),
            identity: 2,
            block_number: 1,
            snft: Some(snft.clone()),
            amount: None,
        }];
        store.commit(&block, &mut stats).expect("commit 1");
        assert_eq!(store.snft_owner(&snft).expect("query").as_deref(), Some("0xminer"));

        let mut block = parsed(2, 1);
        block.domain.nft_txs = vec![NftTx {
            tx_type: 11,
            nft: NftRef::Address(snft.clone()),
            exchanger: None,
            from: "0xminer".into(),
            to: String::new(),
            price: "0".into(),
            timestamp: 1_010,
            block_number: 2,
            tx_hash: "0xr".into(),
        }];
        store.commit(&block, &mut stats).expect("commit 2");

        assert_eq!(store.snft_owner(&snft).expect("query"), None);
        assert_eq!(stats.total_recycle, 1);
        assert_eq!(stats.total_snft, 0);
        let conn = store.conn.borrow();
        let value: String = conn
            .query_row("SELECT recycle_value FROM nft_txs", [], |row| row.get(0))
            .expect("recycle row");
        assert_eq!(value, amount::snft_value(&snft, 1));
    }

    #[test]
    fn balance_sum_follows_account_deltas() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();

        let mut block = parsed(0, 0);
        block.accounts = vec![account(1, 1_000, 0), account(2, 500, 0)];
        store.commit(&block, &mut stats).expect("genesis");

        let mut block = parsed(1, 0);
        block.accounts = vec![account(1, 800, 1), account(3, 150, 1)];
        store.commit(&block, &mut stats).expect("block 1");

        assert_eq!(stats.genesis_balance, "1500");
        assert_eq!(stats.total_balance, "1450");
        assert_eq!(stats.total_account, 3);
        assert_eq!(stats.top_accounts[0].balance, "800");
    }

    #[test]
    fn set_head_rewinds_rows_accounts_and_stats() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();

        let mut block = parsed(0, 0);
        block.accounts = vec![account(1, 1_000, 0)];
        store.commit(&block, &mut stats).expect("genesis");

        let mut block = parsed(1, 0);
        block.accounts = vec![account(1, 400, 1), account(2, 600, 1)];
        block.txs = vec![Transaction {
            hash: hash(0x10),
            block_hash: hash(1),
            block_number: 1,
            timestamp: 1_005,
            from: Address::with_last_byte(1),
            to: Some(Address::with_last_byte(2)),
            input: Bytes::new(),
            value: U256::from(600),
            nonce: 0,
            gas: 21_000,
            gas_price: U256::from(1),
            status: Some(1),
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            contract_address: None,
            tx_index: 0,
        }];
        block.block.total_transaction = 1;
        store.commit(&block, &mut stats).expect("block 1");

        assert_eq!(
            store.accounts_above(0).expect("query"),
            vec![Address::with_last_byte(1)]
        );

        let stats = store
            .set_head(0, &[account(1, 1_000, 0)])
            .expect("rewind should succeed");

        assert_eq!(store.head().expect("head"), Some((0, hash(0))));
        assert_eq!(store.count("transactions").expect("count"), 0);
        assert_eq!(store.account(&Address::with_last_byte(2)).expect("query"), None);
        let survivor = store
            .account(&Address::with_last_byte(1))
            .expect("query")
            .expect("genesis account survives");
        assert_eq!(survivor.balance, "1000");
        assert_eq!(stats.total_block, 1);
        assert_eq!(stats.total_transaction, 0);
        assert_eq!(stats.total_balance, "1000");
        assert_eq!(stats.genesis_balance, "1000");
    }

    #[test]
    fn recount_matches_incremental_stats() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let mut stats = Stats::default();
        let mut block = parsed(0, 0);
        block.accounts = vec![account(1, 10, 0), account(2, 20, 0)];
        store.commit(&block, &mut stats).expect("genesis");
        let mut block = parsed(1, 0);
        block.accounts = vec![account(2, 5, 1)];
        store.commit(&block, &mut stats).expect("block 1");

        let recounted = store.recount_stats(&stats).expect("recount");
        assert_eq!(recounted.total_block, stats.total_block);
        assert_eq!(recounted.total_balance, stats.total_balance);
        assert_eq!(recounted.total_account, stats.total_account);
        assert_eq!(recounted.avg_block_time_ms, stats.avg_block_time_ms);
        assert_eq!(recounted.top_accounts, stats.top_accounts);
    }

    #[test]
    fn reset_drops_existing_rows() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("scan.sqlite");
        let path = path.to_str().expect("utf-8 path");
        {
            let store = Store::new(path).expect("open");
            let mut stats = Stats::default();
            store.commit(&parsed(0, 0), &mut stats).expect("commit");
        }

        let store = Store::open(path, true).expect("reopen with reset");
        assert_eq!(store.count("blocks").expect("count"), 0);
        assert_eq!(store.head().expect("head"), None);
    }
}
