//! Token transfer extraction from event logs.
//!
//! ERC-20 and ERC-721 share the `Transfer(address,address,uint256)` selector;
//! they are told apart by topic count and data length. ERC-1155 has its own
//! single and batch events. Anything that does not match the expected shape
//! exactly is ignored.

use alloy::primitives::{b256, Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;

use crate::types::{Log, TransferRecord};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
    event TransferSingle(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256 id,
        uint256 value
    );
    event TransferBatch(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256[] ids,
        uint256[] values
    );
}

/// Shared by ERC-20 and ERC-721.
pub const TRANSFER_TOPIC0: B256 = Transfer::SIGNATURE_HASH;
pub const TRANSFER_SINGLE_TOPIC0: B256 = TransferSingle::SIGNATURE_HASH;
pub const TRANSFER_BATCH_TOPIC0: B256 = TransferBatch::SIGNATURE_HASH;

/// Legacy selectors some Wormholes-era contracts emit for the 1155 events.
pub const LEGACY_TRANSFER_SINGLE_TOPIC0: B256 =
    b256!("7b912cc6629daab379d004780e875cdb7625e8331d3a7c8fbe08a42156325546");
pub const LEGACY_TRANSFER_BATCH_TOPIC0: B256 =
    b256!("20114eb39ee5dfdb13684c7d9e951052ef22c89bff67131a9bf08879189b0f71");

const WORD: usize = 32;

/// Low 20 bytes of an indexed address topic.
pub fn topic_address(topic: &B256) -> Address {
    Address::from_word(*topic)
}

fn word_at(data: &[u8], index: usize) -> Option<U256> {
    let start = index.checked_mul(WORD)?;
    data.get(start..start + WORD).map(U256::from_be_slice)
}

/// Unpacks every transfer record carried by `log`.
///
/// Returns an empty vector for logs that are not transfers or are malformed.
pub fn unpack_transfer_log(log: &Log) -> Vec<TransferRecord> {
    let Some(topic0) = log.topics.first() else {
        return Vec::new();
    };

    if *topic0 == TRANSFER_TOPIC0 {
        return unpack_transfer(log).into_iter().collect();
    }
    if *topic0 == TRANSFER_SINGLE_TOPIC0 || *topic0 == LEGACY_TRANSFER_SINGLE_TOPIC0 {
        return unpack_1155_single(log).into_iter().collect();
    }
    if *topic0 == TRANSFER_BATCH_TOPIC0 || *topic0 == LEGACY_TRANSFER_BATCH_TOPIC0 {
        return unpack_1155_batch(log).unwrap_or_default();
    }
    Vec::new()
}

fn unpack_transfer(log: &Log) -> Option<TransferRecord> {
    match (log.topics.len(), log.data.len()) {
        (3, WORD) => Some(TransferRecord::Erc20 {
            tx_hash: log.tx_hash,
            log_index: log.index,
            address: log.address,
            from: topic_address(&log.topics[1]),
            to: topic_address(&log.topics[2]),
            value: U256::from_be_slice(&log.data),
        }),
        (4, 0) => Some(TransferRecord::Erc721 {
            tx_hash: log.tx_hash,
            log_index: log.index,
            address: log.address,
            from: topic_address(&log.topics[1]),
            to: topic_address(&log.topics[2]),
            token_id: U256::from_be_bytes(log.topics[3].0),
        }),
        _ => None,
    }
}

fn unpack_1155_single(log: &Log) -> Option<TransferRecord> {
    if log.topics.len() != 4 || log.data.len() != 2 * WORD {
        return None;
    }
    Some(TransferRecord::Erc1155 {
        tx_hash: log.tx_hash,
        log_index: log.index,
        batch_index: 0,
        address: log.address,
        operator: topic_address(&log.topics[1]),
        from: topic_address(&log.topics[2]),
        to: topic_address(&log.topics[3]),
        token_id: word_at(&log.data, 0)?,
        value: word_at(&log.data, 1)?,
    })
}

/// `(uint256[] ids, uint256[] values)` laid out as
/// `[0x40, offset_values, n, ids.., n, values..]`.
fn unpack_1155_batch(log: &Log) -> Option<Vec<TransferRecord>> {
    if log.topics.len() != 4 || log.data.len() % WORD != 0 {
        return None;
    }
    let words = log.data.len() / WORD;
    if words < 4 || words % 2 != 0 {
        return None;
    }
    if word_at(&log.data, 0)? != U256::from(0x40) {
        return None;
    }

    let count = (words - 4) / 2;
    let count_word = U256::from(count);
    if word_at(&log.data, 2)? != count_word || word_at(&log.data, count + 3)? != count_word {
        return None;
    }

    let operator = topic_address(&log.topics[1]);
    let from = topic_address(&log.topics[2]);
    let to = topic_address(&log.topics[3]);

    (0..count)
        .map(|i| {
            Some(TransferRecord::Erc1155 {
                tx_hash: log.tx_hash,
                log_index: log.index,
                batch_index: i as u64,
                address: log.address,
                operator,
                from,
                to,
                token_id: word_at(&log.data, i + 3)?,
                value: word_at(&log.data, count + i + 4)?,
            })
        })
        .collect()
}
