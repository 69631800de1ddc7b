//! Wormholes/Erbie domain decoding.
//!
//! Two sources feed the domain tables:
//! - the chain extensions (`eth_getBlockBeneficiaryAddressByNumber`,
//!   `eth_getCurrentNFTInfo`, `eth_getValidators`, ...), queried per block;
//! - transactions whose input is `wormholes:` / `erbie:` followed by a JSON
//!   command, decoded without touching the node.
//!
//! Everything produced here lands in a [`DomainDelta`]; the store applies it.

use alloy::primitives::{b256, hex, Address, B256};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::amount::{de_decimal, de_opt_decimal, is_zero, negate};
use crate::error::DecodeError;
use crate::node::{hex_quantity, Node, Request};
use crate::signature::recover_signer;
use crate::types::{
    lower_hex, Account, DomainDelta, Epoch, ExchangerChange, Header, Log, Nft, NftRef, NftTx,
    Penalty, Pledge, Reward, SnftMerge, SnftPledge, Transaction, ValidatorChange,
};

pub const WORMHOLES_PREFIX: &[u8] = b"wormholes:";
pub const ERBIE_PREFIX: &[u8] = b"erbie:";

/// Beneficiary slots per block: 6 validators, 1 producer, 4 exchangers.
pub const MAX_REWARDS: usize = 11;

/// Blocks searched backwards for the start of a new epoch.
pub const EPOCH_LOOKBACK: u64 = 64;

/// Account holding the SNFT reward pool.
pub const REWARD_POOL: &str = "0xffffffffffffffffffffffffffffffffffffffff";

/// `SNFTMerged`-style event emitted when pieces combine into a higher level.
pub const MERGE_TOPIC0: B256 =
    b256!("77415a68a0d28daf11e1308e53371f573e0920810c9cd9de7904777d5fb9d625");

const BENEFICIARY_METHOD: &str = "eth_getBlockBeneficiaryAddressByNumber";
const BENEFICIARY_METHOD_NEW: &str = "eth_getBlockBeneficiaryAddressByNumberNew";

/// `nft_txs.tx_type` codes.
pub mod nft_tx_type {
    pub const TRANSFER: u8 = 1;
    pub const BID: u8 = 2;
    pub const FIXED_PRICE: u8 = 3;
    pub const LAZY_FIXED_PRICE: u8 = 4;
    pub const LAZY_FIXED_PRICE_BY_EXCHANGER: u8 = 5;
    pub const AUTHORIZED_BID: u8 = 6;
    pub const LAZY_AUTHORIZED_BID: u8 = 7;
    pub const MATCH: u8 = 8;
    pub const FORCED_BUY: u8 = 9;
    pub const FORCED_BUY_FROM_POOL: u8 = 10;
    pub const RECYCLE: u8 = 11;
}

/// Returns the JSON body of a domain transaction input, if it carries one.
pub fn domain_payload(input: &[u8]) -> Option<&[u8]> {
    input
        .strip_prefix(WORMHOLES_PREFIX)
        .or_else(|| input.strip_prefix(ERBIE_PREFIX))
}

/// Order signed by a buyer or a fixed-price seller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Order {
    pub price: String,
    pub nft_address: String,
    pub exchanger: String,
    pub block_number: String,
    pub seller: String,
    pub sig: String,
}

/// Creator-signed offer for an NFT that is minted by the sale itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LazyMint {
    pub price: String,
    /// Hex basis points, `0x`-prefixed.
    pub royalty: String,
    pub meta_url: String,
    pub exclusive_flag: String,
    pub exchanger: String,
    pub block_number: String,
    pub sig: String,
}

impl LazyMint {
    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.price,
            self.royalty,
            self.meta_url,
            self.exclusive_flag,
            self.exchanger,
            self.block_number
        )
    }
}

/// Exchanger owner's authorisation of a delegate sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangerAuth {
    pub exchanger_owner: String,
    pub to: String,
    pub block_number: String,
    pub sig: String,
}

impl ExchangerAuth {
    pub fn signed_message(&self) -> String {
        format!("{}{}{}", self.exchanger_owner, self.to, self.block_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MintBody {
    pub royalty: u32,
    pub meta_url: String,
    pub exchanger: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangerBody {
    pub name: String,
    pub url: String,
    pub fee_rate: u32,
}

/// Domain command carried by a transaction, one variant per `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// 0
    Mint(MintBody),
    /// 1
    Transfer { nft_address: String },
    /// 6
    Recycle { nft_address: String },
    /// 7 / 8
    SnftPledge { nft_address: String, pledge: bool },
    /// 9 / 10
    ValidatorPledge { proxy_address: String, unpledge: bool },
    /// 11
    OpenExchanger(ExchangerBody),
    /// 12
    CloseExchanger,
    /// 14
    Bid(Order),
    /// 15
    FixedPrice(Order),
    /// 16
    LazyFixedPrice(LazyMint),
    /// 17
    LazyFixedPriceByExchanger(LazyMint),
    /// 18
    AuthorizedBid { buyer: Order, auth: ExchangerAuth },
    /// 19
    LazyAuthorizedBid { seller: LazyMint, auth: ExchangerAuth },
    /// 20
    Match(Order),
    /// 21 / 22
    ExchangerPledge { unpledge: bool },
    /// 27
    ForcedBuy(Order),
    /// 28
    ForcedBuyFromPool(Order),
    /// 31
    BindProxy { proxy_address: String },
}

fn section<T: DeserializeOwned + Default>(value: &Value, name: &str) -> Result<T, String> {
    match value.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("`{name}`: {e}")),
    }
}

fn whole<T: DeserializeOwned>(value: &Value) -> Result<T, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

fn text(value: &Value, name: &str) -> String {
    value
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Payload {
    /// Parses the JSON body. `Ok(None)` for types without side effects here.
    ///
    /// # Errors
    /// Returns a reason if the body is not JSON or a consumed field has the
    /// wrong shape.
    pub fn parse(body: &[u8]) -> Result<Option<Self>, String> {
        let value: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing numeric `type`".to_string())?;

        let payload = match kind {
            0 => Payload::Mint(whole(&value)?),
            1 => Payload::Transfer {
                nft_address: text(&value, "nft_address"),
            },
            6 => Payload::Recycle {
                nft_address: text(&value, "nft_address"),
            },
            7 | 8 => Payload::SnftPledge {
                nft_address: text(&value, "nft_address"),
                pledge: kind == 7,
            },
            9 | 10 => Payload::ValidatorPledge {
                proxy_address: text(&value, "proxy_address"),
                unpledge: kind == 10,
            },
            11 => Payload::OpenExchanger(whole(&value)?),
            12 => Payload::CloseExchanger,
            14 => Payload::Bid(section(&value, "buyer")?),
            15 => Payload::FixedPrice(section(&value, "seller1")?),
            16 => Payload::LazyFixedPrice(section(&value, "seller2")?),
            17 => Payload::LazyFixedPriceByExchanger(section(&value, "seller2")?),
            18 => Payload::AuthorizedBid {
                buyer: section(&value, "buyer")?,
                auth: section(&value, "exchanger_auth")?,
            },
            19 => Payload::LazyAuthorizedBid {
                seller: section(&value, "seller2")?,
                auth: section(&value, "exchanger_auth")?,
            },
            20 => Payload::Match(section(&value, "buyer")?),
            21 | 22 => Payload::ExchangerPledge {
                unpledge: kind == 22,
            },
            27 => Payload::ForcedBuy(section(&value, "buyer")?),
            28 => Payload::ForcedBuyFromPool(section(&value, "buyer")?),
            31 => Payload::BindProxy {
                proxy_address: text(&value, "proxy_address"),
            },
            _ => return Ok(None),
        };
        Ok(Some(payload))
    }
}

/// Decodes the `meta` field of a hex-encoded JSON document. Empty on any
/// failure.
pub fn real_meta_url(raw: &str) -> String {
    #[derive(Deserialize)]
    struct Meta {
        #[serde(default)]
        meta: String,
    }

    hex::decode(raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Meta>(&bytes).ok())
        .map(|m| m.meta)
        .unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn is_bindable_proxy(proxy: &str) -> bool {
    proxy.len() == 42 && proxy != lower_hex(&Address::ZERO)
}

/// Per-transaction values shared by every payload variant.
struct TxContext {
    tx_hash: String,
    from: String,
    to: String,
    value: String,
    number: u64,
    timestamp: u64,
}

impl TxContext {
    fn recover(&self, message: &str, sig: &str) -> Result<String, DecodeError> {
        recover_signer(message, sig).map_err(|e| DecodeError::InvalidSignature {
            tx_hash: self.tx_hash.clone(),
            reason: e.to_string(),
        })
    }

    fn royalty(&self, raw: &str) -> Result<u32, DecodeError> {
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        u32::from_str_radix(digits, 16).map_err(|e| DecodeError::MalformedPayload {
            tx_hash: self.tx_hash.clone(),
            reason: format!("royalty `{raw}`: {e}"),
        })
    }

    fn nft_tx(&self, tx_type: u8, nft: NftRef, exchanger: Option<String>) -> NftTx {
        NftTx {
            tx_type,
            nft,
            exchanger,
            from: String::new(),
            to: self.to.clone(),
            price: self.value.clone(),
            timestamp: self.timestamp,
            block_number: self.number,
            tx_hash: self.tx_hash.clone(),
        }
    }

    fn lazy_nft(&self, offer: &LazyMint, creator: &str, exchanger: String) -> Result<Nft, DecodeError> {
        Ok(Nft {
            royalty_ratio: self.royalty(&offer.royalty)?,
            meta_url: real_meta_url(&offer.meta_url),
            raw_meta_url: offer.meta_url.clone(),
            exchanger,
            creator: creator.to_string(),
            owner: creator.to_string(),
            timestamp: self.timestamp,
            block_number: self.number,
            tx_hash: self.tx_hash.clone(),
        })
    }
}

fn existing(address: &str) -> NftRef {
    NftRef::Address(address.to_lowercase())
}

/// Decodes one transaction's domain command into `delta`.
///
/// Transactions without the marker prefix, failed transactions and unknown
/// command types leave `delta` untouched.
///
/// # Errors
/// Returns [`DecodeError::InvalidSignature`] or
/// [`DecodeError::MalformedPayload`]; the enclosing block must fail.
pub fn decode_domain_tx(
    tx: &Transaction,
    header: &Header,
    delta: &mut DomainDelta,
) -> Result<(), DecodeError> {
    let Some(body) = domain_payload(&tx.input) else {
        return Ok(());
    };
    if !tx.succeeded() {
        return Ok(());
    }

    let tx_hash = lower_hex(&tx.hash);
    let payload = match Payload::parse(body) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            tracing::debug!(tx_hash = %tx_hash, "domain command without indexed effects");
            return Ok(());
        }
        Err(reason) => return Err(DecodeError::MalformedPayload { tx_hash, reason }),
    };

    let ctx = TxContext {
        tx_hash,
        from: lower_hex(&tx.from),
        to: lower_hex(&tx.effective_to().unwrap_or(Address::ZERO)),
        value: tx.value.to_string(),
        number: header.number,
        timestamp: header.timestamp,
    };
    apply(payload, &ctx, delta)
}

fn apply(payload: Payload, ctx: &TxContext, delta: &mut DomainDelta) -> Result<(), DecodeError> {
    use nft_tx_type::*;

    match payload {
        Payload::Mint(body) => delta.nfts.push(Nft {
            royalty_ratio: body.royalty,
            meta_url: real_meta_url(&body.meta_url),
            raw_meta_url: body.meta_url,
            exchanger: body.exchanger.to_lowercase(),
            creator: ctx.to.clone(),
            owner: ctx.to.clone(),
            timestamp: ctx.timestamp,
            block_number: ctx.number,
            tx_hash: ctx.tx_hash.clone(),
        }),
        Payload::Transfer { nft_address } => {
            delta
                .nft_txs
                .push(ctx.nft_tx(TRANSFER, existing(&nft_address), None));
        }
        Payload::Recycle { nft_address } => {
            let mut tx = ctx.nft_tx(RECYCLE, existing(&nft_address), None);
            tx.from = ctx.from.clone();
            tx.to = String::new();
            // replaced by the SNFT value at commit
            tx.price = "0".to_string();
            delta.nft_txs.push(tx);
        }
        Payload::SnftPledge { nft_address, pledge } => delta.snft_pledges.push(SnftPledge {
            owner: ctx.from.clone(),
            prefix: nft_address.to_lowercase(),
            pledge,
        }),
        Payload::ValidatorPledge {
            proxy_address,
            unpledge,
        } => {
            let proxy = proxy_address.to_lowercase();
            delta.validators.push(ValidatorChange {
                address: ctx.from.clone(),
                amount: if unpledge {
                    negate(&ctx.value)
                } else {
                    ctx.value.clone()
                },
                proxy: is_bindable_proxy(&proxy).then_some(proxy),
                weight: None,
            });
            delta.pledges.push(Pledge {
                address: ctx.from.clone(),
                pledge_type: if unpledge { 10 } else { 9 },
                amount: ctx.value.clone(),
                number: ctx.number,
                timestamp: ctx.timestamp,
                tx_hash: ctx.tx_hash.clone(),
            });
        }
        Payload::OpenExchanger(body) => delta.exchangers.push(ExchangerChange::Open {
            address: ctx.from.clone(),
            name: body.name,
            url: body.url,
            fee_ratio: body.fee_rate,
            timestamp: ctx.timestamp,
            block_number: ctx.number,
            tx_hash: ctx.tx_hash.clone(),
            amount: ctx.value.clone(),
        }),
        Payload::CloseExchanger => delta.exchangers.push(ExchangerChange::Close {
            address: ctx.from.clone(),
            timestamp: ctx.timestamp,
            block_number: ctx.number,
        }),
        Payload::Bid(buyer) => delta.nft_txs.push(ctx.nft_tx(
            BID,
            existing(&buyer.nft_address),
            non_empty(buyer.exchanger.to_lowercase()),
        )),
        Payload::FixedPrice(seller) => {
            let mut tx = ctx.nft_tx(
                FIXED_PRICE,
                existing(&seller.nft_address),
                non_empty(seller.exchanger.to_lowercase()),
            );
            // the sender is the buyer
            tx.to = ctx.from.clone();
            delta.nft_txs.push(tx);
        }
        Payload::LazyFixedPrice(offer) => {
            let creator = ctx.recover(&offer.signed_message(), &offer.sig)?;
            let exchanger = offer.exchanger.to_lowercase();
            let nft = ctx.lazy_nft(&offer, &creator, exchanger.clone())?;
            let index = delta.nfts.len();
            delta.nfts.push(nft);

            let mut tx = ctx.nft_tx(LAZY_FIXED_PRICE, NftRef::Minted(index), non_empty(exchanger));
            tx.from = creator;
            tx.to = ctx.from.clone();
            delta.nft_txs.push(tx);
        }
        Payload::LazyFixedPriceByExchanger(offer) => {
            let creator = ctx.recover(&offer.signed_message(), &offer.sig)?;
            let nft = ctx.lazy_nft(&offer, &creator, ctx.from.clone())?;
            let index = delta.nfts.len();
            delta.nfts.push(nft);

            let mut tx = ctx.nft_tx(
                LAZY_FIXED_PRICE_BY_EXCHANGER,
                NftRef::Minted(index),
                Some(ctx.from.clone()),
            );
            tx.from = creator;
            delta.nft_txs.push(tx);
        }
        Payload::AuthorizedBid { buyer, auth } => {
            let exchanger = ctx.recover(&auth.signed_message(), &auth.sig)?;
            delta.nft_txs.push(ctx.nft_tx(
                AUTHORIZED_BID,
                existing(&buyer.nft_address),
                Some(exchanger),
            ));
        }
        Payload::LazyAuthorizedBid { seller, auth } => {
            let creator = ctx.recover(&seller.signed_message(), &seller.sig)?;
            let exchanger = ctx.recover(&auth.signed_message(), &auth.sig)?;
            let nft = ctx.lazy_nft(&seller, &creator, exchanger.clone())?;
            let index = delta.nfts.len();
            delta.nfts.push(nft);

            let mut tx = ctx.nft_tx(LAZY_AUTHORIZED_BID, NftRef::Minted(index), Some(exchanger));
            tx.from = creator;
            delta.nft_txs.push(tx);
        }
        Payload::Match(buyer) => delta.nft_txs.push(ctx.nft_tx(
            MATCH,
            existing(&buyer.nft_address),
            Some(ctx.from.clone()),
        )),
        Payload::ExchangerPledge { unpledge } => delta.exchangers.push(ExchangerChange::Pledge {
            address: ctx.from.clone(),
            amount: if unpledge {
                negate(&ctx.value)
            } else {
                ctx.value.clone()
            },
        }),
        Payload::ForcedBuy(buyer) => {
            let mut tx = ctx.nft_tx(
                FORCED_BUY,
                existing(&buyer.nft_address),
                non_empty(buyer.exchanger.to_lowercase()),
            );
            tx.from = buyer.seller.to_lowercase();
            delta.nft_txs.push(tx);
        }
        Payload::ForcedBuyFromPool(buyer) => {
            let mut tx = ctx.nft_tx(
                FORCED_BUY_FROM_POOL,
                existing(&buyer.nft_address),
                non_empty(buyer.exchanger.to_lowercase()),
            );
            tx.from = lower_hex(&Address::ZERO);
            tx.price = "0".to_string();
            delta.nft_txs.push(tx);
        }
        Payload::BindProxy { proxy_address } => delta.validators.push(ValidatorChange {
            address: ctx.from.clone(),
            amount: "0".to_string(),
            proxy: Some(proxy_address.to_lowercase()),
            weight: None,
        }),
    }
    Ok(())
}

/// `eth_getAccountInfo` response; only the fields the indexer reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "Nonce", default)]
    pub nonce: u64,
    #[serde(rename = "Balance", default, deserialize_with = "de_decimal")]
    pub balance: String,
    #[serde(rename = "Worm", default)]
    pub worm: Option<WormState>,
    #[serde(rename = "Nft", default)]
    pub nft: Option<SnftState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WormState {
    #[serde(rename = "ExchangerBalance", default, deserialize_with = "de_decimal")]
    pub exchanger_balance: String,
    #[serde(rename = "FeeRate", default)]
    pub fee_rate: u32,
    #[serde(rename = "ExchangerName", default)]
    pub exchanger_name: String,
    #[serde(rename = "ExchangerURL", default)]
    pub exchanger_url: String,
    #[serde(rename = "VoteWeight", default, deserialize_with = "de_decimal")]
    pub vote_weight: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnftState {
    #[serde(rename = "MergeLevel", default)]
    pub merge_level: u64,
    #[serde(rename = "MergeNumber", default)]
    pub merge_number: u64,
    #[serde(rename = "Owner", default)]
    pub owner: String,
}

#[derive(Debug, Deserialize)]
struct Beneficiary {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "NftAddress", default)]
    nft_address: Option<String>,
    #[serde(rename = "RewardAmount", default, deserialize_with = "de_opt_decimal")]
    reward_amount: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EpochInfo {
    #[serde(rename = "start_Index", default)]
    start_index: i64,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    royalty: u32,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(default)]
    creator: String,
    #[serde(default, deserialize_with = "de_decimal")]
    vote_weight: String,
}

#[derive(Debug, Deserialize)]
struct OnlineWeight {
    #[serde(alias = "Address")]
    address: String,
    #[serde(alias = "Value")]
    value: i64,
}

#[derive(Debug, Deserialize)]
struct Participant {
    #[serde(rename = "Address", alias = "address")]
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct ValidatorRegistry {
    #[serde(rename = "Validators", default)]
    validators: Vec<RegisteredValidator>,
}

#[derive(Debug, Deserialize)]
struct RegisteredValidator {
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "Balance", default, deserialize_with = "de_decimal")]
    balance: String,
    #[serde(rename = "Proxy", default)]
    proxy: String,
}

/// Beneficiary position to identity: 1 producer, 2 validator, 3 exchanger.
pub fn reward_identity(index: usize) -> u8 {
    match index {
        6 => 1,
        7..=10 => 3,
        _ => 2,
    }
}

/// True for the first SNFT of an epoch (low 12 bits zero).
pub fn is_epoch_start(snft: &str) -> bool {
    snft.len() == 42 && snft.ends_with("000")
}

/// Beneficiaries of block `header.number`, plus the epoch they open.
///
/// # Errors
/// Returns [`DecodeError::TooManyRewards`] for more than 11 entries, or the
/// RPC failure.
#[tracing::instrument(skip_all, fields(block_number = header.number))]
pub async fn decode_rewards(
    node: &Node,
    header: &Header,
    delta: &mut DomainDelta,
) -> Result<(), DecodeError> {
    let number = hex_quantity(header.number);
    let params = json!([number, true]);
    let entries: Option<Vec<Beneficiary>> =
        match node.call(BENEFICIARY_METHOD, params.clone()).await {
            Err(e) if e.is_method_missing() => node.call(BENEFICIARY_METHOD_NEW, params).await?,
            other => other?,
        };
    let entries = entries.unwrap_or_default();
    if entries.len() > MAX_REWARDS {
        return Err(DecodeError::TooManyRewards(entries.len()));
    }

    for (index, entry) in entries.into_iter().enumerate() {
        let mut reward = Reward {
            address: entry.address.to_lowercase(),
            identity: reward_identity(index),
            block_number: header.number,
            snft: None,
            amount: None,
        };
        if let Some(amount) = entry.reward_amount {
            reward.amount = Some(amount);
        } else {
            let snft = entry
                .nft_address
                .map(|a| a.to_lowercase())
                .filter(|a| a.len() == 42)
                .ok_or(DecodeError::MalformedReward {
                    number: header.number,
                    index,
                })?;
            if is_epoch_start(&snft) {
                delta.epoch = Some(decode_epoch(node, header, &snft).await?);
            }
            reward.snft = Some(snft);
        }
        delta.rewards.push(reward);
    }
    Ok(())
}

/// Reads the epoch metadata and locates the block where it started.
async fn decode_epoch(node: &Node, header: &Header, snft: &str) -> Result<Epoch, DecodeError> {
    let info: EpochInfo = node
        .call("eth_getCurrentNFTInfo", json!([hex_quantity(header.number)]))
        .await?;

    let floor = header.number.saturating_sub(EPOCH_LOOKBACK);
    let mut selected = header.number.saturating_sub(1);
    while selected > floor && selected > 0 {
        let earlier: EpochInfo = node
            .call("eth_getCurrentNFTInfo", json!([hex_quantity(selected)]))
            .await?;
        if earlier.start_index != info.start_index {
            break;
        }
        selected -= 1;
    }

    let pool: AccountInfo = node
        .call("eth_getAccountInfo", json!([REWARD_POOL, hex_quantity(selected)]))
        .await?;

    let mut dir = info.dir;
    if dir.len() == 52 {
        dir.push('/');
    }
    tracing::info!(epoch = &snft[..39], start = selected + 1, "new epoch observed");
    Ok(Epoch {
        id: snft[..39].to_string(),
        creator: info.creator.to_lowercase(),
        royalty_ratio: info.royalty,
        dir,
        exchanger: info.address.to_lowercase(),
        vote_weight: info.vote_weight,
        number: selected + 1,
        start_number: header.number,
        start_time: header.timestamp,
        reward: pool.balance,
    })
}

/// Validator weights of the block; black-hole blocks also record penalties
/// and the real proposers.
///
/// # Errors
/// Returns the RPC failure.
pub async fn decode_validators(
    node: &Node,
    header: &Header,
    delta: &mut DomainDelta,
) -> Result<(), DecodeError> {
    let number = hex_quantity(header.number);
    let weights: Option<Vec<OnlineWeight>> =
        node.call("eth_getValidators", json!([number])).await?;
    let weights = weights.unwrap_or_default();

    for weight in &weights {
        delta.validators.push(ValidatorChange {
            address: weight.address.to_lowercase(),
            amount: "0".to_string(),
            proxy: None,
            weight: Some(weight.value),
        });
    }

    if header.miner == Address::ZERO {
        delta.penalties = weights
            .iter()
            .map(|w| Penalty {
                address: w.address.to_lowercase(),
                weight: w.value,
            })
            .collect();
        let proposers: Option<Vec<Participant>> = node
            .call("eth_getRealParticipantsByNumber", json!([number]))
            .await?;
        delta.proposers = proposers
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.address.to_lowercase())
            .collect();
        tracing::warn!(
            block_number = header.number,
            penalised = delta.penalties.len(),
            "black hole block"
        );
    }
    Ok(())
}

/// SNFT merges announced through event logs.
pub fn merges_from_logs(logs: &[Log], header: &Header, delta: &mut DomainDelta) {
    for log in logs {
        if log.topics.len() != 3 || log.data.len() < 32 || log.topics[0] != MERGE_TOPIC0 {
            continue;
        }
        let pieces = u64::from(u16::from_be_bytes([log.data[30], log.data[31]]));
        if pieces == 0 {
            continue;
        }
        let word = hex::encode(log.topics[1]);
        let snft = &word[25..];
        let owner = format!("0x{}", &hex::encode(log.topics[2])[24..]);
        for level in 0..3 {
            if snft.as_bytes()[level] == b'8' {
                delta.merges.push(SnftMerge {
                    address: format!("0x{}", &snft[level..]),
                    owner: owner.clone(),
                    pieces,
                    number: header.number,
                    timestamp: header.timestamp,
                });
            }
        }
    }
}

/// Merges completed by the last piece of a group being rewarded.
async fn merges_from_rewards(
    node: &Node,
    header: &Header,
    delta: &mut DomainDelta,
) -> Result<(), DecodeError> {
    let number = hex_quantity(header.number);
    let completing: Vec<String> = delta
        .rewards
        .iter()
        .filter_map(|r| r.snft.clone())
        .filter(|snft| snft.as_bytes().get(41) == Some(&b'f'))
        .collect();

    for snft in completing {
        for level in 0..3usize {
            let keep = 41 - level;
            let probe = format!("{}{}", &snft[..keep], "0".repeat(42 - keep));
            let info: AccountInfo = node
                .call("eth_getAccountInfo", json!([probe, number]))
                .await?;
            match info.nft {
                Some(nft) if nft.merge_level > level as u64 => delta.merges.push(SnftMerge {
                    address: probe[..keep].to_string(),
                    owner: nft.owner.to_lowercase(),
                    pieces: nft.merge_number,
                    number: header.number,
                    timestamp: header.timestamp,
                }),
                _ => break,
            }
        }
    }
    Ok(())
}

/// Exchangers and validators seeded by the genesis allocation.
///
/// # Errors
/// Returns the RPC failure.
#[tracing::instrument(skip_all, fields(accounts = accounts.len()))]
pub async fn decode_genesis(
    node: &Node,
    header: &Header,
    accounts: &[Account],
    delta: &mut DomainDelta,
) -> Result<(), DecodeError> {
    let genesis = hex_quantity(0);
    let requests: Vec<Request> = accounts
        .iter()
        .map(|a| Request::new("eth_getAccountInfo", json!([a.address, genesis])))
        .collect();
    for chunk in requests.chunks(BATCH_CHUNK) {
        let infos = node.batch_as::<AccountInfo>(chunk).await?;
        for (request, info) in chunk.iter().zip(infos) {
            let Some(worm) = info?.worm else {
                continue;
            };
            if is_zero(&worm.exchanger_balance) {
                continue;
            }
            let address = request.params[0].as_str().unwrap_or_default().to_lowercase();
            delta.exchangers.push(ExchangerChange::Open {
                address,
                name: worm.exchanger_name,
                url: worm.exchanger_url,
                fee_ratio: worm.fee_rate,
                timestamp: header.timestamp,
                block_number: 0,
                tx_hash: "0x0".to_string(),
                amount: worm.exchanger_balance,
            });
        }
    }

    let registry: Option<ValidatorRegistry> =
        node.call("eth_getValidator", json!([genesis])).await?;
    for validator in registry.unwrap_or_default().validators {
        let proxy = validator.proxy.to_lowercase();
        delta.validators.push(ValidatorChange {
            address: validator.addr.to_lowercase(),
            amount: validator.balance,
            proxy: is_bindable_proxy(&proxy).then_some(proxy),
            weight: None,
        });
    }
    tracing::info!(
        exchangers = delta.exchangers.len(),
        validators = delta.validators.len(),
        "genesis domain state decoded"
    );
    Ok(())
}

/// Requests per batch for per-account calls.
pub const BATCH_CHUNK: usize = 256;

/// Full domain decode for a block. `node` is `None` when the node lacks the
/// Wormholes extensions; transaction payloads are still decoded.
///
/// # Errors
/// Propagates reward, signature and payload failures.
pub async fn decode_domain(
    node: Option<&Node>,
    header: &Header,
    txs: &[Transaction],
    logs: &[Log],
    accounts: &[Account],
) -> Result<DomainDelta, DecodeError> {
    let mut delta = DomainDelta::default();

    if header.number == 0 {
        if let Some(node) = node {
            decode_genesis(node, header, accounts, &mut delta).await?;
        }
        return Ok(delta);
    }

    if let Some(node) = node {
        decode_rewards(node, header, &mut delta).await?;
        decode_validators(node, header, &mut delta).await?;
    }
    for tx in txs {
        decode_domain_tx(tx, header, &mut delta)?;
    }
    merges_from_logs(logs, header, &mut delta);
    if let Some(node) = node {
        merges_from_rewards(node, header, &mut delta).await?;
    }
    Ok(delta)
}
