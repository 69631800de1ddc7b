//! Contract classification by probing `eth_call`.
//!
//! Every probe that fails for a non-network reason (revert, bad return data,
//! missing method) counts as "not supported". Only link failures abort a
//! classification so the caller can retry the block.

use alloy::primitives::{address, Address, FixedBytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::error::RpcError;
use crate::node::{BlockTag, Node};
use crate::types::ContractKind;

/// Probe holders used for the ERC-20 invariant calls.
pub const PROBE_ADDR_1: Address = address!("0000000000000000000000000000000000000001");
pub const PROBE_ADDR_2: Address = address!("0000000000000000000000000000000000000002");

pub const ERC165_INTERFACE_ID: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];
pub const INVALID_INTERFACE_ID: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
pub const ERC721_INTERFACE_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];
pub const ERC1155_INTERFACE_ID: [u8; 4] = [0xd9, 0xb6, 0x7a, 0x26];

sol! {
    interface IERC165 {
        function supportsInterface(bytes4 interfaceId) external view returns (bool);
    }

    interface IERC20 {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function totalSupply() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function transfer(address to, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function approve(address spender, uint256 value) external returns (bool);
    }
}

/// Classification plus the optional metadata fetched alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInfo {
    pub kind: ContractKind,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

/// Runs one probe. `Ok(None)` means the contract rejected it.
async fn probe<C: SolCall>(
    node: &Node,
    contract: Address,
    call: &C,
    tag: BlockTag,
) -> Result<Option<C::Return>, RpcError> {
    match node.eth_call(contract, &call.abi_encode(), tag).await {
        Ok(output) => Ok(C::abi_decode_returns(&output, true).ok()),
        Err(e) if e.is_network() => Err(e),
        Err(_) => Ok(None),
    }
}

async fn supports_interface(
    node: &Node,
    contract: Address,
    interface_id: [u8; 4],
    tag: BlockTag,
) -> Result<bool, RpcError> {
    let call = IERC165::supportsInterfaceCall {
        interfaceId: FixedBytes(interface_id),
    };
    Ok(probe(node, contract, &call, tag)
        .await?
        .map(|ret| ret._0)
        .unwrap_or(false))
}

/// ERC-165 requires `supportsInterface(0x01ffc9a7)` to be true and
/// `supportsInterface(0xffffffff)` to be false.
pub async fn is_erc165(node: &Node, contract: Address, tag: BlockTag) -> Result<bool, RpcError> {
    if !supports_interface(node, contract, ERC165_INTERFACE_ID, tag).await? {
        return Ok(false);
    }
    Ok(!supports_interface(node, contract, INVALID_INTERFACE_ID, tag).await?)
}

/// The mandatory ERC-20 surface must answer, and a zero `approve` must
/// return `true`.
pub async fn is_erc20(node: &Node, contract: Address, tag: BlockTag) -> Result<bool, RpcError> {
    if probe(node, contract, &IERC20::totalSupplyCall {}, tag).await?.is_none() {
        return Ok(false);
    }
    let balance = IERC20::balanceOfCall {
        owner: PROBE_ADDR_1,
    };
    if probe(node, contract, &balance, tag).await?.is_none() {
        return Ok(false);
    }
    let allowance = IERC20::allowanceCall {
        owner: PROBE_ADDR_1,
        spender: PROBE_ADDR_2,
    };
    if probe(node, contract, &allowance, tag).await?.is_none() {
        return Ok(false);
    }
    let transfer = IERC20::transferCall {
        to: PROBE_ADDR_2,
        value: U256::ZERO,
    };
    if probe(node, contract, &transfer, tag).await?.is_none() {
        return Ok(false);
    }
    let transfer_from = IERC20::transferFromCall {
        from: PROBE_ADDR_1,
        to: PROBE_ADDR_2,
        value: U256::ZERO,
    };
    if probe(node, contract, &transfer_from, tag).await?.is_none() {
        return Ok(false);
    }
    let approve = IERC20::approveCall {
        spender: PROBE_ADDR_2,
        value: U256::ZERO,
    };
    Ok(probe(node, contract, &approve, tag)
        .await?
        .map(|ret| ret._0)
        .unwrap_or(false))
}

/// Decides the contract kind of `contract` at `tag`.
///
/// # Errors
/// Returns error only for network-level RPC failures.
#[tracing::instrument(skip_all, fields(contract = %contract))]
pub async fn classify(node: &Node, contract: Address, tag: BlockTag) -> Result<ContractKind, RpcError> {
    if !is_erc165(node, contract, tag).await? {
        return Ok(if is_erc20(node, contract, tag).await? {
            ContractKind::Erc20
        } else {
            ContractKind::Other
        });
    }
    if supports_interface(node, contract, ERC721_INTERFACE_ID, tag).await? {
        return Ok(ContractKind::Erc721);
    }
    if supports_interface(node, contract, ERC1155_INTERFACE_ID, tag).await? {
        return Ok(ContractKind::Erc1155);
    }
    Ok(ContractKind::Erc165)
}

/// Classifies a freshly seen contract and fetches its optional
/// `name()`/`symbol()`.
///
/// # Errors
/// Returns error only for network-level RPC failures.
pub async fn inspect(node: &Node, contract: Address, tag: BlockTag) -> Result<ContractInfo, RpcError> {
    let name = probe(node, contract, &IERC20::nameCall {}, tag)
        .await?
        .map(|ret| ret._0);
    let symbol = probe(node, contract, &IERC20::symbolCall {}, tag)
        .await?
        .map(|ret| ret._0);
    let kind = classify(node, contract, tag).await?;
    tracing::debug!(?kind, name = name.as_deref().unwrap_or(""), "contract classified");
    Ok(ContractInfo { kind, name, symbol })
}
