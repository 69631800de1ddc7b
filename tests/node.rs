//! Node capability probing and response decoding through the public API.

mod common;

use alloy::primitives::U256;
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wormscan_data::error::RpcError;
use wormscan_data::node::scripted::ScriptedTransport;
use wormscan_data::node::{Capabilities, Node};
use wormscan_data::wormholes::AccountInfo;
use wormscan_data::BlockDecoder;

const WIDE: &str = "70000000000000000000001";

fn node(transport: Arc<ScriptedTransport>) -> Node {
    Node::scripted(transport, Duration::from_secs(5))
}

#[tokio::test]
async fn capabilities_of_a_full_node() {
    let chain = FakeChain::new(&[(addr(1), eth(1))]);
    let transport = chain.transport();
    transport.on("eth_getAccountInfo", |_| Ok(json!({ "Nonce": 0 })));

    let caps = node(transport).capabilities().await.expect("node answered");
    assert_eq!(
        caps,
        Capabilities {
            debug: true,
            domain: true
        }
    );
}

/// A plain node reports the Wormholes methods as missing; that disables the
/// namespace without failing detection.
#[tokio::test]
async fn missing_methods_disable_only_their_namespace() {
    let chain = FakeChain::new(&[(addr(1), eth(1))]);

    let caps = chain.node().capabilities().await.expect("node answered");
    assert!(caps.debug);
    assert!(!caps.domain);
}

/// Server-side trouble during detection is reported instead of silently
/// turning a namespace off for the whole run.
#[tokio::test]
async fn transient_node_failures_are_errors() {
    let chain = FakeChain::new(&[(addr(1), eth(1))]);
    let transport = chain.transport();
    transport.on("debug_gcStats", |_| {
        Err((-32000, "server busy, try again".to_string()))
    });

    let err = node(transport.clone())
        .capabilities()
        .await
        .expect_err("a busy node is not a node without debug");
    assert!(matches!(err, RpcError::Rpc { code: -32000, .. }));
    assert_eq!(transport.calls("debug_gcStats"), 1);

    transport.on("debug_gcStats", |_| Ok(json!({})));
    transport.on("eth_getAccountInfo", |_| {
        Err((-32603, "upstream connection refused".to_string()))
    });
    assert!(node(transport).capabilities().await.is_err());
}

/// Wei amounts wider than 64 bits arrive as bare JSON numbers and must keep
/// every digit.
#[tokio::test]
async fn wide_account_balances_keep_every_digit() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.on_raw("eth_getAccountInfo", |_| {
        format!(r#"{{"Nonce":7,"Balance":{WIDE},"Worm":{{"VoteWeight":{WIDE},"ExchangerBalance":"0x10"}}}}"#)
    });

    let info: AccountInfo = node(transport)
        .call("eth_getAccountInfo", json!([addr(1), "0x1"]))
        .await
        .expect("account info decodes");
    assert_eq!(info.nonce, 7);
    assert_eq!(info.balance, WIDE);
    let worm = info.worm.expect("worm state present");
    assert_eq!(worm.vote_weight, WIDE);
    assert_eq!(worm.exchanger_balance, "16");
}

#[tokio::test]
async fn wide_genesis_allocation_keeps_every_digit() {
    let chain = FakeChain::new(&[(addr(1), eth(1))]);
    let transport = chain.transport();
    let holder = addr(1);
    transport.on_raw("debug_accountRange", move |_| {
        format!(
            r#"{{"accounts":{{"{holder:#x}":{{"address":"{holder:#x}","balance":{WIDE},"nonce":0}}}},"next":null}}"#
        )
    });
    let decoder = BlockDecoder::new(
        node(transport),
        Capabilities {
            debug: true,
            domain: false,
        },
    );

    let genesis = decoder.decode(0).await.expect("genesis decodes");
    assert_eq!(genesis.accounts.len(), 1);
    assert_eq!(genesis.accounts[0].address, holder);
    assert_eq!(
        genesis.accounts[0].balance,
        U256::from_str_radix(WIDE, 10).expect("literal parses")
    );
}
