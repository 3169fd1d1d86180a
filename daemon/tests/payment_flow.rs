mod support;

use std::sync::Arc;

use flow_common::{
    chain::ChainKey,
    flow::{Flow, FlowStatus, FlowType, StageStatus},
};
use flow_daemon::{
    chain::{BlockResults, EvmLog, TxResponse, TRANSFER_EVENT_TOPIC, ZERO_ADDRESS_TOPIC},
    core::storage::{FlowStore, SledStorage},
};
use indexmap::IndexMap;
use serde_json::json;
use support::{build_tracker, MockEvm, MockTendermint};

const NAMADA_IBC_TX: &str = "4E1C2A90B4D55F3B2C1A0E9D8C7B6A5948372615049382716A5B4C3D2E1F0A9B";
const ORBITER_ADDRESS: &str = "noble1orbiterpaymentaddr";
const RECIPIENT: &str = "0x00112233445566778899aabbccddeeff00112233";
const MEMO_JSON: &str = r#"{"destination_caller":"","mint_recipient":""}"#;

fn payment_flow(id: &str) -> Flow {
    let mut metadata = IndexMap::new();
    metadata.insert("namadaIbcTxHash".to_string(), json!(NAMADA_IBC_TX));
    metadata.insert("memoJson".to_string(), json!(MEMO_JSON));
    metadata.insert("amountBaseUnits".to_string(), json!("250000"));
    metadata.insert("forwardingAddress".to_string(), json!(ORBITER_ADDRESS));
    metadata.insert(
        "destinationCallerB64".to_string(),
        json!("AAAAZGVzdGluYXRpb24="),
    );
    metadata.insert("mintRecipientB64".to_string(), json!("AAAAcmVjaXBpZW50"));
    metadata.insert("destinationDomain".to_string(), json!(0));
    metadata.insert("recipient".to_string(), json!(RECIPIENT));
    metadata.insert(
        "usdcAddress".to_string(),
        json!("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
    );
    Flow::new(
        id.to_string(),
        FlowType::Payment,
        "namada-testnet".to_string(),
        "sepolia".to_string(),
        None,
        metadata,
    )
}

fn orbiter_block() -> BlockResults {
    let packet_data = json!({
        "amount": "250000",
        "receiver": ORBITER_ADDRESS,
        "memo": MEMO_JSON
    })
    .to_string();
    serde_json::from_value(json!({
        "height": "900",
        "txs_results": [{
            "code": 0,
            "events": [
                {
                    "type": "write_acknowledgement",
                    "attributes": [
                        {"key": "packet_ack", "value": "{\"result\":\"AQ==\"}"},
                        {"key": "packet_data", "value": packet_data}
                    ]
                },
                {
                    "type": "circle.cctp.v1.DepositForBurn",
                    "attributes": [
                        {"key": "amount", "value": "\"250000\""},
                        {"key": "destination_caller", "value": "\"AAAAZGVzdGluYXRpb24=\""},
                        {"key": "mint_recipient", "value": "\"AAAAcmVjaXBpZW50\""},
                        {"key": "destination_domain", "value": "0"}
                    ]
                }
            ]
        }]
    }))
    .expect("orbiter block")
}

fn mint_log() -> EvmLog {
    EvmLog {
        address: "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".to_string(),
        topics: vec![
            TRANSFER_EVENT_TOPIC.to_string(),
            ZERO_ADDRESS_TOPIC.to_string(),
            format!("0x{:0>64}", RECIPIENT.trim_start_matches("0x")),
        ],
        // 250000 = 0x3d090
        data: "0x000000000000000000000000000000000000000000000000000000000003d090".to_string(),
        block_number: "0x20".to_string(),
        transaction_hash: "0xminted".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_payment_happy_path() {
    let store = Arc::new(SledStorage::temporary().expect("store"));

    let namada = Arc::new(MockTendermint::with_tip(3418000));
    namada.insert_tx(
        NAMADA_IBC_TX,
        TxResponse {
            hash: NAMADA_IBC_TX.to_string(),
            height: "3417990".to_string(),
            tx_result: Default::default(),
        },
    );

    let noble = Arc::new(MockTendermint::with_tip(900));
    noble.insert_block(900, orbiter_block());

    let evm = Arc::new(MockEvm::with_tip(32));
    evm.logs.lock().unwrap().push(mint_log());

    let tracker = build_tracker(
        Arc::clone(&store),
        Some(noble),
        Some(namada),
        Some(evm),
    );
    store
        .create_flow(payment_flow("flow-payment"))
        .await
        .expect("create");

    tracker.track_flow("flow-payment").await.expect("track");

    let flow = store
        .get_flow("flow-payment")
        .await
        .expect("get")
        .expect("flow");
    assert_eq!(flow.status, FlowStatus::Completed);

    let namada_progress = flow.chain_progress.get(ChainKey::Namada).expect("namada");
    assert_eq!(namada_progress.status, StageStatus::Confirmed);
    assert_eq!(namada_progress.tx_hash.as_deref(), Some(NAMADA_IBC_TX));

    let noble_progress = flow.chain_progress.get(ChainKey::Noble).expect("noble");
    assert_eq!(noble_progress.status, StageStatus::Confirmed);
    assert!(noble_progress.has_stage("noble_payment_received"));
    assert!(noble_progress.has_stage("noble_cctp_burned"));

    let evm_progress = flow.chain_progress.get(ChainKey::Evm).expect("evm");
    assert_eq!(evm_progress.status, StageStatus::Confirmed);
    assert_eq!(evm_progress.tx_hash.as_deref(), Some("0xminted"));

    let logs = store.list_status_logs("flow-payment").await.expect("logs");
    let stages: Vec<_> = logs.iter().map(|l| l.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            "namada_ibc_sent",
            "noble_payment_received",
            "noble_cctp_burned",
            "evm_usdc_minted"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_payment_missing_orbiter_params_skips_to_mint() {
    let store = Arc::new(SledStorage::temporary().expect("store"));

    let namada = Arc::new(MockTendermint::with_tip(3418000));
    namada.insert_tx(
        NAMADA_IBC_TX,
        TxResponse {
            hash: NAMADA_IBC_TX.to_string(),
            height: "3417990".to_string(),
            tx_result: Default::default(),
        },
    );
    let noble = Arc::new(MockTendermint::with_tip(900));
    let evm = Arc::new(MockEvm::with_tip(32));
    evm.logs.lock().unwrap().push(mint_log());

    let tracker = build_tracker(
        Arc::clone(&store),
        Some(noble),
        Some(namada),
        Some(evm),
    );

    // no memoJson / CCTP attributes: the orbiter stage cannot run, but the
    // mint stage still can
    let mut flow = payment_flow("flow-partial");
    flow.metadata.shift_remove("memoJson");
    flow.metadata.shift_remove("destinationCallerB64");
    store.create_flow(flow).await.expect("create");

    tracker.track_flow("flow-partial").await.expect("track");

    let flow = store
        .get_flow("flow-partial")
        .await
        .expect("get")
        .expect("flow");
    assert_eq!(flow.status, FlowStatus::Completed);
    let noble_progress = flow.chain_progress.get(ChainKey::Noble).expect("noble");
    assert!(noble_progress.stages.is_empty());
    assert_eq!(noble_progress.status, StageStatus::Pending);
}
