mod common;

use std::sync::Arc;

use common::*;
use utxod_chainstate::{ChainState, ChainStateError, ChainStateOptions, UtxoEntry};
use utxod_consensus::block_subsidy;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::TxOut;
use utxod_storage::{Column, KeyValueStore};

fn snapshot<S: KeyValueStore>(state: &ChainState<S>) -> Vec<(OutPoint, UtxoEntry)> {
    state
        .with_utxos(|utxos, _| {
            let mut entries: Vec<(OutPoint, UtxoEntry)> = utxos
                .iter()
                .map(|(outpoint, entry)| (*outpoint, entry.clone()))
                .collect();
            entries.sort_by_key(|(outpoint, _)| *outpoint);
            entries
        })
        .expect("snapshot")
}

/// Builds a short chain with one spend, then reorganizes onto a longer
/// branch so the store holds stale side-branch data.
fn populate<S: KeyValueStore>(state: &ChainState<S>) {
    let params = state.params().clone();
    let alice = secret(1);
    let block1 = build_block(&params, Parent::tip_of(state), lock_of(&alice), 0, Vec::new());
    submit(state, &block1);
    let fee = 500;
    let pay = spend(
        &[(reward_outpoint(&block1), &alice)],
        vec![TxOut {
            value: block_subsidy(1, &params) - fee,
            lock: [2u8; 20],
        }],
    );
    let stale = build_block(&params, Parent::of(&block1, 1), [3u8; 20], 0, Vec::new());
    submit(state, &stale);
    let block2 = build_block(&params, Parent::of(&block1, 1), [4u8; 20], fee, vec![pay]);
    submit(state, &block2);
    for block in build_chain(&params, Parent::of(&block2, 2), [4u8; 20], 2) {
        submit(state, &block);
    }
}

#[test]
fn reopen_restores_tip_and_utxos() {
    let params = regtest();
    let (store, state) = open_memory(&params, ChainStateOptions::default());
    populate(&state);
    let tip = state.tip().expect("tip");
    let before = snapshot(&state);
    drop(state);

    let reopened =
        ChainState::open(Arc::clone(&store), params.clone(), ChainStateOptions::default())
            .expect("reopen");
    assert_eq!(reopened.tip().expect("tip"), tip);
    assert_eq!(snapshot(&reopened), before);
    assert_eq!(reopened.balance(&[2u8; 20]).expect("balance"), block_subsidy(1, &params) - 500);
    assert_eq!(reopened.template_context().expect("template").height, tip.height + 1);
}

#[test]
fn reindex_rebuilds_identical_utxo_set() {
    let params = regtest();
    let (store, state) = open_memory(&params, ChainStateOptions::default());
    populate(&state);
    let tip = state.tip().expect("tip");
    let before = snapshot(&state);

    state.reindex_utxos().expect("reindex");
    assert_eq!(state.tip().expect("tip"), tip);
    assert_eq!(snapshot(&state), before);
    assert_eq!(store.count(Column::BlockUndo), tip.height as usize + 1);
    assert_eq!(store.count(Column::Utxo), before.len());
    for height in 0..=tip.height {
        let hash = state.hash_at_height(height).expect("read").expect("hash");
        assert!(state.header_entry(&hash).expect("read").expect("entry").has_undo());
    }

    let reopened = ChainState::open(store, params, ChainStateOptions::default()).expect("reopen");
    assert_eq!(snapshot(&reopened), before);
}

#[test]
fn store_from_other_network_is_refused() {
    let params = regtest();
    let (store, state) = open_memory(&params, ChainStateOptions::default());
    drop(state);

    let mut other = params.clone();
    other.genesis.time += 1;
    match ChainState::open(store, other, ChainStateOptions::default()) {
        Err(ChainStateError::Corrupt(reason)) => {
            assert_eq!(reason, "stored genesis does not match network")
        }
        Err(err) => panic!("unexpected error {err}"),
        Ok(_) => panic!("open should fail"),
    }
}

#[cfg(feature = "fjall")]
#[test]
fn fjall_store_survives_restart() {
    use utxod_storage::fjall::FjallStore;

    let params = regtest();
    let dir = tempfile::tempdir().expect("tempdir");
    let (tip, before) = {
        let store = Arc::new(FjallStore::open(dir.path()).expect("open store"));
        let state = ChainState::open(Arc::clone(&store), params.clone(), ChainStateOptions::default())
            .expect("open");
        populate(&state);
        store.persist().expect("persist");
        (state.tip().expect("tip"), snapshot(&state))
    };

    let store = Arc::new(FjallStore::open(dir.path()).expect("reopen store"));
    let state = ChainState::open(store, params, ChainStateOptions::default()).expect("reopen");
    assert_eq!(state.tip().expect("tip"), tip);
    assert_eq!(snapshot(&state), before);
}
