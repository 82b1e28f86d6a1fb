use neuronet_core::db::{begin_transaction, open_db_in_memory};
use neuronet_core::model::network::Network;
use neuronet_core::model::neuron::Neuron;
use neuronet_core::model::terminal::{NeurotransmitterEffect, Terminal};
use neuronet_core::repo::aggregate_repo::{
    NeuronAggregateRepository, SqliteAggregateRepository, TerminalAggregateRepository,
};
use neuronet_core::repo::query_repo::{NetworkQueryRepository, SqliteNetworkQueryRepository};
use neuronet_core::service::network_transaction::NetworkTransactionService;
use neuronet_core::service::transaction_data::NetworkTransactionData;
use neuronet_core::service::uniquify::{UniquifyError, UniquifyService};
use rusqlite::Connection;
use std::collections::BTreeSet;
use uuid::Uuid;

fn store_neuron(conn: &Connection, tag: &str, targets: &[Uuid]) -> Neuron {
    let repo = SqliteAggregateRepository::try_new(conn).unwrap();
    let id = Uuid::new_v4();
    let version = repo.create_neuron(id).unwrap();
    repo.change_tag(id, tag, version).unwrap();
    for target in targets {
        repo.create_terminal(&Terminal::new_transient(id, *target))
            .unwrap();
    }
    Neuron::persistent(id).with_tag(tag)
}

fn event_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM events;", [], |row| row.get(0))
        .unwrap()
}

/// Runs uniquify then save inside one transaction, committing on success.
fn merge(
    conn: &Connection,
    network: &mut Network,
    data: &mut NetworkTransactionData,
) -> Result<(), UniquifyError> {
    let tx = begin_transaction(conn).unwrap();
    let query = SqliteNetworkQueryRepository::try_new(&tx, 100).unwrap();
    let writer = SqliteAggregateRepository::try_new(&tx).unwrap();

    UniquifyService::new(&query).uniquify(network, data, None)?;
    NetworkTransactionService::new(&writer)
        .save(network, data)
        .unwrap();
    tx.commit().unwrap();
    Ok(())
}

#[test]
fn merged_network_is_committed_against_canonical_neurons() {
    let conn = open_db_in_memory().unwrap();
    let b = store_neuron(&conn, "y", &[]);
    let p = store_neuron(&conn, "x", &[b.id]);

    let region = Uuid::new_v4();
    let a = Neuron::new_transient().with_tag("x");
    let root = Neuron::new_transient()
        .with_tag("root")
        .with_region(region)
        .with_external_url("https://mirror.example/root");
    let root_a = Terminal::new_transient(root.id, a.id).with_effect(NeurotransmitterEffect::Inhibit);
    let mut network: Network = [a.clone(), b.clone(), root.clone()].into_iter().collect();
    network.add_or_replace_all([Terminal::new_transient(a.id, b.id), root_a.clone()]);
    let mut data = NetworkTransactionData::new();

    merge(&conn, &mut network, &mut data).unwrap();

    let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
    let stored_root = writer.replay_neuron(root.id).unwrap().unwrap();
    assert_eq!(stored_root.tag.as_deref(), Some("root"));
    assert_eq!(stored_root.region_id, Some(region));
    assert_eq!(
        stored_root.external_url.as_deref(),
        Some("https://mirror.example/root")
    );
    assert_eq!(writer.current_version(root.id).unwrap(), 4);
    assert!(writer.replay_neuron(a.id).unwrap().is_none());

    let query = SqliteNetworkQueryRepository::try_new(&conn, 100).unwrap();
    assert!(query.has_identical_terminal(root.id, p.id).unwrap());
    assert!(data.is_committed(root.id));
    assert!(data.is_committed(root_a.id));
    assert_eq!(data.resolve(a.id), p.id);
}

fn sibling_network(b: &Neuron) -> (Network, Neuron) {
    let a = Neuron::new_transient().with_tag("x");
    let a2 = Neuron::new_transient().with_tag("x");
    let root = Neuron::new_transient().with_tag("root");
    let mut network: Network = [a.clone(), a2.clone(), b.clone(), root.clone()]
        .into_iter()
        .collect();
    network.add_or_replace_all([
        Terminal::new_transient(a.id, b.id),
        Terminal::new_transient(a2.id, b.id),
        Terminal::new_transient(root.id, a.id),
        Terminal::new_transient(root.id, a2.id),
    ]);
    (network, root)
}

#[test]
fn collapsed_siblings_can_be_merged_again() {
    let conn = open_db_in_memory().unwrap();
    let b = store_neuron(&conn, "y", &[]);
    let p = store_neuron(&conn, "x", &[b.id]);

    let (mut first, first_root) = sibling_network(&b);
    merge(&conn, &mut first, &mut NetworkTransactionData::new()).unwrap();

    let query = SqliteNetworkQueryRepository::try_new(&conn, 100).unwrap();
    let stored = query
        .find_identical_neuron(Some("root"), &BTreeSet::from([p.id]))
        .unwrap();
    assert!(stored.contains(first_root.id));
    assert_eq!(stored.outgoing_edges(first_root.id).len(), 1);

    let (mut second, second_root) = sibling_network(&b);
    let mut data = NetworkTransactionData::new();
    merge(&conn, &mut second, &mut data).unwrap();

    assert_eq!(data.resolve(second_root.id), first_root.id);
    assert_eq!(data.replaced_count(), 3);
}

#[test]
fn skipped_region_still_threads_versions() {
    let conn = open_db_in_memory().unwrap();
    let neuron = Neuron::new_transient()
        .with_tag("x")
        .with_external_url("https://mirror.example/x");
    let mut network: Network = [neuron.clone()].into_iter().collect();

    merge(&conn, &mut network, &mut NetworkTransactionData::new()).unwrap();

    let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
    let events: Vec<(i64, String)> = writer
        .load_events(neuron.id)
        .unwrap()
        .into_iter()
        .map(|event| (event.version, event.event_type))
        .collect();
    assert_eq!(
        events,
        vec![
            (1, "neuron_created".to_string()),
            (2, "tag_changed".to_string()),
            (3, "external_url_changed".to_string()),
        ]
    );
}

#[test]
fn store_integrity_violation_leaves_no_partial_write() {
    let conn = open_db_in_memory().unwrap();
    let b = store_neuron(&conn, "y", &[]);
    store_neuron(&conn, "x", &[b.id]);
    store_neuron(&conn, "x", &[b.id]);
    let before = event_count(&conn);

    let fresh = Neuron::new_transient().with_tag("fresh");
    let a = Neuron::new_transient().with_tag("x");
    let mut network: Network = [fresh.clone(), a.clone(), b.clone()].into_iter().collect();
    network.add_or_replace(Terminal::new_transient(a.id, b.id));

    let err = merge(&conn, &mut network, &mut NetworkTransactionData::new()).unwrap_err();

    assert!(matches!(err, UniquifyError::RedundantNeurons { .. }));
    assert_eq!(event_count(&conn), before);
    let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
    assert!(writer.replay_neuron(fresh.id).unwrap().is_none());
}

#[test]
fn later_merge_in_same_transaction_reuses_committed_neurons() {
    let conn = open_db_in_memory().unwrap();
    let b = store_neuron(&conn, "y", &[]);
    let tx = begin_transaction(&conn).unwrap();
    let query = SqliteNetworkQueryRepository::try_new(&tx, 100).unwrap();
    let writer = SqliteAggregateRepository::try_new(&tx).unwrap();
    let uniquifier = UniquifyService::new(&query);
    let saver = NetworkTransactionService::new(&writer);
    let mut data = NetworkTransactionData::new();

    let first = Neuron::new_transient().with_tag("x");
    let mut network: Network = [first.clone(), b.clone()].into_iter().collect();
    network.add_or_replace(Terminal::new_transient(first.id, b.id));
    uniquifier.uniquify(&mut network, &mut data, None).unwrap();
    saver.save(&network, &mut data).unwrap();

    let second = Neuron::new_transient().with_tag("x");
    let mut network: Network = [second.clone(), b.clone()].into_iter().collect();
    network.add_or_replace(Terminal::new_transient(second.id, b.id));
    let report = uniquifier.uniquify(&mut network, &mut data, None).unwrap();
    let saved = saver.save(&network, &mut data).unwrap();

    assert_eq!(report.replaced, 1);
    assert_eq!(data.resolve(second.id), first.id);
    assert_eq!(saved.neurons_created, 0);
    assert_eq!(saved.terminals_created, 0);
    drop(tx);

    let identical = SqliteNetworkQueryRepository::try_new(&conn, 100)
        .unwrap()
        .find_identical_neuron(Some("x"), &BTreeSet::from([b.id]))
        .unwrap();
    assert!(identical.is_empty());
}
