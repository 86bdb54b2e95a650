// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

// These tests require a Kafka broker listening on localhost:9092:
// `cargo test --features kafka-broker-tests`.
#![cfg(feature = "kafka-broker-tests")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use weir_common::rand::append_random_suffix;
use weir_config::WeirConfig;
use weir_runtime::{
    changelog_topic_name, ErrorAction, JsonArrayMode, OnMalformed, ProcessingContext,
    RecoveryManager, Row, RowProducer, Runtime, RuntimeCounters, SerializationFormat, Topic,
};
use weir_state::{KeyPrefix, StorePartition};

const BOOTSTRAP_SERVERS: &str = "localhost:9092";
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

fn create_admin_client() -> AdminClient<DefaultClientContext> {
    ClientConfig::new()
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .create()
        .unwrap()
}

async fn create_topic_with_config(topic: &str, num_partitions: i32, config: &[(&str, &str)]) {
    let admin_client = create_admin_client();
    let mut new_topic = NewTopic::new(topic, num_partitions, TopicReplication::Fixed(1));
    for (key, value) in config {
        new_topic = new_topic.set(key, value);
    }
    admin_client
        .create_topics(
            &[new_topic],
            &AdminOptions::new().operation_timeout(Some(Duration::from_secs(5).into())),
        )
        .await
        .unwrap()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
}

async fn create_topic(topic: &str, num_partitions: i32) {
    create_topic_with_config(topic, num_partitions, &[]).await;
}

async fn populate_topic(topic: &str, payloads: &[&str]) {
    produce_to_partition(topic, None, payloads).await;
}

async fn produce_to_partition(topic: &str, partition: Option<i32>, payloads: &[&str]) {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .set("message.timeout.ms", "30000")
        .create()
        .unwrap();
    for payload in payloads {
        let mut record = FutureRecord::<(), str>::to(topic).payload(payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(error, _)| error)
            .unwrap();
    }
}

fn config_for_test(consumer_group: &str, state_dir: &std::path::Path) -> WeirConfig {
    let mut config = WeirConfig::for_test();
    config.consumer_group = consumer_group.to_string();
    config.bootstrap_servers = BOOTSTRAP_SERVERS.to_string();
    config.state_dir_path = state_dir.to_path_buf();
    config
}

fn committed_next_offset(consumer_group: &str, topic: &str, partition: i32) -> Option<i64> {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .set("group.id", consumer_group)
        .create()
        .unwrap();
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    let committed = consumer
        .committed_offsets(tpl, Duration::from_secs(10))
        .ok()?;
    match committed.find_partition(topic, partition)?.offset() {
        Offset::Offset(offset) => Some(offset),
        _ => None,
    }
}

fn wait_for_committed_offset(
    consumer_group: &str,
    topic: &str,
    partition: i32,
    expected_next_offset: i64,
) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if committed_next_offset(consumer_group, topic, partition) == Some(expected_next_offset) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "Timed out waiting for committed offset `{expected_next_offset}` on \
             `{topic}-{partition}`."
        );
        std::thread::sleep(Duration::from_millis(250));
    }
}

/// Splits text payloads on whitespace and counts words in the `counts`
/// store. A `DELETE <word>` payload drops the word instead.
fn word_count_pipeline(row: &Row, ctx: &mut ProcessingContext<'_>) -> anyhow::Result<()> {
    let text = row.value.as_text().context("Expected a text payload.")?;
    if let Some(word) = text.strip_prefix("DELETE ") {
        let mut state = ctx.state("counts")?;
        state.delete(word.as_bytes())?;
        return Ok(());
    }
    for word in text.split_whitespace() {
        let mut state = ctx.state("counts")?;
        let count: u64 = state.get_json(word.as_bytes())?.unwrap_or(0);
        state.set_json(word.as_bytes(), &(count + 1))?;
    }
    Ok(())
}

fn spawn_word_count_runtime(
    config: WeirConfig,
    topic: Topic,
) -> (
    weir_runtime::ShutdownHandle,
    std::thread::JoinHandle<RuntimeCounters>,
) {
    let mut runtime = Runtime::new(config).unwrap();
    runtime
        .add_pipeline(topic, &["counts"], word_count_pipeline)
        .unwrap();
    let shutdown_handle = runtime.shutdown_handle();
    let runtime_thread = std::thread::spawn(move || runtime.run().unwrap());
    (shutdown_handle, runtime_thread)
}

fn run_runtime_until(config: WeirConfig, topic: Topic, wait: impl FnOnce()) -> RuntimeCounters {
    let (shutdown_handle, runtime_thread) = spawn_word_count_runtime(config, topic);
    wait();
    shutdown_handle.shutdown();
    runtime_thread.join().unwrap()
}

fn read_count_at(state_dir: &std::path::Path, partition: i32, word: &str) -> Option<u64> {
    let store = Arc::new(
        StorePartition::open(
            &state_dir.join("counts").join(partition.to_string()),
            "counts",
            partition,
            None,
        )
        .unwrap(),
    );
    let mut transaction = store.begin().unwrap();
    let value = transaction.get(KeyPrefix::VALUES, word.as_bytes()).unwrap();
    value.map(|bytes| serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_word_count_end_to_end() {
    weir_common::setup_logging_for_tests();
    let topic_name = append_random_suffix("weir-test-words");
    let consumer_group = append_random_suffix("weir-test-group");
    create_topic(&topic_name, 1).await;
    populate_topic(&topic_name, &["a b a", "a", "b b"]).await;

    let state_dir = tempfile::tempdir().unwrap();
    let config = config_for_test(&consumer_group, state_dir.path());
    let topic = Topic::input(&topic_name, SerializationFormat::Text);

    let counters = run_runtime_until(config, topic, || {
        wait_for_committed_offset(&consumer_group, &topic_name, 0, 3);
    });
    assert_eq!(counters.num_records_processed, 3);
    assert_eq!(counters.num_records_skipped, 0);
    assert!(counters.num_checkpoints >= 1);

    assert_eq!(read_count_at(state_dir.path(), 0, "a"), Some(4));
    assert_eq!(read_count_at(state_dir.path(), 0, "b"), Some(3));

    // The changelog retains at least one record per key whose latest value is
    // the final count.
    let changelog_topic = changelog_topic_name(&consumer_group, &topic_name, "counts");
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .set("group.id", append_random_suffix("weir-test-changelog-reader"))
        .create()
        .unwrap();
    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(&changelog_topic, 0, Offset::Beginning)
        .unwrap();
    consumer.assign(&assignment).unwrap();

    let mut latest_a = None;
    let mut latest_b = None;
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        match consumer.poll(Duration::from_millis(500)) {
            Some(Ok(message)) => {
                let value = message.payload().map(<[u8]>::to_vec);
                match message.key() {
                    Some(b"a") => latest_a = Some(value),
                    Some(b"b") => latest_b = Some(value),
                    _ => {}
                }
            }
            _ => {
                if latest_a.is_some() && latest_b.is_some() {
                    break;
                }
            }
        }
    }
    assert_eq!(latest_a.unwrap().unwrap(), b"4".to_vec());
    assert_eq!(latest_b.unwrap().unwrap(), b"3".to_vec());
}

#[tokio::test]
async fn test_crash_before_store_commit_replays_changelog() {
    // The crash window between offset commit and store commit: the
    // changelog is flushed and durable at the broker, the local store
    // transaction is dropped uncommitted. A restart must converge to the
    // same store content by replaying the changelog.
    weir_common::setup_logging_for_tests();
    let consumer_group = append_random_suffix("weir-test-group");
    let changelog_topic = changelog_topic_name(&consumer_group, "words", "counts");
    create_topic_with_config(&changelog_topic, 1, &[("cleanup.policy", "compact")]).await;

    let state_dir = tempfile::tempdir().unwrap();
    let config = config_for_test(&consumer_group, state_dir.path());
    let store_dir = state_dir.path().join("counts").join("0");
    let store = Arc::new(
        StorePartition::open(&store_dir, "counts", 0, Some(changelog_topic.clone())).unwrap(),
    );
    let producer = RowProducer::from_config(&config).unwrap();

    let mut transaction = store.begin().unwrap();
    transaction.position_at(2);
    transaction
        .set(KeyPrefix::VALUES, b"a", b"4".to_vec())
        .unwrap();
    transaction
        .set(KeyPrefix::VALUES, b"b", b"3".to_vec())
        .unwrap();
    transaction.prepare_changelog(&producer, "words").unwrap();
    producer.flush(Duration::from_secs(10)).unwrap();
    // The process dies here: no store commit, no watermark advance.
    drop(transaction);
    drop(store);

    let reopened = Arc::new(
        StorePartition::open(&store_dir, "counts", 0, Some(changelog_topic)).unwrap(),
    );
    assert_eq!(reopened.processed_offset(), -1);
    let recovery = RecoveryManager::from_config(&config);
    recovery.recover_store_partition(&reopened).unwrap();

    let mut transaction = reopened.begin().unwrap();
    assert_eq!(
        transaction.get(KeyPrefix::VALUES, b"a").unwrap(),
        Some(b"4".to_vec())
    );
    assert_eq!(
        transaction.get(KeyPrefix::VALUES, b"b").unwrap(),
        Some(b"3".to_vec())
    );
    drop(transaction);
    // Two changelog records were replayed; the watermark points at the last.
    assert_eq!(reopened.processed_offset(), 1);
}

#[tokio::test]
async fn test_rebalance_hands_over_partition_with_state() {
    // Two instances share the group on a two-partition topic. When the
    // second joins, the cooperative rebalance moves exactly one partition:
    // the first instance seals it with a scoped final checkpoint, the
    // second replays its changelog and resumes from the committed offset.
    weir_common::setup_logging_for_tests();
    let topic_name = append_random_suffix("weir-test-rebalance");
    let consumer_group = append_random_suffix("weir-test-group");
    create_topic(&topic_name, 2).await;
    produce_to_partition(&topic_name, Some(0), &["alpha", "alpha", "alpha"]).await;
    produce_to_partition(&topic_name, Some(1), &["beta", "beta", "beta"]).await;

    let state_dir_1 = tempfile::tempdir().unwrap();
    let (shutdown_1, thread_1) = spawn_word_count_runtime(
        config_for_test(&consumer_group, state_dir_1.path()),
        Topic::input(&topic_name, SerializationFormat::Text),
    );
    wait_for_committed_offset(&consumer_group, &topic_name, 0, 3);
    wait_for_committed_offset(&consumer_group, &topic_name, 1, 3);

    let state_dir_2 = tempfile::tempdir().unwrap();
    let (shutdown_2, thread_2) = spawn_word_count_runtime(
        config_for_test(&consumer_group, state_dir_2.path()),
        Topic::input(&topic_name, SerializationFormat::Text),
    );
    // Let the incremental rebalance settle, then extend both partitions.
    tokio::time::sleep(Duration::from_secs(5)).await;
    produce_to_partition(&topic_name, Some(0), &["alpha", "alpha"]).await;
    produce_to_partition(&topic_name, Some(1), &["beta", "beta"]).await;
    wait_for_committed_offset(&consumer_group, &topic_name, 0, 5);
    wait_for_committed_offset(&consumer_group, &topic_name, 1, 5);

    shutdown_1.shutdown();
    shutdown_2.shutdown();
    thread_1.join().unwrap();
    thread_2.join().unwrap();

    // Whichever instance owns a partition at the end must hold the full
    // count for its word: the takeover replayed the changelog before
    // resuming. The loser's leftover copy stops at the handover point.
    let count_across_instances = |partition: i32, word: &str| -> Option<u64> {
        [state_dir_1.path(), state_dir_2.path()]
            .iter()
            .filter_map(|state_dir| read_count_at(state_dir, partition, word))
            .max()
    };
    assert_eq!(count_across_instances(0, "alpha"), Some(5));
    assert_eq!(count_across_instances(1, "beta"), Some(5));
    // The second instance took over exactly one of the two partitions and
    // caught up on it.
    let instance_2_counts = [
        read_count_at(state_dir_2.path(), 0, "alpha"),
        read_count_at(state_dir_2.path(), 1, "beta"),
    ];
    assert!(instance_2_counts.iter().any(|count| *count == Some(5)));
}

#[tokio::test]
async fn test_changelog_tombstone_and_recovery() {
    weir_common::setup_logging_for_tests();
    let topic_name = append_random_suffix("weir-test-tombstone");
    let consumer_group = append_random_suffix("weir-test-group");
    create_topic(&topic_name, 1).await;
    populate_topic(&topic_name, &["a b a", "a", "b b", "DELETE a"]).await;

    let state_dir = tempfile::tempdir().unwrap();
    let config = config_for_test(&consumer_group, state_dir.path());
    let topic = Topic::input(&topic_name, SerializationFormat::Text);
    run_runtime_until(config.clone(), topic, || {
        wait_for_committed_offset(&consumer_group, &topic_name, 0, 4);
    });
    assert_eq!(read_count_at(state_dir.path(), 0, "a"), None);
    assert_eq!(read_count_at(state_dir.path(), 0, "b"), Some(3));

    // A fresh store replaying the changelog from scratch converges to the
    // same content: `a` stays deleted, `b` keeps its count.
    let changelog_topic = changelog_topic_name(&consumer_group, &topic_name, "counts");
    let recovered_dir = tempfile::tempdir().unwrap();
    let recovered = Arc::new(
        StorePartition::open(
            &recovered_dir.path().join("counts").join("0"),
            "counts",
            0,
            Some(changelog_topic),
        )
        .unwrap(),
    );
    let recovery = RecoveryManager::from_config(&config);
    recovery.recover_store_partition(&recovered).unwrap();

    let mut transaction = recovered.begin().unwrap();
    assert_eq!(transaction.get(KeyPrefix::VALUES, b"a").unwrap(), None);
    assert_eq!(
        transaction.get(KeyPrefix::VALUES, b"b").unwrap(),
        Some(b"3".to_vec())
    );
}

#[tokio::test]
async fn test_deserializer_skip_advances_offset() {
    weir_common::setup_logging_for_tests();
    let topic_name = append_random_suffix("weir-test-skip");
    let consumer_group = append_random_suffix("weir-test-group");
    create_topic(&topic_name, 1).await;
    populate_topic(&topic_name, &[r#"{"ok": 1}"#, "{malformed", r#"{"ok": 2}"#]).await;

    let state_dir = tempfile::tempdir().unwrap();
    let config = config_for_test(&consumer_group, state_dir.path());
    let topic = Topic::input(
        &topic_name,
        SerializationFormat::Json {
            array_mode: JsonArrayMode::AsValue,
            on_malformed: OnMalformed::Skip,
        },
    );

    let mut runtime = Runtime::new(config).unwrap();
    runtime
        .add_pipeline(
            topic,
            &[],
            |_row: &Row, _ctx: &mut ProcessingContext<'_>| -> anyhow::Result<()> { Ok(()) },
        )
        .unwrap();
    runtime
        .set_error_handler(&topic_name, Box::new(|_, _| ErrorAction::Skip))
        .unwrap();
    let shutdown_handle = runtime.shutdown_handle();
    let runtime_thread = std::thread::spawn(move || runtime.run().unwrap());
    wait_for_committed_offset(&consumer_group, &topic_name, 0, 3);
    shutdown_handle.shutdown();
    let counters = runtime_thread.join().unwrap();

    // The malformed record never reached the pipeline, yet its offset was
    // committed along with its neighbors.
    assert_eq!(counters.num_records_processed, 2);
    assert_eq!(counters.num_records_skipped, 1);
    assert_eq!(counters.num_pipeline_errors, 0);
}
