//! Property tests over the pool and object round trips

mod common;

use proptest::prelude::*;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;

use common::{sample_loader, SAMPLE};
use tandem_config::{ConcurrencyConfig, ExecutionSettings, PartialConcurrencyConfig};
use tandem_execution::{Master, ThreadPool};
use tandem_runtime::InlineWorkerFactory;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Scalar values, weighted towards the zero value of each kind
fn scalar() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        Just(JsonValue::Null),
        Just(json!(0)),
        Just(json!(false)),
        Just(json!("")),
        Just(json!([])),
        Just(json!({})),
        any::<i64>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(|b| json!(b)),
        "[a-z0-9 ]{0,12}".prop_map(|s| json!(s)),
    ]
}

fn value() -> impl Strategy<Value = JsonValue> {
    scalar().prop_recursive(2, 8, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|fields| JsonValue::Object(fields.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_round_robin_period(max_threads in 1usize..5, calls in 1usize..16) {
        let ids = runtime().block_on(async {
            let factory = Arc::new(InlineWorkerFactory::new(sample_loader()));
            let pool = ThreadPool::new(factory, ConcurrencyConfig {
                max_threads,
                ..ConcurrencyConfig::default()
            }).unwrap();

            let mut ids = Vec::new();
            for _ in 0..calls {
                ids.push(pool.get_thread(false).await.unwrap().id());
            }
            prop_assert!(pool.thread_count() <= max_threads);
            pool.terminate(true).await;
            Ok(ids)
        })?;

        for (turn, id) in ids.iter().enumerate() {
            prop_assert_eq!(*id, ids[turn % max_threads]);
        }
        let distinct: std::collections::BTreeSet<_> = ids.iter().collect();
        prop_assert_eq!(distinct.len(), calls.min(max_threads));
    }

    #[test]
    fn prop_object_fields_round_trip(
        initial in prop::collection::vec(scalar(), 1..6),
        updates in prop::collection::vec(value(), 1..6),
    ) {
        let fields: Map<String, JsonValue> = initial
            .iter()
            .enumerate()
            .map(|(i, value)| (format!("f{}", i), value.clone()))
            .collect();

        let (read_back, expected) = runtime().block_on(async {
            let master = Master::new(sample_loader());
            master
                .config(&PartialConcurrencyConfig::default().disabled(true))
                .unwrap();
            let module = master.load(SAMPLE, ExecutionSettings::default()).await.unwrap();
            let record = module
                .export("Record")
                .unwrap()
                .construct(vec![JsonValue::Object(fields.clone())])
                .await
                .unwrap();

            let mut expected = Vec::new();
            for (i, name) in fields.keys().enumerate() {
                let value = updates[i % updates.len()].clone();
                record.set(name, value.clone()).unwrap().wait().await.unwrap();
                expected.push(value);
            }

            let mut read_back = Vec::new();
            for name in fields.keys() {
                read_back.push(record.get(name).await.unwrap().into_ready());
            }
            record.dispose().await.unwrap();
            master.terminate(false).await;
            (read_back, expected)
        });

        let expected: Vec<_> = expected.into_iter().map(Some).collect();
        prop_assert_eq!(read_back, expected);
    }
}
