//! End-to-end statement tests against a live store.

use pds_core::clock::WriterId;
use pds_query::{Params, QueryExecutor, QueryOutcome};
use pds_store::{DocumentStore, StoreConfig};
use std::sync::Arc;

fn executor() -> QueryExecutor {
    let store = Arc::new(DocumentStore::new(
        WriterId::new("local"),
        StoreConfig::default(),
    ));
    QueryExecutor::new(store)
}

fn rows(exec: &QueryExecutor, src: &str) -> Vec<serde_json::Value> {
    match exec.execute(src, &Params::new()).unwrap().outcome {
        QueryOutcome::Rows(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    }
}

fn count(exec: &QueryExecutor, src: &str) -> usize {
    match exec.execute(src, &Params::new()).unwrap().outcome {
        QueryOutcome::Count(n) => n,
        other => panic!("expected count, got {other:?}"),
    }
}

fn seed_orders(exec: &QueryExecutor) {
    count(
        exec,
        "INSERT INTO orders DOCUMENTS \
         {_id: 'o1', status: 'pending', total: 40, region: 'eu'}, \
         {_id: 'o2', status: 'shipped', total: 10, region: 'eu'}, \
         {_id: 'o3', status: 'pending', total: 25, region: 'us'}",
    );
}

#[test]
fn test_insert_and_select() {
    let exec = executor();
    seed_orders(&exec);

    let rows = rows(&exec, "SELECT * FROM orders WHERE status = 'pending' ORDER BY total");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["_id"], "o3");
    assert_eq!(rows[1]["_id"], "o1");
}

#[test]
fn test_projection_and_pagination() {
    let exec = executor();
    seed_orders(&exec);

    let rows = rows(
        &exec,
        "SELECT status FROM orders ORDER BY total DESC LIMIT 2 OFFSET 1",
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["status"], "pending");
    assert_eq!(rows[1]["status"], "shipped");
}

#[test]
fn test_insert_conflict_fail_is_default() {
    let exec = executor();
    seed_orders(&exec);

    let err = exec
        .execute(
            "INSERT INTO orders DOCUMENTS {_id: 'o1', status: 'dup'}",
            &Params::new(),
        )
        .unwrap_err();
    assert!(matches!(err, pds_query::QueryError::ConflictPolicy(_)));

    // DO NOTHING leaves the original untouched
    assert_eq!(
        count(
            &exec,
            "INSERT INTO orders DOCUMENTS {_id: 'o1', status: 'dup'} ON ID CONFLICT DO NOTHING"
        ),
        0
    );
    let rows = rows(&exec, "SELECT status FROM orders WHERE _id = 'o1'");
    assert_eq!(rows[0]["status"], "pending");
}

#[test]
fn test_update_local_diff_identical_is_zero_delta() {
    let exec = executor();
    seed_orders(&exec);
    let head = exec.store().log_head();

    // Re-inserting the identical document must produce no outgoing delta
    let n = count(
        &exec,
        "INSERT INTO orders DOCUMENTS \
         {_id: 'o1', status: 'pending', total: 40, region: 'eu'} \
         ON ID CONFLICT DO UPDATE_LOCAL_DIFF",
    );
    assert_eq!(n, 0);
    assert_eq!(exec.store().log_head(), head);
}

#[test]
fn test_update_local_diff_touches_only_changed_field() {
    let exec = executor();
    seed_orders(&exec);
    let head = exec.store().log_head();

    let n = count(
        &exec,
        "INSERT INTO orders DOCUMENTS \
         {_id: 'o1', status: 'paid', total: 40, region: 'eu'} \
         ON ID CONFLICT DO UPDATE_LOCAL_DIFF",
    );
    assert_eq!(n, 1);

    let log = exec.store().log_since(head);
    assert_eq!(log.len(), 1);
    // Only the changed field is in the delta
    assert_eq!(log[0].delta.fields.len(), 1);
    assert_eq!(log[0].delta.fields[0].0.to_string(), "status");
}

#[test]
fn test_conflict_do_update_always_emits() {
    let exec = executor();
    seed_orders(&exec);
    let head = exec.store().log_head();

    let n = count(
        &exec,
        "INSERT INTO orders DOCUMENTS \
         {_id: 'o1', status: 'pending', total: 40, region: 'eu'} \
         ON ID CONFLICT DO UPDATE",
    );
    assert_eq!(n, 1);
    let log = exec.store().log_since(head);
    assert_eq!(log.len(), 1);
    // All fields merged, even unchanged ones
    assert_eq!(log[0].delta.fields.len(), 3);
}

#[test]
fn test_field_level_update() {
    let exec = executor();
    seed_orders(&exec);

    let n = count(
        &exec,
        "UPDATE orders SET status = 'closed' WHERE region = 'eu'",
    );
    assert_eq!(n, 2);

    let remaining = rows(&exec, "SELECT * FROM orders WHERE status = 'pending'");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["_id"], "o3");
}

#[test]
fn test_counter_adjust_and_restart() {
    let exec = executor();
    count(&exec, "INSERT INTO stock DOCUMENTS {_id: 's1', qty: PNCOUNTER(10)}");

    count(&exec, "UPDATE stock SET qty = qty + 5 WHERE _id = 's1'");
    count(&exec, "UPDATE stock SET qty = qty - 2 WHERE _id = 's1'");
    let r = rows(&exec, "SELECT qty FROM stock WHERE _id = 's1'");
    assert_eq!(r[0]["qty"], 13);

    count(&exec, "UPDATE stock SET RESTART qty TO 100 WHERE _id = 's1'");
    count(&exec, "UPDATE stock SET qty = qty + 1 WHERE _id = 's1'");
    let r = rows(&exec, "SELECT qty FROM stock WHERE _id = 's1'");
    assert_eq!(r[0]["qty"], 101);
}

#[test]
fn test_nested_paths() {
    let exec = executor();
    count(
        &exec,
        "INSERT INTO orders DOCUMENTS {_id: 'o1', shipping: {city: 'Lisbon', zip: '1100'}}",
    );
    count(
        &exec,
        "UPDATE orders SET shipping.city = 'Porto' WHERE _id = 'o1'",
    );

    let r = rows(&exec, "SELECT shipping.city FROM orders WHERE _id = 'o1'");
    assert_eq!(r[0]["shipping.city"], "Porto");
    // The sibling field survived the nested update
    let r = rows(&exec, "SELECT shipping.zip FROM orders WHERE _id = 'o1'");
    assert_eq!(r[0]["shipping.zip"], "1100");
}

#[test]
fn test_aggregates_and_group_by() {
    let exec = executor();
    seed_orders(&exec);

    let r = rows(&exec, "SELECT COUNT(*), SUM(total), AVG(total) FROM orders");
    assert_eq!(r.len(), 1);
    assert_eq!(r[0]["COUNT(*)"], 3);
    assert_eq!(r[0]["SUM(total)"], 75);
    assert_eq!(r[0]["AVG(total)"], 25.0);

    let r = rows(
        &exec,
        "SELECT COUNT(*), MAX(total) FROM orders GROUP BY region",
    );
    assert_eq!(r.len(), 2);
    assert_eq!(r[0]["region"], "eu");
    assert_eq!(r[0]["COUNT(*)"], 2);
    assert_eq!(r[0]["MAX(total)"], 40);
    assert_eq!(r[1]["region"], "us");
}

#[test]
fn test_aggregate_predicate_applied_before_buffering() {
    let exec = executor();
    seed_orders(&exec);

    let r = rows(&exec, "SELECT SUM(total) FROM orders WHERE region = 'eu'");
    assert_eq!(r[0]["SUM(total)"], 50);
}

#[test]
fn test_distinct_on_id_is_noop() {
    let exec = executor();
    seed_orders(&exec);

    let result = exec
        .execute("SELECT DISTINCT _id FROM orders", &Params::new())
        .unwrap();
    assert!(result.stats.distinct_noop);

    // DISTINCT on a non-unique field still dedups
    let result = exec
        .execute("SELECT DISTINCT region FROM orders", &Params::new())
        .unwrap();
    assert!(!result.stats.distinct_noop);
    let QueryOutcome::Rows(rows) = result.outcome else {
        panic!()
    };
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_type_mismatch_is_per_document_skip() {
    let exec = executor();
    count(
        &exec,
        "INSERT INTO mixed DOCUMENTS {_id: 'a', v: 10}, {_id: 'b', v: 'text'}, {_id: 'c', v: 30}",
    );

    let result = exec
        .execute("SELECT * FROM mixed WHERE v > 5", &Params::new())
        .unwrap();
    let QueryOutcome::Rows(rows) = result.outcome else {
        panic!()
    };
    // The string-valued document is skipped, not fatal
    assert_eq!(rows.len(), 2);
    assert_eq!(result.stats.skipped_type_mismatch, 1);

    // With a type guard the mismatch is filtered silently
    let result = exec
        .execute(
            "SELECT * FROM mixed WHERE v IS NUMBER AND v > 5",
            &Params::new(),
        )
        .unwrap();
    assert_eq!(result.stats.skipped_type_mismatch, 0);
}

#[test]
fn test_params_positional_and_named() {
    let exec = executor();
    seed_orders(&exec);

    let params = Params::new().push("pending").set("cap", 30i64);
    let result = exec
        .execute(
            "SELECT * FROM orders WHERE status = ?1 AND total < $cap",
            &params,
        )
        .unwrap();
    let QueryOutcome::Rows(rows) = result.outcome else {
        panic!()
    };
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], "o3");
}

#[test]
fn test_composite_ids() {
    let exec = executor();
    count(
        &exec,
        "INSERT INTO shards DOCUMENTS {_id: {region: 'eu', seq: 7}, load: 3}",
    );

    let r = rows(&exec, "SELECT * FROM shards WHERE region = 'eu'");
    assert_eq!(r.len(), 1);
    assert_eq!(r[0]["seq"], 7);
    assert_eq!(r[0]["load"], 3);
}

#[test]
fn test_soft_delete_hidden_from_ad_hoc_reads() {
    let exec = executor();
    seed_orders(&exec);

    count(&exec, "UPDATE orders SET _deleted = TRUE WHERE _id = 'o2'");
    // Hidden from a plain read...
    assert_eq!(rows(&exec, "SELECT * FROM orders").len(), 2);
    // ...but reachable when the predicate names the tombstone field
    assert_eq!(
        rows(&exec, "SELECT * FROM orders WHERE _deleted = TRUE").len(),
        1
    );
}

#[test]
fn test_evict_is_local_only() {
    let exec = executor();
    seed_orders(&exec);
    let head = exec.store().log_head();

    let n = count(&exec, "EVICT FROM orders WHERE region = 'eu'");
    assert_eq!(n, 2);
    assert_eq!(exec.store().len(), 1);
    // No tombstone merge, no delta: the replication log did not move
    assert_eq!(exec.store().log_head(), head);
}

#[test]
fn test_evict_respects_limit() {
    let exec = executor();
    seed_orders(&exec);

    let n = count(&exec, "EVICT FROM orders WHERE total > 0 LIMIT 2");
    assert_eq!(n, 2);
    assert_eq!(exec.store().len(), 1);
}

#[test]
fn test_exists_early_exit() {
    let exec = executor();
    seed_orders(&exec);

    let stmt = pds_query::parse_statement("SELECT * FROM orders WHERE region = 'eu'").unwrap();
    let pds_query::Statement::Select(select) = stmt else {
        panic!()
    };
    assert!(exec
        .exists("orders", select.predicate.as_ref(), &Params::new())
        .unwrap());

    let stmt = pds_query::parse_statement("SELECT * FROM orders WHERE region = 'sa'").unwrap();
    let pds_query::Statement::Select(select) = stmt else {
        panic!()
    };
    assert!(!exec
        .exists("orders", select.predicate.as_ref(), &Params::new())
        .unwrap());
}

#[test]
fn test_scenario_concurrent_nonconflicting_fields() {
    // Two peers edit different fields of one document; both application
    // orders converge to the same final state.
    let store_a = Arc::new(DocumentStore::new(
        WriterId::new("a"),
        StoreConfig::default(),
    ));
    let store_b = Arc::new(DocumentStore::new(
        WriterId::new("b"),
        StoreConfig::default(),
    ));
    let exec_a = QueryExecutor::new(store_a.clone());
    let exec_b = QueryExecutor::new(store_b.clone());

    count(&exec_a, "INSERT INTO orders DOCUMENTS {_id: 'o1', status: 'pending'}");
    // Ship the insert to B
    for entry in store_a.log_since(0) {
        store_b.apply(&entry.delta).unwrap();
    }
    let b_base = store_b.log_head();

    // A ships the status, B sets the total, concurrently
    let a_base = store_a.log_head();
    count(&exec_a, "UPDATE orders SET status = 'shipped' WHERE _id = 'o1'");
    count(&exec_b, "UPDATE orders SET total = 42 WHERE _id = 'o1'");

    let from_a = store_a.log_since(a_base);
    let from_b = store_b.log_since(b_base);

    // Opposite delivery orders
    for entry in &from_b {
        store_a.apply(&entry.delta).unwrap();
    }
    for entry in &from_a {
        store_b.apply(&entry.delta).unwrap();
    }

    let rows_a = rows(&exec_a, "SELECT * FROM orders WHERE _id = 'o1'");
    let rows_b = rows(&exec_b, "SELECT * FROM orders WHERE _id = 'o1'");
    assert_eq!(rows_a, rows_b);
    assert_eq!(rows_a[0]["status"], "shipped");
    assert_eq!(rows_a[0]["total"], 42);
}
