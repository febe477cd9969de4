use stress_test::{stress_concurrent_writers, stress_observer_backpressure};

use pds_core::clock::WriterId;
use pds_evict::{EvictionConfig, EvictionManager, EvictionPolicy, SweepCancelToken};
use pds_live::{ObserverConfig, ObserverPipeline};
use pds_query::{Params, QueryExecutor, QueryOutcome};
use pds_store::{DocumentId, DocumentStore, StoreConfig};
use pds_sync::{PeerId, ReplicationManager, SubscriptionManager, SyncConfig};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async_main());
}

async fn async_main() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║        PERIDOT DEMO: three peers in a line topology        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    line_topology_demo().await;

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                      STRESS TESTS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    let stats = stress_concurrent_writers(4, 200, 3).await;
    stats.print();
    let stats = stress_observer_backpressure(5_000).await;
    stats.print();

    println!("\n✓ Demo complete");
}

struct Peer {
    id: PeerId,
    store: Arc<DocumentStore>,
    subs: Arc<SubscriptionManager>,
    manager: ReplicationManager,
    exec: QueryExecutor,
}

fn peer(name: &str) -> Peer {
    let store = Arc::new(DocumentStore::new(
        WriterId::new(name),
        StoreConfig::default(),
    ));
    let subs = Arc::new(SubscriptionManager::new());
    let manager = ReplicationManager::new(store.clone(), subs.clone(), SyncConfig::default());
    Peer {
        id: PeerId::new(name),
        store: store.clone(),
        subs,
        manager,
        exec: QueryExecutor::new(store),
    }
}

/// Handshake two peers and exchange deltas until quiescent.
fn sync_pair(a: &Peer, b: &Peer) {
    a.manager.peer_connected(b.id.clone());
    b.manager.peer_connected(a.id.clone());

    // Handshake: hello both ways, responses chased to quiescence
    let mut to_b = vec![a.manager.hello_frame().expect("hello frame")];
    let mut to_a = vec![b.manager.hello_frame().expect("hello frame")];
    while !to_a.is_empty() || !to_b.is_empty() {
        let mut next_to_a = Vec::new();
        let mut next_to_b = Vec::new();
        for frame in to_b.drain(..) {
            next_to_a.extend(b.manager.ingest(&a.id, &frame).expect("ingest"));
        }
        for frame in to_a.drain(..) {
            next_to_b.extend(a.manager.ingest(&b.id, &frame).expect("ingest"));
        }
        to_a = next_to_a;
        to_b = next_to_b;
    }

    // Delta exchange until both sides have nothing left to send
    loop {
        let mut moved = false;
        if let Some(frame) = a.manager.produce_frame_for(&b.id).expect("produce") {
            moved = true;
            let mut frames = b.manager.ingest(&a.id, &frame).expect("ingest");
            while let Some(frame) = frames.pop() {
                frames.extend(a.manager.ingest(&b.id, &frame).expect("ingest"));
            }
        }
        if let Some(frame) = b.manager.produce_frame_for(&a.id).expect("produce") {
            moved = true;
            let mut frames = a.manager.ingest(&b.id, &frame).expect("ingest");
            while let Some(frame) = frames.pop() {
                frames.extend(b.manager.ingest(&a.id, &frame).expect("ingest"));
            }
        }
        if !moved {
            break;
        }
    }
}

async fn line_topology_demo() {
    let alice = peer("alice");
    let bob = peer("bob");
    let carol = peer("carol");

    // Everyone wants the orders collection; tombstoned documents are
    // stored and relayed like any others
    let _subs: Vec<_> = [&alice, &bob, &carol]
        .iter()
        .map(|p| {
            p.subs
                .register_select("SELECT * FROM orders", Params::new())
                .expect("subscription")
        })
        .collect();

    // Carol watches the collection live
    let pipeline = ObserverPipeline::new(carol.exec.clone(), ObserverConfig::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _observer = pipeline
        .register_observer(
            "SELECT * FROM orders ORDER BY total DESC",
            Params::new(),
            Box::new(move |snapshot, credit| {
                let rows: Vec<_> = snapshot.iter().filter_map(|c| c.materialize()).collect();
                let _ = tx.send(rows);
                credit.grant();
            }),
        )
        .expect("observer");

    // Alice writes, the line topology relays alice -> bob -> carol
    alice
        .exec
        .execute(
            "INSERT INTO orders DOCUMENTS \
             {_id: 'o1', status: 'pending', total: 40}, \
             {_id: 'o2', status: 'pending', total: 15}",
            &Params::new(),
        )
        .expect("insert");
    alice
        .exec
        .execute(
            "UPDATE orders SET status = 'shipped' WHERE _id = 'o1'",
            &Params::new(),
        )
        .expect("update");

    sync_pair(&alice, &bob);
    sync_pair(&bob, &carol);

    println!("\ncarol's view after relay:");
    if let QueryOutcome::Rows(rows) = carol
        .exec
        .execute("SELECT * FROM orders ORDER BY total DESC", &Params::new())
        .expect("select")
        .outcome
    {
        for row in &rows {
            println!("  {row}");
        }
    }

    // Soft-delete at alice; the tombstone must reach carol through bob
    alice
        .exec
        .execute(
            "UPDATE orders SET _deleted = TRUE WHERE _id = 'o2'",
            &Params::new(),
        )
        .expect("soft delete");
    sync_pair(&alice, &bob);
    sync_pair(&bob, &carol);

    let visible = match carol
        .exec
        .execute("SELECT * FROM orders", &Params::new())
        .expect("select")
        .outcome
    {
        QueryOutcome::Rows(rows) => rows.len(),
        _ => 0,
    };
    let stored = carol
        .store
        .snapshot("orders", &DocumentId::text("o2"))
        .is_some();
    println!("\nafter tombstone relay: carol sees {visible} order(s), o2 stored={stored}");

    // Drain observer deliveries
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut last = None;
    while let Ok(rows) = rx.try_recv() {
        last = Some(rows);
    }
    if let Some(rows) = last {
        println!("observer's latest snapshot: {} row(s)", rows.len());
    }

    // Evict the shipped order from bob's local storage only
    let evictor = EvictionManager::new(
        bob.exec.clone(),
        bob.subs.clone(),
        EvictionConfig {
            min_sweep_interval: Duration::from_secs(0),
            chunk_limit: 100,
        },
    );
    let policy = EvictionPolicy::FlagBased {
        collection: "orders".into(),
        flag_field: "status_is_final".into(),
    };
    bob.exec
        .execute(
            "UPDATE orders SET status_is_final = TRUE WHERE status = 'shipped'",
            &Params::new(),
        )
        .expect("flag");
    let stats = evictor
        .run_sweep(&policy, &SweepCancelToken::new())
        .expect("sweep");
    println!(
        "\nbob evicted {} document(s) locally in {} chunk(s); alice still has {}",
        stats.evicted,
        stats.chunks,
        alice.store.len()
    );
}
