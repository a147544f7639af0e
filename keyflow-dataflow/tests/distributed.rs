//! Multi-rank behavior: bulk transfers, broadcast locality, out-of-order
//! arrival, and quiescence accounting.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use keyflow_comm::local::{LocalCluster, LocalComm};
use keyflow_comm::CommEngine;
use keyflow_comm::Tag;
use keyflow_data::{pack_into, unpack_from};
use keyflow_dataflow::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn fence_all(worlds: &[World]) {
    std::thread::scope(|scope| {
        for world in worlds {
            let world = world.clone();
            scope.spawn(move || world.fence().expect("fence"));
        }
    });
}

fn finalize_all(worlds: &[World]) {
    std::thread::scope(|scope| {
        for world in worlds {
            let world = world.clone();
            scope.spawn(move || world.finalize().expect("finalize"));
        }
    });
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A buffer value shipped through the split-metadata protocol: the length
/// travels inline, the payload moves as one bulk chunk.
#[derive(Clone, Serialize, Deserialize)]
struct Blob {
    bytes: Vec<u8>,
}

impl Value for Blob {
    const SPLIT_METADATA: bool = true;

    fn metadata(&self) -> KeyflowResult<Vec<u8>> {
        let mut buf = Vec::new();
        pack_into(&(self.bytes.len() as u64), &mut buf)?;
        Ok(buf)
    }

    fn from_metadata(metadata: &[u8]) -> KeyflowResult<Self> {
        let len: u64 = unpack_from(metadata)?;
        Ok(Blob {
            bytes: vec![0; len as usize],
        })
    }

    fn iovecs(&self) -> SmallVec<[&[u8]; 4]> {
        smallvec![&self.bytes[..]]
    }

    fn iovecs_mut(&mut self) -> SmallVec<[&mut [u8]; 4]> {
        smallvec![&mut self.bytes[..]]
    }
}

fn patterned_blob(len: usize) -> Blob {
    Blob {
        bytes: (0..len).map(|i| (i % 251) as u8).collect(),
    }
}

#[test]
fn split_metadata_bulk_transfer_is_byte_identical() {
    init_tracing();
    let worlds = World::local_cluster(2, 2);
    let mut results: Vec<Arc<Mutex<Vec<(u64, Blob)>>>> = Vec::new();
    let ops: Vec<Op<u64, (Read<Blob>,), ()>> = worlds
        .iter()
        .map(|world| {
            let captured: Arc<Mutex<Vec<(u64, Blob)>>> = Arc::new(Mutex::new(Vec::new()));
            results.push(Arc::clone(&captured));
            let op: Op<u64, (Read<Blob>,), ()> = Op::new(
                world,
                "consume",
                &["buffer"],
                &[],
                move |key: &u64, (blob,): (&Blob,), _outs: &()| {
                    captured.lock().unwrap().push((*key, blob.clone()));
                    Ok(())
                },
            )
            .expect("consume op");
            op.set_keymap(|key: &u64| (key % 2) as Rank);
            op.make_executable().expect("make_executable");
            op
        })
        .collect();
    for world in &worlds {
        world.execute().expect("execute");
    }

    // Key 1 is owned by rank 1; ship one megabyte from rank 0.
    let blob = patterned_blob(1 << 20);
    ops[0]
        .inputs()
        .0
        .send_move(&1, blob.clone())
        .expect("send");

    fence_all(&worlds);

    let received = results[1].lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, 1);
    assert_eq!(received[0].1.bytes, blob.bytes);
    assert!(results[0].lock().unwrap().is_empty());

    // Both sides must have released their transfer state before the fence
    // returned.
    assert_eq!(worlds[0].pending_rma_operations(), 0);
    assert_eq!(worlds[1].pending_rma_operations(), 0);
    drop(received);
    finalize_all(&worlds);
}

type Captured = Arc<Mutex<Vec<(u64, u64)>>>;

struct BroadcastGraph {
    feeder: Op<(), (), (Out<u64, u64>,)>,
    _target: Op<u64, (Read<u64>,), ()>,
    results: Captured,
}

fn broadcast_graph(world: &World, keys: &'static [u64]) -> BroadcastGraph {
    let size = world.size() as u64;
    let results: Captured = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&results);
    let target: Op<u64, (Read<u64>,), ()> = Op::new(
        world,
        "target",
        &["value"],
        &[],
        move |key: &u64, (value,): (&u64,), _outs: &()| {
            captured.lock().unwrap().push((*key, *value));
            Ok(())
        },
    )
    .expect("target op");
    target.set_keymap(move |key: &u64| (key % size) as Rank);

    let feeder: Op<(), (), (Out<u64, u64>,)> = Op::new(
        world,
        "feeder",
        &[],
        &["fanout"],
        move |_key: &(), _ins: (), outs: &(Out<u64, u64>,)| outs.0.broadcast(keys, &7),
    )
    .expect("feeder op");
    feeder.set_keymap(|_key: &()| 0);

    Edge::new("fanout")
        .connect(&feeder.outputs().0, &target.inputs().0)
        .expect("connect");
    feeder.make_executable().expect("make_executable");
    target.make_executable().expect("make_executable");
    BroadcastGraph {
        feeder,
        _target: target,
        results,
    }
}

#[test]
fn broadcast_sends_one_message_per_remote_rank() {
    init_tracing();
    let engines: Vec<Arc<LocalComm>> = LocalCluster::new(4);
    let worlds: Vec<World> = engines
        .iter()
        .map(|engine| World::with_engine(engine.clone(), 2))
        .collect();

    let graphs: Vec<BroadcastGraph> = worlds
        .iter()
        .map(|world| broadcast_graph(world, &[0, 1, 2, 3]))
        .collect();
    for world in &worlds {
        world.execute().expect("execute");
    }

    graphs[0].feeder.invoke((), ()).expect("invoke");
    fence_all(&worlds);

    // Exactly one active message to each non-local rank; local delivery
    // produces none.
    assert_eq!(engines[0].sent_to(0, Tag::Am), 0);
    for rank in 1..4 {
        assert_eq!(engines[0].sent_to(rank, Tag::Am), 1, "rank {rank}");
    }
    for engine in &engines[1..] {
        for rank in 0..4 {
            assert_eq!(engine.sent_to(rank, Tag::Am), 0);
        }
    }

    for (rank, graph) in graphs.iter().enumerate() {
        assert_eq!(
            *graph.results.lock().unwrap(),
            vec![(rank as u64, 7)],
            "rank {rank}"
        );
    }
    finalize_all(&worlds);
}

#[test]
fn early_message_is_stashed_and_replayed_on_registration() {
    init_tracing();
    let worlds = World::local_cluster(2, 2);

    let mut results: Vec<Captured> = Vec::new();
    let ops: Vec<Op<u64, (Read<u64>,), ()>> = worlds
        .iter()
        .map(|world| {
            let captured: Captured = Arc::new(Mutex::new(Vec::new()));
            results.push(Arc::clone(&captured));
            let op: Op<u64, (Read<u64>,), ()> = Op::new(
                world,
                "late",
                &["value"],
                &[],
                move |key: &u64, (value,): (&u64,), _outs: &()| {
                    captured.lock().unwrap().push((*key, *value));
                    Ok(())
                },
            )
            .expect("late op");
            op.set_keymap(|key: &u64| (key % 2) as Rank);
            op
        })
        .collect();
    for world in &worlds {
        world.execute().expect("execute");
    }

    // Rank 0 registers and sends; rank 1 has not registered yet, so the
    // message must be stashed by operator id.
    ops[0].make_executable().expect("make_executable");
    ops[0].inputs().0.send_move(&1, 42).expect("send");
    wait_until(|| worlds[1].stashed_messages() == 1);
    assert!(results[1].lock().unwrap().is_empty());

    // Registration replays the stash; the first invocation sees the
    // stashed input.
    ops[1].make_executable().expect("make_executable");
    assert_eq!(worlds[1].stashed_messages(), 0);

    fence_all(&worlds);
    assert_eq!(*results[1].lock().unwrap(), vec![(1, 42)]);
    finalize_all(&worlds);
}

#[test]
fn fence_leaves_counters_balanced() {
    init_tracing();
    let engines: Vec<Arc<LocalComm>> = LocalCluster::new(2);
    let worlds: Vec<World> = engines
        .iter()
        .map(|engine| World::with_engine(engine.clone(), 2))
        .collect();

    // A two-rank ping: rank 0 seeds a key owned by rank 1, whose body
    // answers back to a key owned by rank 0.
    let mut results: Vec<Captured> = Vec::new();
    let ops: Vec<Op<u64, (Read<u64>,), (Out<u64, u64>,)>> = worlds
        .iter()
        .map(|world| {
            let captured: Captured = Arc::new(Mutex::new(Vec::new()));
            results.push(Arc::clone(&captured));
            let op: Op<u64, (Read<u64>,), (Out<u64, u64>,)> = Op::new(
                world,
                "ping",
                &["value"],
                &["reply"],
                move |key: &u64, (value,): (&u64,), outs: &(Out<u64, u64>,)| {
                    captured.lock().unwrap().push((*key, *value));
                    if *key % 2 == 1 {
                        outs.0.send(key - 1, value + 1)
                    } else {
                        Ok(())
                    }
                },
            )
            .expect("ping op");
            op.set_keymap(|key: &u64| (key % 2) as Rank);
            let loopback = Edge::new("reply");
            loopback
                .connect(&op.outputs().0, &op.inputs().0)
                .expect("connect");
            op.make_executable().expect("make_executable");
            op
        })
        .collect();
    for world in &worlds {
        world.execute().expect("execute");
    }

    ops[0].inputs().0.send_move(&1, 10).expect("send");
    fence_all(&worlds);

    assert_eq!(*results[1].lock().unwrap(), vec![(1, 10)]);
    assert_eq!(*results[0].lock().unwrap(), vec![(0, 11)]);

    // Quiescence: every created task ran, and every data frame that was
    // sent has been received.
    for world in &worlds {
        let counts = world.task_counts();
        assert_eq!(counts.created, counts.scheduled);
        assert_eq!(counts.scheduled, counts.completed);
        assert_eq!(world.pending_rma_operations(), 0);
    }
    let sent: u64 = engines.iter().map(|e| e.stats().data_sent).sum();
    let received: u64 = engines.iter().map(|e| e.stats().data_received).sum();
    assert_eq!(sent, received);

    finalize_all(&worlds);
}
