//! Graph construction and single-rank execution.

use std::sync::{Arc, Mutex};

use keyflow_dataflow::prelude::*;

type Results<K, V> = Arc<Mutex<Vec<(K, V)>>>;

fn single_rank_world() -> World {
    let _ = tracing_subscriber::fmt::try_init();
    World::new(WorldConfig {
        workers: 2,
        transport: TransportConfig::Local,
    })
    .expect("local world")
}

/// A sink that records everything it receives.
fn sink(world: &World, name: &str) -> (Op<i64, (Read<i64>,), ()>, Results<i64, i64>) {
    let results: Results<i64, i64> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&results);
    let op = Op::new(
        world,
        name,
        &["value"],
        &[],
        move |key: &i64, (value,): (&i64,), _outs: &()| {
            captured.lock().unwrap().push((*key, *value));
            Ok(())
        },
    )
    .expect("sink op");
    (op, results)
}

fn counter_op(world: &World) -> Op<i64, (Read<i64>,), (Out<i64, i64>, Out<i64, i64>)> {
    Op::new(
        world,
        "counter",
        &["value"],
        &["result", "next"],
        |key: &i64, (value,): (&i64,), outs: &(Out<i64, i64>, Out<i64, i64>)| {
            if *value >= 100 {
                outs.0.send(*key, *value)
            } else {
                outs.1.send(*key + 1, *value + 1)
            }
        },
    )
    .expect("counter op")
}

#[test]
fn self_loop_fires_result_exactly_once() -> KeyflowResult<()> {
    let world = single_rank_world();
    let counter = counter_op(&world);
    let (sink, results) = sink(&world, "sink");

    Edge::new("next").connect(&counter.outputs().1, &counter.inputs().0)?;
    Edge::new("result").connect(&counter.outputs().0, &sink.inputs().0)?;
    counter.make_executable()?;
    sink.make_executable()?;

    world.execute()?;
    counter.invoke(0, (0,))?;
    world.fence()?;

    assert_eq!(*results.lock().unwrap(), vec![(100, 100)]);
    world.finalize()
}

#[test]
fn void_key_pipeline_reaches_consumer() -> KeyflowResult<()> {
    let world = single_rank_world();

    let producer: Op<(), (), (Out<i64, i64>,)> = Op::new(
        &world,
        "producer",
        &[],
        &["seed"],
        |_key: &(), _ins: (), outs: &(Out<i64, i64>,)| outs.0.send(0, 0),
    )?;
    let counter = counter_op(&world);
    let (consumer, results) = sink(&world, "consumer");

    Edge::new("seed").connect(&producer.outputs().0, &counter.inputs().0)?;
    Edge::new("next").connect(&counter.outputs().1, &counter.inputs().0)?;
    Edge::new("result").connect(&counter.outputs().0, &consumer.inputs().0)?;
    producer.make_executable()?;
    counter.make_executable()?;
    consumer.make_executable()?;

    world.execute()?;
    producer.invoke((), ())?;
    world.fence()?;

    assert_eq!(*results.lock().unwrap(), vec![(100, 100)]);
    world.finalize()
}

#[test]
fn terminal_name_arity_is_checked() {
    let world = single_rank_world();
    let result: KeyflowResult<Op<i64, (Read<i64>,), ()>> = Op::new(
        &world,
        "bad",
        &[],
        &[],
        |_key: &i64, (_value,): (&i64,), _outs: &()| Ok(()),
    );
    assert!(matches!(
        result,
        Err(KeyflowError::TerminalNameArity { expected: 1, got: 0, .. })
    ));
}

#[test]
fn unterminated_output_fails_at_make_executable() {
    let world = single_rank_world();
    let op: Op<i64, (), (Out<i64, i64>,)> = Op::new(
        &world,
        "dangling",
        &[],
        &["out"],
        |_key: &i64, _ins: (), outs: &(Out<i64, i64>,)| outs.0.send(0, 0),
    )
    .unwrap();
    assert!(matches!(
        op.make_executable(),
        Err(KeyflowError::UnterminatedOutput { .. })
    ));
}

#[test]
fn wiring_is_frozen_after_make_executable() -> KeyflowResult<()> {
    let world = single_rank_world();
    let producer: Op<(), (), (Out<i64, i64>,)> = Op::new(
        &world,
        "producer",
        &[],
        &["out"],
        |_key: &(), _ins: (), outs: &(Out<i64, i64>,)| outs.0.send(0, 1),
    )?;
    let (sink, _results) = sink(&world, "sink");
    let edge = Edge::new("out");
    edge.connect(&producer.outputs().0, &sink.inputs().0)?;
    producer.make_executable()?;

    assert!(matches!(
        edge.connect(&producer.outputs().0, &sink.inputs().0),
        Err(KeyflowError::WiringFrozen { .. })
    ));
    Ok(())
}

#[test]
fn invoke_requires_executable_and_executing() -> KeyflowResult<()> {
    let world = single_rank_world();
    let (sink, _results) = sink(&world, "sink");

    assert!(matches!(
        sink.invoke(1, (1,)),
        Err(KeyflowError::NotExecutable { .. })
    ));

    sink.make_executable()?;
    assert!(matches!(sink.invoke(1, (1,)), Err(KeyflowError::NotExecuting)));

    world.execute()?;
    sink.invoke(1, (1,))?;
    world.fence()?;
    world.finalize()
}

#[test]
fn double_set_of_non_stream_input_is_an_error() -> KeyflowResult<()> {
    let world = single_rank_world();
    let results: Results<i64, i64> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&results);
    let pair: Op<i64, (Read<i64>, Read<i64>), ()> = Op::new(
        &world,
        "pair",
        &["left", "right"],
        &[],
        move |key: &i64, (left, right): (&i64, &i64), _outs: &()| {
            captured.lock().unwrap().push((*key, left + right));
            Ok(())
        },
    )?;
    pair.make_executable()?;
    world.execute()?;

    pair.inputs().0.send_move(&9, 5)?;
    assert!(matches!(
        pair.inputs().0.send_move(&9, 6),
        Err(KeyflowError::InputAlreadySet { input: 0, .. })
    ));

    // Complete the task so the fence can drain.
    pair.inputs().1.send_move(&9, 7)?;
    world.fence()?;
    assert_eq!(*results.lock().unwrap(), vec![(9, 12)]);
    world.finalize()
}

#[test]
fn input_binding_is_order_insensitive() -> KeyflowResult<()> {
    // Present the same multiset of (slot, value) arrivals in every order;
    // the body must observe the same inputs each time.
    let deliveries: [(usize, i64); 3] = [(0, 10), (1, 20), (2, 30)];
    let orders: &[[usize; 3]] = &[
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    let mut observed: Vec<(i64, i64, i64)> = Vec::new();
    for order in orders {
        let world = single_rank_world();
        let results: Arc<Mutex<Vec<(i64, i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&results);
        let gather: Op<i64, (Read<i64>, Read<i64>, Read<i64>), ()> = Op::new(
            &world,
            "gather",
            &["a", "b", "c"],
            &[],
            move |_key: &i64, (a, b, c): (&i64, &i64, &i64), _outs: &()| {
                captured.lock().unwrap().push((*a, *b, *c));
                Ok(())
            },
        )?;
        gather.make_executable()?;
        world.execute()?;

        for &index in order {
            let (slot, value) = deliveries[index];
            match slot {
                0 => gather.inputs().0.send_move(&1, value)?,
                1 => gather.inputs().1.send_move(&1, value)?,
                _ => gather.inputs().2.send_move(&1, value)?,
            }
        }
        world.fence()?;

        let runs = results.lock().unwrap();
        assert_eq!(runs.len(), 1, "body runs exactly once per order");
        observed.push(runs[0]);
        world.finalize()?;
    }

    assert!(observed.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(observed[0], (10, 20, 30));
    Ok(())
}

#[test]
fn writer_mutation_is_invisible_to_readers() -> KeyflowResult<()> {
    let world = single_rank_world();

    // source -> relay, which forwards one value to both a mutating consumer
    // and a read-only consumer. The mutation must never be observed by the
    // read-only path.
    let relay: Op<i64, (Read<i64>,), (Out<i64, i64>, Out<i64, i64>)> = Op::new(
        &world,
        "relay",
        &["value"],
        &["mutating", "reading"],
        |key: &i64, (value,): (&i64,), outs: &(Out<i64, i64>, Out<i64, i64>)| {
            outs.0.send_ref(key, value)?;
            outs.1.send_ref(key, value)
        },
    )?;

    let mutated: Results<i64, i64> = Arc::new(Mutex::new(Vec::new()));
    let mutated_captured = Arc::clone(&mutated);
    let mutator: Op<i64, (Write<i64>,), ()> = Op::new(
        &world,
        "mutator",
        &["value"],
        &[],
        move |key: &i64, (value,): (&mut i64,), _outs: &()| {
            *value += 1000;
            mutated_captured.lock().unwrap().push((*key, *value));
            Ok(())
        },
    )?;

    let (reader, read_results) = sink(&world, "reader");

    Edge::new("mutating").connect(&relay.outputs().0, &mutator.inputs().0)?;
    Edge::new("reading").connect(&relay.outputs().1, &reader.inputs().0)?;
    relay.make_executable()?;
    mutator.make_executable()?;
    reader.make_executable()?;

    world.execute()?;
    relay.invoke(3, (7,))?;
    world.fence()?;

    assert_eq!(*mutated.lock().unwrap(), vec![(3, 1007)]);
    assert_eq!(*read_results.lock().unwrap(), vec![(3, 7)]);
    world.finalize()
}
