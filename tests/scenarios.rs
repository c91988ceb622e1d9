//! End-to-end scenarios driven through the public engine surface.

use spindle::engine::{Engine, EngineConfig, Output};
use spindle::exemplar::assembler::ExemplarBuilder;
use spindle::exemplar::opcode::Opcode;
use spindle::exemplar::Exemplar;
use spindle::fiber::Fault;
use spindle::machine::Programs;
use spindle::runtime::value::{Condition, Value, ValueKind};
use spindle::scheduler::SchedulerError;
use spindle::Error;
use tracing_subscriber::filter::LevelFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn engine(programs: Programs) -> (Engine, Output) {
    initialize_tracing();
    let output = Output::captured();
    let engine = Engine::with_config(
        programs,
        EngineConfig::default().with_output(output.clone()),
    );
    (engine, output)
}

/// Emits `name = name + 1` for an instance variable.
fn increment(b: &mut ExemplarBuilder, name: &str) {
    b.get_self(name);
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.set_self(name);
}

fn print(b: &mut ExemplarBuilder, text: &str) {
    b.call_with("io.print", |b| b.push_string(text));
}

fn timer() -> Exemplar {
    let mut b = ExemplarBuilder::new("timer");
    let fired = b.new_label();
    b.state("start");
    b.call_with("time.after", |b| b.push_real(2.0));
    b.on(fired);
    b.end_state();
    b.label(fired);
    print(&mut b, "fired");
    b.end_sub();
    b.finish()
}

#[test]
fn simple_timer() {
    let (engine, output) = engine(Programs::new().with(timer()));
    engine.launch("timer").unwrap();
    assert_eq!(engine.context().pending_continuations(), 1);

    for _ in 0..3 {
        assert!(engine.update(0.5));
    }
    assert!(output.lines().is_empty());

    assert!(!engine.update(0.5));
    assert_eq!(output.lines(), ["fired"]);
    assert_eq!(engine.context().pending_continuations(), 0);

    for _ in 0..4 {
        engine.update(1.0);
    }
    assert_eq!(output.lines(), ["fired"]);
}

#[test]
fn shared_variables_are_visible_to_every_instance() {
    let mut b = ExemplarBuilder::new("counter");
    b.declare_shared("count", "int");
    b.declare_local("seen", "int");
    b.state("start");
    b.get_shared("count");
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.set_shared("count");
    b.get_shared("count");
    b.set_self("seen");
    b.end_state();
    let (engine, _) = engine(Programs::new().with(b.finish()));

    let first = engine.launch("counter").unwrap();
    let second = engine.launch("counter").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(first, "seen"),
        Some(&Value::Int(1))
    );
    assert_eq!(
        context.instance_variable(second, "seen"),
        Some(&Value::Int(2))
    );
    assert_eq!(
        context.shared_variable("counter", "count"),
        Some(&Value::Int(2))
    );
    assert_eq!(context.machines().len(), 1);
}

#[test]
fn goto_cancels_pending_waits() {
    let mut b = ExemplarBuilder::new("ticker");
    let tick = b.new_label();
    b.state("a");
    b.call_with("time.every", |b| b.push_real(1.0));
    b.on(tick);
    b.goto_state("b");
    b.state("b");
    b.end_state();
    b.label(tick);
    print(&mut b, "tick");
    b.end_sub();
    let (engine, output) = engine(Programs::new().with(b.finish()));

    let fiber = engine.launch("ticker").unwrap();
    assert_eq!(engine.context().pending_continuations(), 0);
    for _ in 0..10 {
        assert!(!engine.update(1.0));
    }
    assert!(output.lines().is_empty());
    assert_eq!(engine.context().fiber(fiber).unwrap().state(), 1);
}

#[test]
fn goto_cancels_pending_events() {
    let mut b = ExemplarBuilder::new("tracker");
    let moved = b.new_label();
    b.state("a");
    b.call_with("pointer.every", |b| b.push_string("move"));
    b.on(moved);
    b.goto_state("b");
    b.state("b");
    b.end_state();
    b.label(moved);
    print(&mut b, "moved");
    b.end_sub();
    let (engine, output) = engine(Programs::new().with(b.finish()));

    let fiber = engine.launch("tracker").unwrap();
    assert_eq!(engine.context().pending_continuations(), 0);
    for _ in 0..3 {
        engine.post_event("pointer", "move").unwrap();
        assert!(!engine.update(0.));
    }
    assert!(output.lines().is_empty());
    assert_eq!(engine.context().pending_continuations(), 0);
    assert_eq!(engine.context().fiber(fiber).unwrap().state(), 1);
}

#[test]
fn goto_from_a_continuation_cancels_its_siblings() {
    let mut b = ExemplarBuilder::new("switcher");
    let tick = b.new_label();
    let switch = b.new_label();
    b.state("a");
    b.call_with("time.every", |b| b.push_real(1.0));
    b.on(tick);
    b.call_with("time.after", |b| b.push_real(2.5));
    b.on(switch);
    b.end_state();
    b.label(tick);
    print(&mut b, "tick");
    b.end_sub();
    b.label(switch);
    b.goto_state("b");
    b.state("b");
    print(&mut b, "entered b");
    b.end_state();
    let (engine, output) = engine(Programs::new().with(b.finish()));

    engine.launch("switcher").unwrap();
    for _ in 0..6 {
        engine.update(1.0);
    }
    assert_eq!(output.lines(), ["tick", "tick", "entered b"]);
    assert_eq!(engine.context().pending_continuations(), 0);
}

#[test]
fn recurrence_counts() {
    let mut b = ExemplarBuilder::new("recurring");
    let counters = [("once", 0), ("twice", 1), ("four", 3), ("forever", -1)];
    let bodies = counters.map(|_| b.new_label());
    for (name, _) in counters {
        b.declare_local(name, "int");
    }
    b.state("start");
    for ((_, repeats), body) in counters.iter().zip(bodies) {
        b.call_with("time.recur", |b| {
            b.push_real(1.0);
            b.push_int(*repeats);
        });
        b.on(body);
    }
    b.end_state();
    for ((name, _), body) in counters.iter().zip(bodies) {
        b.label(body);
        increment(&mut b, name);
        b.end_sub();
    }
    let (engine, _) = engine(Programs::new().with(b.finish()));

    let fiber = engine.launch("recurring").unwrap();
    for _ in 0..20 {
        assert!(engine.update(1.0));
    }
    let context = engine.context();
    for (name, expected) in [("once", 1), ("twice", 2), ("four", 4), ("forever", 20)] {
        assert_eq!(
            context.instance_variable(fiber, name),
            Some(&Value::Int(expected)),
            "{name}"
        );
    }
    assert_eq!(context.pending_continuations(), 1);
}

#[test]
fn cancelling_a_continuation_cancels_its_children() {
    let mut b = ExemplarBuilder::new("nested");
    b.state("start");
    b.end_state();
    let late = b.address();
    print(&mut b, "late");
    b.end_sub();
    let (engine, output) = engine(Programs::new().with(b.finish()).with(crasher()));

    let fiber = engine.launch("nested").unwrap();
    let mut context = engine.context();
    let parent = context
        .register_continuation(None, fiber, &Condition::event("pointer", "down"), late)
        .unwrap();
    let child = context
        .register_ordered_continuation(Some(parent), fiber, 5.0, late, 0, 0.)
        .unwrap();
    context
        .register_ordered_continuation(Some(child), fiber, 6.0, late, 0, 0.)
        .unwrap();
    assert_eq!(context.pending_continuations(), 3);

    context.cancel_continuation(parent).unwrap();
    assert_eq!(context.pending_continuations(), 0);
    assert_eq!(
        context.cancel_continuation(parent),
        Err(SchedulerError::UnknownContinuation)
    );

    // Continuations cannot be registered for a fiber that no longer exists.
    let Err(Error::Execution(crashed)) = context.launch("crasher") else {
        unreachable!("crasher should fault")
    };
    assert_eq!(
        context.register_ordered_continuation(None, crashed.fiber, 1.0, 0, 0, 0.),
        Err(SchedulerError::UnknownFiber(crashed.fiber))
    );
    drop(context);

    for _ in 0..10 {
        engine.update(1.0);
    }
    assert!(output.lines().is_empty());
    assert!(engine.context().fiber(fiber).is_some());
}

#[test]
fn pointer_events() {
    let mut b = ExemplarBuilder::new("clicker");
    let down = b.new_label();
    let moved = b.new_label();
    b.declare_local("downs", "int");
    b.declare_local("moves", "int");
    b.state("start");
    b.call_with("pointer.down", |_| {});
    b.on(down);
    b.call_with("pointer.every", |b| b.push_string("move"));
    b.on(moved);
    b.end_state();
    b.label(down);
    increment(&mut b, "downs");
    b.end_sub();
    b.label(moved);
    increment(&mut b, "moves");
    b.end_sub();
    let (engine, _) = engine(Programs::new().with(b.finish()));

    let fiber = engine.launch("clicker").unwrap();
    engine.post_event("pointer", "up").unwrap();
    engine.post_event("pointer", "move").unwrap();
    engine.update(0.);
    engine.post_event("pointer", "down").unwrap();
    engine.post_event("pointer", "move").unwrap();
    engine.update(0.);
    engine.post_event("pointer", "down").unwrap();
    engine.update(0.);

    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "downs"),
        Some(&Value::Int(1))
    );
    assert_eq!(
        context.instance_variable(fiber, "moves"),
        Some(&Value::Int(2))
    );
    assert_eq!(context.pending_continuations(), 1);
    drop(context);

    assert!(engine.post_event("keyboard", "down").is_err());
    assert!(engine.post_event("time", "down").is_err());
}

fn worker() -> Exemplar {
    let mut b = ExemplarBuilder::new("worker");
    let body = b.new_label();
    b.declare_local("given", "int");
    b.state("start");
    b.get_frame(0);
    b.set_self("given");
    b.call_with("time.after", |b| b.push_real(1.0));
    b.on(body);
    b.end_state();
    b.label(body);
    b.call_with("io.print", |b| {
        b.get_self("given");
        b.call_with("main.alive", |_| {});
    });
    b.push_int(1);
    b.push_int(0);
    b.op(Opcode::OpDiv);
    b.end_sub();
    b.finish()
}

fn crasher() -> Exemplar {
    let mut b = ExemplarBuilder::new("crasher");
    b.state("start");
    b.push_nil();
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.end_state();
    b.finish()
}

fn parent() -> Exemplar {
    let mut b = ExemplarBuilder::new("parent");
    let body = b.new_label();
    for (name, ty) in [
        ("worker", "fiber"),
        ("crashed", "any"),
        ("seen", "int"),
        ("alive", "int"),
    ] {
        b.declare_local(name, ty);
    }
    b.state("start");
    b.launch("worker", |b| b.push_int(5));
    b.set_self("worker");
    b.call_with("worker.given", |_| {});
    b.set_self("seen");
    b.launch("crasher", |_| {});
    b.set_self("crashed");
    b.call_with("time.every", |b| b.push_real(1.0));
    b.on(body);
    b.end_state();
    b.label(body);
    increment(&mut b, "alive");
    b.end_sub();
    b.finish()
}

#[test]
fn faults_are_isolated_to_one_fiber() {
    let (engine, output) = engine(
        Programs::new()
            .with(parent())
            .with(worker())
            .with(crasher()),
    );

    let parent = engine.launch("parent").unwrap();
    {
        let context = engine.context();
        assert_eq!(context.faults().len(), 1);
        assert_eq!(context.faults()[0].machine, "crasher");
        assert_eq!(context.faults()[0].fault, Fault::ExpectedNumber);
        assert_eq!(
            context.instance_variable(parent, "crashed"),
            Some(&Value::Nil)
        );
        assert_eq!(
            context.instance_variable(parent, "seen"),
            Some(&Value::Int(5))
        );
        assert_eq!(
            context
                .instance_variable(parent, "worker")
                .map(Value::kind),
            Some(ValueKind::Fiber)
        );
        assert_eq!(context.fiber_count(), 2);
    }

    for _ in 0..3 {
        assert!(engine.update(1.0));
    }
    assert_eq!(output.lines(), ["5 0"]);
    let context = engine.context();
    assert_eq!(context.faults().len(), 2);
    assert_eq!(context.faults()[1].machine, "worker");
    assert_eq!(context.faults()[1].fault, Fault::DivideByZero);
    assert_eq!(
        context.instance_variable(parent, "alive"),
        Some(&Value::Int(3))
    );
    assert_eq!(context.fiber_count(), 1);
}

#[test]
fn unreferenced_fibers_are_reaped() {
    let mut b = ExemplarBuilder::new("spawner");
    b.declare_local("kept", "fiber");
    b.declare_local("alive", "int");
    b.state("start");
    b.launch("timer", |_| {});
    b.op(Opcode::Pop);
    b.launch("worker", |b| b.push_int(1));
    b.set_self("kept");
    b.end_state();
    let (engine, output) = engine(
        Programs::new()
            .with(b.finish())
            .with(timer())
            .with(worker()),
    );

    engine.launch("spawner").unwrap();
    // The timer's own continuation keeps it alive until it fires.
    assert_eq!(engine.context().fiber_count(), 3);
    engine.update(1.0);
    // The worker faulted after printing.
    assert_eq!(engine.context().fiber_count(), 2);
    engine.update(1.0);
    assert_eq!(output.lines(), ["1 0", "fired"]);
    let context = engine.context();
    assert_eq!(context.fiber_count(), 1);
    assert_eq!(context.pending_continuations(), 0);
}

#[test]
fn exemplars_round_trip_through_rsn() {
    let original = timer();
    let text = rsn::to_string_pretty(&original);
    let restored: Exemplar = rsn::parser::Config::default()
        .deserialize(&text)
        .unwrap();
    assert_eq!(restored, original);

    let (engine, output) = engine(Programs::new().with(restored));
    engine.launch("timer").unwrap();
    engine.update(2.0);
    assert_eq!(output.lines(), ["fired"]);
}
