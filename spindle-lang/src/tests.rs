use tracing_subscriber::filter::LevelFilter;

use crate::engine::{Engine, EngineConfig, Output};
use crate::exemplar::assembler::ExemplarBuilder;
use crate::exemplar::opcode::Opcode;
use crate::exemplar::{Exemplar, ExemplarError};
use crate::fiber::{Fault, FiberId, RunEnd};
use crate::machine::Programs;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::{Error, ErrorKind};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn engine(programs: Programs, config: EngineConfig) -> (Engine, Output) {
    initialize_tracing();
    let output = Output::captured();
    let engine = Engine::with_config(programs, config.with_output(output.clone()));
    (engine, output)
}

fn single(exemplar: Exemplar) -> (Engine, Output) {
    engine(Programs::new().with(exemplar), EngineConfig::default())
}

/// Returns the plain values of the array held by `fiber`'s variable `name`.
fn array_contents(engine: &Engine, fiber: FiberId, name: &str) -> Vec<String> {
    let context = engine.context();
    let Some(Value::Array(elements)) = context.instance_variable(fiber, name) else {
        panic!("{name} is not an array");
    };
    elements
        .iter()
        .map(|element| context.pool().display(context.pool().get(*element).unwrap()))
        .collect()
}

#[test]
fn params_collect_in_push_order() {
    let mut b = ExemplarBuilder::new("params");
    b.declare_local("args", "array");
    b.state("start");
    b.push_int(7);
    b.params(|b| {
        b.push_int(1);
        b.params(|b| b.push_string("two"));
        b.push_real(3.5);
    });
    b.set_self("args");
    b.suspend();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("params").unwrap();
    assert_eq!(array_contents(&engine, fiber, "args"), ["1", "[two]", "3.5"]);
    // Only the value pushed before the argument list remains.
    assert_eq!(engine.context().fiber(fiber).unwrap().stack_depth(), 1);
}

#[test]
fn params_end_without_start_underflows() {
    let mut b = ExemplarBuilder::new("unbalanced");
    b.state("start");
    b.push_int(1);
    let failing = b.address();
    b.op(Opcode::ParamsEnd);
    b.end_state();
    let (engine, _) = single(b.finish());

    let Err(Error::Execution(err)) = engine.launch("unbalanced") else {
        unreachable!("launch should fault")
    };
    assert_eq!(err.fault, Fault::StackUnderflow);
    assert_eq!(err.pc, failing);
    assert_eq!(err.machine, "unbalanced");
}

#[test]
fn arithmetic() {
    let mut b = ExemplarBuilder::new("math");
    for name in ["wrapped", "quotient", "remainder", "mixed", "joined", "negated"] {
        b.declare_local(name, "any");
    }
    b.state("start");
    b.push_int(i64::MAX);
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.set_self("wrapped");
    b.push_int(7);
    b.push_int(2);
    b.op(Opcode::OpDiv);
    b.set_self("quotient");
    b.push_int(7);
    b.push_int(3);
    b.op(Opcode::OpModulus);
    b.set_self("remainder");
    b.push_int(1);
    b.push_real(0.5);
    b.op(Opcode::OpAdd);
    b.set_self("mixed");
    b.push_string("spin");
    b.push_string("dle");
    b.op(Opcode::OpAdd);
    b.set_self("joined");
    b.push_int(4);
    b.op(Opcode::OpNegate);
    b.set_self("negated");
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("math").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "wrapped"),
        Some(&Value::Int(i64::MIN))
    );
    assert_eq!(
        context.instance_variable(fiber, "quotient"),
        Some(&Value::Int(3))
    );
    assert_eq!(
        context.instance_variable(fiber, "remainder"),
        Some(&Value::Int(1))
    );
    assert_eq!(
        context.instance_variable(fiber, "mixed"),
        Some(&Value::Real(1.5))
    );
    assert_eq!(
        context.instance_variable(fiber, "joined"),
        Some(&Value::from("spindle"))
    );
    assert_eq!(
        context.instance_variable(fiber, "negated"),
        Some(&Value::Int(-4))
    );
}

#[test]
fn integer_division_by_zero_faults() {
    let mut b = ExemplarBuilder::new("divider");
    b.declare_local("items", "array");
    b.state("start");
    b.params(|b| {
        b.push_int(1);
        b.push_int(2);
    });
    b.set_self("items");
    b.push_int(1);
    b.push_int(0);
    let failing = b.address();
    b.op(Opcode::OpModulus);
    b.end_state();
    let (engine, _) = single(b.finish());

    let err = engine.launch("divider").unwrap_err();
    assert_eq!(err.kind(), "divided_by_zero");
    let context = engine.context();
    assert_eq!(context.faults().len(), 1);
    assert_eq!(context.faults()[0].pc, failing);
    // The faulting fiber's variables, stack entries, and array elements are
    // all released.
    assert_eq!(context.fiber_count(), 0);
    assert_eq!(context.pool_len(), 0);
}

#[test]
fn real_division_by_zero_is_infinite() {
    let mut b = ExemplarBuilder::new("divider");
    b.declare_local("result", "real");
    b.state("start");
    b.push_real(1.0);
    b.push_int(0);
    b.op(Opcode::OpDiv);
    b.set_self("result");
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("divider").unwrap();
    assert_eq!(
        engine.context().instance_variable(fiber, "result"),
        Some(&Value::Real(f64::INFINITY))
    );
}

#[test]
fn conditionals_compare_as_reals() {
    let mut b = ExemplarBuilder::new("branches");
    b.declare_local("taken", "array");
    b.state("start");
    for (value, test) in [
        (0, Opcode::IfEq0),
        (1, Opcode::IfEq0),
        (-2, Opcode::IfLt0),
        (2, Opcode::IfGte0),
        (0, Opcode::IfGt0),
    ] {
        let otherwise = b.new_label();
        let done = b.new_label();
        b.get_self("taken");
        b.dot();
        b.push_int(value);
        b.branch(test, otherwise);
        b.params(|b| b.push_string("yes"));
        b.jump(done);
        b.label(otherwise);
        b.params(|b| b.push_string("no"));
        b.label(done);
        b.call_dynamic("push");
    }
    let otherwise = b.new_label();
    let done = b.new_label();
    b.get_self("taken");
    b.dot();
    b.push_int(3);
    b.push_real(3.0);
    b.branch(Opcode::IfEq, otherwise);
    b.params(|b| b.push_string("equal"));
    b.jump(done);
    b.label(otherwise);
    b.params(|b| b.push_string("different"));
    b.label(done);
    b.call_dynamic("push");
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("branches").unwrap();
    assert_eq!(
        array_contents(&engine, fiber, "taken"),
        ["yes", "no", "yes", "yes", "no", "equal"]
    );
}

#[test]
fn for_each_binds_each_element() {
    let mut b = ExemplarBuilder::new("summer");
    b.declare_local("sum", "int");
    b.state("start");
    for generator in [true, false] {
        let end = b.new_label();
        if generator {
            b.params(|b| {
                b.push_int(10);
                b.push_int(20);
                b.push_int(30);
            });
        } else {
            // Counts 0, 1, 2, 3.
            b.push_int(4);
        }
        b.for_each(end);
        b.get_self("sum");
        b.get_frame(0);
        b.op(Opcode::OpAdd);
        b.set_self("sum");
        b.end_sub();
        b.label(end);
    }
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("summer").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "sum"),
        Some(&Value::Int(66))
    );
    assert_eq!(context.fiber(fiber).unwrap().stack_depth(), 0);
}

#[test]
fn suspending_inside_a_loop_faults() {
    let mut b = ExemplarBuilder::new("looper");
    b.state("start");
    let end = b.new_label();
    b.push_int(2);
    b.for_each(end);
    b.call_with("time.after", |b| b.push_real(1.0));
    let failing = b.address();
    b.wait();
    b.end_sub();
    b.label(end);
    b.end_state();
    let (engine, _) = single(b.finish());

    let Err(Error::Execution(err)) = engine.launch("looper") else {
        unreachable!("launch should fault")
    };
    assert_eq!(err.fault, Fault::SuspendInLoop);
    assert_eq!(err.pc, failing);
    // The wait's continuation was never registered.
    assert_eq!(engine.context().pending_continuations(), 0);
}

#[test]
fn validation_rejects_malformed_images() {
    let mut b = ExemplarBuilder::new("jump");
    b.state("start");
    b.op(Opcode::GotoAddr);
    b.word(99);
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::AddressOutOfRange { pc: 0, target: 99 })
    );

    let mut b = ExemplarBuilder::new("truncated");
    b.state("start");
    b.op(Opcode::PushConstant);
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::TruncatedInstruction {
            pc: 0,
            opcode: Opcode::PushConstant
        })
    );

    let mut b = ExemplarBuilder::new("opcode");
    b.state("start");
    b.word(0xFFFF);
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::InvalidOpcode {
            pc: 0,
            opcode: 0xFFFF
        })
    );

    let mut b = ExemplarBuilder::new("dangling");
    b.state("start");
    b.op(Opcode::IfEq0);
    b.end_state();
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::TruncatedInstruction {
            pc: 0,
            opcode: Opcode::IfEq0
        })
    );

    let mut b = ExemplarBuilder::new("typed");
    b.declare_shared("banana", "fruit");
    b.state("start");
    b.end_state();
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::UnknownType {
            variable: Symbol::from("banana"),
            ty: Symbol::from("fruit")
        })
    );

    let mut b = ExemplarBuilder::new("twice");
    b.state("start");
    b.end_state();
    b.state("start");
    b.end_state();
    assert_eq!(
        b.finish().validate(),
        Err(ExemplarError::DuplicateState(Symbol::from("start")))
    );

    let mut b = ExemplarBuilder::new("empty");
    b.state("start");
    assert!(matches!(
        b.finish().validate(),
        Err(ExemplarError::StateOutOfRange { address: 0, .. })
    ));
}

#[test]
fn invalid_machine_is_not_instantiated() {
    let mut b = ExemplarBuilder::new("broken");
    b.state("start");
    b.op(Opcode::GotoAddr);
    b.word(42);
    let (engine, _) = single(b.finish());

    assert!(matches!(
        engine.launch("broken"),
        Err(Error::Exemplar(ExemplarError::AddressOutOfRange { .. }))
    ));
    assert!(matches!(
        engine.launch("missing"),
        Err(Error::Fault(Fault::UnknownMachine(name))) if name == "missing"
    ));
    let context = engine.context();
    assert!(context.machines().is_empty());
    assert_eq!(context.fiber_count(), 0);
}

#[test]
fn call_sites_resolve_once() {
    let mut b = ExemplarBuilder::new("caller");
    b.declare_local("total", "int");
    b.state("start");
    let end = b.new_label();
    b.push_int(5);
    b.for_each(end);
    b.get_self("total");
    b.call_with("math.abs", |b| {
        b.get_frame(0);
        b.op(Opcode::OpNegate);
    });
    b.op(Opcode::OpAdd);
    b.set_self("total");
    b.end_sub();
    b.label(end);
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("caller").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "total"),
        Some(&Value::Int(10))
    );
    assert_eq!(context.resolution_searches(), 1);
    assert_eq!(context.fiber(fiber).unwrap().cached_resolutions(), 1);
}

#[test]
fn math_library() {
    let mut b = ExemplarBuilder::new("mathy");
    b.declare_local("low", "any");
    b.declare_local("high", "any");
    b.declare_local("floored", "int");
    b.state("start");
    for (function, target) in [("math.min", "low"), ("math.max", "high")] {
        b.call_with(function, |b| {
            b.push_int(3);
            b.push_real(1.5);
            b.push_int(2);
        });
        b.set_self(target);
    }
    b.call_with("math.floor", |b| b.push_real(2.7));
    b.set_self("floored");
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("mathy").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "low"),
        Some(&Value::Real(1.5))
    );
    assert_eq!(
        context.instance_variable(fiber, "high"),
        Some(&Value::Int(3))
    );
    assert_eq!(
        context.instance_variable(fiber, "floored"),
        Some(&Value::Int(2))
    );
}

#[test]
fn dynamic_calls_resolve_against_the_receiver() {
    let mut b = ExemplarBuilder::new("lists");
    b.declare_local("items", "array");
    b.declare_local("count", "int");
    b.declare_local("second", "any");
    b.declare_local("letters", "int");
    b.state("start");
    for value in [3, 4] {
        b.get_self("items");
        b.dot();
        b.params(|b| b.push_int(value));
        b.call_dynamic("push");
    }
    b.get_self("items");
    b.dot();
    b.params(|_| {});
    b.call_dynamic("len");
    b.set_self("count");
    b.get_self("items");
    b.dot();
    b.params(|b| b.push_int(1));
    b.call_dynamic("get");
    b.set_self("second");
    b.push_string("héllo");
    b.dot();
    b.params(|_| {});
    b.call_dynamic("len");
    b.set_self("letters");
    b.end_state();
    let (engine, _) = single(b.finish());

    let fiber = engine.launch("lists").unwrap();
    let context = engine.context();
    assert_eq!(
        context.instance_variable(fiber, "count"),
        Some(&Value::Int(2))
    );
    assert_eq!(
        context.instance_variable(fiber, "second"),
        Some(&Value::Int(4))
    );
    assert_eq!(
        context.instance_variable(fiber, "letters"),
        Some(&Value::Int(5))
    );
    // Dynamic calls are not memoized.
    assert_eq!(context.resolution_searches(), 5);
}

#[test]
fn unknown_identifiers_fault() {
    let mut b = ExemplarBuilder::new("lost");
    b.state("start");
    b.call_with("nowhere.to_be.found", |_| {});
    b.end_state();
    let (engine, _) = single(b.finish());

    let Err(Error::Execution(err)) = engine.launch("lost") else {
        unreachable!("launch should fault")
    };
    assert_eq!(
        err.fault,
        Fault::UnknownIdentifier(Symbol::from("nowhere.to_be.found"))
    );
}

#[test]
fn signatures_are_checked() {
    let mut b = ExemplarBuilder::new("misuse");
    b.state("start");
    b.call_with("math.sqrt", |b| b.push_string("four"));
    b.end_state();
    let (engine, _) = single(b.finish());

    let Err(Error::Execution(err)) = engine.launch("misuse") else {
        unreachable!("launch should fault")
    };
    assert_eq!(err.fault, Fault::UnexpectedArgument);
}

#[test]
fn step_budget_stops_runaway_loops() {
    let mut b = ExemplarBuilder::new("spinner");
    b.state("start");
    let top = b.new_label();
    b.label(top);
    b.op(Opcode::Nop);
    b.jump(top);
    let (engine, _) = engine(
        Programs::new().with(b.finish()),
        EngineConfig::default().with_step_budget(100),
    );

    let Err(Error::Execution(err)) = engine.launch("spinner") else {
        unreachable!("launch should fault")
    };
    assert_eq!(err.fault, Fault::NoBudget);
}

#[test]
fn launch_depth_is_limited() {
    let mut b = ExemplarBuilder::new("nested");
    b.state("start");
    b.launch("nested", |_| {});
    b.op(Opcode::Pop);
    b.end_state();
    let (engine, _) = engine(
        Programs::new().with(b.finish()),
        EngineConfig::default().with_max_depth(4),
    );

    // Only the innermost launch faults; every launcher continues.
    let main = engine.launch("nested").unwrap();
    let context = engine.context();
    assert_eq!(context.faults().len(), 1);
    assert_eq!(context.faults()[0].fault, Fault::StackOverflow);
    // Children were unreferenced once their fiber values were popped.
    assert_eq!(context.fiber_count(), 1);
    assert_eq!(context.main(), Some(main));
}

#[test]
fn goto_inside_a_loop_leaves_the_loop() {
    let mut b = ExemplarBuilder::new("looper");
    b.declare_local("iterations", "int");
    let (outer_end, inner_end) = (b.new_label(), b.new_label());
    b.state("start");
    b.push_int(2);
    b.for_each(outer_end);
    b.push_int(3);
    b.for_each(inner_end);
    b.get_self("iterations");
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.set_self("iterations");
    b.goto_state("next");
    b.end_sub();
    b.label(inner_end);
    b.end_sub();
    b.label(outer_end);
    b.call_with("io.print", |b| b.push_string("loop finished"));
    b.end_state();
    b.state("next");
    b.call_with("io.print", |b| b.push_string("entered"));
    b.call_with("time.after", |b| b.push_real(1.0));
    b.wait();
    b.call_with("io.print", |b| b.push_string("resumed"));
    b.end_state();
    let (engine, output) = single(b.finish());

    let fiber = engine.launch("looper").unwrap();
    assert_eq!(output.lines(), ["entered"]);
    {
        let context = engine.context();
        assert_eq!(
            context.instance_variable(fiber, "iterations"),
            Some(&Value::Int(1))
        );
        let looper = context.fiber(fiber).unwrap();
        assert_eq!(looper.state(), 1);
        assert_eq!(looper.stack_depth(), 0);
        assert_eq!(context.pending_continuations(), 1);
    }

    assert!(!engine.update(1.0));
    assert_eq!(output.lines(), ["entered", "resumed"]);
    assert!(engine.context().faults().is_empty());
}

#[test]
fn counted_loops_allocate_one_element_at_a_time() {
    let mut b = ExemplarBuilder::new("counting");
    b.declare_local("total", "int");
    let end = b.new_label();
    b.state("start");
    b.push_int(1000);
    b.for_each(end);
    b.get_self("total");
    b.get_frame(0);
    b.op(Opcode::OpAdd);
    b.set_self("total");
    b.end_sub();
    b.label(end);
    b.end_state();
    let (engine, _) = engine(
        Programs::new().with(b.finish()),
        EngineConfig::default().with_pool_capacity(16),
    );

    let fiber = engine.launch("counting").unwrap();
    assert_eq!(
        engine.context().instance_variable(fiber, "total"),
        Some(&Value::Int(499_500))
    );
}

#[test]
fn shared_variables_belong_to_the_loaded_name() {
    initialize_tracing();
    let mut b = ExemplarBuilder::new("counter");
    b.declare_shared("count", "int");
    b.state("start");
    b.get_shared("count");
    b.push_int(1);
    b.op(Opcode::OpAdd);
    b.set_shared("count");
    b.end_state();
    let counter = b.finish();
    let engine = Engine::new(move |name: &Symbol| {
        (name.as_str() == "alias").then(|| counter.clone())
    });

    let first = engine.launch("alias").unwrap();
    engine.launch("alias").unwrap();
    let context = engine.context();
    assert_eq!(
        context.shared_variable("alias", "count"),
        Some(&Value::Int(2))
    );
    assert_eq!(context.shared_variable("counter", "count"), None);
    assert_eq!(context.fiber(first).unwrap().machine(), "alias");
}

#[test]
fn failed_machine_load_releases_shared_variables() {
    let mut b = ExemplarBuilder::new("crowded");
    for name in ["a", "b", "c"] {
        b.declare_shared(name, "int");
    }
    b.state("start");
    b.end_state();
    let (engine, _) = engine(
        Programs::new().with(b.finish()),
        EngineConfig::default().with_pool_capacity(2),
    );

    for _ in 0..2 {
        assert!(matches!(
            engine.launch("crowded"),
            Err(Error::Fault(Fault::PoolExhausted))
        ));
        let context = engine.context();
        assert_eq!(context.pool_len(), 0);
        assert!(context.machines().is_empty());
        assert_eq!(context.shared_variable("crowded", "a"), None);
    }
}

#[test]
fn floor_rejects_values_without_an_integer() {
    for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
        let mut b = ExemplarBuilder::new("flooring");
        b.state("start");
        b.call_with("math.floor", |b| b.push_real(value));
        b.op(Opcode::Pop);
        b.end_state();
        let (engine, _) = single(b.finish());

        let Err(Error::Execution(err)) = engine.launch("flooring") else {
            unreachable!("flooring {value} should fault")
        };
        assert_eq!(err.fault, Fault::UnexpectedArgument, "{value}");
    }
}

#[test]
fn resume_continues_after_suspend() {
    let mut b = ExemplarBuilder::new("pausing");
    b.state("start");
    b.call_with("io.print", |b| b.push_string("before"));
    b.suspend();
    b.call_with("io.print", |b| b.push_string("after"));
    b.end_state();
    let (engine, output) = single(b.finish());

    let fiber = engine.launch("pausing").unwrap();
    assert_eq!(output.lines(), ["before"]);
    assert!(engine.context().fiber(fiber).unwrap().suspended_pc().is_some());

    assert_eq!(engine.resume(fiber).unwrap(), RunEnd::StateEnd);
    assert_eq!(output.lines(), ["before", "after"]);
    assert!(matches!(
        engine.resume(fiber),
        Err(Error::Fault(Fault::NotSuspended))
    ));
}

#[test]
fn globals_are_declared_on_assignment() {
    let mut b = ExemplarBuilder::new("writer");
    b.state("start");
    b.push_int(3);
    b.set_global("score");
    b.get_global("bonus");
    b.get_global("score");
    b.op(Opcode::OpAdd);
    b.set_global("score");
    b.end_state();
    let (engine, _) = single(b.finish());

    engine
        .context()
        .declare_global("bonus", Value::Int(10))
        .unwrap();
    engine.launch("writer").unwrap();
    assert_eq!(
        engine.context().global_variable("score"),
        Some(&Value::Int(13))
    );
}

#[test]
fn bare_names_read_variables() {
    let mut b = ExemplarBuilder::new("reader");
    b.declare_local("copy", "any");
    b.declare_local("own", "int");
    b.state("start");
    b.push_int(5);
    b.set_self("own");
    b.call_with("own", |_| {});
    b.call_with("greeting", |_| {});
    b.op(Opcode::OpAdd);
    b.set_self("copy");
    b.end_state();
    let (engine, _) = single(b.finish());

    engine
        .context()
        .declare_global("greeting", Value::Int(1))
        .unwrap();
    let fiber = engine.launch("reader").unwrap();
    assert_eq!(
        engine.context().instance_variable(fiber, "copy"),
        Some(&Value::Int(6))
    );
}
