//! End-to-end coverage: compile a scene script, bind it into the scheduler
//! and drive it against a mock game host.

use std::sync::Arc;

use anyhow::Context;
use pretty_assertions::assert_eq;

use ashen_script::registry::NativeRegistry;
use ashen_script::scheduler::{ContextId, Scheduler, SchedulerRequest};
use ashen_script::value::{TypeTag, Value};
use ashen_script::{compile, Program};

#[derive(Default)]
struct World {
    units: Vec<Unit>,
    log: Vec<String>,
}

struct Unit {
    hp: i32,
}

fn world_registry() -> (NativeRegistry, u16) {
    let mut registry = NativeRegistry::new();
    let unit_ty = registry.types_mut().register("Unit");

    registry.register_native("spawn", vec![], TypeTag::Object(unit_ty), move |ctx| {
        let world = ctx.host.downcast_mut::<World>().context("host is not a World")?;
        let handle = world.units.len() as u32;
        world.units.push(Unit { hp: 100 });
        ctx.push(Value::Object { ty: unit_ty, handle })?;
        Ok(())
    });

    registry.register_native("say", vec![TypeTag::Str], TypeTag::Void, |ctx| {
        let line = match ctx.pop_typed(TypeTag::Str)? {
            Value::Str(s) => s,
            _ => unreachable!(),
        };
        let world = ctx.host.downcast_mut::<World>().context("host is not a World")?;
        world.log.push(line);
        Ok(())
    });

    registry.register_native("stop", vec![TypeTag::Trigger], TypeTag::Void, |ctx| {
        if let Value::Trigger(t) = ctx.pop_typed(TypeTag::Trigger)? {
            ctx.requests.push(SchedulerRequest::DeactivateTrigger(t));
        }
        Ok(())
    });

    registry.register_member(
        "hp",
        unit_ty,
        TypeTag::Int,
        |ctx, object| {
            let Value::Object { handle, .. } = object else { unreachable!() };
            let handle = *handle as usize;
            let world = ctx.host.downcast_mut::<World>().context("host is not a World")?;
            let unit = world.units.get(handle).context("stale unit handle")?;
            Ok(Value::Int(unit.hp))
        },
        |ctx, object, value| {
            let Value::Object { handle, .. } = object else { unreachable!() };
            let Value::Int(hp) = value else { unreachable!() };
            let handle = *handle as usize;
            let world = ctx.host.downcast_mut::<World>().context("host is not a World")?;
            let unit = world.units.get_mut(handle).context("stale unit handle")?;
            unit.hp = hp;
            Ok(())
        },
    );

    (registry, unit_ty)
}

fn boot(source: &str, registry: NativeRegistry, host: &mut World) -> (Scheduler, ContextId, Arc<Program>) {
    let externs = registry.externs();
    let program = Arc::new(compile(source, &externs).unwrap());
    let mut sched = Scheduler::new(registry);
    let id = sched.create_context(program.clone(), false);
    sched.run_context(id, 0, host).unwrap();
    (sched, id, program)
}

fn global(sched: &Scheduler, id: ContextId, program: &Program, name: &str) -> Value {
    let slot = program.global_slot(name).unwrap();
    sched.get_context_value(id, slot).unwrap()
}

#[test]
fn scene_script_drives_host_objects() {
    let src = r#"
        int ticks;
        object(Unit) hero;

        trigger boot(init);
        event start(boot) {
            hero = spawn();
            say("scene start");
        }

        trigger beat(every, 10);
        event tick(beat) {
            ticks = ticks + 1;
            hero.hp = hero.hp - 25;
            if (hero.hp <= 0) {
                say("hero down");
                stop(beat);
            }
        }
    "#;
    let (registry, _) = world_registry();
    let mut world = World::default();
    let (mut sched, id, program) = boot(src, registry, &mut world);
    assert_eq!(world.units[0].hp, 100);
    assert_eq!(world.log, vec!["scene start"]);

    for now in 0..=60 {
        sched.process_triggers(now, &mut world);
    }
    assert_eq!(global(&sched, id, &program, "ticks"), Value::Int(4));
    assert_eq!(world.units[0].hp, 0);
    assert_eq!(world.log, vec!["scene start", "hero down"]);
    assert_eq!(sched.active_count(), 0);
}

#[test]
fn periodic_event_pauses_mid_body() {
    let src = r#"
        int phase;
        trigger t(every, 20);
        event e(t) {
            phase = phase + 1;
            pause(5);
            phase = phase + 10;
        }
    "#;
    let (registry, _) = world_registry();
    let mut world = World::default();
    let (mut sched, id, program) = boot(src, registry, &mut world);

    for now in 0..=60 {
        sched.process_triggers(now, &mut world);
    }
    // Fires at 20 and 45: each run suspends for 5 ticks, then the periodic
    // interval counts from completion.
    assert_eq!(global(&sched, id, &program, "phase"), Value::Int(22));
    assert_eq!(sched.next_due(), Some(70));
}

#[test]
fn named_constants_resolve_at_compile_time() {
    let (mut registry, _) = world_registry();
    registry.register_constant("MAX_HP", Value::Int(100));
    let src = r#"
        int cap;
        trigger boot(init);
        event start(boot) {
            cap = MAX_HP / 4;
        }
    "#;
    let mut world = World::default();
    let (sched, id, program) = boot(src, registry, &mut world);
    assert_eq!(global(&sched, id, &program, "cap"), Value::Int(25));
}

#[test]
fn two_contexts_share_a_program_without_sharing_state() {
    let src = r#"
        int count;
        trigger t(every, 10);
        event e(t) { count = count + 1; }
    "#;
    let (registry, _) = world_registry();
    let mut world = World::default();
    let (mut sched, first, program) = boot(src, registry, &mut world);
    sched.process_triggers(10, &mut world);

    let second = sched.create_context(program.clone(), false);
    sched.run_context(second, 10, &mut world).unwrap();
    sched.process_triggers(20, &mut world);

    assert_eq!(global(&sched, first, &program, "count"), Value::Int(2));
    assert_eq!(global(&sched, second, &program, "count"), Value::Int(1));
}
