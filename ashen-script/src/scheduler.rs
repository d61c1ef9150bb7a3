//! Time-driven trigger/event scheduling and context lifecycle.
//!
//! The scheduler owns every script context, the two active-trigger lists and
//! the VM. One list is time-ordered (regular triggers, ascending due time),
//! the other kind-ordered (callback listeners grouped by callback kind).
//! Entries are never unlinked while a pass is scanning; they are flagged
//! `deactivated` and swept once the pass commits, and insertions discovered
//! during a pass are buffered the same way.

use std::any::Any;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::context::ScriptContext;
use crate::program::{Program, TriggerKind};
use crate::registry::NativeRegistry;
use crate::value::Value;
use crate::vm::{RunOutcome, Vm};

/// Handle to a context owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u32);

/// A scheduled, not-yet-fired binding of a trigger to a context.
#[derive(Debug, Clone)]
pub struct ActiveTrigger {
    pub test_time: u64,
    pub context: ContextId,
    pub kind: TriggerKind,
    pub trigger: u16,
    pub event: u16,
    /// Present only on `Pause` entries: where to re-enter the event.
    pub resume_offset: Option<u32>,
    /// Callback kind; meaningful only on the callback list.
    pub callback: u16,
    /// Flagged for deferred removal; swept at commit.
    pub deactivated: bool,
}

/// Persisted form of an active trigger. Restoring one re-inserts it without
/// re-running any initialization code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTrigger {
    pub kind: TriggerKind,
    pub trigger: u16,
    pub event: u16,
    pub resume_offset: Option<u32>,
    pub due_time: u64,
}

/// Scheduler mutations requested from inside a running script. Applying them
/// mid-run would mutate the lists the dispatch pass is scanning, so natives
/// buffer them and the scheduler commits after the run returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerRequest {
    /// Flag every active instance of this trigger on the calling context.
    DeactivateTrigger(u16),
    /// Insert this trigger as if the context had just been run.
    ActivateTrigger(u16),
    /// Dispatch a game callback once the current pass commits.
    FireCallback(u16),
    /// Mark the calling context release-when-idle.
    ReleaseContext,
}

#[derive(Default)]
struct Pending {
    inserts: Vec<ActiveTrigger>,
    fire_callbacks: Vec<u16>,
}

pub struct Scheduler {
    registry: NativeRegistry,
    contexts: Vec<Option<ScriptContext>>,
    /// Ascending by `test_time`, stable for equal times.
    active: Vec<ActiveTrigger>,
    /// Ascending by callback kind.
    callbacks: Vec<ActiveTrigger>,
    vm: Vm,
}

impl Scheduler {
    pub fn new(registry: NativeRegistry) -> Self {
        Scheduler {
            registry,
            contexts: Vec::new(),
            active: Vec::new(),
            callbacks: Vec::new(),
            vm: Vm::new(),
        }
    }

    pub fn registry(&self) -> &NativeRegistry {
        &self.registry
    }

    pub fn context_count(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_some()).count()
    }

    pub fn active_count(&self) -> usize {
        self.active.len() + self.callbacks.len()
    }

    /// Due time of the earliest scheduled trigger.
    pub fn next_due(&self) -> Option<u64> {
        self.active.iter().find(|e| !e.deactivated).map(|e| e.test_time)
    }

    /// Allocate a context with every storage chunk pre-typed and initialized.
    pub fn create_context(&mut self, program: Arc<Program>, release: bool) -> ContextId {
        let ctx = ScriptContext::new(program, &self.registry, release);
        for (i, slot) in self.contexts.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ctx);
                return ContextId(i as u32);
            }
        }
        self.contexts.push(Some(ctx));
        ContextId(self.contexts.len() as u32 - 1)
    }

    /// Bind a context into the scheduler: walk every event with a trigger
    /// link, executing `init` triggers immediately and inserting the rest.
    pub fn run_context(&mut self, id: ContextId, now: u64, host: &mut dyn Any) -> Result<()> {
        let program = self
            .context(id)
            .with_context(|| format!("run_context: context {} not found", id.0))?
            .program
            .clone();
        let mut pending = Pending::default();
        for (event_idx, event) in program.events.iter().enumerate() {
            let Some(trigger_idx) = event.trigger else { continue };
            let Some(def) = program.trigger(trigger_idx) else { continue };
            match def.kind {
                TriggerKind::Init => {
                    let outcome = self.fire_event(id, event_idx as u16, None, now, host, &mut pending);
                    if let Some(RunOutcome::Paused { resume_offset, delay }) = outcome {
                        pending.inserts.push(ActiveTrigger {
                            test_time: now + delay as u64,
                            context: id,
                            kind: TriggerKind::Pause,
                            trigger: trigger_idx,
                            event: event_idx as u16,
                            resume_offset: Some(resume_offset),
                            callback: 0,
                            deactivated: false,
                        });
                    }
                }
                TriggerKind::Callback => {
                    pending.inserts.push(ActiveTrigger {
                        test_time: 0,
                        context: id,
                        kind: TriggerKind::Callback,
                        trigger: trigger_idx,
                        event: event_idx as u16,
                        resume_offset: None,
                        callback: def.callback.unwrap_or(0),
                        deactivated: false,
                    });
                }
                TriggerKind::Wait | TriggerKind::Every | TriggerKind::Code => {
                    pending.inserts.push(ActiveTrigger {
                        test_time: now + def.interval as u64,
                        context: id,
                        kind: def.kind,
                        trigger: trigger_idx,
                        event: event_idx as u16,
                        resume_offset: None,
                        callback: 0,
                        deactivated: false,
                    });
                }
                TriggerKind::Pause => {}
            }
        }
        self.commit(pending, now, host);
        Ok(())
    }

    /// Tear down everything referencing a context, run release hooks over its
    /// storage and free it.
    pub fn remove_context(&mut self, id: ContextId) -> Result<()> {
        let Some(ctx) = self.contexts.get_mut(id.0 as usize).and_then(Option::take) else {
            bail!("remove_context: context {} not found", id.0);
        };
        self.active.retain(|e| e.context != id);
        self.callbacks.retain(|e| e.context != id);
        for value in ctx.globals.iter() {
            self.registry.release_value(value);
        }
        log::trace!("removed context {}", id.0);
        Ok(())
    }

    /// Advance the scheduler by one tick: fire every due time-ordered trigger
    /// in ascending order, then commit the transitions discovered.
    pub fn process_triggers(&mut self, now: u64, host: &mut dyn Any) {
        let mut pending = Pending::default();
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].test_time > now {
                break;
            }
            if self.active[i].deactivated {
                i += 1;
                continue;
            }
            // Consume the entry; its fate below decides what gets reinserted.
            let entry = self.active[i].clone();
            self.active[i].deactivated = true;
            self.dispatch_entry(&entry, now, host, &mut pending);
            i += 1;
        }
        self.commit(pending, now, host);
    }

    /// Dispatch a game-wide callback to every listener of `kind`.
    pub fn fire_callback(&mut self, kind: u16, now: u64, host: &mut dyn Any) {
        let mut pending = Pending::default();
        let mut i = 0;
        while i < self.callbacks.len() {
            if self.callbacks[i].callback > kind {
                break;
            }
            if self.callbacks[i].callback < kind || self.callbacks[i].deactivated {
                i += 1;
                continue;
            }
            let entry = self.callbacks[i].clone();
            let (outcome, requests) = self.fire_event_with_requests(
                entry.context,
                entry.event,
                None,
                now,
                host,
                &mut pending,
            );
            let deactivated = requests
                .iter()
                .any(|r| *r == SchedulerRequest::DeactivateTrigger(entry.trigger));
            match outcome {
                Some(RunOutcome::Paused { resume_offset, delay }) => {
                    // The listener suspends: replace it with a pause entry on
                    // the time list.
                    self.callbacks[i].deactivated = true;
                    pending.inserts.push(ActiveTrigger {
                        test_time: now + delay as u64,
                        context: entry.context,
                        kind: TriggerKind::Pause,
                        trigger: entry.trigger,
                        event: entry.event,
                        resume_offset: Some(resume_offset),
                        callback: 0,
                        deactivated: false,
                    });
                }
                Some(RunOutcome::Halted) if deactivated => {
                    self.callbacks[i].deactivated = true;
                }
                Some(RunOutcome::Halted) => {}
                // Fault: drop the offending listener, the pass continues.
                None => self.callbacks[i].deactivated = true,
            }
            i += 1;
        }
        self.commit(pending, now, host);
    }

    pub fn get_context_value(&self, id: ContextId, slot: u32) -> Result<Value> {
        let ctx = self
            .context(id)
            .with_context(|| format!("get_context_value: context {} not found", id.0))?;
        Ok(ctx.globals.get(slot)?.clone())
    }

    pub fn set_context_value(&mut self, id: ContextId, slot: u32, value: Value) -> Result<()> {
        let types = self.registry.types();
        let Some(ctx) = self.contexts.get_mut(id.0 as usize).and_then(Option::as_mut) else {
            bail!("set_context_value: context {} not found", id.0);
        };
        let want = *ctx
            .program
            .globals
            .get(slot as usize)
            .with_context(|| format!("global slot {slot} out of range"))?;
        if !types.equivalent(want, value.type_tag()) {
            bail!(
                "set_context_value: slot {slot} holds {want}, got {}",
                value.type_tag()
            );
        }
        ctx.globals.set(slot, value)?;
        Ok(())
    }

    /// Snapshot every live trigger referencing a context, for persistence.
    pub fn save_triggers(&self, id: ContextId) -> Vec<SavedTrigger> {
        self.active
            .iter()
            .chain(self.callbacks.iter())
            .filter(|e| e.context == id && !e.deactivated)
            .map(|e| SavedTrigger {
                kind: e.kind,
                trigger: e.trigger,
                event: e.event,
                resume_offset: e.resume_offset,
                due_time: e.test_time,
            })
            .collect()
    }

    /// Re-insert a saved trigger without re-running any initialization code.
    pub fn restore_trigger(&mut self, id: ContextId, saved: &SavedTrigger) -> Result<()> {
        let program = self
            .context(id)
            .with_context(|| format!("restore_trigger: context {} not found", id.0))?
            .program
            .clone();
        if program.event(saved.event).is_none() {
            bail!("restore_trigger: event index {} out of range", saved.event);
        }
        let def = program
            .trigger(saved.trigger)
            .with_context(|| format!("restore_trigger: trigger index {} out of range", saved.trigger))?;
        let entry = ActiveTrigger {
            test_time: saved.due_time,
            context: id,
            kind: saved.kind,
            trigger: saved.trigger,
            event: saved.event,
            resume_offset: saved.resume_offset,
            callback: def.callback.unwrap_or(0),
            deactivated: false,
        };
        self.insert_entry(entry);
        Ok(())
    }

    fn context(&self, id: ContextId) -> Option<&ScriptContext> {
        self.contexts.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Decide the fate of one due time-ordered entry.
    fn dispatch_entry(
        &mut self,
        entry: &ActiveTrigger,
        now: u64,
        host: &mut dyn Any,
        pending: &mut Pending,
    ) {
        let Some(program) = self.context(entry.context).map(|c| c.program.clone()) else {
            log::warn!("dropping trigger for missing context {}", entry.context.0);
            return;
        };

        // Code triggers gate on their boolean test body first.
        if entry.kind == TriggerKind::Code {
            match self.run_trigger_test(entry, now, host, pending) {
                Some(true) => {}
                Some(false) => {
                    let mut next = entry.clone();
                    next.test_time = now + self.interval_of(&program, entry.trigger) as u64;
                    pending.inserts.push(next);
                    return;
                }
                // Test faulted: the trigger is dropped, the tick continues.
                None => return,
            }
        }

        let (outcome, requests) = self.fire_event_with_requests(
            entry.context,
            entry.event,
            entry.resume_offset,
            now,
            host,
            pending,
        );
        let deactivated = requests
            .iter()
            .any(|r| *r == SchedulerRequest::DeactivateTrigger(entry.trigger));

        match outcome {
            Some(RunOutcome::Paused { resume_offset, delay }) => {
                pending.inserts.push(ActiveTrigger {
                    test_time: now + delay as u64,
                    kind: TriggerKind::Pause,
                    resume_offset: Some(resume_offset),
                    deactivated: false,
                    ..entry.clone()
                });
            }
            Some(RunOutcome::Halted) if deactivated => {}
            Some(RunOutcome::Halted) => {
                // A resumed event that ran to completion requeues according
                // to the trigger it originated from.
                let origin = if entry.kind == TriggerKind::Pause {
                    program.trigger(entry.trigger).map(|d| d.kind)
                } else {
                    Some(entry.kind)
                };
                match origin {
                    Some(TriggerKind::Every) => {
                        pending.inserts.push(ActiveTrigger {
                            test_time: now + self.interval_of(&program, entry.trigger) as u64,
                            kind: TriggerKind::Every,
                            resume_offset: None,
                            deactivated: false,
                            ..entry.clone()
                        });
                    }
                    Some(TriggerKind::Callback) => {
                        // The listener suspended earlier; put it back.
                        pending.inserts.push(ActiveTrigger {
                            test_time: 0,
                            kind: TriggerKind::Callback,
                            resume_offset: None,
                            callback: program
                                .trigger(entry.trigger)
                                .and_then(|d| d.callback)
                                .unwrap_or(0),
                            deactivated: false,
                            ..entry.clone()
                        });
                    }
                    // Wait, Code and init entries are one-shot.
                    _ => {}
                }
            }
            None => {}
        }
    }

    fn interval_of(&self, program: &Program, trigger: u16) -> u32 {
        program.trigger(trigger).map(|d| d.interval).unwrap_or(0)
    }

    fn run_trigger_test(
        &mut self,
        entry: &ActiveTrigger,
        now: u64,
        host: &mut dyn Any,
        pending: &mut Pending,
    ) -> Option<bool> {
        let Some(ctx) = self
            .contexts
            .get_mut(entry.context.0 as usize)
            .and_then(Option::as_mut)
        else {
            return None;
        };
        let program = ctx.program.clone();
        debug_assert!(!self.vm.is_running(), "trigger test dispatched re-entrantly");
        let mut requests = Vec::new();
        let result = self.vm.run_test(
            &program,
            &mut ctx.globals,
            &self.registry,
            host,
            &mut requests,
            entry.trigger,
        );
        match result {
            Ok(verdict) => {
                self.apply_requests(entry.context, &requests, now, pending);
                Some(verdict)
            }
            Err(fault) => {
                log::error!("trigger test fault: {}", fault.describe(&program));
                None
            }
        }
    }

    fn fire_event(
        &mut self,
        id: ContextId,
        event: u16,
        resume: Option<u32>,
        now: u64,
        host: &mut dyn Any,
        pending: &mut Pending,
    ) -> Option<RunOutcome> {
        self.fire_event_with_requests(id, event, resume, now, host, pending).0
    }

    fn fire_event_with_requests(
        &mut self,
        id: ContextId,
        event: u16,
        resume: Option<u32>,
        now: u64,
        host: &mut dyn Any,
        pending: &mut Pending,
    ) -> (Option<RunOutcome>, Vec<SchedulerRequest>) {
        let Some(ctx) = self.contexts.get_mut(id.0 as usize).and_then(Option::as_mut) else {
            log::warn!("fire_event: context {} not found", id.0);
            return (None, Vec::new());
        };
        let program = ctx.program.clone();
        debug_assert!(!self.vm.is_running(), "event dispatched re-entrantly");
        let mut requests = Vec::new();
        let result = self.vm.run_event(
            &program,
            &mut ctx.globals,
            &self.registry,
            host,
            &mut requests,
            event,
            resume,
        );
        match result {
            Ok(outcome) => {
                self.apply_requests(id, &requests, now, pending);
                (Some(outcome), requests)
            }
            Err(fault) => {
                log::error!("script fault: {}", fault.describe(&program));
                (None, requests)
            }
        }
    }

    fn apply_requests(
        &mut self,
        id: ContextId,
        requests: &[SchedulerRequest],
        now: u64,
        pending: &mut Pending,
    ) {
        for request in requests {
            match *request {
                SchedulerRequest::DeactivateTrigger(trigger) => {
                    for entry in self.active.iter_mut().chain(self.callbacks.iter_mut()) {
                        if entry.context == id && entry.trigger == trigger {
                            entry.deactivated = true;
                        }
                    }
                    for entry in pending.inserts.iter_mut() {
                        if entry.context == id && entry.trigger == trigger {
                            entry.deactivated = true;
                        }
                    }
                }
                SchedulerRequest::ActivateTrigger(trigger) => {
                    let Some(ctx) = self.context(id) else { continue };
                    let program = ctx.program.clone();
                    let Some(def) = program.trigger(trigger) else {
                        log::warn!("activate request for unknown trigger {trigger}");
                        continue;
                    };
                    let Some(event) = program
                        .events
                        .iter()
                        .position(|e| e.trigger == Some(trigger))
                    else {
                        log::warn!("activate request for unbound trigger {trigger}");
                        continue;
                    };
                    pending.inserts.push(ActiveTrigger {
                        // Wait/every intervals count from the tick that
                        // requested the activation.
                        test_time: now + def.interval as u64,
                        context: id,
                        kind: def.kind,
                        trigger,
                        event: event as u16,
                        resume_offset: None,
                        callback: def.callback.unwrap_or(0),
                        deactivated: false,
                    });
                }
                SchedulerRequest::FireCallback(kind) => pending.fire_callbacks.push(kind),
                SchedulerRequest::ReleaseContext => {
                    // Marks only; the idle sweep at commit frees the context
                    // once its last trigger is gone.
                    if let Some(ctx) =
                        self.contexts.get_mut(id.0 as usize).and_then(Option::as_mut)
                    {
                        ctx.release = true;
                    }
                }
            }
        }
    }

    fn insert_entry(&mut self, entry: ActiveTrigger) {
        if let Some(ctx) = self
            .contexts
            .get_mut(entry.context.0 as usize)
            .and_then(Option::as_mut)
        {
            ctx.trigger_count += 1;
        }
        if entry.kind == TriggerKind::Callback {
            let pos = self
                .callbacks
                .iter()
                .position(|e| e.callback > entry.callback)
                .unwrap_or(self.callbacks.len());
            self.callbacks.insert(pos, entry);
        } else {
            // Stable for equal times: insert before the first strictly
            // greater entry.
            let pos = self
                .active
                .iter()
                .position(|e| e.test_time > entry.test_time)
                .unwrap_or(self.active.len());
            self.active.insert(pos, entry);
        }
    }

    /// Apply everything a pass buffered: sweep deactivated entries, insert
    /// the new ones, release contexts, then dispatch queued callbacks.
    fn commit(&mut self, pending: Pending, now: u64, host: &mut dyn Any) {
        let Pending { inserts, fire_callbacks } = pending;

        let mut removed: Vec<ContextId> = Vec::new();
        self.active.retain(|e| {
            if e.deactivated {
                removed.push(e.context);
                false
            } else {
                true
            }
        });
        self.callbacks.retain(|e| {
            if e.deactivated {
                removed.push(e.context);
                false
            } else {
                true
            }
        });
        for id in removed {
            if let Some(ctx) = self.contexts.get_mut(id.0 as usize).and_then(Option::as_mut) {
                ctx.trigger_count = ctx.trigger_count.saturating_sub(1);
            }
        }

        for entry in inserts {
            if !entry.deactivated {
                self.insert_entry(entry);
            }
        }

        // Auto-release: a release-eligible context whose last trigger just
        // went away is a dangling allocation.
        let idle: Vec<ContextId> = self
            .contexts
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|c| c.idle())
                    .map(|_| ContextId(i as u32))
            })
            .collect();
        for id in idle {
            if let Err(e) = self.remove_context(id) {
                log::error!("{e:#}");
            }
        }

        for kind in fire_callbacks {
            self.fire_callback(kind, now, host);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::compile;
    use crate::value::TypeTag;

    fn boot(source: &str) -> (Scheduler, ContextId, Arc<Program>) {
        boot_with(source, NativeRegistry::new(), false)
    }

    fn boot_with(
        source: &str,
        registry: NativeRegistry,
        release: bool,
    ) -> (Scheduler, ContextId, Arc<Program>) {
        let externs = registry.externs();
        let program = Arc::new(compile(source, &externs).unwrap());
        let mut sched = Scheduler::new(registry);
        let id = sched.create_context(program.clone(), release);
        sched.run_context(id, 0, &mut ()).unwrap();
        (sched, id, program)
    }

    fn global(sched: &Scheduler, id: ContextId, program: &Program, name: &str) -> Value {
        let slot = program.global_slot(name).unwrap();
        sched.get_context_value(id, slot).unwrap()
    }

    #[test]
    fn wait_triggers_fire_in_time_order() {
        let src = r#"
            string log;
            trigger tc(wait, 30);
            trigger ta(wait, 10);
            trigger tb(wait, 20);
            event ec(tc) { log = log & "c"; }
            event ea(ta) { log = log & "a"; }
            event eb(tb) { log = log & "b"; }
        "#;
        let (mut sched, id, program) = boot(src);
        assert_eq!(sched.active_count(), 3);
        sched.process_triggers(100, &mut ());
        assert_eq!(global(&sched, id, &program, "log"), Value::Str("abc".into()));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn periodic_trigger_requeues_on_interval() {
        let src = r#"
            int x;
            trigger t(every, 10);
            event e(t) { x = x + 1; }
        "#;
        let (mut sched, id, program) = boot(src);
        for now in 0..=35 {
            sched.process_triggers(now, &mut ());
        }
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(3));
        assert_eq!(sched.next_due(), Some(40));
        assert_eq!(sched.active_count(), 1);
    }

    #[test]
    fn init_event_runs_synchronously_and_pause_reschedules() {
        let src = r#"
            int x;
            trigger t(init);
            event e(t) {
                x = 1;
                pause(100);
                x = 2;
            }
        "#;
        let (mut sched, id, program) = boot(src);
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(1));
        assert_eq!(sched.next_due(), Some(100));
        sched.process_triggers(99, &mut ());
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(1));
        sched.process_triggers(100, &mut ());
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(2));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn code_trigger_gates_on_test_expression() {
        let src = r#"
            int x;
            int fired;
            trigger gate(test: x > 2, 10);
            event hit(gate) { fired = fired + 1; }
            trigger tick(every, 10);
            event bump(tick) { x = x + 1; }
        "#;
        let (mut sched, id, program) = boot(src);
        for now in (0..=40).step_by(10) {
            sched.process_triggers(now, &mut ());
        }
        // The test first passes on the tick after x reaches 3; the trigger
        // then leaves the schedule.
        assert_eq!(global(&sched, id, &program, "fired"), Value::Int(1));
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(4));
        assert_eq!(sched.active_count(), 1);
    }

    #[test]
    fn callback_listeners_dispatch_by_kind() {
        let mut registry = NativeRegistry::new();
        let on_hit = registry.register_callback("on_hit");
        let on_miss = registry.register_callback("on_miss");
        let src = r#"
            int hits;
            trigger t(callback, on_hit);
            event e(t) { hits = hits + 1; }
        "#;
        let (mut sched, id, program) = boot_with(src, registry, false);
        sched.fire_callback(on_hit, 0, &mut ());
        sched.fire_callback(on_hit, 1, &mut ());
        sched.fire_callback(on_miss, 2, &mut ());
        assert_eq!(global(&sched, id, &program, "hits"), Value::Int(2));
        // Listeners persist across dispatches.
        assert_eq!(sched.active_count(), 1);
    }

    #[test]
    fn release_context_frees_after_last_trigger() {
        let src = r#"
            int x;
            trigger t(wait, 5);
            event e(t) { x = 1; }
        "#;
        let (mut sched, _id, _program) = boot_with(src, NativeRegistry::new(), true);
        assert_eq!(sched.context_count(), 1);
        sched.process_triggers(5, &mut ());
        assert_eq!(sched.context_count(), 0);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn release_request_defers_to_idle() {
        let mut registry = NativeRegistry::new();
        registry.register_native("release", vec![], TypeTag::Void, |ctx| {
            ctx.requests.push(SchedulerRequest::ReleaseContext);
            Ok(())
        });
        registry.register_native("stop", vec![TypeTag::Trigger], TypeTag::Void, |ctx| {
            if let Value::Trigger(t) = ctx.pop_typed(TypeTag::Trigger)? {
                ctx.requests.push(SchedulerRequest::DeactivateTrigger(t));
            }
            Ok(())
        });
        let src = r#"
            int x;
            trigger t(every, 10);
            event e(t) {
                x = x + 1;
                if (x == 1) {
                    release();
                }
                if (x == 2) {
                    stop(t);
                }
            }
        "#;
        let (mut sched, id, program) = boot_with(src, registry, false);
        sched.process_triggers(10, &mut ());
        // The release request only marks the context; its requeued periodic
        // trigger keeps it alive.
        assert_eq!(sched.context_count(), 1);
        assert_eq!(sched.next_due(), Some(20));
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(1));
        sched.process_triggers(20, &mut ());
        // Last trigger gone: the idle sweep frees it.
        assert_eq!(sched.context_count(), 0);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn native_request_deactivates_trigger() {
        let mut registry = NativeRegistry::new();
        registry.register_native("stop", vec![TypeTag::Trigger], TypeTag::Void, |ctx| {
            if let Value::Trigger(t) = ctx.pop_typed(TypeTag::Trigger)? {
                ctx.requests.push(SchedulerRequest::DeactivateTrigger(t));
            }
            Ok(())
        });
        let src = r#"
            int x;
            trigger t(every, 10);
            event e(t) {
                x = x + 1;
                if (x == 2) {
                    stop(t);
                }
            }
        "#;
        let (mut sched, id, program) = boot_with(src, registry, false);
        for now in (0..=50).step_by(10) {
            sched.process_triggers(now, &mut ());
        }
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(2));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn saved_triggers_restore_without_init() {
        let src = r#"
            int x;
            trigger boot(init);
            event started(boot) { x = 100; }
            trigger t(wait, 10);
            event e(t) { x = x + 1; }
        "#;
        let (sched, id, program) = boot(src);
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(100));
        let saved = sched.save_triggers(id);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].due_time, 10);

        // Persist through the serialized form, then rebuild a scheduler
        // without re-running the context.
        let yaml = serde_yaml::to_string(&saved).unwrap();
        let restored: Vec<SavedTrigger> = serde_yaml::from_str(&yaml).unwrap();

        let mut sched = Scheduler::new(NativeRegistry::new());
        let id = sched.create_context(program.clone(), false);
        for entry in &restored {
            sched.restore_trigger(id, entry).unwrap();
        }
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(0));
        sched.process_triggers(10, &mut ());
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(1));
    }

    #[test]
    fn faulting_event_is_dropped() {
        let src = r#"
            int x;
            int zero;
            trigger bad(every, 10);
            event eb(bad) { x = 1 / zero; }
            trigger ok(wait, 20);
            event eo(ok) { x = 5; }
        "#;
        let (mut sched, id, program) = boot(src);
        sched.process_triggers(10, &mut ());
        // The faulting periodic trigger is gone, the healthy one still fires.
        assert_eq!(sched.active_count(), 1);
        sched.process_triggers(20, &mut ());
        assert_eq!(global(&sched, id, &program, "x"), Value::Int(5));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn remove_context_tears_down_triggers() {
        let src = r#"
            int x;
            trigger t(every, 10);
            event e(t) { x = x + 1; }
        "#;
        let (mut sched, id, program) = boot(src);
        let other = sched.create_context(program.clone(), false);
        sched.run_context(other, 0, &mut ()).unwrap();
        assert_eq!(sched.context_count(), 2);
        assert_eq!(sched.active_count(), 2);
        sched.remove_context(id).unwrap();
        assert_eq!(sched.context_count(), 1);
        assert_eq!(sched.active_count(), 1);
        assert!(sched.remove_context(ContextId(99)).is_err());
    }
}
