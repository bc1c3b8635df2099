//! End-to-end strand scenarios against the in-memory store
//!
//! Time is driven explicitly through `run_pass_at`, so suspends and
//! deadlines are exercised without sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use strand_engine::engine::{DispatchOutcome, Dispatcher, DispatcherConfig, PassReport, ResourceState};
use strand_engine::persistence::{InMemoryStrandStore, NewStrand, StrandStore};
use strand_engine::program::{Program, ProgramRegistry, Step, StepContext};
use strand_engine::reliability::DeadlineMonitor;
use strand_engine::strand::{
    semaphore, FailureKind, Frame, StepError, StepOutcome, StepResult, Strand, StrandStatus,
};
use strand_engine::StrandClient;

// ============================================
// Harness
// ============================================

struct Harness {
    store: Arc<InMemoryStrandStore>,
    client: StrandClient,
    dispatcher: Dispatcher,
    t0: DateTime<Utc>,
}

impl Harness {
    fn new(registry: ProgramRegistry) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(InMemoryStrandStore::new());
        let client = StrandClient::new(store.clone(), registry.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            DispatcherConfig::new().with_worker_id("scenario"),
        );
        Self {
            store,
            client,
            dispatcher,
            // Strands assembled right after this are already due at t0
            t0: Utc::now() + chrono::Duration::seconds(1),
        }
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + chrono::Duration::seconds(secs)
    }

    async fn pass(&self, secs: i64) -> PassReport {
        self.dispatcher.run_pass_at(self.at(secs)).await.unwrap()
    }

    async fn strand(&self, id: Uuid) -> Strand {
        self.store.load_strand(id).await.unwrap()
    }
}

// ============================================
// Programs
// ============================================

/// Increment `n`; loop until it reaches 3, then return it
fn count(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let n: u64 = ctx.frame().fetch("n")?;
        let n = n + 1;
        ctx.frame_mut().set("n", n)?;
        if n < 3 {
            Ok(StepOutcome::transition("loop"))
        } else {
            Ok(StepOutcome::returning(n))
        }
    })
}

/// Sleep `delay_secs` once, then return `value`
fn delayed(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        if ctx.frame().contains("slept") {
            let value: i64 = ctx.frame().fetch("value")?;
            return Ok(StepOutcome::returning(value));
        }
        let delay: u64 = ctx.frame().fetch("delay_secs")?;
        ctx.frame_mut().set("slept", true)?;
        Ok(StepOutcome::suspend_secs(delay))
    })
}

fn broken(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move { Err(StepError::fatal("disk vanished")) })
}

fn spawn_two(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.spawn_program("Delayed", Frame::new().with("value", 1).with("delay_secs", 10))?;
        ctx.spawn_program("Delayed", Frame::new().with("value", 2).with("delay_secs", 30))?;
        Ok(StepOutcome::transition("wait"))
    })
}

fn spawn_broken(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.spawn_program("Broken", Frame::new())?;
        Ok(StepOutcome::transition("wait"))
    })
}

/// Collect finished children into `sum`/`seen`, return once leaf
fn gather(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let mut sum: i64 = ctx.frame().fetch_or("sum", 0)?;
        let mut seen: Vec<Uuid> = ctx.frame().fetch_or("seen", Vec::new())?;
        let mut failures: Vec<String> = ctx.frame().fetch_or("failures", Vec::new())?;

        for child in ctx.collect_finished_children().await? {
            match child.result {
                Ok(value) => sum += value.as_i64().unwrap_or(0),
                Err(failure) => failures.push(failure.message),
            }
            seen.push(child.id);
        }

        ctx.frame_mut().set("sum", sum)?;
        ctx.frame_mut().set("seen", &seen)?;
        ctx.frame_mut().set("failures", &failures)?;

        if ctx.is_leaf().await? {
            Ok(StepOutcome::returning(
                json!({ "sum": sum, "seen": seen, "failures": failures }),
            ))
        } else {
            Ok(StepOutcome::yield_to_children())
        }
    })
}

fn to_wait(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move { Ok(StepOutcome::transition("wait")) })
}

fn idle(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move { Ok(StepOutcome::suspend_secs(3600)) })
}

fn finish(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move { Ok(StepOutcome::returning("done")) })
}

/// Start the long `restart` sub-call, or move on once it returned
fn call_restart(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        if let Some(result) = ctx.retval().cloned() {
            ctx.frame_mut().set("restart_result", result)?;
            return Ok(StepOutcome::transition("wait"));
        }
        Ok(StepOutcome::push("Vm", "restart", Frame::new()))
    })
}

fn teardown(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.consume(semaphore::DESTROY).await?;
        ctx.destroy_children();
        Ok(StepOutcome::returning("destroyed"))
    })
}

/// Call `Double` with this frame's `x` and return the result
fn call_double(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        if let Some(result) = ctx.retval().cloned() {
            return Ok(StepOutcome::returning(result));
        }
        let x: i64 = ctx.frame().fetch("x")?;
        Ok(StepOutcome::push("Double", "start", Frame::new().with("x", x)))
    })
}

fn double(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let x: i64 = ctx.frame().fetch("x")?;
        Ok(StepOutcome::returning(x * 2))
    })
}

fn nap_once(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        if ctx.frame().contains("napped") {
            return Ok(StepOutcome::returning(true));
        }
        ctx.frame_mut().set("napped", true)?;
        Ok(StepOutcome::suspend_secs(60))
    })
}

fn slow(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(StepOutcome::returning(1))
    })
}

fn arm_deadline(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.register_deadline("done", Duration::from_secs(10))?;
        Ok(StepOutcome::transition("wait"))
    })
}

/// Spawn one child (`Napper` unless `child` names another program)
fn spawn_and_leave(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let child: String = ctx.frame().fetch_or("child", "Napper".to_string())?;
        ctx.spawn_program(&child, Frame::new())?;
        Ok(StepOutcome::transition("leave"))
    })
}

/// Return from the outermost frame, disposing of children as `how` says
fn leave(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let how: String = ctx.frame().fetch_or("how", String::new())?;
        match how.as_str() {
            "abandon" => ctx.abandon_children(),
            "destroy" => ctx.destroy_children(),
            _ => {}
        }
        Ok(StepOutcome::returning("left"))
    })
}

fn call_watchdog(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        if let Some(result) = ctx.retval().cloned() {
            return Ok(StepOutcome::returning(result));
        }
        Ok(StepOutcome::push("Watchdog", "start", Frame::new()))
    })
}

fn hibernate(_ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move { Ok(StepOutcome::suspend(Duration::MAX)) })
}

/// Blocks its first run until released; returns the run number
#[derive(Default)]
struct Stall {
    runs: AtomicUsize,
    release: Notify,
}

struct StallStep(Arc<Stall>);

#[async_trait]
impl Step for StallStep {
    async fn run(&self, _ctx: &mut StepContext) -> StepResult {
        let run = self.0.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run == 1 {
            self.0.release.notified().await;
        }
        Ok(StepOutcome::returning(run as u64))
    }
}

fn registry() -> ProgramRegistry {
    let programs = [
        Program::builder("Example")
            .step_fn("start", count)
            .step_fn("loop", count)
            .build(),
        Program::builder("Delayed").step_fn("start", delayed).build(),
        Program::builder("Broken").step_fn("start", broken).build(),
        Program::builder("Parent")
            .step_fn("start", spawn_two)
            .step_fn("wait", gather)
            .build(),
        Program::builder("Guardian")
            .step_fn("start", spawn_broken)
            .step_fn("wait", gather)
            .build(),
        Program::builder("Vm")
            .step_fn("start", call_restart)
            .step_fn("wait", idle)
            .step_fn("restart", idle)
            .step_fn("destroy", teardown)
            .teardown("destroy")
            .steady(["wait"])
            .build(),
        Program::builder("Server")
            .step_fn("start", to_wait)
            .step_fn("wait", idle)
            .step_fn("destroy", teardown)
            .teardown("destroy")
            .steady(["wait"])
            .build(),
        Program::builder("Caller").step_fn("start", call_double).build(),
        Program::builder("Double").step_fn("start", double).build(),
        Program::builder("Napper").step_fn("start", nap_once).build(),
        Program::builder("Slow").step_fn("start", slow).build(),
        Program::builder("Watched")
            .step_fn("start", arm_deadline)
            .step_fn("wait", idle)
            .step_fn("done", finish)
            .build(),
        Program::builder("Leaver")
            .step_fn("start", spawn_and_leave)
            .step_fn("leave", leave)
            .build(),
        Program::builder("Outer").step_fn("start", call_watchdog).build(),
        Program::builder("Watchdog")
            .step_fn("start", arm_deadline)
            .step_fn("wait", finish)
            .step_fn("done", finish)
            .build(),
        Program::builder("Hibernator").step_fn("start", hibernate).build(),
    ];

    let mut registry = ProgramRegistry::new();
    for program in programs {
        registry.register(program.unwrap()).unwrap();
    }
    registry
}

// ============================================
// Scenarios
// ============================================

#[test_log::test(tokio::test)]
async fn test_counter_returns_after_three_passes() {
    let h = Harness::new(registry());
    let id = h
        .client
        .assemble("Example", Frame::new().with("n", 0))
        .await
        .unwrap();

    assert_eq!(h.pass(0).await.dispatched, 1);
    assert_eq!(h.strand(id).await.label, "loop");
    assert_eq!(h.pass(1).await.dispatched, 1);
    let report = h.pass(2).await;
    assert_eq!(report.completed, 1);

    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Completed);
    assert_eq!(strand.exitval, Some(json!(3)));
    assert!(strand.stack.is_empty());

    // Finished strands are never listed again
    assert_eq!(h.pass(3).await.examined, 0);
}

#[test_log::test(tokio::test)]
async fn test_parent_collects_each_child_once() {
    let h = Harness::new(registry());
    let parent = h.client.assemble("Parent", Frame::new()).await.unwrap();

    h.pass(0).await;
    assert_eq!(h.client.children(parent).await.unwrap().len(), 2);

    // Children take their first step and suspend
    h.pass(1).await;
    assert_eq!(h.strand(parent).await.label, "wait");

    // First child finishes; the parent collects it but is not a leaf yet
    h.pass(12).await;
    h.pass(13).await;
    let strand = h.strand(parent).await;
    assert_eq!(strand.status, StrandStatus::Running);
    let seen: Vec<Uuid> = strand.top_frame().unwrap().fetch("seen").unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(h.client.children(parent).await.unwrap().len(), 1);

    // Second child finishes
    h.pass(32).await;
    h.pass(33).await;
    let strand = h.strand(parent).await;
    assert_eq!(strand.status, StrandStatus::Completed);

    let exitval = strand.exitval.unwrap();
    assert_eq!(exitval["sum"], json!(3));
    let seen: Vec<Uuid> = serde_json::from_value(exitval["seen"].clone()).unwrap();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);

    // Collected children are reaped
    assert!(h.client.children(parent).await.unwrap().is_empty());
    assert_eq!(h.store.strand_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_child_failure_surfaces_on_collect() {
    let h = Harness::new(registry());
    let parent = h.client.assemble("Guardian", Frame::new()).await.unwrap();

    for secs in 0..4 {
        h.pass(secs).await;
    }

    let strand = h.strand(parent).await;
    assert_eq!(strand.status, StrandStatus::Completed);
    let exitval = strand.exitval.unwrap();
    assert_eq!(exitval["sum"], json!(0));
    let failures: Vec<String> = serde_json::from_value(exitval["failures"].clone()).unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("disk vanished"));
}

#[test_log::test(tokio::test)]
async fn test_destroy_forces_teardown() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Server", Frame::new()).await.unwrap();

    h.pass(0).await;
    h.pass(1).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.label, "wait");
    assert!(strand.not_before > h.at(1000));
    assert_eq!(
        h.client.resource_state(id).await.unwrap(),
        ResourceState::Running
    );

    // Raising wakes the suspended strand
    h.client.destroy(id).await.unwrap();
    assert_eq!(
        h.client.resource_state(id).await.unwrap(),
        ResourceState::Deleting
    );

    h.pass(2).await;
    assert_eq!(h.strand(id).await.label, "destroy");

    h.pass(3).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Completed);
    assert_eq!(strand.exitval, Some(json!("destroyed")));
    assert!(!h.client.is_raised(id, semaphore::DESTROY).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_destroy_cancels_pushed_sub_call() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Vm", Frame::new()).await.unwrap();

    h.pass(0).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.depth(), 2);
    assert_eq!(strand.label, "restart");

    // The sub-call is waiting on a slow operation
    h.pass(1).await;
    h.client.destroy(id).await.unwrap();

    // Steered to teardown inside the sub-call
    h.pass(2).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.label, "destroy");
    assert_eq!(strand.depth(), 2);

    // The sub-call is cancelled and returns to its caller
    h.pass(3).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.depth(), 1);
    assert_eq!(strand.label, "start");
    assert_eq!(strand.retval, Some(json!(semaphore::CANCELLED_BY_DESTROY)));

    // The outer level tears down
    h.pass(4).await;
    assert_eq!(h.strand(id).await.label, "destroy");
    h.pass(5).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Completed);
    assert_eq!(strand.exitval, Some(json!("destroyed")));
}

#[test_log::test(tokio::test)]
async fn test_push_and_return_keep_stack_integrity() {
    let h = Harness::new(registry());
    let id = h
        .client
        .assemble("Caller", Frame::new().with("x", 21).with("mine", "kept"))
        .await
        .unwrap();

    h.pass(0).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.depth(), 2);
    assert_eq!(strand.program, "Double");
    let link = strand.top_frame().unwrap().link.clone().unwrap();
    assert_eq!((link.program.as_str(), link.label.as_str()), ("Caller", "start"));

    h.pass(1).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.depth(), 1);
    assert_eq!(strand.program, "Caller");
    assert_eq!(strand.retval, Some(json!(42)));
    assert_eq!(strand.top_frame().unwrap().get("mine"), Some(&json!("kept")));

    h.pass(2).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Completed);
    assert_eq!(strand.exitval, Some(json!(42)));
}

#[test_log::test(tokio::test)]
async fn test_transition_and_suspend_keep_depth() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Server", Frame::new()).await.unwrap();

    h.pass(0).await;
    assert_eq!(h.strand(id).await.depth(), 1);
    h.pass(1).await;
    assert_eq!(h.strand(id).await.depth(), 1);
}

#[test_log::test(tokio::test)]
async fn test_suspend_hides_strand_until_due() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Napper", Frame::new()).await.unwrap();

    h.pass(0).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.not_before, h.at(60));

    assert!(h.store.list_runnable(h.at(59), 10).await.unwrap().is_empty());
    assert_eq!(
        h.dispatcher.run_strand_at(id, h.at(30)).await.unwrap(),
        DispatchOutcome::Skipped
    );

    assert_eq!(h.store.list_runnable(h.at(60), 10).await.unwrap(), vec![id]);
    assert_eq!(h.pass(60).await.completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lease_acquisition_has_one_winner() {
    let store = Arc::new(InMemoryStrandStore::new());
    let new = NewStrand::new("Example", "start", Frame::new().with("n", 0));
    let id = new.id;
    store.create_strand(new).await.unwrap();

    let now = Utc::now();
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .acquire_lease(id, &format!("worker-{i}"), now, Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[test_log::test(tokio::test)]
async fn test_two_dispatchers_never_run_one_strand_twice() {
    let registry = Arc::new(registry());
    let store = Arc::new(InMemoryStrandStore::new());
    let client = StrandClient::new(store.clone(), registry.clone());
    let id = client.assemble("Slow", Frame::new()).await.unwrap();

    let a = Dispatcher::new(
        store.clone(),
        registry.clone(),
        DispatcherConfig::new().with_worker_id("a"),
    );
    let b = Dispatcher::new(store.clone(), registry, DispatcherConfig::new().with_worker_id("b"));

    let (first, second) = tokio::join!(a.run_strand(id), b.run_strand(id));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_dispatched()).count(), 1);
    assert!(outcomes.contains(&DispatchOutcome::Skipped));
    assert_eq!(
        store.load_strand(id).await.unwrap().status,
        StrandStatus::Completed
    );
}

#[test_log::test(tokio::test)]
async fn test_semaphore_consumption() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Server", Frame::new()).await.unwrap();

    assert!(!h.store.consume_semaphore(id, "ping").await.unwrap());
    assert_eq!(h.store.semaphore_count(id, "ping").await.unwrap(), 0);

    h.client.raise(id, "ping").await.unwrap();
    assert!(h.client.is_raised(id, "ping").await.unwrap());
    assert!(h.store.consume_semaphore(id, "ping").await.unwrap());
    assert_eq!(h.store.semaphore_count(id, "ping").await.unwrap(), 0);
    assert!(!h.store.consume_semaphore(id, "ping").await.unwrap());
    assert_eq!(h.store.semaphore_count(id, "ping").await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn test_deadline_fires_exactly_once() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Watched", Frame::new()).await.unwrap();
    let monitor = DeadlineMonitor::new(h.store.clone());

    h.pass(0).await;
    h.pass(1).await;
    assert_eq!(h.strand(id).await.label, "wait");

    assert!(monitor.check_at(h.at(5)).await.unwrap().is_empty());

    let alarms = monitor.check_at(h.at(11)).await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].strand_id, id);
    assert_eq!(alarms[0].target_label, "done");
    assert_eq!(alarms[0].current_label, "wait");

    assert!(monitor.check_at(h.at(12)).await.unwrap().is_empty());

    // An alarm is not a transition
    let strand = h.strand(id).await;
    assert_eq!(strand.label, "wait");
    assert_eq!(strand.status, StrandStatus::Running);
}

#[test_log::test(tokio::test)]
async fn test_fatal_failure_halts_and_keeps_state() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Broken", Frame::new().with("disk", "sda")).await.unwrap();

    assert_eq!(h.pass(0).await.halted, 1);

    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Halted);
    assert_eq!(strand.label, "start");
    assert_eq!(strand.top_frame().unwrap().get("disk"), Some(&json!("sda")));
    let failure = strand.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert!(failure.message.contains("disk vanished"));

    // Halted strands are not rescheduled until resumed
    assert_eq!(h.pass(1).await.examined, 0);
    assert!(h.client.resume(id).await.unwrap());
    assert_eq!(h.pass(2).await.halted, 1);
}

#[test_log::test(tokio::test)]
async fn test_outermost_return_with_live_children_halts() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Leaver", Frame::new()).await.unwrap();

    h.dispatcher.run_strand_at(id, h.at(0)).await.unwrap();
    let children = h.client.children(id).await.unwrap();
    assert_eq!(children.len(), 1);

    let failure = match h.dispatcher.run_strand_at(id, h.at(1)).await.unwrap() {
        DispatchOutcome::Halted { failure } => failure,
        other => panic!("expected a halt, got {other:?}"),
    };
    assert_eq!(failure.kind, FailureKind::ContractViolation);

    let strand = h.strand(id).await;
    assert_eq!(strand.status, StrandStatus::Halted);
    assert_eq!(strand.label, "leave");
    assert_eq!(h.strand(children[0].id).await.parent_id, Some(id));
}

#[test_log::test(tokio::test)]
async fn test_abandon_or_destroy_lets_outermost_frame_return() {
    let h = Harness::new(registry());
    let abandoning = h
        .client
        .assemble("Leaver", Frame::new().with("how", "abandon"))
        .await
        .unwrap();
    let destroying = h
        .client
        .assemble("Leaver", Frame::new().with("how", "destroy"))
        .await
        .unwrap();

    for id in [abandoning, destroying] {
        h.dispatcher.run_strand_at(id, h.at(0)).await.unwrap();
    }
    let abandoned = h.client.children(abandoning).await.unwrap()[0].id;
    let destroyed = h.client.children(destroying).await.unwrap()[0].id;

    for id in [abandoning, destroying] {
        let outcome = h.dispatcher.run_strand_at(id, h.at(1)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { exitval: json!("left") });
    }

    // Abandoned children run on as roots
    let orphan = h.strand(abandoned).await;
    assert_eq!(orphan.parent_id, None);
    assert_eq!(orphan.status, StrandStatus::Running);

    assert!(h.store.load_strand(destroyed).await.is_err());
    assert!(h.client.children(destroying).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_destroyed_children_leave_grandchildren_detached() {
    let h = Harness::new(registry());
    let root = h
        .client
        .assemble("Leaver", Frame::new().with("child", "Leaver").with("how", "destroy"))
        .await
        .unwrap();

    h.dispatcher.run_strand_at(root, h.at(0)).await.unwrap();
    let child = h.client.children(root).await.unwrap()[0].id;
    h.dispatcher.run_strand_at(child, h.at(1)).await.unwrap();
    let grandchild = h.client.children(child).await.unwrap()[0].id;

    h.dispatcher.run_strand_at(root, h.at(2)).await.unwrap();
    assert_eq!(h.strand(root).await.status, StrandStatus::Completed);
    assert!(h.store.load_strand(child).await.is_err());

    let orphan = h.strand(grandchild).await;
    assert_eq!(orphan.parent_id, None);
    assert!(h
        .dispatcher
        .run_strand_at(grandchild, h.at(3))
        .await
        .unwrap()
        .is_dispatched());
}

#[test_log::test(tokio::test)]
async fn test_deadline_retires_when_registering_frame_returns() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Outer", Frame::new()).await.unwrap();
    let monitor = DeadlineMonitor::new(h.store.clone());

    h.pass(0).await;
    assert_eq!(h.strand(id).await.depth(), 2);

    // The sub-call registers its deadline, then returns before reaching it
    h.pass(1).await;
    let deadline = h.store.load_deadline(id).await.unwrap().unwrap();
    assert_eq!(deadline.frame_depth, 2);

    h.pass(2).await;
    let strand = h.strand(id).await;
    assert_eq!(strand.depth(), 1);
    assert_eq!(strand.program, "Outer");
    assert!(h.store.load_deadline(id).await.unwrap().is_none());
    assert!(monitor.check_at(h.at(60)).await.unwrap().is_empty());

    h.pass(3).await;
    assert_eq!(h.strand(id).await.exitval, Some(json!("done")));
}

#[test_log::test(tokio::test)]
async fn test_huge_suspend_is_clamped_to_storable_time() {
    let h = Harness::new(registry());
    let id = h.client.assemble("Hibernator", Frame::new()).await.unwrap();

    let latest = DateTime::from_timestamp(253_402_300_799, 0).unwrap();
    assert_eq!(
        h.dispatcher.run_strand_at(id, h.at(0)).await.unwrap(),
        DispatchOutcome::Suspended { until: latest }
    );
    assert_eq!(h.strand(id).await.not_before, latest);
}

#[test_log::test(tokio::test)]
async fn test_expired_lease_cannot_commit_over_new_holder() {
    let stall = Arc::new(Stall::default());
    let mut registry = registry();
    registry
        .register(
            Program::builder("Stalled")
                .step("start", StallStep(stall.clone()))
                .build()
                .unwrap(),
        )
        .unwrap();
    let registry = Arc::new(registry);

    let store = Arc::new(InMemoryStrandStore::new());
    let client = StrandClient::new(store.clone(), registry.clone());
    // Both executions share one worker id
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        DispatcherConfig::new()
            .with_worker_id("shared")
            .with_lease_ttl(Duration::from_secs(1)),
    );
    let id = client.assemble("Stalled", Frame::new()).await.unwrap();
    let t0 = Utc::now() + chrono::Duration::seconds(1);

    let stale = dispatcher.run_strand_at(id, t0);
    let fresh = async {
        while stall.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // The first lease expired at t0 + 1s
        let outcome = dispatcher
            .run_strand_at(id, t0 + chrono::Duration::seconds(5))
            .await;
        stall.release.notify_one();
        outcome
    };
    let (stale, fresh) = tokio::join!(stale, fresh);

    assert_eq!(fresh.unwrap(), DispatchOutcome::Completed { exitval: json!(2) });
    assert_eq!(stale.unwrap(), DispatchOutcome::LeaseLost);
    assert_eq!(store.load_strand(id).await.unwrap().exitval, Some(json!(2)));
}
