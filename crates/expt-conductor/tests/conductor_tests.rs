//! Conducting, re-conducting, interrupting and clearing procedures

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use expt_conductor::{
    Conductor, ConductorConfig, ConductorError, Evaluation, ExecutionOutcome, ExecutionStatus, ExecutorRegistry,
    ExperimentPath, Instruction, OutputEvent, PlanningError, Procedure, StaticEnvironment,
};
use expt_test_utils::{path, FnExecutor, Journal, MemoryStorage, TIMEOUT};
use pretty_assertions::assert_eq;

#[derive(Debug)]
struct Sample;

#[derive(Debug)]
struct Spectrum(u64);

fn wait_for(journal: &Journal, entry: &str) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if journal.contains(entry) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Runs until interrupted, recording start and cancellation
fn idle(journal: &Journal) -> FnExecutor {
    let journal = journal.clone();
    FnExecutor::new(
        |_| {},
        move |c| {
            let id = c.instruction().id().to_string();
            journal.record(format!("{id} started"));
            let deadline = Instant::now() + TIMEOUT;
            while !c.is_cancelled() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            journal.record(format!("{id} cancelled"));
            anyhow::bail!("{id} stopped")
        },
    )
}

fn registry(journal: &Journal) -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with("idle", idle(journal))
        .with("noop", FnExecutor::noop())
}

fn conductor_with(storage: &MemoryStorage, executors: ExecutorRegistry) -> Conductor {
    Conductor::new(
        Arc::new(storage.clone()),
        executors,
        Arc::new(StaticEnvironment::new()),
        ConductorConfig::default(),
    )
}

fn idle_procedure() -> Procedure {
    Procedure::new("p")
        .with("/a", Instruction::new("a", "idle"))
        .unwrap()
        .with("/b", Instruction::new("b", "noop"))
        .unwrap()
}

#[test]
fn test_reconducting_same_procedure_keeps_executions() {
    let journal = Journal::new();
    let storage = MemoryStorage::new();
    let conductor = conductor_with(&storage, registry(&journal));

    let first = conductor.conduct(idle_procedure()).unwrap();
    assert!(wait_for(&journal, "a started"));
    let running = conductor.execution(&path("/a")).unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);

    let second = conductor.conduct(idle_procedure()).unwrap();
    assert_eq!(second.sequence(), first.sequence() + 1);
    assert!(!first.is_live());
    assert!(second.is_live());
    assert!(Arc::ptr_eq(&first.successor().unwrap(), &second));
    assert!(Arc::ptr_eq(&second.prior().unwrap(), &first));
    for id in ["/a", "/b"] {
        let key = path(id);
        assert!(Arc::ptr_eq(&first.progress()[&key], &second.progress()[&key]), "{id}");
    }
    assert_eq!(conductor.execution(&path("/a")).unwrap().id, running.id);
    assert!(!journal.contains("a cancelled"));
    assert!(storage.read(&ExperimentPath::root(), "p.json").is_some());

    conductor.interrupt();
    assert!(journal.contains("a cancelled"));
    let interrupted = conductor.execution(&path("/a")).unwrap();
    assert_eq!(interrupted.outcome, Some(ExecutionOutcome::Interrupted));
    assert!(!interrupted.valid);
    assert!(conductor.procedure().is_some());

    let third = conductor.conduct(idle_procedure()).unwrap();
    let restarted = conductor.execution(&path("/a")).unwrap();
    assert_ne!(restarted.id, running.id);
    assert!(!Arc::ptr_eq(&second.progress()[&path("/a")], &third.progress()[&path("/a")]));
    assert_eq!(third.progress()[&path("/a")].execution, restarted.id);
}

#[test]
fn test_dropped_instruction_is_interrupted_and_deallocated() {
    let journal = Journal::new();
    let storage = MemoryStorage::new();
    let conductor = conductor_with(&storage, registry(&journal));

    conductor.conduct(idle_procedure()).unwrap();
    assert!(wait_for(&journal, "a started"));

    let remaining = Procedure::new("p")
        .with("/b", Instruction::new("b", "noop"))
        .unwrap();
    let output = conductor.conduct(remaining).unwrap();
    assert!(journal.contains("a cancelled"));
    assert!(conductor.execution(&path("/a")).is_none());
    assert_eq!(output.progress().keys().cloned().collect::<Vec<_>>(), vec![path("/b")]);
    assert!(storage.deallocated().contains(&PathBuf::from("/memory/a")));
    assert!(conductor.await_completion(TIMEOUT));
}

#[test]
fn test_changed_producer_restarts_its_consumers_first() {
    let journal = Journal::new();
    let storage = MemoryStorage::new();
    let producer = |version: u64, journal: &Journal| {
        let journal = journal.clone();
        FnExecutor::new(
            |c| c.observes_result::<Spectrum>(),
            move |c| {
                journal.record(format!("a{version} started"));
                c.observe_result(Spectrum(version))?;
                Ok(())
            },
        )
    };
    let reader = {
        let journal = journal.clone();
        FnExecutor::new(
            |c| c.declare_result_requirement::<Spectrum>(),
            move |c| {
                let spectrum = c.acquire_result::<Spectrum>()?;
                let value = spectrum.value()?.map_or(0, |s| s.0);
                journal.record(format!("b read {value}"));
                let deadline = Instant::now() + TIMEOUT;
                while !c.is_cancelled() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(2));
                }
                if c.is_cancelled() {
                    journal.record("b interrupted");
                }
                Ok(())
            },
        )
    };
    let conductor = conductor_with(
        &storage,
        ExecutorRegistry::new()
            .with("v1", producer(1, &journal))
            .with("v2", producer(2, &journal))
            .with("reader", reader),
    );
    let procedure = |version: &str| {
        Procedure::new("p")
            .with("/a", Instruction::new("a", version))
            .unwrap()
            .with("/a/b", Instruction::new("b", "reader"))
            .unwrap()
    };

    conductor.conduct(procedure("v1")).unwrap();
    assert!(wait_for(&journal, "b read 1"));
    let before = conductor.execution(&path("/a/b")).unwrap().id;

    conductor.conduct(procedure("v2")).unwrap();
    assert!(wait_for(&journal, "b read 2"));
    assert!(journal.ordered("b interrupted", "a2 started"));
    assert_ne!(conductor.execution(&path("/a/b")).unwrap().id, before);
}

#[test]
fn test_ordering_dependents_restart_with_predecessor() {
    let conductor = conductor_with(
        &MemoryStorage::new(),
        ExecutorRegistry::new()
            .with(
                "holder",
                FnExecutor::new(
                    |c| c.prepares_condition::<Sample>(Evaluation::Ordered),
                    |c| {
                        c.prepare_condition(|| Sample)?;
                        Ok(())
                    },
                ),
            )
            .with(
                "consumer",
                FnExecutor::new(|c| c.declare_condition_requirement::<Sample>(), |_| Ok(())),
            ),
    );
    let procedure = |gain: u64| {
        Procedure::new("p")
            .with("/holder", Instruction::new("holder", "holder"))
            .unwrap()
            .with("/holder/a", Instruction::new("a", "consumer").with_variable("gain", gain))
            .unwrap()
            .with("/holder/b", Instruction::new("b", "consumer"))
            .unwrap()
            .with("/holder/c", Instruction::new("c", "consumer"))
            .unwrap()
    };
    let ids = |conductor: &Conductor| {
        ["/holder", "/holder/a", "/holder/b", "/holder/c"]
            .map(|id| conductor.execution(&path(id)).map(|execution| execution.id))
    };

    conductor.conduct(procedure(1)).unwrap();
    assert!(conductor.await_completion(TIMEOUT));
    let before = ids(&conductor);

    conductor.conduct(procedure(2)).unwrap();
    assert!(conductor.await_completion(TIMEOUT));
    let after = ids(&conductor);

    assert_eq!(before[0], after[0]);
    for index in 1..4 {
        assert_ne!(before[index], after[index], "consumer {index} kept its execution");
    }
}

#[test]
fn test_clear_drops_everything_and_deallocates_root() {
    let journal = Journal::new();
    let storage = MemoryStorage::new();
    let conductor = conductor_with(&storage, registry(&journal));

    conductor.conduct(idle_procedure()).unwrap();
    assert!(wait_for(&journal, "a started"));
    conductor.clear().unwrap();

    assert!(journal.contains("a cancelled"));
    assert!(conductor.procedure().is_none());
    assert!(conductor.execution(&path("/a")).is_none());
    assert!(conductor.output().progress().is_empty());
    assert!(conductor.output().procedure().is_none());
    assert_eq!(storage.deallocated().last(), Some(&PathBuf::from("/memory")));

    let fresh = Procedure::new("q")
        .with("/x", Instruction::new("x", "noop"))
        .unwrap();
    let output = conductor.conduct(fresh).unwrap();
    assert_eq!(output.progress().keys().cloned().collect::<Vec<_>>(), vec![path("/x")]);
    assert!(conductor.await_completion(TIMEOUT));
}

#[test]
fn test_clear_reports_deallocation_failure_after_interrupting() {
    let journal = Journal::new();
    let storage = MemoryStorage::new();
    let conductor = conductor_with(&storage, registry(&journal));

    conductor.conduct(idle_procedure()).unwrap();
    assert!(wait_for(&journal, "a started"));
    storage.fail_deallocation();

    let error = conductor.clear().unwrap_err();
    assert!(matches!(error, ConductorError::Storage { ref path, .. } if path.is_root()));
    assert!(journal.contains("a cancelled"));
    assert!(conductor.output().progress().is_empty());
}

#[test]
fn test_output_events_follow_executions() {
    let conductor = conductor_with(&MemoryStorage::new(), registry(&Journal::new()));
    let initial = conductor.output();
    assert_eq!(initial.sequence(), 0);
    let mut events = initial.subscribe();

    let procedure = Procedure::new("p")
        .with("/b", Instruction::new("b", "noop"))
        .unwrap();
    conductor.conduct(procedure).unwrap();
    assert!(conductor.await_completion(TIMEOUT));
    conductor.clear().unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 4, "{received:?}");
    assert!(matches!(&received[0], OutputEvent::Succeeded { sequence: 1, .. }));
    assert!(matches!(&received[1], OutputEvent::ExecutionStarted { path, .. } if *path == self::path("/b")));
    assert!(matches!(
        &received[2],
        OutputEvent::ExecutionCompleted { outcome: ExecutionOutcome::Succeeded, .. }
    ));
    match &received[3] {
        OutputEvent::Succeeded { sequence, successor } => {
            assert_eq!(*sequence, 2);
            assert!(successor.progress().is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_storage_failure_skips_only_that_instruction() {
    let storage = MemoryStorage::new();
    storage.fail_locating(&path("/a/b"));
    let conductor = conductor_with(&storage, registry(&Journal::new()));

    let procedure = Procedure::new("p")
        .with("/a", Instruction::new("a", "noop"))
        .unwrap()
        .with("/a/b", Instruction::new("b", "noop"))
        .unwrap();
    let error = conductor.conduct(procedure).unwrap_err();
    assert!(matches!(error, ConductorError::Storage { ref path, .. } if *path == self::path("/a/b")));

    assert!(conductor.procedure().is_some());
    assert!(conductor.execution(&path("/a/b")).is_none());
    assert!(conductor.await_completion(TIMEOUT));
    assert_eq!(
        conductor.execution(&path("/a")).unwrap().outcome,
        Some(ExecutionOutcome::Succeeded)
    );
}

#[test]
fn test_storage_failure_releases_the_producer() {
    let storage = MemoryStorage::new();
    storage.fail_locating(&path("/holder/a"));
    let journal = Journal::new();
    let record = journal.clone();
    let conductor = conductor_with(
        &storage,
        ExecutorRegistry::new()
            .with(
                "holder",
                FnExecutor::new(
                    |c| c.prepares_condition::<Sample>(Evaluation::Ordered),
                    |c| {
                        c.prepare_condition(|| Sample)?;
                        Ok(())
                    },
                ),
            )
            .with(
                "consumer",
                FnExecutor::new(
                    |c| c.declare_condition_requirement::<Sample>(),
                    move |c| {
                        let sample = c.acquire_condition::<Sample>()?;
                        record.record(format!("{} acquired", c.instruction().id()));
                        sample.close();
                        Ok(())
                    },
                ),
            ),
    );
    let procedure = Procedure::new("p")
        .with("/holder", Instruction::new("holder", "holder"))
        .unwrap()
        .with("/holder/a", Instruction::new("a", "consumer"))
        .unwrap()
        .with("/holder/b", Instruction::new("b", "consumer"))
        .unwrap();

    let error = conductor.conduct(procedure).unwrap_err();
    assert!(matches!(error, ConductorError::Storage { ref path, .. } if *path == self::path("/holder/a")));
    assert!(conductor.await_completion(TIMEOUT));
    assert_eq!(journal.entries(), vec!["b acquired"]);
    assert_eq!(
        conductor.execution(&path("/holder")).unwrap().outcome,
        Some(ExecutionOutcome::Succeeded)
    );
}

#[test]
fn test_restarted_consumer_reacquires_held_condition() {
    let journal = Journal::new();
    let (prepared, record) = (journal.clone(), journal.clone());
    let conductor = conductor_with(
        &MemoryStorage::new(),
        ExecutorRegistry::new()
            .with(
                "holder",
                FnExecutor::new(
                    |c| c.prepares_condition::<Sample>(Evaluation::Serial),
                    move |c| {
                        c.prepare_condition(|| Sample)?;
                        prepared.record("prepared");
                        Ok(())
                    },
                ),
            )
            .with(
                "consumer",
                FnExecutor::new(
                    |c| c.declare_condition_requirement::<Sample>(),
                    move |c| {
                        let gain: u64 = c.variable("gain")?;
                        let sample = c.acquire_condition::<Sample>()?;
                        record.record(format!("a gain {gain} acquired"));
                        if gain == 1 {
                            let deadline = Instant::now() + TIMEOUT;
                            while !c.is_cancelled() && Instant::now() < deadline {
                                thread::sleep(Duration::from_millis(2));
                            }
                        }
                        sample.close();
                        Ok(())
                    },
                ),
            ),
    );
    let procedure = |gain: u64| {
        Procedure::new("p")
            .with("/holder", Instruction::new("holder", "holder"))
            .unwrap()
            .with("/holder/a", Instruction::new("a", "consumer").with_variable("gain", gain))
            .unwrap()
    };

    conductor.conduct(procedure(1)).unwrap();
    assert!(wait_for(&journal, "a gain 1 acquired"));
    let holder = conductor.execution(&path("/holder")).unwrap().id;

    conductor.conduct(procedure(2)).unwrap();
    assert!(conductor.await_completion(TIMEOUT));
    assert_eq!(journal.entries(), vec!["a gain 1 acquired", "a gain 2 acquired", "prepared"]);
    assert_eq!(conductor.execution(&path("/holder")).unwrap().id, holder);
    assert_eq!(
        conductor.execution(&path("/holder/a")).unwrap().outcome,
        Some(ExecutionOutcome::Succeeded)
    );
}

#[test]
fn test_persist_failure_leaves_conductor_untouched() {
    let storage = MemoryStorage::new();
    storage.fail_locating(&ExperimentPath::root());
    let conductor = conductor_with(&storage, registry(&Journal::new()));

    let error = conductor.conduct(idle_procedure()).unwrap_err();
    assert!(matches!(error, ConductorError::Storage { .. }));
    assert!(conductor.procedure().is_none());
    assert_eq!(conductor.output().sequence(), 0);
    assert!(storage.located().is_empty());
}

#[test]
fn test_planning_error_leaves_conductor_untouched() {
    let conductor = conductor_with(
        &MemoryStorage::new(),
        registry(&Journal::new()).with(
            "mixed",
            FnExecutor::new(
                |c| {
                    c.declare_condition_requirement::<Sample>();
                    c.declare_result_requirement::<Spectrum>();
                },
                |_| Ok(()),
            ),
        ),
    );
    let procedure = Procedure::new("p")
        .with("/b", Instruction::new("b", "noop"))
        .unwrap();
    conductor.conduct(procedure).unwrap();
    assert!(conductor.await_completion(TIMEOUT));

    let broken = Procedure::new("q")
        .with("/b", Instruction::new("b", "noop"))
        .unwrap()
        .with("/b/m", Instruction::new("m", "mixed"))
        .unwrap();
    let error = conductor.conduct(broken).unwrap_err();
    assert!(error.is_planning());
    assert!(matches!(
        error,
        ConductorError::Planning(PlanningError::MixedRequirements(ref p)) if *p == path("/b/m")
    ));

    let unknown = Procedure::new("q")
        .with("/z", Instruction::new("z", "missing"))
        .unwrap();
    assert!(conductor.conduct(unknown).unwrap_err().is_planning());

    assert_eq!(conductor.procedure().unwrap().id(), "p");
    assert_eq!(conductor.output().sequence(), 1);
}

#[test]
fn test_panicking_body_fails_its_execution() {
    let conductor = conductor_with(
        &MemoryStorage::new(),
        ExecutorRegistry::new().with("boom", FnExecutor::new(|_| {}, |_| panic!("boom"))),
    );
    let procedure = Procedure::new("p")
        .with("/x", Instruction::new("x", "boom"))
        .unwrap();
    conductor.conduct(procedure).unwrap();
    assert!(conductor.await_completion(TIMEOUT));

    let execution = conductor.execution(&path("/x")).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.outcome, Some(ExecutionOutcome::Failed("boom".to_string())));
}

#[test]
fn test_executions_see_merged_variables_and_own_storage() {
    let journal = Journal::new();
    let record = journal.clone();
    let conductor = Conductor::new(
        Arc::new(MemoryStorage::new()),
        ExecutorRegistry::new().with(
            "report",
            FnExecutor::new(
                |_| {},
                move |c| {
                    let gain: u64 = c.variable("gain")?;
                    record.record(format!("{} gain {gain} at {}", c.path(), c.location().display()));
                    Ok(())
                },
            ),
        ),
        Arc::new(StaticEnvironment::new().with_variable("gain", 2)),
        ConductorConfig::default().with_persist_procedures(false),
    );
    let procedure = Procedure::new("p")
        .with("/a", Instruction::new("a", "report"))
        .unwrap()
        .with("/a/b", Instruction::new("b", "report").with_variable("gain", 3))
        .unwrap();
    conductor.conduct(procedure).unwrap();
    assert!(conductor.await_completion(TIMEOUT));

    let mut entries = journal.entries();
    entries.sort();
    assert_eq!(
        entries,
        vec!["/a gain 2 at /memory/a", "/a/b gain 3 at /memory/a/b"]
    );
}
