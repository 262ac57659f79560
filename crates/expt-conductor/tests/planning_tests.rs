use expt_conductor::{
    DependencyKind, Evaluation, ExecutorRegistry, Instruction, Procedure, ProcedureDependents, Variables,
};
use expt_test_utils::{path, FnExecutor};
use proptest::prelude::*;

struct Sample;

fn registry() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(
            "holder",
            FnExecutor::new(
                |c| {
                    let evaluation = c.declare_variable::<Evaluation>("evaluation").unwrap_or_default();
                    c.prepares_condition::<Sample>(evaluation);
                },
                |_| Ok(()),
            ),
        )
        .with(
            "consumer",
            FnExecutor::new(|c| c.declare_condition_requirement::<Sample>(), |_| Ok(())),
        )
}

fn holder_procedure(evaluation: &str, consumers: usize) -> Procedure {
    (0..consumers).fold(
        Procedure::new("p")
            .with("/holder", Instruction::new("holder", "holder").with_variable("evaluation", evaluation))
            .unwrap(),
        |procedure, index| {
            procedure
                .with(&format!("/holder/c{index}"), Instruction::new(format!("c{index}"), "consumer"))
                .unwrap()
        },
    )
}

proptest! {
    #[test]
    fn prop_ordered_consumers_form_a_chain(consumers in 1..12usize) {
        let procedure = holder_procedure("ORDERED", consumers);
        let planned = ProcedureDependents::new(&procedure, &registry(), &Variables::new()).unwrap();

        let holder = planned.dependents(&path("/holder")).unwrap();
        let expected: Vec<_> = (0..consumers).map(|i| path(&format!("/holder/c{i}"))).collect();
        prop_assert_eq!(holder.consumers().cloned().collect::<Vec<_>>(), expected);

        let ordering = planned.edges().iter().filter(|e| e.kind == DependencyKind::Ordering).count();
        prop_assert_eq!(ordering, consumers - 1);
        for index in 1..consumers {
            let following = planned.dependencies(&path(&format!("/holder/c{index}"))).unwrap();
            prop_assert_eq!(following.ordering().len(), 1);
            prop_assert_eq!(&following.ordering()[0].to, &path(&format!("/holder/c{}", index - 1)));
        }
    }

    #[test]
    fn prop_planning_is_repeatable(consumers in 0..8usize, ordered in any::<bool>()) {
        let evaluation = if ordered { "ORDERED" } else { "PARALLEL" };
        let procedure = holder_procedure(evaluation, consumers);
        let first = ProcedureDependents::new(&procedure, &registry(), &Variables::new()).unwrap();
        let second = ProcedureDependents::new(&procedure, &registry(), &Variables::new()).unwrap();
        prop_assert_eq!(first.edges(), second.edges());
    }
}

#[test]
fn test_unordered_condition_adds_no_ordering() {
    let planned =
        ProcedureDependents::new(&holder_procedure("SERIAL", 4), &registry(), &Variables::new()).unwrap();
    assert!(planned.edges().iter().all(|e| e.kind == DependencyKind::Condition));
    assert_eq!(planned.edges().len(), 4);
}
