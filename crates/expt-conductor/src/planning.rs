//! Dependency planning
//!
//! [`ProcedureDependents`] runs every instruction's [`Executor::plan`]
//! against a recording [`PlanningContext`] and resolves the declarations
//! into [`Dependency`] edges. The result is built once per procedure and
//! shared read-only by every instruction execution.
//!
//! Resolution rules:
//! - condition and result requirements resolve to the parent instruction
//! - additional result requirements resolve their path against the
//!   requiring instruction
//! - every ORDERED condition with consumers `[b, c, d]` adds ordering edges
//!   `c -> b` and `d -> c`

use indexmap::{IndexMap, IndexSet};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::de::DeserializeOwned;

use crate::error::{ConductorError, PlanningError};
use crate::executor::ExecutorRegistry;
use crate::path::ExperimentPath;
use crate::procedure::{Procedure, Variables};
use crate::types::{DependencyKind, Evaluation, ProductionType};

/// Recording context handed to [`Executor::plan`](crate::Executor::plan)
#[derive(Debug)]
pub struct PlanningContext<'a> {
    path: &'a ExperimentPath,
    variables: &'a Variables,
    declarations: Declarations,
}

#[derive(Debug, Default)]
struct Declarations {
    conditions: Vec<ProductionType>,
    results: Vec<ProductionType>,
    additional_results: Vec<(ExperimentPath, ProductionType)>,
    resources: IndexSet<ProductionType>,
    prepared: IndexMap<ProductionType, Evaluation>,
    observed: IndexSet<ProductionType>,
    variables: IndexSet<String>,
}

impl<'a> PlanningContext<'a> {
    fn new(path: &'a ExperimentPath, variables: &'a Variables) -> Self {
        Self {
            path,
            variables,
            declarations: Declarations::default(),
        }
    }

    /// Path of the instruction being planned
    #[inline]
    #[must_use]
    pub fn path(&self) -> &ExperimentPath {
        self.path
    }

    /// Instruction variables layered over the environment's globals
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &Variables {
        self.variables
    }

    /// Decode a variable without declaring it
    ///
    /// # Errors
    /// Returns [`ConductorError::Variable`] if missing or malformed.
    pub fn variable<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConductorError> {
        self.variables.get_as(name)
    }

    /// Declare a variable the instruction reads, returning its value if set
    pub fn declare_variable<T: DeserializeOwned>(&mut self, name: &str) -> Option<T> {
        self.declarations.variables.insert(name.to_string());
        self.variables.get_as(name).ok()
    }

    /// Require the parent's condition of type `T`
    pub fn declare_condition_requirement<T: 'static>(&mut self) {
        self.declarations.conditions.push(ProductionType::of::<T>());
    }

    /// Require the parent's result of type `T`
    pub fn declare_result_requirement<T: 'static>(&mut self) {
        self.declarations.results.push(ProductionType::of::<T>());
    }

    /// Require the result of type `T` of the instruction at `path`
    ///
    /// Relative paths resolve against this instruction.
    pub fn declare_additional_result_requirement<T: 'static>(&mut self, path: ExperimentPath) {
        self.declarations
            .additional_results
            .push((path, ProductionType::of::<T>()));
    }

    /// Declare a resource of type `T` the body will acquire
    pub fn declare_resource_requirement<T: 'static>(&mut self) {
        self.declarations.resources.insert(ProductionType::of::<T>());
    }

    /// Declare a condition of type `T` this instruction prepares
    pub fn prepares_condition<T: 'static>(&mut self, evaluation: Evaluation) {
        self.declarations
            .prepared
            .insert(ProductionType::of::<T>(), evaluation);
    }

    /// Declare a result of type `T` this instruction observes
    pub fn observes_result<T: 'static>(&mut self) {
        self.declarations.observed.insert(ProductionType::of::<T>());
    }
}

/// Edge discovered by planning
///
/// `from` is the consuming (or following) instruction and `to` the
/// producing (or preceding) one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Edge kind
    pub kind: DependencyKind,
    /// Production carried or ordered on
    pub production: ProductionType,
    /// Consumer
    pub from: ExperimentPath,
    /// Producer
    pub to: ExperimentPath,
}

/// Requirements of one instruction, resolved to edges
#[derive(Debug, Clone, Default)]
pub struct InstructionDependencies {
    condition: Option<Dependency>,
    result: Option<Dependency>,
    additional_results: Vec<Dependency>,
    ordering: Vec<Dependency>,
    resources: IndexSet<ProductionType>,
    variables: IndexSet<String>,
}

impl InstructionDependencies {
    /// Primary condition requirement
    #[inline]
    #[must_use]
    pub fn condition(&self) -> Option<&Dependency> {
        self.condition.as_ref()
    }

    /// Primary result requirement
    #[inline]
    #[must_use]
    pub fn result(&self) -> Option<&Dependency> {
        self.result.as_ref()
    }

    /// Additional result requirements in declaration order
    #[inline]
    #[must_use]
    pub fn additional_results(&self) -> &[Dependency] {
        &self.additional_results
    }

    /// Consumers this instruction must follow
    #[inline]
    #[must_use]
    pub fn ordering(&self) -> &[Dependency] {
        &self.ordering
    }

    /// Every hand-off edge (condition, result, additional results)
    pub fn hand_offs(&self) -> impl Iterator<Item = &Dependency> {
        self.condition
            .iter()
            .chain(self.result.iter())
            .chain(self.additional_results.iter())
    }

    /// Check if a resource type was declared
    #[inline]
    #[must_use]
    pub fn requires_resource(&self, resource: &ProductionType) -> bool {
        self.resources.contains(resource)
    }

    /// Declared variable names
    pub fn declared_variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }
}

/// Condition produced by an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedCondition {
    /// Admission policy
    pub evaluation: Evaluation,
    /// Consumers in declaration order
    pub consumers: Vec<ExperimentPath>,
}

/// Productions of one instruction and who consumes them
#[derive(Debug, Clone, Default)]
pub struct InstructionDependents {
    conditions: IndexMap<ProductionType, ProducedCondition>,
    results: IndexMap<ProductionType, Vec<ExperimentPath>>,
    ordering: Vec<ExperimentPath>,
}

impl InstructionDependents {
    /// Conditions this instruction prepares
    pub fn conditions(&self) -> impl Iterator<Item = (&ProductionType, &ProducedCondition)> {
        self.conditions.iter()
    }

    /// Results this instruction observes, with their consumers
    pub fn results(&self) -> impl Iterator<Item = (&ProductionType, &[ExperimentPath])> {
        self.results.iter().map(|(t, c)| (t, c.as_slice()))
    }

    /// Evaluation policy of a prepared condition
    #[inline]
    #[must_use]
    pub fn evaluation(&self, production: &ProductionType) -> Option<Evaluation> {
        self.conditions.get(production).map(|c| c.evaluation)
    }

    /// Consumers of a prepared condition
    #[must_use]
    pub fn condition_consumers(&self, production: &ProductionType) -> &[ExperimentPath] {
        self.conditions
            .get(production)
            .map_or(&[], |c| c.consumers.as_slice())
    }

    /// Consumers of an observed result
    #[must_use]
    pub fn result_consumers(&self, production: &ProductionType) -> &[ExperimentPath] {
        self.results.get(production).map_or(&[], Vec::as_slice)
    }

    /// Check if this instruction prepares the condition
    #[inline]
    #[must_use]
    pub fn prepares(&self, production: &ProductionType) -> bool {
        self.conditions.contains_key(production)
    }

    /// Check if this instruction observes the result
    #[inline]
    #[must_use]
    pub fn observes(&self, production: &ProductionType) -> bool {
        self.results.contains_key(production)
    }

    /// Instructions ordered after this one on some condition
    #[inline]
    #[must_use]
    pub fn ordering_dependents(&self) -> &[ExperimentPath] {
        &self.ordering
    }

    /// Every instruction consuming any production of this one
    pub fn consumers(&self) -> impl Iterator<Item = &ExperimentPath> {
        self.conditions
            .values()
            .flat_map(|c| c.consumers.iter())
            .chain(self.results.values().flatten())
    }
}

/// Planned dependency index of a procedure
#[derive(Debug, Clone, Default)]
pub struct ProcedureDependents {
    dependencies: IndexMap<ExperimentPath, InstructionDependencies>,
    dependents: IndexMap<ExperimentPath, InstructionDependents>,
    edges: Vec<Dependency>,
}

impl ProcedureDependents {
    /// Plan a procedure
    ///
    /// # Arguments
    /// * `procedure` - Procedure to plan
    /// * `executors` - Registry resolving instruction executors
    /// * `globals` - Environment variables instructions are layered over
    ///
    /// # Errors
    /// Returns [`PlanningError`] on unknown executors, dangling, mixed,
    /// duplicate, unsatisfied or cyclic requirements.
    pub fn new(
        procedure: &Procedure,
        executors: &ExecutorRegistry,
        globals: &Variables,
    ) -> Result<Self, PlanningError> {
        let mut declarations = IndexMap::with_capacity(procedure.len());
        for (path, instruction) in procedure.instructions() {
            let executor =
                executors
                    .get(instruction.executor())
                    .ok_or_else(|| PlanningError::UnknownExecutor {
                        path: path.clone(),
                        executor: instruction.executor().to_string(),
                    })?;
            let variables = instruction.variables().over(globals);
            let mut context = PlanningContext::new(path, &variables);
            executor.plan(&mut context);
            declarations.insert(path.clone(), context.declarations);
        }

        let mut planned = Self {
            dependencies: IndexMap::with_capacity(declarations.len()),
            dependents: declarations
                .iter()
                .map(|(path, declared)| {
                    let dependents = InstructionDependents {
                        conditions: declared
                            .prepared
                            .iter()
                            .map(|(production, evaluation)| {
                                let produced = ProducedCondition {
                                    evaluation: *evaluation,
                                    consumers: Vec::new(),
                                };
                                (*production, produced)
                            })
                            .collect(),
                        results: declared
                            .observed
                            .iter()
                            .map(|production| (*production, Vec::new()))
                            .collect(),
                        ordering: Vec::new(),
                    };
                    (path.clone(), dependents)
                })
                .collect(),
            edges: Vec::new(),
        };

        for (path, declared) in &declarations {
            let dependencies = planned.resolve(procedure, path, declared)?;
            planned.dependencies.insert(path.clone(), dependencies);
        }
        planned.add_ordering();
        planned.check_acyclic(procedure)?;

        tracing::debug!(
            procedure = procedure.id(),
            instructions = procedure.len(),
            edges = planned.edges.len(),
            "planned procedure dependencies"
        );
        Ok(planned)
    }

    fn resolve(
        &mut self,
        procedure: &Procedure,
        path: &ExperimentPath,
        declared: &Declarations,
    ) -> Result<InstructionDependencies, PlanningError> {
        if declared.conditions.len() > 1 {
            return Err(PlanningError::DuplicateRequirement {
                path: path.clone(),
                kind: "condition",
            });
        }
        if declared.results.len() > 1 {
            return Err(PlanningError::DuplicateRequirement {
                path: path.clone(),
                kind: "result",
            });
        }
        let has_results = !declared.results.is_empty() || !declared.additional_results.is_empty();
        if !declared.conditions.is_empty() && has_results {
            return Err(PlanningError::MixedRequirements(path.clone()));
        }

        let mut dependencies = InstructionDependencies {
            resources: declared.resources.clone(),
            variables: declared.variables.clone(),
            ..InstructionDependencies::default()
        };

        if let Some(production) = declared.conditions.first() {
            let to = Self::parent_producer(procedure, path, *production)?;
            dependencies.condition = Some(self.link(DependencyKind::Condition, *production, path, to)?);
        }
        if let Some(production) = declared.results.first() {
            let to = Self::parent_producer(procedure, path, *production)?;
            dependencies.result = Some(self.link(DependencyKind::Result, *production, path, to)?);
        }
        for (target, production) in &declared.additional_results {
            let to = target
                .resolve_against(path)
                .filter(|resolved| procedure.contains(resolved))
                .ok_or_else(|| PlanningError::DanglingDependency {
                    path: path.clone(),
                    target: target.to_string(),
                    production: *production,
                })?;
            let edge = self.link(DependencyKind::AdditionalResult, *production, path, to)?;
            dependencies.additional_results.push(edge);
        }
        Ok(dependencies)
    }

    fn parent_producer(
        procedure: &Procedure,
        path: &ExperimentPath,
        production: ProductionType,
    ) -> Result<ExperimentPath, PlanningError> {
        path.parent()
            .filter(|parent| procedure.contains(parent))
            .ok_or_else(|| PlanningError::DanglingDependency {
                path: path.clone(),
                target: path
                    .parent()
                    .map_or_else(|| "..".to_string(), |p| p.to_string()),
                production,
            })
    }

    fn link(
        &mut self,
        kind: DependencyKind,
        production: ProductionType,
        from: &ExperimentPath,
        to: ExperimentPath,
    ) -> Result<Dependency, PlanningError> {
        let unsatisfied = || PlanningError::UnsatisfiedRequirement {
            path: from.clone(),
            producer: to.clone(),
            production,
        };
        let producer = self.dependents.get_mut(&to).ok_or_else(unsatisfied)?;
        let consumers = match kind {
            DependencyKind::Condition => producer
                .conditions
                .get_mut(&production)
                .map(|c| &mut c.consumers),
            _ => producer.results.get_mut(&production),
        }
        .ok_or_else(unsatisfied)?;
        consumers.push(from.clone());

        let edge = Dependency {
            kind,
            production,
            from: from.clone(),
            to,
        };
        self.edges.push(edge.clone());
        Ok(edge)
    }

    fn add_ordering(&mut self) {
        let mut ordering = Vec::new();
        for dependents in self.dependents.values() {
            for (production, produced) in &dependents.conditions {
                if !produced.evaluation.is_ordered() {
                    continue;
                }
                for pair in produced.consumers.windows(2) {
                    ordering.push(Dependency {
                        kind: DependencyKind::Ordering,
                        production: *production,
                        from: pair[1].clone(),
                        to: pair[0].clone(),
                    });
                }
            }
        }

        for edge in ordering {
            if let Some(preceding) = self.dependents.get_mut(&edge.to) {
                preceding.ordering.push(edge.from.clone());
            }
            if let Some(following) = self.dependencies.get_mut(&edge.from) {
                following.ordering.push(edge.clone());
            }
            self.edges.push(edge);
        }
    }

    fn check_acyclic(&self, procedure: &Procedure) -> Result<(), PlanningError> {
        let mut graph = DiGraphMap::<usize, ()>::new();
        for path in procedure.paths() {
            if let Some(index) = procedure.position(path) {
                graph.add_node(index);
            }
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (procedure.position(&edge.from), procedure.position(&edge.to)) {
                graph.add_edge(from, to, ());
            }
        }
        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            let path = procedure
                .paths()
                .nth(cycle.node_id())
                .cloned()
                .unwrap_or_else(ExperimentPath::root);
            PlanningError::CyclicDependency(path)
        })
    }

    /// Requirements of an instruction
    #[inline]
    #[must_use]
    pub fn dependencies(&self, path: &ExperimentPath) -> Option<&InstructionDependencies> {
        self.dependencies.get(path)
    }

    /// Productions and consumers of an instruction
    #[inline]
    #[must_use]
    pub fn dependents(&self, path: &ExperimentPath) -> Option<&InstructionDependents> {
        self.dependents.get(path)
    }

    /// All planned edges
    #[inline]
    #[must_use]
    pub fn edges(&self) -> &[Dependency] {
        &self.edges
    }

    /// Number of planned instructions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// Check if nothing was planned
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}
