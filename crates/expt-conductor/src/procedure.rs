//! Procedures and instructions
//!
//! A [`Procedure`] is an immutable, named set of [`Instruction`]s keyed by
//! [`ExperimentPath`]. Instructions keep their declaration order, which is
//! also the order consumers are registered with their producers.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConductorError, ProcedureError};
use crate::executor::ExecutorId;
use crate::path::ExperimentPath;

/// Named variable values of an instruction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, Value>);

impl Variables {
    /// Empty variable map
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder: set a variable
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a variable, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Raw value of a variable
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Decode a variable
    ///
    /// # Errors
    /// Returns [`ConductorError::Variable`] if the variable is missing or
    /// does not decode as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConductorError> {
        let value = self.0.get(name).ok_or_else(|| ConductorError::Variable {
            name: name.to_string(),
            message: "not set".to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| ConductorError::Variable {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Layer these variables over a set of defaults
    #[must_use]
    pub fn over(&self, defaults: &Variables) -> Variables {
        let mut merged = defaults.clone();
        merged.0.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Iterate over variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of variables
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no variables are set
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One step of a procedure
///
/// Instructions are values: changing any field produces a new instruction,
/// and the conductor restarts a step exactly when its instruction changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    id: String,
    executor: ExecutorId,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    variables: Variables,
}

impl Instruction {
    /// Create an instruction with no variables
    #[must_use]
    pub fn new(id: impl Into<String>, executor: impl Into<ExecutorId>) -> Self {
        Self {
            id: id.into(),
            executor: executor.into(),
            variables: Variables::new(),
        }
    }

    /// Builder: set a variable
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name, value);
        self
    }

    /// Builder: replace all variables
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Experiment id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Executor identifier
    #[inline]
    #[must_use]
    pub fn executor(&self) -> &ExecutorId {
        &self.executor
    }

    /// Instruction variables
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }
}

/// Immutable, named collection of instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    id: String,
    instructions: IndexMap<ExperimentPath, Instruction>,
}

impl Procedure {
    /// Create an empty procedure
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instructions: IndexMap::new(),
        }
    }

    /// Builder: append an instruction
    ///
    /// Parents must be added before their children.
    ///
    /// # Errors
    /// Returns [`ProcedureError`] if the path is not absolute, is the root,
    /// is already taken, or has no parent instruction.
    pub fn with_instruction(
        mut self,
        path: ExperimentPath,
        instruction: Instruction,
    ) -> Result<Self, ProcedureError> {
        self.check_placement(&path)?;
        self.instructions.insert(path, instruction);
        Ok(self)
    }

    /// Builder: append an instruction at a path given as text
    ///
    /// # Errors
    /// See [`Procedure::with_instruction`]; unparseable text is reported as
    /// [`ProcedureError::InvalidPath`].
    pub fn with(self, path: &str, instruction: Instruction) -> Result<Self, ProcedureError> {
        let parsed = path
            .parse::<ExperimentPath>()
            .map_err(|_| ProcedureError::InvalidPath(path.to_string()))?;
        self.with_instruction(parsed, instruction)
    }

    fn check_placement(&self, path: &ExperimentPath) -> Result<(), ProcedureError> {
        if !path.is_absolute() {
            return Err(ProcedureError::RelativePath(path.clone()));
        }
        let Some(parent) = path.parent() else {
            return Err(ProcedureError::RootInstruction);
        };
        if self.instructions.contains_key(path) {
            return Err(ProcedureError::DuplicatePath(path.clone()));
        }
        if !parent.is_root() && !self.instructions.contains_key(&parent) {
            return Err(ProcedureError::OrphanInstruction {
                path: path.clone(),
                parent,
            });
        }
        Ok(())
    }

    /// Validate the tree structure of a procedure built elsewhere
    ///
    /// # Errors
    /// Returns the first [`ProcedureError`] found.
    pub fn validate(&self) -> Result<(), ProcedureError> {
        for path in self.instructions.keys() {
            if !path.is_absolute() {
                return Err(ProcedureError::RelativePath(path.clone()));
            }
            let parent = path.parent().ok_or(ProcedureError::RootInstruction)?;
            if !parent.is_root() && !self.instructions.contains_key(&parent) {
                return Err(ProcedureError::OrphanInstruction {
                    path: path.clone(),
                    parent,
                });
            }
        }
        Ok(())
    }

    /// Procedure id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path all instruction storage is rooted at
    #[inline]
    #[must_use]
    pub fn root_path(&self) -> ExperimentPath {
        ExperimentPath::root()
    }

    /// Instruction at a path
    #[inline]
    #[must_use]
    pub fn instruction(&self, path: &ExperimentPath) -> Option<&Instruction> {
        self.instructions.get(path)
    }

    /// Check if an instruction exists at a path
    #[inline]
    #[must_use]
    pub fn contains(&self, path: &ExperimentPath) -> bool {
        self.instructions.contains_key(path)
    }

    /// Declaration index of a path
    #[inline]
    #[must_use]
    pub fn position(&self, path: &ExperimentPath) -> Option<usize> {
        self.instructions.get_index_of(path)
    }

    /// Instructions in declaration order
    pub fn instructions(&self) -> impl Iterator<Item = (&ExperimentPath, &Instruction)> {
        self.instructions.iter()
    }

    /// Paths in declaration order
    pub fn paths(&self) -> impl Iterator<Item = &ExperimentPath> {
        self.instructions.keys()
    }

    /// Direct children of a path, in declaration order
    pub fn children<'a>(
        &'a self,
        path: &'a ExperimentPath,
    ) -> impl Iterator<Item = &'a ExperimentPath> + 'a {
        self.instructions
            .keys()
            .filter(move |candidate| candidate.parent().as_ref() == Some(path))
    }

    /// Number of instructions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if the procedure has no instructions
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path(s: &str) -> ExperimentPath {
        s.parse().unwrap()
    }

    fn sample_procedure() -> Procedure {
        Procedure::new("calibration")
            .with("/holder", Instruction::new("holder", "sample-holder"))
            .unwrap()
            .with("/holder/b", Instruction::new("b", "spectrum"))
            .unwrap()
            .with("/holder/a", Instruction::new("a", "spectrum").with_variable("mass", 12))
            .unwrap()
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let procedure = sample_procedure();
        let paths: Vec<_> = procedure.paths().map(ToString::to_string).collect();
        assert_eq!(paths, vec!["/holder", "/holder/b", "/holder/a"]);
        let children: Vec<_> = procedure.children(&path("/holder")).cloned().collect();
        assert_eq!(children, vec![path("/holder/b"), path("/holder/a")]);
        assert_eq!(procedure.position(&path("/holder/a")), Some(2));
    }

    #[test]
    fn test_rejects_orphan_instruction() {
        let error = Procedure::new("p")
            .with("/missing/child", Instruction::new("child", "x"))
            .unwrap_err();
        assert_eq!(
            error,
            ProcedureError::OrphanInstruction {
                path: path("/missing/child"),
                parent: path("/missing"),
            }
        );
    }

    #[test]
    fn test_rejects_duplicate_and_relative_paths() {
        let procedure = Procedure::new("p").with("/a", Instruction::new("a", "x")).unwrap();
        assert_eq!(
            procedure.clone().with("/a", Instruction::new("a", "y")).unwrap_err(),
            ProcedureError::DuplicatePath(path("/a"))
        );
        assert!(matches!(
            procedure.with("../a", Instruction::new("a", "x")),
            Err(ProcedureError::RelativePath(_))
        ));
        assert_eq!(
            Procedure::new("p")
                .with_instruction(ExperimentPath::root(), Instruction::new("r", "x"))
                .unwrap_err(),
            ProcedureError::RootInstruction
        );
    }

    #[test]
    fn test_variables_decode_and_layer() {
        let globals = Variables::new().with("mass", 1).with("unit", "Da");
        let local = Variables::new().with("mass", 12);
        let merged = local.over(&globals);
        assert_eq!(merged.get_as::<u32>("mass").unwrap(), 12);
        assert_eq!(merged.get_as::<String>("unit").unwrap(), "Da");
        assert!(matches!(
            merged.get_as::<u32>("unit"),
            Err(ConductorError::Variable { .. })
        ));
        assert!(merged.get_as::<u32>("absent").is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_order() {
        let procedure = sample_procedure();
        let json = serde_json::to_string(&procedure).unwrap();
        let back: Procedure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, procedure);
        back.validate().unwrap();
    }
}
