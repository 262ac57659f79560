//! Shared vocabulary types

use std::any::{type_name, TypeId};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a production type
///
/// Conditions, results and resources are keyed by the Rust type of the
/// value they carry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductionType {
    name: &'static str,
    id: TypeId,
}

impl ProductionType {
    /// Production type of `T`
    #[inline]
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            id: TypeId::of::<T>(),
        }
    }

    /// Fully qualified type name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ProductionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProductionType({})", self.name)
    }
}

impl fmt::Display for ProductionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Kind of value an instruction produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductionKind {
    /// Exclusive, scoped value handed to consumers in turn
    Condition,
    /// Observable value read by any number of consumers
    Result,
}

/// Kind of a planned dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    /// Consumer is gated by its parent's condition
    Condition,
    /// Consumer reads its parent's result
    Result,
    /// Consumer reads a result of an explicitly addressed instruction
    AdditionalResult,
    /// Consumer must follow another consumer of an ordered condition
    Ordering,
}

impl DependencyKind {
    /// Production kind carried along this edge, `None` for ordering edges
    #[must_use]
    pub fn production_kind(self) -> Option<ProductionKind> {
        match self {
            DependencyKind::Condition => Some(ProductionKind::Condition),
            DependencyKind::Result | DependencyKind::AdditionalResult => {
                Some(ProductionKind::Result)
            }
            DependencyKind::Ordering => None,
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DependencyKind::Condition => "condition",
            DependencyKind::Result => "result",
            DependencyKind::AdditionalResult => "additional result",
            DependencyKind::Ordering => "ordering",
        };
        f.write_str(name)
    }
}

/// Admission policy for consumers of a produced condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Evaluation {
    /// Consumers acquire strictly in declaration order, one at a time
    Ordered,
    /// Consumers acquire one at a time in any order
    Serial,
    /// Serial, within a single preparation
    SerialTogether,
    /// Consumers may hold the condition concurrently
    Parallel,
    /// Parallel, within a single preparation
    ParallelTogether,
    /// No constraint declared
    #[default]
    Independent,
}

impl Evaluation {
    /// Check if admission follows declaration order
    #[inline]
    #[must_use]
    pub fn is_ordered(self) -> bool {
        self == Evaluation::Ordered
    }

    /// Check if consumers must never overlap
    #[inline]
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            Evaluation::Ordered | Evaluation::Serial | Evaluation::SerialTogether
        )
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Evaluation::Ordered => "ordered",
            Evaluation::Serial => "serial",
            Evaluation::SerialTogether => "serial-together",
            Evaluation::Parallel => "parallel",
            Evaluation::ParallelTogether => "parallel-together",
            Evaluation::Independent => "independent",
        };
        f.write_str(name)
    }
}

impl FromStr for Evaluation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ordered" => Ok(Evaluation::Ordered),
            "serial" => Ok(Evaluation::Serial),
            "serial-together" => Ok(Evaluation::SerialTogether),
            "parallel" => Ok(Evaluation::Parallel),
            "parallel-together" => Ok(Evaluation::ParallelTogether),
            "independent" => Ok(Evaluation::Independent),
            other => Err(format!("unknown evaluation '{other}'")),
        }
    }
}

/// Identity of one run of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample;

    #[test]
    fn test_production_type_identity() {
        assert_eq!(ProductionType::of::<Sample>(), ProductionType::of::<Sample>());
        assert_ne!(ProductionType::of::<Sample>(), ProductionType::of::<u8>());
        assert!(ProductionType::of::<Sample>().name().ends_with("Sample"));
    }

    #[test]
    fn test_evaluation_parse() {
        assert_eq!("ORDERED".parse(), Ok(Evaluation::Ordered));
        assert_eq!("parallel_together".parse(), Ok(Evaluation::ParallelTogether));
        assert!("sometimes".parse::<Evaluation>().is_err());
        assert_eq!(Evaluation::default(), Evaluation::Independent);
    }

    #[test]
    fn test_evaluation_exclusivity() {
        assert!(Evaluation::Ordered.is_exclusive());
        assert!(Evaluation::SerialTogether.is_exclusive());
        assert!(!Evaluation::ParallelTogether.is_exclusive());
        assert!(!Evaluation::Independent.is_exclusive());
    }

    #[test]
    fn test_evaluation_serde() {
        let json = serde_json::to_string(&Evaluation::SerialTogether).unwrap();
        assert_eq!(json, "\"SERIAL_TOGETHER\"");
    }
}
