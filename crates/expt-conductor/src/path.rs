//! Experiment paths for addressing instructions
//!
//! Provides [`ExperimentPath`], the hierarchical address of an instruction
//! within a procedure. Absolute paths locate instructions; relative paths
//! (`./x`, `../x`) address neighbours from a base instruction and are
//! resolved with [`ExperimentPath::resolve_against`].

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a path is anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Anchor {
    Absolute,
    Relative(usize),
}

/// Path of an instruction within a procedure
///
/// Paths are totally ordered so that a sorted collection of absolute paths
/// reproduces depth-first tree order: `/a < /a/b < /a/c < /b`.
///
/// # Examples
/// - `/` is the procedure root
/// - `/sample/spectrum` is the `spectrum` instruction under `sample`
/// - `../reference` is a sibling, relative to some base instruction
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExperimentPath {
    anchor: Anchor,
    ids: Vec<String>,
}

impl ExperimentPath {
    /// The absolute root path
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self {
            anchor: Anchor::Absolute,
            ids: Vec::new(),
        }
    }

    /// A relative path climbing `ancestors` levels before descending
    #[inline]
    #[must_use]
    pub fn relative(ancestors: usize) -> Self {
        Self {
            anchor: Anchor::Relative(ancestors),
            ids: Vec::new(),
        }
    }

    /// Build an absolute path from ids
    ///
    /// # Errors
    /// Returns [`PathError::InvalidId`] if any id is malformed.
    pub fn absolute<I, S>(ids: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids
            .into_iter()
            .map(|id| validate_id(id.into()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            anchor: Anchor::Absolute,
            ids,
        })
    }

    /// Check if path is anchored at the root
    #[inline]
    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.anchor == Anchor::Absolute
    }

    /// Check if this is the root path
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_absolute() && self.ids.is_empty()
    }

    /// Number of levels a relative path climbs, `None` when absolute
    #[inline]
    #[must_use]
    pub fn ancestors(&self) -> Option<usize> {
        match self.anchor {
            Anchor::Absolute => None,
            Anchor::Relative(n) => Some(n),
        }
    }

    /// Path ids, outermost first
    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Number of ids
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ids.len()
    }

    /// Last id (if any)
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.ids.last().map(String::as_str)
    }

    /// Parent path
    ///
    /// The root has no parent. The parent of an empty relative path
    /// climbs one more level.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        match (self.anchor, self.ids.is_empty()) {
            (Anchor::Absolute, true) => None,
            (Anchor::Relative(n), true) => Some(Self::relative(n + 1)),
            (anchor, false) => Some(Self {
                anchor,
                ids: self.ids[..self.ids.len() - 1].to_vec(),
            }),
        }
    }

    /// Append an id, returning the new path
    ///
    /// The id is taken verbatim; use [`ExperimentPath::try_child`] for
    /// untrusted input.
    #[inline]
    #[must_use]
    pub fn child(&self, id: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.ids.push(id.into());
        child
    }

    /// Append a validated id
    ///
    /// # Errors
    /// Returns [`PathError::InvalidId`] if the id is malformed.
    pub fn try_child(&self, id: impl Into<String>) -> Result<Self, PathError> {
        Ok(self.child(validate_id(id.into())?))
    }

    /// Check if this path strictly contains another
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.anchor == other.anchor
            && self.ids.len() < other.ids.len()
            && other.ids[..self.ids.len()] == self.ids[..]
    }

    /// Resolve this path against a base path
    ///
    /// Absolute paths resolve to themselves. Returns `None` when a relative
    /// path climbs above an absolute base.
    #[must_use]
    pub fn resolve_against(&self, base: &Self) -> Option<Self> {
        let Anchor::Relative(climb) = self.anchor else {
            return Some(self.clone());
        };
        if climb <= base.ids.len() {
            let mut ids = base.ids[..base.ids.len() - climb].to_vec();
            ids.extend(self.ids.iter().cloned());
            return Some(Self {
                anchor: base.anchor,
                ids,
            });
        }
        match base.anchor {
            Anchor::Absolute => None,
            Anchor::Relative(n) => Some(Self {
                anchor: Anchor::Relative(n + climb - base.ids.len()),
                ids: self.ids.clone(),
            }),
        }
    }

    /// Express this path relative to a base path
    ///
    /// Returns `None` if the two paths are anchored differently.
    #[must_use]
    pub fn relative_to(&self, base: &Self) -> Option<Self> {
        if self.anchor != base.anchor {
            return None;
        }
        let common = self
            .ids
            .iter()
            .zip(&base.ids)
            .take_while(|(a, b)| a == b)
            .count();
        Some(Self {
            anchor: Anchor::Relative(base.ids.len() - common),
            ids: self.ids[common..].to_vec(),
        })
    }

    /// Iterate from the root down to this path, excluding the path itself
    pub fn ancestry(&self) -> impl Iterator<Item = Self> + '_ {
        (0..self.ids.len()).map(move |len| Self {
            anchor: self.anchor,
            ids: self.ids[..len].to_vec(),
        })
    }
}

fn validate_id(id: String) -> Result<String, PathError> {
    let malformed = id.is_empty()
        || id == "."
        || id == ".."
        || id.chars().any(|c| c == '/' || c.is_control());
    if malformed {
        Err(PathError::InvalidId(id))
    } else {
        Ok(id)
    }
}

impl Display for ExperimentPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.anchor {
            Anchor::Absolute => f.write_str("/")?,
            Anchor::Relative(0) => f.write_str("./")?,
            Anchor::Relative(n) => {
                for _ in 0..n {
                    f.write_str("../")?;
                }
            }
        }
        f.write_str(&self.ids.join("/"))
    }
}

impl FromStr for ExperimentPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }

        let (mut anchor, rest) = match s.strip_prefix('/') {
            Some(rest) => (Anchor::Absolute, rest),
            None => (Anchor::Relative(0), s),
        };

        if rest.contains("//") {
            return Err(PathError::InvalidId(String::new()));
        }

        let mut ids = Vec::new();
        let mut descending = false;
        for segment in rest.split('/') {
            match (segment, anchor) {
                ("", _) => continue,
                (".", Anchor::Relative(0)) if !descending => {}
                ("..", Anchor::Relative(n)) if !descending => anchor = Anchor::Relative(n + 1),
                ("." | "..", _) => return Err(PathError::MisplacedAnchor(s.to_string())),
                (id, _) => {
                    descending = true;
                    ids.push(validate_id(id.to_string())?);
                }
            }
        }

        Ok(Self { anchor, ids })
    }
}

impl TryFrom<String> for ExperimentPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExperimentPath> for String {
    fn from(path: ExperimentPath) -> Self {
        path.to_string()
    }
}

/// Path parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Empty input
    #[error("empty path")]
    Empty,

    /// Malformed id segment
    #[error("invalid path id '{0}'")]
    InvalidId(String),

    /// `.` or `..` after the first id
    #[error("'.' and '..' may only lead a path: {0}")]
    MisplacedAnchor(String),
}
