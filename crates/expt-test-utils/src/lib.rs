//! Testing utilities for the experiment conductor workspace
//!
//! Closure-backed executors, in-memory storage with failure injection,
//! resource leases that record their release, and small synchronization
//! helpers for driving concurrent scenarios.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use expt_conductor::{
    AnyValue, ExecutionContext, Executor, ExperimentPath, PlanningContext, ResourceError, ResourceLease, Storage,
    StorageConfiguration,
};
use parking_lot::{Condvar, Mutex};

type PlanFn = dyn Fn(&mut PlanningContext<'_>) + Send + Sync;
type ExecuteFn = dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync;

/// Executor built from two closures
pub struct FnExecutor {
    plan: Box<PlanFn>,
    execute: Box<ExecuteFn>,
}

impl FnExecutor {
    pub fn new<P, E>(plan: P, execute: E) -> Self
    where
        P: Fn(&mut PlanningContext<'_>) + Send + Sync + 'static,
        E: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            plan: Box::new(plan),
            execute: Box::new(execute),
        }
    }

    /// Executor that declares nothing and returns immediately
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| Ok(()))
    }
}

impl Executor for FnExecutor {
    fn plan(&self, context: &mut PlanningContext<'_>) {
        (self.plan)(context);
    }

    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        (self.execute)(context)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<PathBuf, Vec<u8>>,
    located: Vec<ExperimentPath>,
    deallocated: Vec<PathBuf>,
    failing: HashSet<ExperimentPath>,
    failing_deallocation: bool,
}

/// Storage configuration that keeps everything in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every attempt to locate storage for `path`
    pub fn fail_locating(&self, path: &ExperimentPath) {
        self.state.lock().failing.insert(path.clone());
    }

    /// Fail every deallocation from now on
    pub fn fail_deallocation(&self) {
        self.state.lock().failing_deallocation = true;
    }

    /// Paths located so far, in order
    pub fn located(&self) -> Vec<ExperimentPath> {
        self.state.lock().located.clone()
    }

    /// Locations deallocated so far, in order
    pub fn deallocated(&self) -> Vec<PathBuf> {
        self.state.lock().deallocated.clone()
    }

    /// Contents of a written entry
    pub fn read(&self, path: &ExperimentPath, name: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(&Self::location(path).join(name)).cloned()
    }

    /// Location assigned to an experiment path
    pub fn location(path: &ExperimentPath) -> PathBuf {
        path.ids().iter().fold(PathBuf::from("/memory"), |dir, id| dir.join(id))
    }
}

impl StorageConfiguration for MemoryStorage {
    fn locate_storage(&self, path: &ExperimentPath) -> io::Result<Box<dyn Storage>> {
        let mut state = self.state.lock();
        if state.failing.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("storage refused for {path}")));
        }
        state.located.push(path.clone());
        Ok(Box::new(MemoryLocation {
            location: Self::location(path),
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
struct MemoryLocation {
    location: PathBuf,
    state: Arc<Mutex<MemoryState>>,
}

impl Storage for MemoryLocation {
    fn location(&self) -> &Path {
        &self.location
    }

    fn write(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        self.state.lock().files.insert(self.location.join(name), contents.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.state.lock().files.remove(&self.location.join(name));
        Ok(())
    }

    fn deallocate(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failing_deallocation {
            return Err(io::Error::new(io::ErrorKind::Other, "deallocation refused"));
        }
        state.files.retain(|file, _| !file.starts_with(&self.location));
        state.deallocated.push(self.location.clone());
        Ok(())
    }
}

/// Lease that records its release in a [`Journal`]
pub struct RecordingLease {
    name: String,
    value: AnyValue,
    fail: bool,
    journal: Journal,
}

impl RecordingLease {
    pub fn new(name: impl Into<String>, value: AnyValue, journal: &Journal) -> Self {
        Self {
            name: name.into(),
            value,
            fail: false,
            journal: journal.clone(),
        }
    }

    /// Make the release fail after recording it
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl ResourceLease for RecordingLease {
    fn value(&self) -> AnyValue {
        Arc::clone(&self.value)
    }

    fn release(self: Box<Self>) -> Result<(), ResourceError> {
        self.journal.record(format!("release {}", self.name));
        if self.fail {
            Err(ResourceError::new(self.name.clone(), "close failed"))
        } else {
            Ok(())
        }
    }
}

/// Shared, ordered log of what happened
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    /// Check that `first` was recorded before `second`
    pub fn ordered(&self, first: &str, second: &str) -> bool {
        matches!((self.position(first), self.position(second)), (Some(a), Some(b)) if a < b)
    }
}

/// Count-down latch
#[derive(Debug, Clone)]
pub struct Latch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    pub fn count_down(&self) {
        let (count, released) = &*self.inner;
        let mut count = count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            released.notify_all();
        }
    }

    /// Wait for the count to reach zero; false on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let (count, released) = &*self.inner;
        let mut count = count.lock();
        while *count > 0 {
            if released.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Parse a path, panicking on malformed input
pub fn path(text: &str) -> ExperimentPath {
    text.parse().unwrap_or_else(|e| panic!("bad test path {text}: {e}"))
}

/// Default wait used by conductor tests
pub const TIMEOUT: Duration = Duration::from_secs(10);
