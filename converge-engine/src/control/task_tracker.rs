//! Memoized async goals with cycle detection.
//! See [`TaskTracker`] for more details.

use super::thunk::Thunk;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Arc,
};
use tokio::sync::Mutex;

/// The work behind each goal of a [`TaskTracker`].
///
/// `work` receives a [`TaskContext`] through which it declares the goals it
/// depends on. A goal's result is computed once and shared with every goal
/// that depends on it.
#[async_trait::async_trait]
pub trait TaskWork {
    type Output: Send + Sync;
    type Key: Clone + Ord + std::fmt::Display + Send;
    type CycleError;

    /// Perform the work for the goal `key`.
    async fn work(&self, context: TaskContext<Self>, key: Self::Key) -> Self::Output;

    /// Report a dependency cycle, found when a goal requires one of its
    /// (transitive) dependents.
    fn cycle_error(&self, cycle: Cycle<Self::Key>) -> Self::CycleError;
}

struct TaskState<Work: TaskWork + ?Sized> {
    result: Thunk<Work::Output>,
    dependencies: BTreeSet<Work::Key>,
}

struct InnerState<Work: TaskWork + ?Sized> {
    tasks: BTreeMap<Work::Key, TaskState<Work>>,
    work_context: Arc<Work>,
}

/// Goal scheduling with memoization and cycle detection.
///
/// Goals are identified by keys. Asking for the same key twice yields the same
/// shared computation, so a goal that many others depend on still runs once.
/// Dependencies are recorded as they are declared, and a declaration that
/// would close a cycle fails with [`TaskWork::cycle_error`] instead of
/// deadlocking.
pub struct TaskTracker<Work: TaskWork + ?Sized> {
    state: Arc<Mutex<InnerState<Work>>>,
}
impl<Work: TaskWork + Send + Sync + 'static> TaskTracker<Work>
where
    Work::Output: Clone + Send + Sync,
    Work::Key: Clone + Send + Sync,
{
    pub fn new(work_context: Arc<Work>) -> Self {
        TaskTracker {
            state: Arc::new(Mutex::new(InnerState {
                tasks: BTreeMap::new(),
                work_context,
            })),
        }
    }

    /// Look up or create the goal for `key`, without starting it.
    pub async fn create(&self, key: Work::Key) -> Thunk<Work::Output> {
        let mut state = self.state.lock().await;
        let work_context = state.work_context.clone();
        match state.tasks.entry(key.clone()) {
            Entry::Occupied(task) => task.get().result.clone(),
            Entry::Vacant(slot) => {
                let context = TaskContext {
                    tracker: self.clone(),
                    key: key.clone(),
                };
                let result = Thunk::new(async move { work_context.work(context, key).await });
                slot.insert(TaskState {
                    result: result.clone(),
                    dependencies: BTreeSet::new(),
                });
                result
            }
        }
    }

    /// Run the goal for `key` and wait for its result.
    pub async fn run(&self, key: Work::Key) -> Work::Output {
        let thunk = self.create(key).await;
        thunk.force().await.clone()
    }
}

impl<Work> Clone for TaskTracker<Work>
where
    Work: TaskWork + ?Sized,
{
    fn clone(&self) -> Self {
        TaskTracker {
            state: self.state.clone(),
        }
    }
}

/// Handed to [`TaskWork::work`]; declares dependencies of the goal being
/// worked on.
pub struct TaskContext<Work: TaskWork + ?Sized> {
    tracker: TaskTracker<Work>,
    key: Work::Key,
}
impl<Work: TaskWork + ?Sized> Clone for TaskContext<Work> {
    fn clone(&self) -> Self {
        TaskContext {
            tracker: self.tracker.clone(),
            key: self.key.clone(),
        }
    }
}
impl<Work: TaskWork + Send + Sync + 'static> TaskContext<Work>
where
    Work::Output: Clone + Send + Sync,
    Work::Key: Clone + Send + Sync,
{
    async fn add_dependency(&self, key: Work::Key) -> Result<(), Work::CycleError> {
        let mut state = self.tracker.state.lock().await;

        let known = match state.tasks.get(&self.key) {
            Some(task) => task.dependencies.contains(&key),
            None => panic!("TaskContext: current task disappeared"),
        };
        if known {
            return Ok(());
        }

        if let Some(mut path) = find_path_to(
            &mut BTreeSet::new(),
            &state.tasks,
            &self.key,
            std::iter::once(&key),
        ) {
            path.reverse();
            return Err(state.work_context.cycle_error(Cycle::new(path)));
        }

        if let Some(task) = state.tasks.get_mut(&self.key) {
            task.dependencies.insert(key);
        }
        Ok(())
    }

    /// Declare a dependency on `key` and start it in the background.
    pub async fn spawn(
        &self,
        key: Work::Key,
    ) -> Result<Thunk<<Work as TaskWork>::Output>, Work::CycleError> {
        self.add_dependency(key.clone()).await?;
        let thunk = self.tracker.create(key).await;
        let thunk_for_task = thunk.clone();
        tokio::spawn(async move {
            thunk_for_task.force().await;
        });
        Ok(thunk)
    }

    /// Declare a dependency on `key` and wait for its result.
    #[allow(clippy::type_complexity)]
    pub fn require(
        &self,
        key: Work::Key,
    ) -> Pin<Box<dyn Future<Output = Result<Work::Output, Work::CycleError>> + Send + '_>>
    where
        Work: 'static,
    {
        Box::pin(async move {
            self.add_dependency(key.clone()).await?;
            Ok(self.tracker.run(key).await)
        })
    }
}

// Depth-first search over recorded dependencies. Step graphs are small and
// mostly shallow, so nothing is cached between searches.
fn find_path_to<'a, Work: TaskWork>(
    seen: &mut BTreeSet<Work::Key>,
    tasks: &'a BTreeMap<Work::Key, TaskState<Work>>,
    needle: &Work::Key,
    outgoing: impl Iterator<Item = &'a Work::Key> + Clone,
) -> Option<Vec<Work::Key>> {
    if outgoing.clone().any(|edge| edge == needle) {
        return Some(vec![needle.clone()]);
    }
    for edge in outgoing {
        if !seen.insert(edge.clone()) {
            continue;
        }
        if let Some(node) = tasks.get(edge) {
            if let Some(mut path) = find_path_to(seen, tasks, needle, node.dependencies.iter()) {
                path.push(edge.clone());
                return Some(path);
            }
        }
    }
    None
}

/// A dependency cycle. The first element of [`Cycle::path`] depends on the
/// second, and so forth; the last depends on the first, which is not repeated.
#[derive(PartialEq, Eq)]
pub struct Cycle<Key> {
    path: Vec<Key>,
}
impl<Key: Clone> Clone for Cycle<Key> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
        }
    }
}
impl<Key> Cycle<Key> {
    /// `path` must not be empty.
    pub fn new(path: Vec<Key>) -> Self {
        assert!(!path.is_empty(), "Cycle must have at least one element");
        Cycle { path }
    }
    pub fn path(&self) -> &[Key] {
        &self.path
    }
    pub fn into_path(self) -> Vec<Key> {
        self.path
    }
}
impl<Key: std::fmt::Display> std::fmt::Display for Cycle<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for k in &self.path {
            write!(f, "{} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}
impl<Key: std::fmt::Debug> std::fmt::Debug for Cycle<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for k in &self.path {
            write!(f, "{:?} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{:?}", first),
            None => Ok(()),
        }
    }
}
