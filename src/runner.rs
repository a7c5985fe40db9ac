//! Runs a function over a list of inputs, sequentially or on a worker pool.
//!
//! Failure policy is fail-fast: the first failing task is handed to the
//! consumer as an `Err` at the point its result is due, after which the run is
//! over and the pool is torn down. Tasks already running on other workers are
//! allowed to finish, nothing is aborted mid-flight. Wrap the task with
//! [`isolated`] to log failures and keep going instead.

use std::{
    any::Any,
    convert::Infallible,
    fmt::{Debug, Display},
    panic::{self, AssertUnwindSafe},
};

use crate::progress::{BarSink, ProgressObserver, ProgressSink};

mod pool;
mod sequential;

use pool::WorkerPool;
use sequential::Sequential;

pub type Outcome<I, O, E> = Result<O, TaskError<I, E>>;

#[derive(Debug, thiserror::Error)]
pub enum TaskError<I, E> {
    #[error("task #{index} failed: {error}")]
    Failed { index: usize, input: I, error: E },
    #[error("task #{index} panicked: {message}")]
    Panicked { index: usize, input: I, message: String },
}

impl<I, E> TaskError<I, E> {
    /// Position of the offending input among the inputs.
    pub fn index(&self) -> usize {
        match self {
            TaskError::Failed { index, .. } | TaskError::Panicked { index, .. } => *index,
        }
    }

    pub fn input(&self) -> &I {
        match self {
            TaskError::Failed { input, .. } | TaskError::Panicked { input, .. } => input,
        }
    }

    pub fn into_input(self) -> I {
        match self {
            TaskError::Failed { input, .. } | TaskError::Panicked { input, .. } => input,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn worker {worker} of {workers}: {source}")]
    Spawn {
        worker: usize,
        workers: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Size of the worker pool; `0` and `1` both mean "run in the calling thread".
    pub workers: usize,
    /// Yield results in input order instead of completion order.
    pub ordered: bool,
    /// Show progress under this label; `None` disables progress entirely.
    pub progress_label: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            ordered: false,
            progress_label: None,
        }
    }
}

/// Builder for a single [`TaskRun`].
///
/// ```no_run
/// use birb_pool::TaskRunner;
///
/// let squares = TaskRunner::new()
///     .workers(4)
///     .ordered(true)
///     .run(|x: &u64| Ok::<_, std::convert::Infallible>(x * x), 0..100)?
///     .collect::<Result<Vec<_>, _>>();
/// # Ok::<(), birb_pool::PoolError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TaskRunner<S = BarSink> {
    options: RunOptions,
    sink: S,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::from(RunOptions::default())
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl From<RunOptions> for TaskRunner {
    fn from(options: RunOptions) -> Self {
        Self {
            options,
            sink: BarSink,
        }
    }
}

impl<S: ProgressSink> TaskRunner<S> {
    pub fn workers(mut self, workers: usize) -> Self {
        self.options.workers = workers;
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.options.ordered = ordered;
        self
    }

    pub fn progress(mut self, label: impl Into<String>) -> Self {
        self.options.progress_label = Some(label.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.options.progress_label = None;
        self
    }

    /// Replace the default progress bar with another sink.
    pub fn with_sink<T: ProgressSink>(self, sink: T) -> TaskRunner<T> {
        TaskRunner {
            options: self.options,
            sink,
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Materializes `inputs` and starts applying `task` to them.
    ///
    /// With more than one worker the pool is spawned right away and starts
    /// working before the first result is pulled. The pool lives as long as
    /// the returned iterator: it is joined when the iterator is exhausted,
    /// when it yields a failure, or when it is dropped.
    pub fn run<I, O, E, F>(
        &self,
        task: F,
        inputs: impl IntoIterator<Item = I>,
    ) -> Result<TaskRun<I, O, E>, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        let inputs: Vec<I> = inputs.into_iter().collect();
        let total = inputs.len();
        let workers = self.options.workers.max(1);

        let source = if workers > 1 {
            log::debug!("running {total} tasks on {workers} workers (ordered: {})", self.options.ordered);
            Source::Pool(WorkerPool::spawn(task, inputs, workers, self.options.ordered)?)
        } else {
            log::debug!("running {total} tasks sequentially");
            Source::Sequential(Sequential::new(task, inputs))
        };

        let progress = self
            .options
            .progress_label
            .as_deref()
            .map(|label| self.sink.start(&format!("{label} @{workers}-threads"), total));

        Ok(TaskRun {
            source,
            progress,
            total,
            yielded: 0,
            done: false,
        })
    }
}

/// Shorthand for `TaskRunner::from(options).run(task, inputs)`.
pub fn run<I, O, E, F>(
    task: F,
    inputs: impl IntoIterator<Item = I>,
    options: RunOptions,
) -> Result<TaskRun<I, O, E>, PoolError>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
{
    TaskRunner::from(options).run(task, inputs)
}

enum Source<I, O, E> {
    Sequential(Sequential<I, O, E>),
    Pool(WorkerPool<I, O, E>),
}

/// Lazy stream of task results.
pub struct TaskRun<I, O, E> {
    source: Source<I, O, E>,
    progress: Option<Box<dyn ProgressObserver + Send>>,
    total: usize,
    yielded: usize,
    done: bool,
}

impl<I, O, E> TaskRun<I, O, E> {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of results handed out so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Worker threads still attached to this run; always `0` when sequential.
    pub fn live_workers(&self) -> usize {
        match &self.source {
            Source::Sequential(_) => 0,
            Source::Pool(pool) => pool.live_workers(),
        }
    }

    /// Runs `f` with the progress indicator hidden, e.g. to print a result.
    pub fn suspend(&self, f: impl FnOnce()) {
        let mut f = Some(f);
        if let Some(progress) = &self.progress {
            progress.suspend(&mut || {
                if let Some(f) = f.take() {
                    f();
                }
            });
        }
        // Observers are free to skip the call.
        if let Some(f) = f {
            f();
        }
    }

    fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Source::Pool(pool) = &mut self.source {
            pool.shutdown();
        }
        if let Some(progress) = &mut self.progress {
            progress.finish();
        }
    }
}

impl<I, O, E> Iterator for TaskRun<I, O, E> {
    type Item = Outcome<I, O, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let outcome = match &mut self.source {
            Source::Sequential(sequential) => sequential.next(),
            Source::Pool(pool) => pool.next(),
        };

        let Some(outcome) = outcome else {
            self.close();
            return None;
        };

        self.yielded += 1;
        if let Some(progress) = &mut self.progress {
            progress.advance();
        }

        if let Err(err) = &outcome {
            log::debug!("stopping run after task #{} failed", err.index());
            self.close();
        }

        Some(outcome)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.total - self.yielded))
        }
    }
}

impl<I, O, E> Drop for TaskRun<I, O, E> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Applies `task` to one input, turning errors and panics into [`TaskError`]s.
pub(crate) fn apply<I, O, E, F>(task: &F, index: usize, input: I) -> Outcome<I, O, E>
where
    F: Fn(&I) -> Result<O, E> + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| task(&input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(TaskError::Failed { index, input, error }),
        Err(payload) => Err(TaskError::Panicked {
            index,
            input,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Makes a task that never fails the run.
///
/// Errors and panics are logged together with the input and become `None`.
pub fn isolated<I, O, E, F>(task: F) -> impl Fn(&I) -> Result<Option<O>, Infallible> + Send + Sync + 'static
where
    I: Debug + 'static,
    O: 'static,
    E: Display + 'static,
    F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
{
    move |input: &I| match panic::catch_unwind(AssertUnwindSafe(|| task(input))) {
        Ok(Ok(output)) => Ok(Some(output)),
        Ok(Err(error)) => {
            log::error!("task failed for {input:?}: {error}");
            Ok(None)
        }
        Err(payload) => {
            log::error!("task panicked for {input:?}: {}", panic_message(payload.as_ref()));
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use super::*;
    use crate::progress::testing::CountingSink;

    fn quiet(workers: usize, ordered: bool) -> TaskRunner {
        TaskRunner::new().workers(workers).ordered(ordered).quiet()
    }

    fn square(x: &u64) -> Result<u64, Infallible> {
        Ok(x * x)
    }

    /// Earlier inputs take longer, so completion order is roughly reversed.
    fn slow_first(x: &u64) -> Result<u64, Infallible> {
        std::thread::sleep(Duration::from_millis(40u64.saturating_sub(*x * 2)));
        Ok(x + 1000)
    }

    fn collect_ok<I: Debug, O, E: Debug>(run: TaskRun<I, O, E>) -> Vec<O> {
        run.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn sequential_squares() {
        let out = collect_ok(quiet(1, true).run(square, [0, 1, 2, 3, 4]).unwrap());
        assert_eq!(out, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn zero_workers_runs_sequentially() {
        let run = quiet(0, false).run(square, [3, 4]).unwrap();
        assert_eq!(run.live_workers(), 0);
        assert_eq!(collect_ok(run), vec![9, 16]);
    }

    #[test]
    fn sequential_runs_in_calling_thread() {
        let caller = std::thread::current().id();
        let out = collect_ok(
            quiet(1, false)
                .run(move |_: &u8| Ok::<_, Infallible>(std::thread::current().id() == caller), [1, 2, 3])
                .unwrap(),
        );
        assert_eq!(out, vec![true, true, true]);
    }

    #[test]
    fn ordered_matches_sequential_for_any_pool_size() {
        let inputs: Vec<u64> = (0..20).collect();
        let expected = collect_ok(quiet(1, true).run(slow_first, inputs.clone()).unwrap());
        for workers in 2..=6 {
            let out = collect_ok(quiet(workers, true).run(slow_first, inputs.clone()).unwrap());
            assert_eq!(out, expected, "workers = {workers}");
        }
    }

    #[test]
    fn unordered_yields_the_same_multiset() {
        let inputs: Vec<u64> = (0..20).chain(0..5).collect();
        let mut expected = collect_ok(quiet(1, false).run(slow_first, inputs.clone()).unwrap());
        let mut out = collect_ok(quiet(4, false).run(slow_first, inputs).unwrap());
        expected.sort();
        out.sort();
        assert_eq!(out, expected);
    }

    #[test]
    fn unordered_identity_is_a_permutation() {
        let out = collect_ok(
            quiet(3, false)
                .run(|s: &&str| Ok::<_, Infallible>(s.to_string()), ["a", "b", "c"])
                .unwrap(),
        );
        assert_eq!(out.len(), 3);
        let set: HashSet<_> = out.into_iter().collect();
        assert_eq!(set, ["a", "b", "c"].into_iter().map(String::from).collect());
    }

    #[test]
    fn pool_has_exactly_the_requested_workers() {
        let run = quiet(5, true).run(square, [1, 2]).unwrap();
        assert_eq!(run.live_workers(), 5);
        assert_eq!(collect_ok(run), vec![1, 4]);
    }

    #[test]
    fn empty_input_on_a_pool() {
        let mut run = quiet(4, true).run(square, Vec::new()).unwrap();
        assert!(run.next().is_none());
        assert_eq!(run.live_workers(), 0);
    }

    #[test]
    fn progress_advances_once_per_result() {
        for workers in [1, 3] {
            let sink = CountingSink::default();
            let run = quiet(workers, false)
                .progress("squares")
                .with_sink(sink.clone())
                .run(square, 0..7)
                .unwrap();
            assert_eq!(sink.ticks(), 0);
            assert_eq!(collect_ok(run).len(), 7);
            assert_eq!(sink.ticks(), 7);
            assert!(sink.finished());
            assert_eq!(*sink.started.lock().unwrap(), vec![(format!("squares @{workers}-threads"), 7)]);
        }
    }

    #[test]
    fn partial_consumption_reports_partial_progress() {
        let sink = CountingSink::default();
        let mut run = quiet(2, true)
            .progress("partial")
            .with_sink(sink.clone())
            .run(square, 0..10)
            .unwrap();
        run.next();
        run.next();
        assert_eq!(run.yielded(), 2);
        drop(run);
        assert_eq!(sink.ticks(), 2);
        assert!(sink.finished());
    }

    #[test]
    fn printing_goes_through_the_observer() {
        let sink = CountingSink::default();
        let printed = AtomicUsize::new(0);
        let mut run = quiet(2, true)
            .progress("print")
            .with_sink(sink.clone())
            .run(square, 0..3)
            .unwrap();
        while let Some(result) = run.next() {
            assert!(result.is_ok());
            run.suspend(|| {
                printed.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(printed.load(Ordering::SeqCst), 3);
        assert_eq!(sink.suspended(), 3);

        let run = quiet(2, true).with_sink(sink.clone()).run(square, 0..3).unwrap();
        run.suspend(|| {
            printed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(printed.load(Ordering::SeqCst), 4);
        assert_eq!(sink.suspended(), 3);
    }

    #[test]
    fn no_label_means_no_observer() {
        let sink = CountingSink::default();
        let run = quiet(2, false).with_sink(sink.clone()).run(square, 0..4).unwrap();
        assert_eq!(collect_ok(run).len(), 4);
        assert!(sink.started.lock().unwrap().is_empty());
        assert_eq!(sink.ticks(), 0);
    }

    fn fails_on_three(x: &u64) -> Result<u64, String> {
        if *x == 3 {
            Err(format!("bad input {x}"))
        } else {
            Ok(*x)
        }
    }

    #[test]
    fn failure_is_yielded_in_position_then_the_run_stops() {
        for workers in [1, 4] {
            let mut run = quiet(workers, true).run(fails_on_three, 0..10).unwrap();
            assert_eq!(run.next().unwrap().unwrap(), 0);
            assert_eq!(run.next().unwrap().unwrap(), 1);
            assert_eq!(run.next().unwrap().unwrap(), 2);

            let err = run.next().unwrap().unwrap_err();
            assert_eq!(err.index(), 3);
            assert_eq!(*err.input(), 3);
            assert!(matches!(&err, TaskError::Failed { error, .. } if error == "bad input 3"));
            assert_eq!(err.to_string(), "task #3 failed: bad input 3");

            assert!(run.next().is_none());
            assert_eq!(run.live_workers(), 0);
        }
    }

    #[test]
    fn failure_lets_running_siblings_finish() {
        let both_started = Arc::new(Barrier::new(2));
        let sibling_done = Arc::new(AtomicBool::new(false));
        let (barrier, done) = (both_started.clone(), sibling_done.clone());

        let mut run = quiet(2, true)
            .run(
                move |x: &u32| {
                    if *x < 2 {
                        barrier.wait();
                    }
                    match x {
                        0 => Err("first input is bad"),
                        1 => {
                            std::thread::sleep(Duration::from_millis(100));
                            done.store(true, Ordering::SeqCst);
                            Ok(*x)
                        }
                        _ => Ok(*x),
                    }
                },
                0..6,
            )
            .unwrap();

        let err = run.next().unwrap().unwrap_err();
        assert_eq!(err.index(), 0);
        assert!(sibling_done.load(Ordering::SeqCst));
        assert_eq!(run.live_workers(), 0);
        assert!(run.next().is_none());
    }

    #[test]
    fn unordered_failure_carries_its_input() {
        let run = quiet(3, false).run(fails_on_three, 0..10).unwrap();
        let outcomes: Vec<_> = run.collect();
        let last = outcomes.last().unwrap().as_ref().unwrap_err();
        assert_eq!(last.index(), 3);
        assert_eq!(*last.input(), 3);
        assert!(outcomes[..outcomes.len() - 1].iter().all(|r| r.is_ok()));
    }

    #[test]
    fn panics_become_task_errors() {
        for workers in [1, 2] {
            let mut run = quiet(workers, true)
                .run(
                    |x: &u32| -> Result<u32, Infallible> {
                        if *x == 1 {
                            panic!("boom");
                        }
                        Ok(*x)
                    },
                    [0, 1, 2],
                )
                .unwrap();
            assert_eq!(run.next().unwrap().unwrap(), 0);
            let err = run.next().unwrap().unwrap_err();
            assert!(matches!(&err, TaskError::Panicked { index: 1, message, .. } if message == "boom"));
            assert_eq!(err.into_input(), 1);
            assert!(run.next().is_none());
        }
    }

    /// Every worker holds a clone of the task; once they are all joined only
    /// the test's own handle is left.
    #[test]
    fn workers_are_joined_after_completion_abandonment_and_failure() {
        let marker = Arc::new(());

        let task = {
            let marker = marker.clone();
            move |x: &u64| {
                let _held = &marker;
                std::thread::sleep(Duration::from_millis(2));
                if *x == 50 { Err("fifty") } else { Ok(*x) }
            }
        };

        let run = quiet(4, false).run(task.clone(), 0..20).unwrap();
        assert_eq!(run.count(), 20);
        assert_eq!(Arc::strong_count(&marker), 2);

        let mut run = quiet(4, true).run(task.clone(), 0..200).unwrap();
        run.next();
        drop(run);
        assert_eq!(Arc::strong_count(&marker), 2);

        let mut run = quiet(4, true).run(task.clone(), 0..200).unwrap();
        assert!(run.by_ref().any(|r| r.is_err()));
        assert_eq!(run.live_workers(), 0);
        assert_eq!(Arc::strong_count(&marker), 2);

        drop(task);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn abandoned_run_does_not_process_the_remaining_queue() {
        let executed = Arc::new(AtomicUsize::new(0));
        let mut run = quiet(2, true)
            .run(
                {
                    let executed = executed.clone();
                    move |x: &u64| {
                        executed.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        Ok::<_, Infallible>(*x)
                    }
                },
                0..200,
            )
            .unwrap();
        assert_eq!(run.next().unwrap().unwrap(), 0);
        drop(run);

        let after_drop = executed.load(Ordering::SeqCst);
        assert!(after_drop < 200, "executed {after_drop} tasks");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(executed.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn isolated_tasks_keep_the_run_going() {
        let run = quiet(3, true).run(isolated(fails_on_three), 0..6).unwrap();
        let out: Vec<Option<u64>> = run.map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![Some(0), Some(1), Some(2), None, Some(4), Some(5)]);
    }

    #[test]
    fn free_function_uses_options() {
        let options = RunOptions {
            workers: 2,
            ordered: true,
            progress_label: None,
        };
        let out = collect_ok(run(square, [5, 6, 7], options).unwrap());
        assert_eq!(out, vec![25, 36, 49]);
    }

    #[test]
    fn default_options_use_every_cpu() {
        let options = RunOptions::default();
        assert_eq!(options.workers, num_cpus::get());
        assert!(!options.ordered);
        assert!(options.progress_label.is_none());
    }
}
