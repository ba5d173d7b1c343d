//! Step pipelines.
//!
//! A [`Sequence`] is an ordered list of async steps run strictly one after
//! another against a layered [`Scope`]. Steps may be conditional, may stop
//! the run early with a value, and may defer extra steps to run after the
//! remaining ones without changing what the run returns.
//!
//! Sequences are bound to a host at call time. The host stands in for the
//! object whose methods a pipeline implements: steps reach it through
//! [`SequenceState::host`], [`SequenceState::icall`] and
//! [`SequenceState::idcall`].
//!
//! ```ignore
//! fn greet<'a>(a: &'a mut SequenceState<Greeter, String>) -> StepFuture<'a, String> {
//!     Box::pin(async move {
//!         let name = a.get::<String>("name").cloned().unwrap_or_default();
//!         Ok(Some(a.icall(|h| h.greeting(&name))))
//!     })
//! }
//!
//! let seq = Sequence::new("greet", vec![Step::new("greet", greet)]);
//! let out = seq.call_with(host, [("name", scope_value("amy".to_string()))]).await?;
//! ```

mod scope;

pub use scope::{Scope, ScopeValue, ScopeView, scope_value};

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use cumulus_types::{CoreError, CoreResult};

/// Future returned by a step body.
pub type StepFuture<'a, T> = BoxFuture<'a, CoreResult<Option<T>>>;

type StepFn<H, T> =
    Arc<dyn for<'a> Fn(&'a mut SequenceState<H, T>) -> StepFuture<'a, T> + Send + Sync>;

type ConditionFn<H, T> =
    Arc<dyn for<'a> Fn(&'a SequenceState<H, T>) -> BoxFuture<'a, CoreResult<bool>> + Send + Sync>;

/// One pipeline step.
pub struct Step<H, T> {
    name: &'static str,
    condition: Option<ConditionFn<H, T>>,
    run: StepFn<H, T>,
    /// Deferred steps run but never replace the run's return value.
    keeps_return: bool,
}

impl<H, T> Clone for Step<H, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            condition: self.condition.clone(),
            run: Arc::clone(&self.run),
            keeps_return: self.keeps_return,
        }
    }
}

impl<H, T> Step<H, T>
where
    H: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: for<'a> Fn(&'a mut SequenceState<H, T>) -> StepFuture<'a, T> + Send + Sync + 'static,
    {
        Self {
            name,
            condition: None,
            run: Arc::new(run),
            keeps_return: false,
        }
    }

    /// Only run this step when `condition` resolves to true.
    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: for<'a> Fn(&'a SequenceState<H, T>) -> BoxFuture<'a, CoreResult<bool>>
            + Send
            + Sync
            + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered, reusable pipeline of steps.
pub struct Sequence<H, T> {
    name: &'static str,
    steps: Vec<Step<H, T>>,
}

impl<H, T> Sequence<H, T>
where
    H: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(name: &'static str, steps: Vec<Step<H, T>>) -> Self {
        Self { name, steps }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the pipeline against `host` with an empty scope.
    pub async fn call(&self, host: Arc<H>) -> CoreResult<Option<T>> {
        self.call_in(host, Scope::new()).await
    }

    /// Run the pipeline with initial scope values.
    pub async fn call_with<K, I>(&self, host: Arc<H>, values: I) -> CoreResult<Option<T>>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ScopeValue)>,
    {
        let scope = Scope::with_values(values.into_iter().map(|(k, v)| (k.into(), v)));
        self.call_in(host, scope).await
    }

    /// Run the pipeline on top of an existing scope, e.g. a parent run's.
    ///
    /// Errors from any step propagate out unchanged; remaining steps are
    /// not run.
    pub async fn call_in(&self, host: Arc<H>, scope: Scope) -> CoreResult<Option<T>> {
        let mut state = SequenceState {
            host,
            scope,
            steps: self.steps.clone(),
            i: 0,
            stopped: false,
            last_return: None,
            defer_ptr: None,
        };
        state.run(self.name).await?;
        Ok(state.last_return)
    }
}

/// Per-run state handed to every step.
pub struct SequenceState<H, T> {
    host: Arc<H>,
    scope: Scope,
    steps: Vec<Step<H, T>>,
    i: usize,
    stopped: bool,
    last_return: Option<T>,
    defer_ptr: Option<usize>,
}

impl<H, T> SequenceState<H, T>
where
    H: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn run(&mut self, sequence: &'static str) -> CoreResult<()> {
        while self.i < self.steps.len() {
            let step = self.steps[self.i].clone();

            if let Some(condition) = &step.condition {
                if !condition(self).await? {
                    tracing::trace!(sequence, step = step.name, "condition false, skipping");
                    self.i += 1;
                    continue;
                }
            }

            self.scope.push_frame();
            tracing::trace!(sequence, step = step.name, "running step");

            let ret = (step.run)(self).await?;
            if !step.keeps_return {
                self.last_return = ret;
            }

            if self.stopped {
                tracing::trace!(sequence, step = step.name, "stopped");
                break;
            }
            self.i += 1;
        }
        Ok(())
    }

    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.scope.get(key)
    }

    /// Like [`get`](Self::get), but a missing or mistyped value is an
    /// internal error.
    pub fn require<V: Any>(&self, key: &str) -> CoreResult<&V> {
        self.scope.get(key).ok_or_else(|| {
            CoreError::Internal(format!(
                "sequence value {} is missing or has the wrong type",
                key
            ))
        })
    }

    pub fn set<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.scope.set(key, scope_value(value));
    }

    /// Bulk-set `items`, then return a read-only view of the whole scope.
    pub fn values<K, I>(&mut self, items: I) -> ScopeView
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ScopeValue)>,
    {
        for (k, v) in items {
            self.scope.set(k, v);
        }
        self.scope.snapshot()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The host this run is bound to.
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Call into the host.
    pub fn icall<'s, R>(&'s self, f: impl FnOnce(&'s H) -> R) -> R {
        f(&self.host)
    }

    /// Call into the host, handing it this run's state as well.
    pub fn idcall<R>(&mut self, f: impl FnOnce(Arc<H>, &mut Self) -> R) -> R {
        let host = Arc::clone(&self.host);
        f(host, self)
    }

    /// End the run after the current step; the run returns `value`.
    pub fn stop(&mut self, value: T) -> Option<T> {
        self.stopped = true;
        Some(value)
    }

    /// End the run after the current step with no value.
    pub fn stop_empty(&mut self) -> Option<T> {
        self.stopped = true;
        None
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The value returned by the most recent non-deferred step.
    pub fn last_return(&self) -> Option<&T> {
        self.last_return.as_ref()
    }

    /// Schedule `run` after the remaining steps.
    ///
    /// The first call pins an insertion point after the last step; every
    /// deferred step is inserted there, so later defers run first. Deferred
    /// steps never change the run's return value, and are skipped if a step
    /// stops the run.
    pub fn defer<F>(&mut self, run: F)
    where
        F: for<'a> Fn(&'a mut SequenceState<H, T>) -> StepFuture<'a, T> + Send + Sync + 'static,
    {
        let ptr = *self.defer_ptr.get_or_insert(self.steps.len());
        let mut step = Step::new("deferred", run);
        step.keeps_return = true;
        self.steps.insert(ptr, step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_types::CoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn note(&self, s: &str) {
            self.log.lock().unwrap().push(s.to_string());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    type St = SequenceState<Recorder, i64>;

    fn set_x<'a>(a: &'a mut St) -> StepFuture<'a, i64> {
        Box::pin(async move {
            a.icall(|h| h.note("set_x"));
            a.set("x", 41_i64);
            Ok(None)
        })
    }

    fn read_x<'a>(a: &'a mut St) -> StepFuture<'a, i64> {
        Box::pin(async move {
            a.icall(|h| h.note("read_x"));
            Ok(a.get::<i64>("x").map(|x| x + 1))
        })
    }

    fn stop_early<'a>(a: &'a mut St) -> StepFuture<'a, i64> {
        Box::pin(async move { Ok(a.stop(7)) })
    }

    fn fail<'a>(_a: &'a mut St) -> StepFuture<'a, i64> {
        Box::pin(async move { Err(CoreError::internal("boom")) })
    }

    #[tokio::test]
    async fn later_steps_see_earlier_sets() {
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new("t", vec![Step::new("set", set_x), Step::new("read", read_x)]);
        assert_eq!(seq.call(host.clone()).await.unwrap(), Some(42));
        assert_eq!(host.entries(), vec!["set_x", "read_x"]);
    }

    #[tokio::test]
    async fn stop_skips_remaining_steps() {
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new(
            "t",
            vec![Step::new("stop", stop_early), Step::new("read", read_x)],
        );
        assert_eq!(seq.call(host.clone()).await.unwrap(), Some(7));
        assert!(host.entries().is_empty());
    }

    #[tokio::test]
    async fn false_condition_skips_step() {
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new(
            "t",
            vec![
                Step::new("set", set_x),
                Step::new("read", read_x).when(|a| Box::pin(async move { Ok(!a.scope().contains("x")) })),
            ],
        );
        assert_eq!(seq.call(host.clone()).await.unwrap(), None);
        assert_eq!(host.entries(), vec!["set_x"]);
    }

    #[tokio::test]
    async fn errors_propagate_and_halt() {
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new("t", vec![Step::new("fail", fail), Step::new("set", set_x)]);
        let err = seq.call(host.clone()).await.unwrap_err();
        assert_eq!(err.code(), "internal");
        assert!(host.entries().is_empty());
    }

    #[tokio::test]
    async fn deferred_steps_run_last_without_changing_result() {
        fn defer_two<'a>(a: &'a mut St) -> StepFuture<'a, i64> {
            Box::pin(async move {
                a.defer(|a| {
                    Box::pin(async move {
                        a.icall(|h| h.note("first-deferred"));
                        Ok(Some(-1))
                    })
                });
                a.defer(|a| {
                    Box::pin(async move {
                        a.icall(|h| h.note("second-deferred"));
                        Ok(Some(-2))
                    })
                });
                Ok(None)
            })
        }

        let host = Arc::new(Recorder::default());
        let seq = Sequence::new(
            "t",
            vec![
                Step::new("defer", defer_two),
                Step::new("set", set_x),
                Step::new("read", read_x),
            ],
        );
        assert_eq!(seq.call(host.clone()).await.unwrap(), Some(42));
        assert_eq!(
            host.entries(),
            vec!["set_x", "read_x", "second-deferred", "first-deferred"]
        );
    }

    #[tokio::test]
    async fn initial_values_seed_the_scope() {
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new("t", vec![Step::new("read", read_x)]);
        let out = seq
            .call_with(host, [("x", scope_value(9_i64))])
            .await
            .unwrap();
        assert_eq!(out, Some(10));
    }

    #[tokio::test]
    async fn values_merges_and_snapshots() {
        fn merge<'a>(a: &'a mut St) -> StepFuture<'a, i64> {
            Box::pin(async move {
                let view = a.values([("y", scope_value(5_i64))]);
                Ok(view.get::<i64>("y").copied())
            })
        }
        let host = Arc::new(Recorder::default());
        let seq = Sequence::new("t", vec![Step::new("merge", merge)]);
        assert_eq!(seq.call(host).await.unwrap(), Some(5));
    }
}
