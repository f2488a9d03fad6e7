//! Batched, deduplicated, parallel execution of tasks.
//!
//! [`Dispatcher::resolve`] takes every task a caller currently knows about
//! and:
//!
//! 1. registers the fingerprints nobody is working on yet (duplicates within
//!    the request and fingerprints already in flight elsewhere are skipped),
//! 2. serves what it can from the cache and groups the rest by process, so
//!    each process is loaded once per batch with the union of the fields its
//!    tasks need, then computes the groups in parallel on the worker pool,
//! 3. stores results, records failures, and wakes waiters,
//! 4. waits for fingerprints other callers are still executing.
//!
//! At most one execution per fingerprint is in flight at any time. A failed
//! fingerprint stays failed (no retry) until it is cleared. A panic in a
//! loader, evaluator or calculation is recorded as [`Error::Panicked`] for
//! the tasks it hit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use rayon::prelude::*;

use hc_core::{Error, Estimation, Result, panic_message};
use hc_data::{DataLoader, ExpressionEvaluator, Process, Table};

use crate::cache::Cache;
use crate::calculation::Task;
use crate::fingerprint::Fingerprint;

#[derive(Default)]
struct State {
    in_flight: HashSet<Fingerprint>,
    failures: HashMap<Fingerprint, Arc<Error>>,
}

/// Coordinates task execution over a shared cache.
pub struct Dispatcher {
    cache: Arc<dyn Cache>,
    loader: Arc<dyn DataLoader>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    pool: rayon::ThreadPool,
    state: Mutex<State>,
    settled: Condvar,
    executions: AtomicU64,
}

type Outcome = (Fingerprint, std::result::Result<Estimation, Arc<Error>>);

/// Run `f`, turning a panic into [`Error::Panicked`].
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| Err(Error::Panicked(panic_message(&*p))))
}

/// Fingerprints registered as in flight by one `resolve` call. Dropping it
/// releases them and wakes waiters, also while unwinding.
struct Registration<'a> {
    dispatcher: &'a Dispatcher,
    fingerprints: Vec<Fingerprint>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.fingerprints.is_empty() {
            return;
        }
        let mut state = self.dispatcher.lock();
        for fp in &self.fingerprints {
            state.in_flight.remove(fp);
        }
        drop(state);
        self.dispatcher.settled.notify_all();
    }
}

impl Dispatcher {
    /// Create a dispatcher with a worker pool of `threads` threads
    /// (0 = rayon default).
    pub fn new(
        cache: Arc<dyn Cache>,
        loader: Arc<dyn DataLoader>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        threads: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hc-worker-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to create thread pool: {e}")))?;
        Ok(Self {
            cache,
            loader,
            evaluator,
            pool,
            state: Mutex::new(State::default()),
            settled: Condvar::new(),
            executions: AtomicU64::new(0),
        })
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// The expression evaluator.
    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    /// Number of task computations performed (cache hits excluded).
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve every task, returning one result per task in input order.
    ///
    /// A failed task yields [`Error::Dependency`] naming its fingerprint;
    /// other tasks are unaffected.
    pub fn resolve(&self, tasks: &[Task]) -> Vec<Result<Estimation>> {
        let mut unique: BTreeMap<Fingerprint, &Task> = BTreeMap::new();
        for t in tasks {
            unique.entry(t.fingerprint()).or_insert(t);
        }

        // 1. Register.
        let mine: Vec<&Task> = {
            let mut state = self.lock();
            unique
                .values()
                .filter(|t| {
                    let fp = t.fingerprint();
                    !state.failures.contains_key(&fp) && state.in_flight.insert(fp)
                })
                .copied()
                .collect()
        };
        let registration = Registration {
            dispatcher: self,
            fingerprints: mine.iter().map(|t| t.fingerprint()).collect(),
        };

        // 2. Execute our share.
        let outcomes = if mine.is_empty() { Vec::new() } else { self.run_batch(&mine) };

        // 3. Publish.
        let mut fresh: HashMap<Fingerprint, Estimation> = HashMap::new();
        let mut failed: Vec<(Fingerprint, Arc<Error>)> = Vec::new();
        for (fp, outcome) in outcomes {
            match outcome {
                Ok(est) => {
                    fresh.insert(fp, est);
                }
                Err(e) => failed.push((fp, e)),
            }
        }
        {
            let mut state = self.lock();
            for (fp, e) in failed {
                tracing::warn!(fingerprint = %fp.short(), error = %e, "calculation failed");
                state.failures.insert(fp, e);
            }
        }
        drop(registration);

        // 4. Wait for everything else and collect.
        let mut state = self.lock();
        while unique.keys().any(|fp| state.in_flight.contains(fp)) {
            state = self.settled.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        let failures: HashMap<Fingerprint, Arc<Error>> = unique
            .keys()
            .filter_map(|fp| state.failures.get(fp).map(|e| (*fp, Arc::clone(e))))
            .collect();
        drop(state);

        tasks
            .iter()
            .map(|t| {
                let fp = t.fingerprint();
                if let Some(e) = failures.get(&fp) {
                    return Err(Error::Dependency { fingerprint: fp.to_hex(), source: Arc::clone(e) });
                }
                if let Some(est) = fresh.get(&fp) {
                    return Ok(est.clone());
                }
                match self.cache.lookup(&fp) {
                    Ok(Some(est)) => Ok(est),
                    Ok(None) => Err(Error::Validation(format!(
                        "result for {fp} was cleared while it was being resolved"
                    ))),
                    Err(e) => Err(Error::Dependency { fingerprint: fp.to_hex(), source: Arc::new(e) }),
                }
            })
            .collect()
    }

    /// Execute a registered batch. Never fails as a whole: every task gets
    /// its own outcome.
    fn run_batch(&self, batch: &[&Task]) -> Vec<Outcome> {
        let t0 = Instant::now();
        let mut outcomes: Vec<Outcome> = Vec::with_capacity(batch.len());
        let mut groups: HashMap<&Process, Vec<&Task>> = HashMap::new();
        let mut cached = 0usize;

        for &t in batch {
            let fp = t.fingerprint();
            match guarded(|| self.cache.lookup(&fp)) {
                Ok(Some(est)) => {
                    tracing::debug!(fingerprint = %fp.short(), "cache hit");
                    cached += 1;
                    outcomes.push((fp, Ok(est)));
                }
                Ok(None) => groups.entry(t.projection.process.as_ref()).or_default().push(t),
                Err(e @ Error::CacheCorruption { .. }) => {
                    tracing::warn!(fingerprint = %fp.short(), error = %e, "corrupt cache entry, recomputing");
                    groups.entry(t.projection.process.as_ref()).or_default().push(t);
                }
                Err(e) => outcomes.push((fp, Err(Arc::new(e)))),
            }
        }

        let n_groups = groups.len();
        let groups: Vec<(&Process, Vec<&Task>)> = groups.into_iter().collect();
        let computed: Vec<Outcome> = self.pool.install(|| {
            groups
                .par_iter()
                .flat_map_iter(|(process, tasks)| {
                    let run = AssertUnwindSafe(|| self.run_group(process, tasks));
                    catch_unwind(run).unwrap_or_else(|p| {
                        let e = Arc::new(Error::Panicked(panic_message(&*p)));
                        tasks.iter().map(|t| (t.fingerprint(), Err(Arc::clone(&e)))).collect()
                    })
                })
                .collect()
        });

        for (fp, outcome) in computed {
            let outcome = outcome.and_then(|est| match guarded(|| self.cache.store(&fp, &est)) {
                Ok(()) => Ok(est),
                Err(e) => Err(Arc::new(e)),
            });
            outcomes.push((fp, outcome));
        }

        tracing::info!(
            tasks = batch.len(),
            cached,
            processes = n_groups,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "batch resolved"
        );
        outcomes
    }

    /// Load a process once for all its tasks, then compute them in parallel.
    fn run_group(&self, process: &Process, tasks: &[&Task]) -> Vec<Outcome> {
        let evaluator = self.evaluator.as_ref();
        let mut outcomes: Vec<Outcome> = Vec::new();
        let mut fields = std::collections::BTreeSet::new();
        let mut runnable: Vec<&Task> = Vec::with_capacity(tasks.len());
        for &t in tasks {
            match guarded(|| t.calculation.required_fields(&t.projection, evaluator)) {
                Ok(f) => {
                    fields.extend(f);
                    runnable.push(t);
                }
                Err(e) => outcomes.push((t.fingerprint(), Err(Arc::new(e)))),
            }
        }
        if runnable.is_empty() {
            return outcomes;
        }

        let table = match guarded(|| self.loader.load(process, &fields)) {
            Ok(table) => table,
            // Some task referenced a field the data lacks: load per task so
            // the error lands only on the tasks that asked for it.
            Err(Error::Expression(_)) => {
                outcomes.extend(runnable.par_iter().map(|t| {
                    self.executions.fetch_add(1, Ordering::Relaxed);
                    (t.fingerprint(), guarded(|| t.run(self.loader.as_ref(), evaluator)).map_err(Arc::new))
                }).collect::<Vec<_>>());
                return outcomes;
            }
            Err(e) => {
                let e = Arc::new(e);
                outcomes.extend(runnable.iter().map(|t| (t.fingerprint(), Err(Arc::clone(&e)))));
                return outcomes;
            }
        };
        tracing::debug!(process = %process.name, rows = table.n_rows(), tasks = runnable.len(), "process loaded");

        let computed: Vec<Outcome> = runnable
            .par_iter()
            .map(|t| (t.fingerprint(), guarded(|| self.compute(t, &table)).map_err(Arc::new)))
            .collect();
        outcomes.extend(computed);
        outcomes
    }

    fn compute(&self, task: &Task, table: &Table) -> Result<Estimation> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint = %task.fingerprint().short(), calculation = %task.calculation, "executing");
        let view = task.projection.apply(table.clone(), self.evaluator.as_ref())?;
        task.calculation.compute(&view, self.evaluator.as_ref())
    }

    /// Forget a fingerprint: its cache entry and any recorded failure.
    pub fn clear(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.lock().failures.remove(fingerprint);
        self.cache.clear(fingerprint)
    }

    /// Forget everything.
    pub fn clear_all(&self) -> Result<()> {
        self.lock().failures.clear();
        self.cache.clear_all()
    }

    /// Recorded failure for a fingerprint, if any.
    pub fn failure(&self, fingerprint: &Fingerprint) -> Option<Arc<Error>> {
        self.lock().failures.get(fingerprint).cloned()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threads", &self.threads())
            .field("executions", &self.executions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::calculation::Calculation;
    use hc_data::{Binning, CompiledEvaluator, MemoryLoader, Projection, Region};

    fn setup() -> (Dispatcher, Arc<MemoryLoader>) {
        let mut l = MemoryLoader::new();
        l.insert("a", Table::from_columns([("pt", vec![10.0, 30.0, 50.0])]).unwrap());
        l.insert("b", Table::from_columns([("pt", vec![5.0])]).unwrap());
        let loader = Arc::new(l);
        let d = Dispatcher::new(
            Arc::new(MemoryCache::new()),
            loader.clone(),
            Arc::new(CompiledEvaluator::new()),
            2,
        )
        .unwrap();
        (d, loader)
    }

    fn task(process: &Arc<Process>, selection: &str, calc: Calculation) -> Task {
        Task::new(calc, Projection::new(process.clone(), Arc::new(Region::new(selection, ""))))
            .unwrap()
    }

    #[test]
    fn duplicates_execute_once() {
        let (d, _) = setup();
        let p = Arc::new(Process::new("A", ["a"]));
        let t = task(&p, "pt > 20", Calculation::count());
        let results = d.resolve(&[t.clone(), t.clone(), t]);
        assert_eq!(d.executions(), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().as_count().unwrap().value == 2.0));
    }

    #[test]
    fn one_load_per_process_per_batch() {
        let (d, loader) = setup();
        let a = Arc::new(Process::new("A", ["a"]));
        let b = Arc::new(Process::new("B", ["b"]));
        let hist = Calculation::histogram("pt", Binning::uniform(0.0, 60.0, 3));
        let tasks = vec![
            task(&a, "pt > 20", Calculation::count()),
            task(&a, "pt > 40", Calculation::count()),
            task(&a, "", hist.clone()),
            task(&b, "", hist),
        ];
        let results = d.resolve(&tasks);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(loader.loads(), 2);
        assert_eq!(d.executions(), 4);

        // Second resolution is served from the cache.
        d.resolve(&tasks);
        assert_eq!(loader.loads(), 2);
        assert_eq!(d.executions(), 4);
    }

    #[test]
    fn failure_is_isolated_and_sticky() {
        let (d, _) = setup();
        let a = Arc::new(Process::new("A", ["a"]));
        let good = task(&a, "pt > 20", Calculation::count());
        let bad = task(&a, "eta < 2", Calculation::count());
        let results = d.resolve(&[good.clone(), bad.clone()]);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.failed_dependency(), Some(bad.fingerprint().to_hex().as_str()));
        assert!(matches!(err.root_cause(), Error::Expression(_)));

        // No retry until cleared.
        let executions = d.executions();
        assert!(d.resolve(std::slice::from_ref(&bad))[0].is_err());
        assert_eq!(d.executions(), executions);
        d.clear(&bad.fingerprint()).unwrap();
        assert!(d.failure(&bad.fingerprint()).is_none());
        assert!(d.resolve(&[bad])[0].is_err());
        assert_eq!(d.executions(), executions + 1);
    }

    #[test]
    fn missing_data_fails_the_whole_process_only() {
        let (d, _) = setup();
        let missing = Arc::new(Process::new("M", ["nope"]));
        let a = Arc::new(Process::new("A", ["a"]));
        let results = d.resolve(&[
            task(&missing, "", Calculation::count()),
            task(&missing, "pt > 1", Calculation::count()),
            task(&a, "", Calculation::count()),
        ]);
        assert!(matches!(results[0].as_ref().unwrap_err().root_cause(), Error::DataUnavailable { .. }));
        assert!(matches!(results[1].as_ref().unwrap_err().root_cause(), Error::DataUnavailable { .. }));
        assert!(results[2].is_ok());
    }
}
