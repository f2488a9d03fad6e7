//! Composition graphs: derived quantities built from task results.
//!
//! A [`Graph`] is an arena of nodes. A base node is a [`Task`]; a composite
//! node applies a pure function to the values of earlier nodes. Building a
//! graph does no work. Evaluating it collects every base task reachable from
//! the requested nodes, resolves them in one dispatcher batch (so tasks
//! shared between branches run once), then evaluates composites in arena
//! order, which is a topological order since inputs always precede their
//! users.
//!
//! A failed base task reaches every dependent as [`Error::Dependency`]; a
//! failure inside a composite's own function is reported as
//! [`Error::Composition`] naming that node.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use hc_core::{Combination, Error, Estimation, Result, Uncertainty, Variation};
use hc_data::{Process, Projection, Region};

use crate::calculation::{Calculation, Task};
use crate::dispatcher::Dispatcher;

/// The value of a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    /// A count or histogram.
    Estimation(Estimation),
    /// A nominal estimation with systematic variations.
    Uncertainty(Uncertainty),
}

impl Value {
    /// The estimation, or an error for an uncertainty.
    pub fn as_estimation(&self) -> Result<&Estimation> {
        match self {
            Value::Estimation(e) => Ok(e),
            Value::Uncertainty(_) => {
                Err(Error::Validation("expected an estimation, got an uncertainty".into()))
            }
        }
    }

    /// The uncertainty, or an error for a plain estimation.
    pub fn as_uncertainty(&self) -> Result<&Uncertainty> {
        match self {
            Value::Uncertainty(u) => Ok(u),
            Value::Estimation(_) => {
                Err(Error::Validation("expected an uncertainty, got an estimation".into()))
            }
        }
    }

    /// The central estimation (the nominal of an uncertainty).
    pub fn nominal(&self) -> &Estimation {
        match self {
            Value::Estimation(e) => e,
            Value::Uncertainty(u) => u.nominal(),
        }
    }
}

impl From<Estimation> for Value {
    fn from(e: Estimation) -> Self {
        Value::Estimation(e)
    }
}

impl From<Uncertainty> for Value {
    fn from(u: Uncertainty) -> Self {
        Value::Uncertainty(u)
    }
}

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

/// Reference to a node of a [`Graph`]. Only valid in the graph that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    graph: u64,
    index: usize,
}

impl Handle {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.index
    }
}

/// How a named variation of an uncertainty node is obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VariationNode {
    /// One varied estimation, taken symmetrically.
    Symmetric(Handle),
    /// Separate up and down estimations.
    UpDown(Handle, Handle),
    /// Normalization-only variation: nominal times `(up, down)` factors.
    Overall(f64, f64),
    /// Statistical variation of the nominal itself.
    Statistical,
}

type CombineFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

enum Node {
    Base(Task),
    Combine { name: String, inputs: Vec<Handle>, f: CombineFn },
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Base(t) => write!(f, "Base({}, {:?})", t.calculation, t.fingerprint()),
            Node::Combine { name, inputs, .. } => write!(f, "Combine({name}, {inputs:?})"),
        }
    }
}

/// A lazily evaluated composition of tasks.
#[derive(Debug)]
pub struct Graph {
    id: u64,
    nodes: Vec<Node>,
}

impl Default for Graph {
    fn default() -> Self {
        Self { id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed), nodes: Vec::new() }
    }
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: Node) -> Handle {
        self.nodes.push(node);
        Handle { graph: self.id, index: self.nodes.len() - 1 }
    }

    /// Arena position of `handle`, if it was issued by this graph.
    fn slot(&self, handle: Handle) -> Option<usize> {
        (handle.graph == self.id && handle.index < self.nodes.len()).then_some(handle.index)
    }

    /// A base node: `calculation` applied to `projection`.
    pub fn calculation(&mut self, calculation: Calculation, projection: Projection) -> Result<Handle> {
        Ok(self.task(Task::new(calculation, projection)?))
    }

    /// A base node from an already bound task.
    pub fn task(&mut self, task: Task) -> Handle {
        self.push(Node::Base(task))
    }

    /// A composite node applying `f` to the values of `inputs`.
    ///
    /// Inputs must be handles of this graph. A handle issued by another graph
    /// makes the node fail at evaluation with [`Error::Validation`].
    pub fn combine<F>(&mut self, name: impl Into<String>, inputs: &[Handle], f: F) -> Handle
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(Node::Combine { name: name.into(), inputs: inputs.to_vec(), f: Arc::new(f) })
    }

    /// `k * a`.
    pub fn scale(&mut self, a: Handle, k: f64) -> Handle {
        self.combine(format!("scale({k})"), &[a], move |v| {
            Ok(v[0].as_estimation()?.scale(k).into())
        })
    }

    /// Sum of all inputs.
    pub fn sum(&mut self, inputs: &[Handle]) -> Handle {
        self.combine("sum", inputs, |v| {
            let ests = v.iter().map(Value::as_estimation).collect::<Result<Vec<_>>>()?;
            Ok(Estimation::sum(ests)?.into())
        })
    }

    /// `a - b`.
    pub fn difference(&mut self, a: Handle, b: Handle) -> Handle {
        self.combine("difference", &[a, b], |v| {
            Ok(v[0].as_estimation()?.sub(v[1].as_estimation()?)?.into())
        })
    }

    /// `a / b`.
    pub fn ratio(&mut self, a: Handle, b: Handle) -> Handle {
        self.combine("ratio", &[a, b], |v| {
            Ok(v[0].as_estimation()?.ratio(v[1].as_estimation()?)?.into())
        })
    }

    /// An uncertainty: `nominal` plus named variations.
    pub fn uncertainty(&mut self, nominal: Handle, variations: &[(&str, VariationNode)]) -> Handle {
        let mut inputs = vec![nominal];
        // (name, kind, position of first input)
        let mut layout: Vec<(String, VariationNode, usize)> = Vec::new();
        for (name, v) in variations {
            layout.push((name.to_string(), *v, inputs.len()));
            match v {
                VariationNode::Symmetric(h) => inputs.push(*h),
                VariationNode::UpDown(up, down) => inputs.extend([*up, *down]),
                VariationNode::Overall(..) | VariationNode::Statistical => {}
            }
        }
        self.combine("uncertainty", &inputs, move |v| {
            let nominal = v[0].as_estimation()?;
            let mut u = Uncertainty::new(nominal.clone());
            for (name, kind, at) in &layout {
                let variation = match kind {
                    VariationNode::Symmetric(_) => {
                        Variation::Symmetric { varied: v[*at].as_estimation()?.clone() }
                    }
                    VariationNode::UpDown(..) => Variation::UpDown {
                        up: v[*at].as_estimation()?.clone(),
                        down: v[*at + 1].as_estimation()?.clone(),
                    },
                    VariationNode::Overall(up, down) => Variation::from_overall(nominal, *up, *down),
                    VariationNode::Statistical => Variation::statistical(nominal),
                };
                u.insert(name.clone(), variation)?;
            }
            Ok(u.into())
        })
    }

    /// Uncertainty with the statistical variation of `nominal` only.
    pub fn statistical(&mut self, nominal: Handle) -> Handle {
        self.combine("statistical", &[nominal], |v| {
            let nominal = v[0].as_estimation()?;
            let u = Uncertainty::new(nominal.clone())
                .with_variation("statistical", Variation::statistical(nominal))?;
            Ok(u.into())
        })
    }

    /// Collapse an uncertainty into an estimation whose variance is the
    /// nominal variance plus the combined systematic deviation squared.
    pub fn combined(&mut self, uncertainty: Handle, rule: Combination) -> Handle {
        self.combine("combined", &[uncertainty], move |v| {
            Ok(v[0].as_uncertainty()?.total(rule)?.into())
        })
    }

    /// Sum of one calculation over several processes in one region.
    pub fn total(
        &mut self,
        calculation: &Calculation,
        processes: &[Arc<Process>],
        region: &Arc<Region>,
    ) -> Result<Handle> {
        let parts = processes
            .iter()
            .map(|p| {
                self.calculation(calculation.clone(), Projection::new(p.clone(), region.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.sum(&parts))
    }

    /// The task behind a base node (`None` for composites).
    pub fn base_task(&self, handle: Handle) -> Option<&Task> {
        match &self.nodes[self.slot(handle)?] {
            Node::Base(t) => Some(t),
            Node::Combine { .. } => None,
        }
    }

    /// Base tasks reachable from `targets`, deduplicated by fingerprint.
    pub fn dependencies(&self, targets: &[Handle]) -> Vec<&Task> {
        let reachable = self.reachable(targets);
        let mut seen = BTreeSet::new();
        reachable
            .iter()
            .filter_map(|&i| match &self.nodes[i] {
                Node::Base(t) if seen.insert(t.fingerprint()) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn reachable(&self, targets: &[Handle]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = targets.iter().filter_map(|h| self.slot(*h)).collect();
        while let Some(i) = stack.pop() {
            if !seen.insert(i) {
                continue;
            }
            if let Node::Combine { inputs, .. } = &self.nodes[i] {
                stack.extend(inputs.iter().filter_map(|h| self.slot(*h)));
            }
        }
        seen
    }

    /// Evaluate `targets`, returning one result per target.
    pub fn evaluate(&self, dispatcher: &Dispatcher, targets: &[Handle]) -> Vec<Result<Value>> {
        let reachable = self.reachable(targets);

        let base: Vec<usize> =
            reachable.iter().copied().filter(|&i| matches!(self.nodes[i], Node::Base(_))).collect();
        let tasks: Vec<Task> = base
            .iter()
            .filter_map(|&i| match &self.nodes[i] {
                Node::Base(t) => Some(t.clone()),
                Node::Combine { .. } => None,
            })
            .collect();
        let resolved = dispatcher.resolve(&tasks);

        type Slot = Option<std::result::Result<Value, Arc<Error>>>;
        let mut values: Vec<Slot> = (0..self.nodes.len()).map(|_| None).collect();
        for (i, r) in base.into_iter().zip(resolved) {
            values[i] = Some(r.map(Value::from).map_err(Arc::new));
        }

        // BTreeSet iteration is ascending, i.e. topological.
        for &i in &reachable {
            let Node::Combine { name, inputs, f } = &self.nodes[i] else {
                continue;
            };
            let mut args = Vec::with_capacity(inputs.len());
            let mut failed = None;
            for h in inputs {
                // Inputs precede their users; anything else is a foreign handle.
                let slot = self.slot(*h).filter(|&j| j < i).and_then(|j| values[j].as_ref());
                match slot {
                    Some(Ok(v)) => args.push(v.clone()),
                    Some(Err(e)) => {
                        failed = Some(Arc::clone(e));
                        break;
                    }
                    None => {
                        failed = Some(Arc::new(Error::Validation(format!(
                            "node {i} ('{name}') has input {} from another graph",
                            h.index
                        ))));
                        break;
                    }
                }
            }
            values[i] = Some(match failed {
                Some(e) => Err(Arc::new(Error::share(&e, name))),
                None => (**f)(&args).map_err(|e| {
                    Arc::new(Error::Composition { node: name.clone(), source: Arc::new(e) })
                }),
            });
        }

        targets
            .iter()
            .map(|h| match self.slot(*h).and_then(|i| values[i].as_ref()) {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(e)) => Err(Error::share(e, &format!("node {}", h.index))),
                None => Err(Error::Validation(format!("handle {} is not part of this graph", h.index))),
            })
            .collect()
    }
}
