//! Analysis definition (YAML/JSON): named processes, regions and requests.
//!
//! Requests reference processes and regions by name, and derived requests
//! reference other requests by name. Everything is compiled into one
//! [`Graph`] and evaluated in a single batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use hc_calc::{Calculation, Graph, Handle, VariationNode};
use hc_core::Combination;
use hc_data::{
    Binning, FlowPolicy, NegativeWeightPolicy, Process, Projection, Region, RegionVariation,
    VarianceConvention,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    pub processes: Vec<Process>,
    pub regions: BTreeMap<String, Region>,
    pub requests: BTreeMap<String, Request>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    Count {
        process: String,
        region: String,
        #[serde(default)]
        variation: Option<RegionVariation>,
        #[serde(default)]
        variance: VarianceConvention,
        #[serde(default)]
        negative_weights: NegativeWeightPolicy,
    },
    Histogram {
        process: String,
        region: String,
        expression: String,
        /// Falls back to the region's binning.
        #[serde(default)]
        binning: Option<Binning>,
        #[serde(default)]
        variation: Option<RegionVariation>,
        #[serde(default)]
        flow: FlowPolicy,
        #[serde(default)]
        variance: VarianceConvention,
        #[serde(default)]
        negative_weights: NegativeWeightPolicy,
    },
    Scaled {
        input: String,
        factor: f64,
    },
    Sum {
        inputs: Vec<String>,
    },
    Difference {
        minuend: String,
        subtrahend: String,
    },
    Ratio {
        numerator: String,
        denominator: String,
    },
    Uncertainty {
        nominal: String,
        #[serde(default)]
        variations: BTreeMap<String, VariationSpec>,
        /// Add the statistical variation of the nominal.
        #[serde(default)]
        statistical: bool,
    },
    Combined {
        input: String,
        #[serde(default = "default_rule")]
        rule: Combination,
    },
}

fn default_rule() -> Combination {
    Combination::Quadrature
}

/// How one named variation is obtained in an `uncertainty` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VariationSpec {
    UpDown { up: String, down: String },
    Symmetric { symmetric: String },
    Overall { overall: (f64, f64) },
}

impl Request {
    /// Requests this one is built from.
    fn inputs(&self) -> Vec<&str> {
        match self {
            Request::Count { .. } | Request::Histogram { .. } => Vec::new(),
            Request::Scaled { input, .. } | Request::Combined { input, .. } => vec![input.as_str()],
            Request::Sum { inputs } => inputs.iter().map(String::as_str).collect(),
            Request::Difference { minuend, subtrahend } => vec![minuend.as_str(), subtrahend.as_str()],
            Request::Ratio { numerator, denominator } => vec![numerator.as_str(), denominator.as_str()],
            Request::Uncertainty { nominal, variations, .. } => {
                let mut out = vec![nominal.as_str()];
                for v in variations.values() {
                    match v {
                        VariationSpec::UpDown { up, down } => out.extend([up.as_str(), down.as_str()]),
                        VariationSpec::Symmetric { symmetric } => out.push(symmetric.as_str()),
                        VariationSpec::Overall { .. } => {}
                    }
                }
                out
            }
        }
    }
}

impl AnalysisConfig {
    /// Load `path` (plus its `.local` override).
    pub fn load(path: &Path) -> Result<Self> {
        let config: AnalysisConfig = hc_calc::config::load_layered(path)
            .with_context(|| format!("failed to load analysis {}", path.display()))?;
        config.check_names()?;
        Ok(config)
    }

    fn check_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for p in &self.processes {
            if !seen.insert(p.name.as_str()) {
                bail!("duplicate process '{}'", p.name);
            }
        }
        Ok(())
    }

    fn process(&self, name: &str) -> Result<Arc<Process>> {
        self.processes
            .iter()
            .find(|p| p.name == name)
            .map(|p| Arc::new(p.clone()))
            .ok_or_else(|| anyhow!("unknown process '{name}'"))
    }

    fn region(&self, name: &str, variation: Option<&RegionVariation>) -> Result<Arc<Region>> {
        let region = self.regions.get(name).ok_or_else(|| anyhow!("unknown region '{name}'"))?;
        Ok(Arc::new(match variation {
            Some(v) => region.varied(v.clone()),
            None => region.clone(),
        }))
    }

    /// The process and region a request is displayed with: its own for base
    /// requests, otherwise those of its first input.
    pub fn display(&self, name: &str) -> Option<(Arc<Process>, Arc<Region>)> {
        let mut current = name;
        let mut hops = 0;
        loop {
            match self.requests.get(current)? {
                Request::Count { process, region, variation, .. }
                | Request::Histogram { process, region, variation, .. } => {
                    return Some((
                        self.process(process).ok()?,
                        self.region(region, variation.as_ref()).ok()?,
                    ));
                }
                other => current = other.inputs().first().copied()?,
            }
            hops += 1;
            if hops > self.requests.len() {
                return None;
            }
        }
    }

    /// Compile every request into `graph`. Returns the handle per request.
    pub fn build(&self, graph: &mut Graph) -> Result<BTreeMap<String, Handle>> {
        let mut handles = HashMap::new();
        let mut visiting = HashSet::new();
        for name in self.requests.keys() {
            self.build_one(name, graph, &mut handles, &mut visiting)?;
        }
        Ok(handles.into_iter().collect())
    }

    fn build_one(
        &self,
        name: &str,
        graph: &mut Graph,
        handles: &mut HashMap<String, Handle>,
        visiting: &mut HashSet<String>,
    ) -> Result<Handle> {
        if let Some(h) = handles.get(name) {
            return Ok(*h);
        }
        let request = self.requests.get(name).ok_or_else(|| anyhow!("unknown request '{name}'"))?;
        if !visiting.insert(name.to_string()) {
            bail!("request '{name}' depends on itself");
        }

        let mut inputs = HashMap::new();
        for input in request.inputs() {
            let h = self
                .build_one(input, graph, handles, visiting)
                .with_context(|| format!("in request '{name}'"))?;
            inputs.insert(input, h);
        }
        let h = |n: &String| inputs[n.as_str()];

        let handle = match request {
            Request::Count { process, region, variation, variance, negative_weights } => {
                let calc = Calculation::count()
                    .with_variance(*variance)
                    .with_negative_weights(*negative_weights);
                let projection =
                    Projection::new(self.process(process)?, self.region(region, variation.as_ref())?);
                graph.calculation(calc, projection).with_context(|| format!("request '{name}'"))?
            }
            Request::Histogram {
                process,
                region,
                expression,
                binning,
                variation,
                flow,
                variance,
                negative_weights,
            } => {
                let region = self.region(region, variation.as_ref())?;
                let binning = binning
                    .clone()
                    .or_else(|| region.binning.clone())
                    .ok_or_else(|| anyhow!("request '{name}': no binning and region has none"))?;
                let calc = Calculation::histogram(expression.clone(), binning)
                    .with_flow(*flow)
                    .with_variance(*variance)
                    .with_negative_weights(*negative_weights);
                let projection = Projection::new(self.process(process)?, region);
                graph.calculation(calc, projection).with_context(|| format!("request '{name}'"))?
            }
            Request::Scaled { input, factor } => graph.scale(h(input), *factor),
            Request::Sum { inputs } => {
                if inputs.is_empty() {
                    bail!("request '{name}': sum needs at least one input");
                }
                let hs: Vec<Handle> = inputs.iter().map(|n| h(n)).collect();
                graph.sum(&hs)
            }
            Request::Difference { minuend, subtrahend } => graph.difference(h(minuend), h(subtrahend)),
            Request::Ratio { numerator, denominator } => graph.ratio(h(numerator), h(denominator)),
            Request::Uncertainty { nominal, variations, statistical } => {
                let mut nodes: Vec<(&str, VariationNode)> = variations
                    .iter()
                    .map(|(k, v)| {
                        let node = match v {
                            VariationSpec::UpDown { up, down } => VariationNode::UpDown(h(up), h(down)),
                            VariationSpec::Symmetric { symmetric } => VariationNode::Symmetric(h(symmetric)),
                            VariationSpec::Overall { overall: (up, down) } => {
                                VariationNode::Overall(*up, *down)
                            }
                        };
                        (k.as_str(), node)
                    })
                    .collect();
                if *statistical {
                    nodes.push(("statistical", VariationNode::Statistical));
                }
                graph.uncertainty(h(nominal), &nodes)
            }
            Request::Combined { input, rule } => graph.combined(h(input), *rule),
        };

        visiting.remove(name);
        handles.insert(name.to_string(), handle);
        Ok(handle)
    }
}
