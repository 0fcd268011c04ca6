//! Dependency analysis: builds a file-import graph from a plan, detects
//! cycles, and emits topologically ordered batches plus the critical path.

use crate::plan::Plan;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One of the per-language import parsers dispatched by `language_hint`.
/// Unknown languages yield an empty dependency set rather than an error.
fn parse_imports(language_hint: Option<&str>, source: &str) -> Vec<String> {
    match language_hint {
        Some("python") => parse_python_imports(source),
        Some("javascript") | Some("typescript") => parse_es_imports(source),
        Some("rust") => parse_rust_uses(source),
        _ => Vec::new(),
    }
}

fn parse_python_imports(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("import ") {
            out.push(rest.split_whitespace().next().unwrap_or("").to_string());
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(module) = rest.split(" import").next() {
                out.push(module.trim().to_string());
            }
        }
    }
    out.retain(|s| !s.is_empty());
    out
}

fn parse_es_imports(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(from_idx) = line.find("from ") {
            if line.starts_with("import ") || line.starts_with("export ") {
                let rest = &line[from_idx + 5..];
                let spec = rest.trim().trim_matches(|c| c == '\'' || c == '"' || c == ';');
                out.push(spec.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("require(") {
            let spec = rest.trim_matches(|c: char| c == ')' || c == '\'' || c == '"' || c == ';');
            out.push(spec.to_string());
        }
    }
    out
}

fn parse_rust_uses(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("use ") {
            let module = rest.trim_end_matches(';').split("::").next().unwrap_or("");
            if !module.is_empty() {
                out.push(module.to_string());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DependencyStats {
    pub file_count: usize,
    pub edge_count: usize,
    pub batch_count: usize,
    pub has_circular_dependencies: bool,
    pub missing_targets: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalysisResult {
    /// Topologically ordered batches; files within a batch are independent.
    pub batches: Vec<Vec<PathBuf>>,
    /// Members of the (longest) critical path, in order.
    pub critical_path: Vec<PathBuf>,
    pub stats: DependencyStats,
}

/// Builds a `petgraph::DiGraph<PathBuf, ()>` from a plan's declared
/// dependencies and, where source text is available, a textual import scan,
/// then derives topological batches, SCC-based cycle handling, and the
/// critical path.
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, plan: &Plan) -> AnalysisResult {
        let mut graph: DiGraph<PathBuf, ()> = DiGraph::new();
        let mut node_of: HashMap<PathBuf, NodeIndex> = HashMap::new();
        let mut id_to_path: HashMap<String, PathBuf> = HashMap::new();
        let mut missing_targets = Vec::new();

        for entry in &plan.entries {
            let path = PathBuf::from(&entry.target_file_path);
            id_to_path.insert(entry.id.clone(), path.clone());
            node_of.entry(path.clone()).or_insert_with(|| graph.add_node(path));
        }

        // Declared dependencies (by entry id or literal path) take precedence
        // over the textual scan.
        for entry in &plan.entries {
            let from = node_of[&PathBuf::from(&entry.target_file_path)];
            for dep in &entry.dependencies {
                let target_path = id_to_path
                    .get(dep)
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from(dep));

                if target_path == PathBuf::from(&entry.target_file_path) {
                    // self-import: dropped
                    continue;
                }

                let to = *node_of
                    .entry(target_path.clone())
                    .or_insert_with(|| graph.add_node(target_path.clone()));

                if !id_to_path.values().any(|p| p == &target_path) && !plan_has_path(plan, &target_path) {
                    missing_targets.push(target_path.display().to_string());
                }

                graph.update_edge(from, to, ());
            }

            if entry.dependencies.is_empty() {
                if let Some(source) = &entry.source {
                    for import in parse_imports(entry.language_hint.as_deref(), source) {
                        let target_path = PathBuf::from(&import);
                        if target_path == PathBuf::from(&entry.target_file_path) {
                            continue;
                        }
                        let to = *node_of
                            .entry(target_path.clone())
                            .or_insert_with(|| graph.add_node(target_path.clone()));
                        graph.update_edge(from, to, ());
                    }
                }
            }
        }

        let sccs = tarjan_scc(&graph);
        let has_circular_dependencies = sccs.iter().any(|scc| scc.len() > 1);

        let batches = topological_batches(&graph, &sccs);
        let critical_path = longest_chain(&graph, &batches);

        let stats = DependencyStats {
            file_count: graph.node_count(),
            edge_count: graph.edge_count(),
            batch_count: batches.len(),
            has_circular_dependencies,
            missing_targets,
        };

        if has_circular_dependencies {
            warn!(scc_count = sccs.iter().filter(|s| s.len() > 1).count(), "circular dependencies detected");
        }
        debug!(batches = batches.len(), files = stats.file_count, "dependency analysis complete");

        AnalysisResult {
            batches,
            critical_path,
            stats,
        }
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn plan_has_path(plan: &Plan, path: &Path) -> bool {
    plan.entries.iter().any(|e| Path::new(&e.target_file_path) == path)
}

/// Collapse each SCC of size > 1 into a single unordered batch (cycle
/// handling), then Kahn's-algorithm the condensed graph into dependency
/// order. Edges point from dependent to dependency, so a node's batch is
/// `1 + max(batch of its dependencies)`.
fn topological_batches(graph: &DiGraph<PathBuf, ()>, sccs: &[Vec<NodeIndex>]) -> Vec<Vec<PathBuf>> {
    let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
    for (comp_id, scc) in sccs.iter().enumerate() {
        for &node in scc {
            component_of.insert(node, comp_id);
        }
    }

    let n_components = sccs.len();
    let mut comp_depends_on: Vec<HashSet<usize>> = vec![HashSet::new(); n_components];
    for edge in graph.edge_indices() {
        let (from, to) = graph.edge_endpoints(edge).unwrap();
        let from_c = component_of[&from];
        let to_c = component_of[&to];
        if from_c != to_c {
            comp_depends_on[from_c].insert(to_c);
        }
    }

    let mut batch_of_component: Vec<Option<usize>> = vec![None; n_components];
    let mut changed = true;
    while changed {
        changed = false;
        for c in 0..n_components {
            if batch_of_component[c].is_some() {
                continue;
            }
            let deps = &comp_depends_on[c];
            if deps.iter().all(|d| batch_of_component[*d].is_some()) {
                let max_dep_batch = deps
                    .iter()
                    .map(|d| batch_of_component[*d].unwrap())
                    .max();
                batch_of_component[c] = Some(max_dep_batch.map_or(0, |b| b + 1));
                changed = true;
            }
        }
    }

    // Any remaining unresolved components (shouldn't happen post-SCC
    // condensation, but degrade to the last batch rather than panic).
    let fallback = batch_of_component.iter().flatten().max().copied().unwrap_or(0) + 1;
    for b in batch_of_component.iter_mut() {
        if b.is_none() {
            *b = Some(fallback);
        }
    }

    let max_batch = batch_of_component.iter().flatten().max().copied().unwrap_or(0);
    let mut batches: Vec<Vec<PathBuf>> = vec![Vec::new(); max_batch + 1];
    for (comp_id, scc) in sccs.iter().enumerate() {
        let batch_idx = batch_of_component[comp_id].unwrap();
        for &node in scc {
            batches[batch_idx].push(graph[node].clone());
        }
    }
    for batch in &mut batches {
        batch.sort();
    }
    batches.retain(|b| !b.is_empty());
    batches
}

/// Longest chain by node count, approximated from the batch assignment: one
/// representative per batch, preferring nodes with the most dependents.
fn longest_chain(graph: &DiGraph<PathBuf, ()>, batches: &[Vec<PathBuf>]) -> Vec<PathBuf> {
    let mut path = Vec::new();
    for batch in batches {
        if let Some(best) = batch.iter().max_by_key(|p| {
            graph
                .node_indices()
                .find(|&n| &graph[n] == *p)
                .map(|n| graph.neighbors_directed(n, petgraph::Direction::Incoming).count())
                .unwrap_or(0)
        }) {
            path.push(best.clone());
        }
    }
    path
}
