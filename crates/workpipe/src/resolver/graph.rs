//! The import dependency graph and its cycle analysis.

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;

/// A directed graph over normalized file paths. Edges carry the list
/// of names imported along them.
#[derive(Debug, Default)]
pub struct ImportGraph {
    nodes: IndexSet<Utf8PathBuf>,
    edges: Vec<Vec<(usize, Vec<String>)>>,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning its index. Adding an existing node is a
    /// no-op.
    pub fn add_node(&mut self, path: &Utf8Path) -> usize {
        let (index, inserted) = self.nodes.insert_full(path.to_owned());
        if inserted {
            self.edges.push(vec![]);
        }
        index
    }

    /// Adds an edge `from -> to` (from imports to).
    pub fn add_edge(&mut self, from: &Utf8Path, to: &Utf8Path, names: Vec<String>) {
        let from = self.add_node(from);
        let to = self.add_node(to);
        self.edges[from].push((to, names));
    }

    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.nodes.contains(path)
    }

    fn path(&self, index: usize) -> &Utf8Path {
        self.nodes.get_index(index).expect("node index in range")
    }

    /// Tarjan's strongly connected components, iteratively, in
    /// O(V + E).
    ///
    /// Components come out in reverse topological order: every
    /// component is emitted after all components it depends on. For an
    /// acyclic graph each component is a singleton, so the emitted
    /// sequence is already a leaves-first compilation order.
    pub fn sccs(&self) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;

        let n = self.nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = vec![];
        let mut next_index = 0usize;
        let mut components = vec![];

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }

            // Explicit call stack of (node, next-neighbor position).
            let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(&mut (v, ref mut at)) = frames.last_mut() {
                if *at < self.edges[v].len() {
                    let w = self.edges[v][*at].0;
                    *at += 1;

                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                } else {
                    frames.pop();

                    if lowlink[v] == index[v] {
                        let mut component = vec![];
                        loop {
                            let w = stack.pop().expect("tarjan stack underflow");
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        component.reverse();
                        components.push(component);
                    }

                    if let Some(&mut (parent, _)) = frames.last_mut() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                }
            }
        }

        components
    }

    fn has_self_loop(&self, node: usize) -> bool {
        self.edges[node].iter().any(|(to, _)| *to == node)
    }

    /// Returns every import cycle: any SCC with two or more members,
    /// or a singleton with a self-loop.
    pub fn cycles(&self) -> Vec<Vec<&Utf8Path>> {
        self.sccs()
            .into_iter()
            .filter(|scc| scc.len() >= 2 || self.has_self_loop(scc[0]))
            .map(|scc| scc.into_iter().map(|i| self.path(i)).collect())
            .collect()
    }

    /// The leaves-first compilation order, or `None` when the graph
    /// has a cycle.
    pub fn topological_order(&self) -> Option<Vec<&Utf8Path>> {
        let mut order = vec![];
        for scc in self.sccs() {
            if scc.len() >= 2 || self.has_self_loop(scc[0]) {
                return None;
            }
            order.push(self.path(scc[0]));
        }
        Some(order)
    }

    /// All transitive dependents of `path` (files that import it,
    /// directly or indirectly). Used for editor invalidation.
    pub fn dependents_of(&self, path: &Utf8Path) -> Vec<&Utf8Path> {
        let Some(target) = self.nodes.get_index_of(path) else {
            return vec![];
        };

        // Reverse adjacency, then BFS.
        let mut reverse = vec![vec![]; self.nodes.len()];
        for (from, edges) in self.edges.iter().enumerate() {
            for (to, _) in edges {
                reverse[*to].push(from);
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut queue = vec![target];
        let mut out = vec![];
        while let Some(node) = queue.pop() {
            for &dependent in &reverse[node] {
                if !seen[dependent] && dependent != target {
                    seen[dependent] = true;
                    out.push(self.path(dependent));
                    queue.push(dependent);
                }
            }
        }
        out
    }

    /// Renders a cycle as `a → b → … → a` for diagnostics.
    pub fn render_ring(cycle: &[&Utf8Path]) -> String {
        let mut names: Vec<&str> = cycle
            .iter()
            .map(|p| p.file_name().unwrap_or(p.as_str()))
            .collect();
        if let Some(first) = names.first().copied() {
            names.push(first);
        }
        names.join(" → ")
    }
}
