//! Weighted directed graph with the cycle-breaking machinery used to order
//! sweeps: Tarjan strongly-connected components, Kahn topological sort and
//! the Eades–Lin–Smyth ("GR") feedback-arc-set heuristic.
//!
//! Vertices are dense indices `0..n`. Adjacency is kept in ordered maps so
//! every traversal, and therefore every removed-edge list, is deterministic
//! across ranks.

use std::collections::{BTreeMap, VecDeque};

#[derive(Clone, Debug, Default)]
pub struct DirectedGraph {
    /// Downstream edges with weights.
    ds: Vec<BTreeMap<usize, f64>>,
    /// Upstream edges with weights.
    us: Vec<BTreeMap<usize, f64>>,
}

impl DirectedGraph {
    pub fn with_vertices(n: usize) -> Self {
        Self {
            ds: vec![BTreeMap::new(); n],
            us: vec![BTreeMap::new(); n],
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.ds.len()
    }

    pub fn num_edges(&self) -> usize {
        self.ds.iter().map(BTreeMap::len).sum()
    }

    pub fn add_vertex(&mut self) -> usize {
        self.ds.push(BTreeMap::new());
        self.us.push(BTreeMap::new());
        self.ds.len() - 1
    }

    /// Add `from -> to`; returns `false` if the edge already existed or is a
    /// self-loop.
    pub fn add_edge(&mut self, from: usize, to: usize, weight: f64) -> bool {
        if from == to || self.ds[from].contains_key(&to) {
            return false;
        }
        self.ds[from].insert(to, weight);
        self.us[to].insert(from, weight);
        true
    }

    pub fn remove_edge(&mut self, from: usize, to: usize) -> bool {
        let had = self.ds[from].remove(&to).is_some();
        self.us[to].remove(&from);
        had
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.ds[from].contains_key(&to)
    }

    pub fn successors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.ds[v].keys().copied()
    }

    pub fn predecessors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.us[v].keys().copied()
    }

    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.ds
            .iter()
            .enumerate()
            .flat_map(|(u, m)| m.keys().map(move |&v| (u, v)))
            .collect()
    }

    /// Strongly connected components with more than one vertex (Tarjan,
    /// iterative).
    pub fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.num_vertices();
        let adj: Vec<Vec<usize>> = (0..n).map(|v| self.successors(v).collect()).collect();
        let mut index = vec![UNVISITED; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut next_index = 0usize;
        let mut sccs = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            index[root] = next_index;
            low[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut call: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = call.last_mut() {
                let v = frame.0;
                if frame.1 < adj[v].len() {
                    let w = adj[v][frame.1];
                    frame.1 += 1;
                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        low[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(index[w]);
                    }
                    continue;
                }
                call.pop();
                if let Some(&(parent, _)) = call.last() {
                    low[parent] = low[parent].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut comp = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        comp.push(w);
                        if w == v {
                            break;
                        }
                    }
                    if comp.len() > 1 {
                        sccs.push(comp);
                    }
                }
            }
        }
        sccs
    }

    /// Kahn topological order. Returns an empty vector when the graph has a
    /// cycle (and at least one vertex).
    pub fn topological_sort(&self) -> Vec<usize> {
        let n = self.num_vertices();
        let mut in_degree: Vec<usize> = self.us.iter().map(BTreeMap::len).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&v| in_degree[v] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(u) = queue.pop_front() {
            order.push(u);
            for v in self.successors(u) {
                in_degree[v] -= 1;
                if in_degree[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
        if order.len() != n {
            order.clear();
        }
        order
    }

    /// Vertex sequence from the GR heuristic; edges pointing backwards in
    /// this sequence form an approximate minimum feedback arc set.
    pub fn approx_minimum_fas_sequence(&self) -> Vec<usize> {
        let n = self.num_vertices();
        let mut g = self.clone();
        let mut alive = vec![true; n];
        let mut remaining = n;
        let mut s1 = Vec::with_capacity(n);
        let mut s2 = Vec::new();

        let remove = |g: &mut DirectedGraph, alive: &mut [bool], v: usize| {
            let ds: Vec<usize> = g.ds[v].keys().copied().collect();
            let us: Vec<usize> = g.us[v].keys().copied().collect();
            for w in ds {
                g.remove_edge(v, w);
            }
            for u in us {
                g.remove_edge(u, v);
            }
            alive[v] = false;
        };

        while remaining > 0 {
            loop {
                let sink = (0..n).find(|&v| alive[v] && g.ds[v].is_empty());
                let source = (0..n).find(|&v| alive[v] && g.us[v].is_empty());
                if let Some(v) = sink {
                    remove(&mut g, &mut alive, v);
                    s2.push(v);
                } else if let Some(v) = source {
                    remove(&mut g, &mut alive, v);
                    s1.push(v);
                } else {
                    break;
                }
                remaining -= 1;
            }
            if remaining == 0 {
                break;
            }
            let delta = |v: usize| -> f64 {
                g.ds[v].values().sum::<f64>() - g.us[v].values().sum::<f64>()
            };
            let mut best: Option<(usize, f64)> = None;
            for v in (0..n).filter(|&v| alive[v]) {
                let d = delta(v);
                if best.is_none_or(|(_, bd)| d > bd) {
                    best = Some((v, d));
                }
            }
            if let Some((v, _)) = best {
                remove(&mut g, &mut alive, v);
                s1.push(v);
                remaining -= 1;
            }
        }
        s2.reverse();
        s1.extend(s2);
        s1
    }

    /// Remove edges until the graph is acyclic; returns the removed edges.
    ///
    /// Two-vertex components lose their front→back edge, three-vertex
    /// components their first internal edge, larger components every edge
    /// pointing backwards in the GR sequence. Detection repeats until no
    /// component with more than one vertex remains.
    pub fn remove_cyclic_dependencies(&mut self) -> Vec<(usize, usize)> {
        let mut removed = Vec::new();
        let mut sccs = self.strongly_connected_components();
        while !sccs.is_empty() {
            for scc in &sccs {
                match scc.len() {
                    2 => {
                        let (u, v) = (scc[0], scc[1]);
                        if self.remove_edge(u, v) {
                            removed.push((u, v));
                        }
                    }
                    3 => {
                        let edge = scc.iter().find_map(|&u| {
                            self.successors(u).find(|v| scc.contains(v)).map(|v| (u, v))
                        });
                        if let Some((u, v)) = edge {
                            self.remove_edge(u, v);
                            removed.push((u, v));
                        }
                    }
                    _ => {
                        let local: BTreeMap<usize, usize> =
                            scc.iter().enumerate().map(|(i, &v)| (v, i)).collect();
                        let mut sub = DirectedGraph::with_vertices(scc.len());
                        for (i, &u) in scc.iter().enumerate() {
                            for (&v, &w) in &self.ds[u] {
                                if let Some(&j) = local.get(&v) {
                                    sub.add_edge(i, j, w);
                                }
                            }
                        }
                        let seq = sub.approx_minimum_fas_sequence();
                        let mut pos = vec![0usize; seq.len()];
                        for (p, &v) in seq.iter().enumerate() {
                            pos[v] = p;
                        }
                        for (i, j) in sub.edges() {
                            if pos[j] < pos[i] {
                                self.remove_edge(scc[i], scc[j]);
                                removed.push((scc[i], scc[j]));
                            }
                        }
                    }
                }
            }
            sccs = self.strongly_connected_components();
        }
        removed
    }
}
