//! Dependency graph over run specs.
//!
//! Edges are stored by id index rather than by reference; the graph is an
//! arena built from a snapshot of the tree. `a -> b` means "b depends on
//! a". The planner partitions affected specs by longest dependency chain,
//! so leaves (specs that depend on nothing) run first.

use std::collections::HashMap;

use crate::group::RootGroup;
use crate::paths::PathId;
use crate::runspec::RunSpec;

pub struct DependencyGraph {
    ids: Vec<PathId>,
    index: HashMap<PathId, usize>,
    /// `deps[i]` holds the indices spec `i` depends on. Dependencies on
    /// ids outside the snapshot are dropped.
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn from_root(root: &RootGroup) -> Self {
        Self::from_specs(&root.transitive_run_specs())
    }

    pub fn from_specs(specs: &[&RunSpec]) -> Self {
        let ids: Vec<PathId> = specs.iter().map(|s| s.id().clone()).collect();
        let index: HashMap<PathId, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let deps = specs
            .iter()
            .map(|s| {
                s.dependencies()
                    .iter()
                    .filter_map(|d| index.get(d).copied())
                    .collect()
            })
            .collect();
        Self { ids, index, deps }
    }

    pub fn contains(&self, id: &PathId) -> bool {
        self.index.contains_key(id)
    }

    /// Some id on a dependency cycle, if the graph has one.
    pub fn find_cycle(&self) -> Option<PathId> {
        // 0 = unvisited, 1 = on the current DFS stack, 2 = done.
        let mut mark = vec![0u8; self.ids.len()];
        for start in 0..self.ids.len() {
            if mark[start] != 0 {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            mark[start] = 1;
            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < self.deps[node].len() {
                    frame.1 += 1;
                    let dep = self.deps[node][next];
                    match mark[dep] {
                        0 => {
                            mark[dep] = 1;
                            stack.push((dep, 0));
                        }
                        1 => return Some(self.ids[dep].clone()),
                        _ => {}
                    }
                } else {
                    mark[node] = 2;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Longest-path length from each vertex through its dependencies.
    /// Undefined on cyclic graphs; callers validate acyclicity first.
    pub fn longest_path_lengths(&self) -> HashMap<PathId, usize> {
        let mut memo: Vec<Option<usize>> = vec![None; self.ids.len()];
        for i in 0..self.ids.len() {
            self.longest_from(i, &mut memo);
        }
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), memo[i].unwrap_or(0)))
            .collect()
    }

    fn longest_from(&self, node: usize, memo: &mut Vec<Option<usize>>) -> usize {
        if let Some(len) = memo[node] {
            return len;
        }
        // Pre-mark to bound runaway recursion if a cycle slips through.
        memo[node] = Some(0);
        let mut len = 0;
        for i in 0..self.deps[node].len() {
            let dep = self.deps[node][i];
            len = len.max(self.longest_from(dep, memo) + 1);
        }
        memo[node] = Some(len);
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runspec::AppSpec;

    fn spec(id: &str, deps: &[&str]) -> RunSpec {
        let mut app = AppSpec::new(id.parse().unwrap(), 0);
        app.dependencies = deps.iter().map(|d| d.parse().unwrap()).collect();
        RunSpec::App(app)
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let specs = [
            spec("/db", &[]),
            spec("/service", &["/db"]),
            spec("/frontend", &["/service"]),
        ];
        let refs: Vec<&RunSpec> = specs.iter().collect();
        assert!(DependencyGraph::from_specs(&refs).find_cycle().is_none());
    }

    #[test]
    fn detects_cycles() {
        let specs = [spec("/a", &["/b"]), spec("/b", &["/c"]), spec("/c", &["/a"])];
        let refs: Vec<&RunSpec> = specs.iter().collect();
        assert!(DependencyGraph::from_specs(&refs).find_cycle().is_some());
    }

    #[test]
    fn longest_path_layers_leaves_first() {
        let specs = [
            spec("/db", &[]),
            spec("/cache", &[]),
            spec("/service", &["/db", "/cache"]),
            spec("/frontend", &["/service"]),
        ];
        let refs: Vec<&RunSpec> = specs.iter().collect();
        let layers = DependencyGraph::from_specs(&refs).longest_path_lengths();
        assert_eq!(layers[&"/db".parse().unwrap()], 0);
        assert_eq!(layers[&"/cache".parse().unwrap()], 0);
        assert_eq!(layers[&"/service".parse().unwrap()], 1);
        assert_eq!(layers[&"/frontend".parse().unwrap()], 2);
    }

    #[test]
    fn unknown_dependencies_are_ignored() {
        let specs = [spec("/a", &["/missing"])];
        let refs: Vec<&RunSpec> = specs.iter().collect();
        let layers = DependencyGraph::from_specs(&refs).longest_path_lengths();
        assert_eq!(layers[&"/a".parse().unwrap()], 0);
    }
}
