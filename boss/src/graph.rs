//! Dependency graph and start/stop ordering.

use crate::error::{Error, Result};
use crate::service::ServiceDescriptor;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// Dependency graph node.
#[derive(Debug, Clone)]
struct DependencyNode {
    priority: i32,
    requires: BTreeSet<String>,
}

/// Directed "must be running before" graph over registered services.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DependencyNode>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from descriptors.
    pub fn from_descriptors<'a, I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        let mut graph = Self::new();
        for desc in descriptors {
            graph.add(&desc.name, desc.priority, desc.dependencies.iter().cloned());
        }
        graph
    }

    /// Add or replace a node.
    pub fn add<I>(&mut self, name: &str, priority: i32, requires: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.nodes.insert(
            name.to_string(),
            DependencyNode {
                priority,
                requires: requires.into_iter().collect(),
            },
        );
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &String> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|node| node.requires.iter())
    }

    /// Fail if any node requires a name that is not in the graph.
    pub fn check_references(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            if let Some(missing) = node.requires.iter().find(|dep| !self.nodes.contains_key(*dep)) {
                return Err(Error::Configuration(format!(
                    "service {} depends on unregistered service {}",
                    name, missing
                )));
            }
        }
        Ok(())
    }

    /// Topological start order.
    ///
    /// Among services whose dependencies are all placed, lower priority comes
    /// first, then name.
    pub fn start_order(&self) -> Result<Vec<String>> {
        self.check_references()?;

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, node) in &self.nodes {
            in_degree.insert(name.as_str(), node.requires.len());
            for dep in &node.requires {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BinaryHeap<Reverse<(i32, &str)>> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| Reverse((self.nodes[name].priority, name)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.nodes[dependent].priority, dependent)));
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            return Err(Error::CyclicDependency(self.find_cycle(&placed)));
        }

        Ok(order)
    }

    /// Reverse of the start order: dependents stop before their dependencies.
    pub fn stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Every service that depends on `name`, directly or transitively.
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![name.to_string()];

        while let Some(current) = frontier.pop() {
            for (candidate, node) in &self.nodes {
                if node.requires.contains(&current) && found.insert(candidate.clone()) {
                    frontier.push(candidate.clone());
                }
            }
        }

        found.remove(name);
        found
    }

    /// Walk dependency edges among unplaced nodes until one repeats.
    ///
    /// Every node left over by Kahn's algorithm still has an unplaced
    /// dependency, so the walk always closes a cycle.
    fn find_cycle(&self, placed: &BTreeSet<&str>) -> Vec<String> {
        let start = match self.nodes.keys().find(|name| !placed.contains(name.as_str())) {
            Some(name) => name.as_str(),
            None => return Vec::new(),
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start;

        loop {
            if let Some(pos) = path.iter().position(|&n| n == current) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);

            let next = self.nodes[current]
                .requires
                .iter()
                .find(|dep| !placed.contains(dep.as_str()) && self.nodes.contains_key(*dep));

            match next {
                Some(dep) => current = dep.as_str(),
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assistant_graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add("updater", 90, deps(&["database"]));
        graph.add("llm", 40, deps(&["database", "security"]));
        graph.add("tts", 50, deps(&["database"]));
        graph.add("stt", 50, deps(&["database"]));
        graph.add("security", 20, deps(&["database"]));
        graph.add("database", 10, deps(&[]));
        graph.add("automation", 60, deps(&["database", "security"]));
        graph
    }

    #[test]
    fn test_start_order_respects_dependencies() {
        let graph = assistant_graph();
        let order = graph.start_order().unwrap();
        assert_eq!(order.len(), graph.len());

        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        for name in &order {
            for dep in graph.dependencies(name) {
                assert!(pos(dep.as_str()) < pos(name.as_str()), "{} must start after {}", name, dep);
            }
        }
    }

    #[test]
    fn test_start_order_priority_then_name() {
        let order = assistant_graph().start_order().unwrap();
        assert_eq!(
            order,
            vec!["database", "security", "llm", "stt", "tts", "automation", "updater"]
        );
    }

    #[test]
    fn test_priority_does_not_override_dependencies() {
        let mut graph = DependencyGraph::new();
        graph.add("base", 99, deps(&[]));
        graph.add("eager", 1, deps(&["base"]));
        graph.add("other", 50, deps(&[]));
        assert_eq!(graph.start_order().unwrap(), vec!["other", "base", "eager"]);
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let mut a = DependencyGraph::new();
        a.add("x", 5, deps(&[]));
        a.add("y", 1, deps(&[]));
        let mut b = DependencyGraph::new();
        b.add("y", 1, deps(&[]));
        b.add("x", 5, deps(&[]));
        assert_eq!(a.start_order().unwrap(), b.start_order().unwrap());
        assert_eq!(a.start_order().unwrap(), vec!["y", "x"]);
    }

    #[test]
    fn test_stop_order_is_reverse() {
        let graph = assistant_graph();
        let mut start = graph.start_order().unwrap();
        start.reverse();
        assert_eq!(graph.stop_order().unwrap(), start);
    }

    #[test]
    fn test_cycle_reports_members() {
        let mut graph = DependencyGraph::new();
        graph.add("root", 1, deps(&[]));
        graph.add("a", 10, deps(&["b", "root"]));
        graph.add("b", 10, deps(&["c"]));
        graph.add("c", 10, deps(&["a"]));
        graph.add("leaf", 10, deps(&["a"]));

        match graph.start_order() {
            Err(Error::CyclicDependency(cycle)) => {
                assert_eq!(cycle.first(), cycle.last());
                let members: BTreeSet<&str> = cycle.iter().map(String::as_str).collect();
                let expected: BTreeSet<&str> = ["a", "b", "c"].into_iter().collect();
                assert_eq!(members, expected);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_is_configuration_error() {
        let mut graph = DependencyGraph::new();
        graph.add("llm", 40, deps(&["database"]));
        assert!(matches!(graph.start_order(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add("a", 1, deps(&[]));
        graph.add("b", 1, deps(&["a"]));
        graph.add("c", 1, deps(&["b"]));
        graph.add("d", 1, deps(&[]));

        let dependents = graph.dependents_of("a");
        let expected: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dependents, expected);
        assert!(graph.dependents_of("c").is_empty());
        assert!(graph.dependents_of("missing").is_empty());
    }
}
