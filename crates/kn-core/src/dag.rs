use std::collections::{HashMap, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("duplicate task id: {0}")]
    DuplicateNode(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

pub type Result<T> = std::result::Result<T, DagError>;

// ---------------------------------------------------------------------------
// TaskDag
// ---------------------------------------------------------------------------

/// Dependency graph over task ids.
///
/// Nodes keep their insertion order, which is used as the tie break for both
/// [`TaskDag::order`] and [`TaskDag::ready`] so the walk is deterministic.
#[derive(Debug, Clone, Default)]
pub struct TaskDag {
    nodes: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl TaskDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` with its incoming edges. Dependencies may name nodes
    /// that are added later; they are resolved by [`TaskDag::order`].
    pub fn add<I, S>(&mut self, id: impl Into<String>, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        if self.deps.contains_key(&id) {
            return Err(DagError::DuplicateNode(id));
        }
        let mut list: Vec<String> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !list.contains(&dep) {
                list.push(dep);
            }
        }
        self.nodes.push(id.clone());
        self.deps.insert(id, list);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.deps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Full topological order (Kahn's algorithm). Every id appears after all
    /// of its dependencies.
    pub fn order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.nodes {
            let deps = self.dependencies(id);
            for dep in deps {
                if !self.deps.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
            indegree.insert(id.as_str(), deps.len());
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(count) = indegree.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .filter(|id| indegree[id.as_str()] > 0)
                .cloned()
                .collect();
            return Err(DagError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Ids whose dependencies are all in `completed` and which are not
    /// themselves completed, in insertion order.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| self.dependencies(id).iter().all(|d| completed.contains(d)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn diamond() -> TaskDag {
        let mut dag = TaskDag::new();
        dag.add("a", Vec::<String>::new()).unwrap();
        dag.add("b", ["a"]).unwrap();
        dag.add("c", ["a"]).unwrap();
        dag.add("d", ["b", "c"]).unwrap();
        dag
    }

    #[test]
    fn order_respects_dependencies() {
        let dag = diamond();
        let order = dag.order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert_eq!(order.len(), 4);
        for id in dag.nodes() {
            for dep in dag.dependencies(id) {
                assert!(pos(dep) < pos(id), "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn order_breaks_ties_by_insertion() {
        let mut dag = TaskDag::new();
        dag.add("z", Vec::<String>::new()).unwrap();
        dag.add("m", Vec::<String>::new()).unwrap();
        dag.add("a", ["z"]).unwrap();
        assert_eq!(dag.order().unwrap(), vec!["z", "m", "a"]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut dag = TaskDag::new();
        dag.add("a", ["c"]).unwrap();
        dag.add("b", ["a"]).unwrap();
        dag.add("c", ["b"]).unwrap();
        dag.add("free", Vec::<String>::new()).unwrap();
        match dag.order() {
            Err(DagError::Cycle(stuck)) => assert_eq!(stuck, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut dag = TaskDag::new();
        dag.add("a", ["a"]).unwrap();
        assert!(matches!(dag.order(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut dag = TaskDag::new();
        dag.add("a", ["ghost"]).unwrap();
        assert_eq!(
            dag.order(),
            Err(DagError::UnknownDependency {
                task: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut dag = TaskDag::new();
        dag.add("a", Vec::<String>::new()).unwrap();
        assert_eq!(
            dag.add("a", Vec::<String>::new()),
            Err(DagError::DuplicateNode("a".into()))
        );
        assert_eq!(dag.len(), 1);
    }

    #[test]
    fn empty_graph() {
        let dag = TaskDag::new();
        assert!(dag.order().unwrap().is_empty());
        assert!(dag.ready(&HashSet::new()).is_empty());
    }

    #[test]
    fn single_node() {
        let mut dag = TaskDag::new();
        dag.add("only", Vec::<String>::new()).unwrap();
        assert_eq!(dag.order().unwrap(), vec!["only"]);
        assert_eq!(dag.ready(&HashSet::new()), vec!["only"]);
        assert!(dag.ready(&done(&["only"])).is_empty());
    }

    #[test]
    fn diamond_frontier() {
        let dag = diamond();
        assert_eq!(dag.ready(&done(&[])), vec!["a"]);
        assert_eq!(dag.ready(&done(&["a"])), vec!["b", "c"]);
        assert_eq!(dag.ready(&done(&["a", "b"])), vec!["c"]);
        assert_eq!(dag.ready(&done(&["a", "b", "c"])), vec!["d"]);
    }

    #[test]
    fn ready_excludes_completed_and_blocked() {
        let dag = diamond();
        let completed = done(&["a", "c"]);
        let ready = dag.ready(&completed);
        for id in &ready {
            assert!(!completed.contains(id));
            assert!(dag.dependencies(id).iter().all(|d| completed.contains(d)));
        }
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn incremental_add_extends_frontier() {
        let mut dag = diamond();
        dag.add("task-revision-b", ["b"]).unwrap();
        assert!(dag.order().is_ok());
        assert_eq!(dag.ready(&done(&["a", "b"])), vec!["c", "task-revision-b"]);
    }
}
