//! 计划依赖图
//!
//! 邻接表 + 入度表；构造时检查悬空依赖，分层拓扑排序（Kahn）时检查环。

use std::collections::{BTreeMap, BTreeSet};

use super::plan::{StepId, TaskStep};
use super::PlanError;

/// 步骤依赖图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤
    pub adjacency: BTreeMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 尚未完成的依赖数
    pub in_degree: BTreeMap<StepId, usize>,
}

impl PlanGraph {
    pub fn new(steps: &[TaskStep]) -> Result<Self, PlanError> {
        let mut adjacency: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
        let mut in_degree: BTreeMap<StepId, usize> = BTreeMap::new();

        for step in steps {
            if in_degree.insert(step.id.clone(), 0).is_some() {
                return Err(PlanError::InvalidWorkflow(format!("duplicate step id {}", step.id)));
            }
            adjacency.insert(step.id.clone(), Vec::new());
        }

        for step in steps {
            for dep in &step.depends_on {
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(PlanError::DanglingDependency {
                        step: step.id.clone(),
                        missing: dep.clone(),
                    });
                };
                dependents.push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self { adjacency, in_degree })
    }

    /// 分层拓扑序：同一层内的步骤互不依赖；存在环时返回环上的步骤
    pub fn levels(&self) -> Result<Vec<Vec<StepId>>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut current: Vec<StepId> = degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut levels = Vec::new();
        let mut visited = 0;

        while !current.is_empty() {
            visited += current.len();
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.adjacency.get(id).into_iter().flatten() {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.insert(dependent.clone());
                        }
                    }
                }
            }
            levels.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }

        if visited != degree.len() {
            let cyclic = degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(PlanError::CyclicDependency(cyclic));
        }
        Ok(levels)
    }

    /// 入度为 0 的步骤
    pub fn roots(&self) -> Vec<StepId> {
        self.in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 标记步骤完成，返回因此变为可执行的步骤
    pub fn mark_completed(&mut self, id: &str) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.adjacency.get(id) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(dependent.clone());
                    }
                }
            }
        }
        newly_ready
    }

    /// 所有直接或间接依赖于 `id` 的步骤
    pub fn descendants(&self, id: &str) -> BTreeSet<StepId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.adjacency.get(&current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent.clone());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> TaskStep {
        deps.iter()
            .fold(TaskStep::new(id, "Cap", 10), |s, d| s.depends_on(*d))
    }

    #[test]
    fn test_levels_diamond() {
        let steps = vec![
            step("d", &["b", "c"]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("a", &[]),
        ];
        let graph = PlanGraph::new(&steps).unwrap();
        assert_eq!(
            graph.levels().unwrap(),
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
        assert_eq!(graph.descendants("b").into_iter().collect::<Vec<_>>(), vec!["d".to_string()]);
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"]), step("x", &[])];
        let graph = PlanGraph::new(&steps).unwrap();
        assert_eq!(
            graph.levels(),
            Err(PlanError::CyclicDependency(vec!["a".into(), "b".into(), "c".into()]))
        );
    }

    #[test]
    fn test_dangling_dependency() {
        let steps = vec![step("a", &["ghost"])];
        assert_eq!(
            PlanGraph::new(&steps).err(),
            Some(PlanError::DanglingDependency {
                step: "a".into(),
                missing: "ghost".into()
            })
        );
    }

    #[test]
    fn test_mark_completed() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        let mut graph = PlanGraph::new(&steps).unwrap();
        assert_eq!(graph.roots(), vec!["a".to_string()]);
        assert_eq!(graph.mark_completed("a"), vec!["b".to_string()]);
        assert_eq!(graph.mark_completed("b"), vec!["c".to_string()]);
    }
}
