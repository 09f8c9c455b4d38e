use std::collections::{BTreeSet, HashMap, VecDeque};

use itertools::Itertools;

use super::{DerivedVariable, DerivedVariableError, SlotKey};
use crate::grid::VariableLookup;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Derived variables have a cyclic dependency involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("More than one derived variable is named '{0}'")]
    DuplicateName(String),
    #[error("'{var}' depends on '{prereq}', which is not available per time step")]
    NotTimeResolved { var: String, prereq: String },
}

/// Derived variables of one job in dependency order.
///
/// Built once per job. Every variable comes after all derived variables it
/// depends on; prerequisites that are not derived variables are raw model
/// variables and impose no ordering.
#[derive(Debug, Clone, Default)]
pub struct DerivedGraph {
    nodes: Vec<DerivedVariable>,
    /// For each node, the nodes that consume its per-step output.
    consumers: Vec<Vec<usize>>,
    per_step: Vec<bool>,
}

impl DerivedGraph {
    /// Order `variables` topologically. Ties keep the declaration order.
    pub fn build(variables: Vec<DerivedVariable>) -> Result<Self, GraphError> {
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, var) in variables.iter().enumerate() {
            if index.insert(var.name().to_string(), i).is_some() {
                return Err(GraphError::DuplicateName(var.name().to_string()));
            }
        }

        let n = variables.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];
        for (i, var) in variables.iter().enumerate() {
            for p in var.prerequisites() {
                if let Some(&j) = index.get(p) {
                    if variables[j].reduces_time() {
                        return Err(GraphError::NotTimeResolved {
                            var: var.name().to_string(),
                            prereq: p.clone(),
                        });
                    }
                    dependents[j].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            let mut released = vec![];
            for &d in dependents[i].iter() {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    released.push(d);
                }
            }
            released.sort_unstable();
            ready.extend(released);
        }

        if order.len() < n {
            let cyclic = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| variables[i].name().to_string())
                .collect_vec();
            return Err(GraphError::Cycle(cyclic));
        }

        let mut slots: Vec<Option<DerivedVariable>> = variables.into_iter().map(Some).collect();
        let nodes = order.iter().filter_map(|&i| slots[i].take()).collect_vec();
        let mut graph = Self {
            consumers: vec![vec![]; n],
            per_step: vec![false; n],
            nodes,
        };
        graph.link();
        Ok(graph)
    }

    /// Fill in per-step consumers and decide which nodes are evaluated per
    /// step: every non-linear node, and every linear node a per-step node
    /// (transitively) depends on.
    fn link(&mut self) {
        let index: HashMap<&str, usize> = self.nodes.iter().enumerate().map(|(i, v)| (v.name(), i)).collect();
        let mut consumers = vec![vec![]; self.nodes.len()];
        for (i, var) in self.nodes.iter().enumerate() {
            for p in var.prerequisites() {
                if let Some(&j) = index.get(p.as_str()) {
                    consumers[j].push(i);
                }
            }
        }

        let mut per_step = self.nodes.iter().map(|v| !v.is_linear()).collect_vec();
        // Consumers always come later in the order, so one reverse sweep
        // propagates the flag through any chain of linear nodes.
        for i in (0..self.nodes.len()).rev() {
            if consumers[i].iter().any(|&c| per_step[c]) {
                per_step[i] = true;
            }
        }
        self.consumers = consumers;
        self.per_step = per_step;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedVariable> {
        self.nodes.iter()
    }

    /// Variables in evaluation order, with the key of their carry slot.
    pub fn iter_with_keys(&self) -> impl Iterator<Item = (SlotKey, &DerivedVariable)> {
        self.nodes.iter().enumerate().map(|(i, v)| (SlotKey(i), v))
    }

    pub fn get(&self, key: SlotKey) -> Option<&DerivedVariable> {
        self.nodes.get(key.0)
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|v| v.name().to_string()).collect()
    }

    /// Keys of the variables that must be evaluated on every time step.
    pub fn per_step_keys(&self) -> Vec<SlotKey> {
        (0..self.nodes.len()).filter(|&i| self.per_step[i]).map(SlotKey).collect()
    }

    /// Whether the per-step output of `key` is an input to another per-step variable.
    pub fn feeds_forward(&self, key: SlotKey) -> bool {
        self.consumers
            .get(key.0)
            .map(|c| c.iter().any(|&i| self.per_step[i]))
            .unwrap_or(false)
    }

    /// Names (raw or derived) whose instantaneous values the per-step
    /// variables need.
    pub fn instantaneous_prerequisites(&self) -> BTreeSet<String> {
        self.per_step_keys()
            .into_iter()
            .filter_map(|k| self.get(k))
            .flat_map(|v| v.prerequisites().iter().cloned())
            .collect()
    }

    /// Check the prerequisites of every variable against `target`, failing on
    /// the first one that is not satisfied.
    pub fn check_prerequisites(
        &mut self,
        target: &dyn VariableLookup,
        constants: Option<&dyn VariableLookup>,
    ) -> Result<(), DerivedVariableError> {
        for var in self.nodes.iter_mut() {
            if !var.check_prerequisites(target, constants) {
                return Err(DerivedVariableError::PrerequisitesNotSatisfied(var.name().to_string()));
            }
        }
        Ok(())
    }

    /// Check prerequisites one variable at a time, declaring each in the
    /// output store right after its check so later variables can depend on it.
    pub fn check_and_declare<S: crate::output::OutputStore>(
        &mut self,
        store: &mut S,
        constants: Option<&dyn VariableLookup>,
    ) -> error_stack::Result<(), DerivedVariableError> {
        for var in self.nodes.iter_mut() {
            if !var.check_prerequisites(&*store, constants) {
                return Err(DerivedVariableError::PrerequisitesNotSatisfied(var.name().to_string()).into());
            }
            var.create_output_slot(store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::{named_variable, running_extremum, Computation, ExtremumMode, LinearCombination};
    use crate::grid::{DataType, VariableInfo};

    fn linear(name: &str, inputs: &[&str]) -> DerivedVariable {
        DerivedVariable::new(
            name,
            "",
            &["time"],
            Computation::Linear(LinearCombination::sum(inputs)),
        )
    }

    #[test]
    fn test_topological_order() {
        let vars = vec![
            named_variable("NetWaterFlux").unwrap(),
            named_variable("WetDays").unwrap(),
            named_variable("LiquidPrecip").unwrap(),
            named_variable("RAIN").unwrap(),
        ];
        let graph = DerivedGraph::build(vars).unwrap();
        let names = graph.names();
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("LiquidPrecip") < pos("NetWaterFlux"));
        assert!(pos("RAIN") < pos("WetDays"));
    }

    #[test]
    fn test_cycle_detected() {
        let vars = vec![linear("A", &["B"]), linear("B", &["C"]), linear("C", &["A"]), linear("D", &["X"])];
        match DerivedGraph::build(vars) {
            Err(GraphError::Cycle(names)) => assert_eq!(names, vec!["A", "B", "C"]),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_name() {
        let vars = vec![named_variable("NetPrecip").unwrap(), named_variable("NetPrecip_Srfc").unwrap()];
        assert!(matches!(DerivedGraph::build(vars), Err(GraphError::DuplicateName(_))));
    }

    #[test]
    fn test_per_step_selection() {
        let vars = vec![
            named_variable("RAIN").unwrap(),
            named_variable("LiquidPrecip").unwrap(),
            named_variable("WetDays").unwrap(),
        ];
        let graph = DerivedGraph::build(vars).unwrap();
        let per_step: Vec<&str> = graph
            .per_step_keys()
            .into_iter()
            .map(|k| graph.get(k).unwrap().name())
            .collect();
        assert_eq!(per_step, vec!["RAIN", "WetDays"]);
        let rain = graph.iter_with_keys().find(|(_, v)| v.name() == "RAIN").unwrap().0;
        assert!(graph.feeds_forward(rain));
        let pq = graph.instantaneous_prerequisites();
        assert!(pq.contains("RAINNC") && pq.contains("RAINC") && pq.contains("RAIN"));
        assert!(!pq.contains("ACSNOW"));
    }

    #[test]
    fn test_extremum_cannot_be_prerequisite() {
        let t2 = VariableInfo::new("T2", &["Time"], "K", DataType::F32);
        let max = running_extremum(&t2, ExtremumMode::Max);
        let vars = vec![max, linear("Twice", &["MaxT2"])];
        assert!(matches!(DerivedGraph::build(vars), Err(GraphError::NotTimeResolved { .. })));
    }
}
