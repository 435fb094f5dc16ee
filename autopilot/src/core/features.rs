//! Feature records, the status transition table and dependency-graph checks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Implemented,
    Blocked,
    Tested,
}

impl FeatureStatus {
    pub const ALL: [FeatureStatus; 5] = [
        FeatureStatus::Pending,
        FeatureStatus::InProgress,
        FeatureStatus::Implemented,
        FeatureStatus::Blocked,
        FeatureStatus::Tested,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::InProgress => "in_progress",
            FeatureStatus::Implemented => "implemented",
            FeatureStatus::Blocked => "blocked",
            FeatureStatus::Tested => "tested",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work tracked by the build harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub description: String,
    /// Lower is more urgent.
    pub priority: u32,
    pub status: FeatureStatus,
    pub phase: String,
    pub dependencies: BTreeSet<String>,
    pub acceptance_criteria: Vec<String>,
    pub attempts: u32,
    pub cost_usd: f64,
}

/// Legal status edges.
///
/// `implemented -> blocked` exists only for the harness's failed test batch.
pub fn is_allowed_transition(from: FeatureStatus, to: FeatureStatus) -> bool {
    use FeatureStatus::{Blocked, Implemented, InProgress, Pending, Tested};
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Implemented)
            | (InProgress, Blocked)
            | (Implemented, Tested)
            | (Implemented, Blocked)
            | (Blocked, Pending)
    )
}

/// Rejected status edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub feature_id: String,
    pub from: FeatureStatus,
    pub to: FeatureStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal status transition for feature '{}': {} -> {}",
            self.feature_id, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

pub fn check_transition(
    feature_id: &str,
    from: FeatureStatus,
    to: FeatureStatus,
) -> Result<(), TransitionError> {
    if is_allowed_transition(from, to) {
        return Ok(());
    }
    Err(TransitionError {
        feature_id: feature_id.to_string(),
        from,
        to,
    })
}

/// Dependency graph integrity violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    DuplicateId(String),
    MissingDependency { feature: String, dependency: String },
    /// Features forming one strongly connected component, in input order.
    Cycle(Vec<String>),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateId(id) => write!(f, "duplicate feature id '{id}'"),
            GraphError::MissingDependency {
                feature,
                dependency,
            } => write!(
                f,
                "feature '{feature}' depends on unknown feature '{dependency}'"
            ),
            GraphError::Cycle(members) => {
                write!(f, "dependency cycle: {}", members.join(" -> "))
            }
        }
    }
}

/// Every graph violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphValidationError(pub Vec<GraphError>);

impl fmt::Display for GraphValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "invalid feature graph: {}", messages.join("; "))
    }
}

impl std::error::Error for GraphValidationError {}

/// Check ids are unique, every dependency exists and the graph is acyclic.
///
/// Each strongly connected component with more than one member, and each
/// self-dependency, is reported as one cycle listing its members in input order.
pub fn validate_graph(features: &[Feature]) -> Vec<GraphError> {
    let mut errors = Vec::new();
    let mut index: HashMap<&str, &Feature> = HashMap::new();
    for feature in features {
        if index.insert(feature.id.as_str(), feature).is_some() {
            errors.push(GraphError::DuplicateId(feature.id.clone()));
        }
    }

    for feature in features {
        for dep in &feature.dependencies {
            if !index.contains_key(dep.as_str()) {
                errors.push(GraphError::MissingDependency {
                    feature: feature.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut search = CycleSearch {
        index: &index,
        next_index: 0,
        indices: HashMap::new(),
        low_links: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        components: Vec::new(),
    };
    for feature in features {
        if !search.indices.contains_key(feature.id.as_str()) {
            search.visit(feature.id.as_str());
        }
    }

    let position: HashMap<&str, usize> = features
        .iter()
        .enumerate()
        .rev()
        .map(|(pos, f)| (f.id.as_str(), pos))
        .collect();
    let mut cycles: Vec<Vec<&str>> = search
        .components
        .into_iter()
        .filter(|members| match members.as_slice() {
            [only] => index
                .get(only)
                .is_some_and(|f| f.dependencies.iter().any(|dep| dep == only)),
            _ => true,
        })
        .map(|mut members| {
            members.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            members
        })
        .collect();
    cycles.sort_by_key(|members| {
        members
            .first()
            .and_then(|id| position.get(id).copied())
            .unwrap_or(usize::MAX)
    });
    errors.extend(cycles.into_iter().map(|members| {
        GraphError::Cycle(members.into_iter().map(str::to_string).collect())
    }));
    errors
}

/// Tarjan's strongly connected components over the dependency edges.
struct CycleSearch<'a> {
    index: &'a HashMap<&'a str, &'a Feature>,
    next_index: usize,
    indices: HashMap<&'a str, usize>,
    low_links: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    components: Vec<Vec<&'a str>>,
}

impl<'a> CycleSearch<'a> {
    fn visit(&mut self, id: &'a str) {
        let index = self.index;
        self.indices.insert(id, self.next_index);
        self.low_links.insert(id, self.next_index);
        self.next_index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);

        if let Some(feature) = index.get(id) {
            for dep in &feature.dependencies {
                let Some(dep_feature) = index.get(dep.as_str()) else {
                    continue;
                };
                let dep_id = dep_feature.id.as_str();
                if !self.indices.contains_key(dep_id) {
                    self.visit(dep_id);
                    let dep_low = self.low_links[dep_id];
                    self.lower_link(id, dep_low);
                } else if self.on_stack.contains(dep_id) {
                    let dep_index = self.indices[dep_id];
                    self.lower_link(id, dep_index);
                }
            }
        }

        if self.low_links[id] == self.indices[id] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member);
                if member == id {
                    break;
                }
            }
            self.components.push(component);
        }
    }

    fn lower_link(&mut self, id: &'a str, candidate: usize) {
        if let Some(low) = self.low_links.get_mut(id) {
            *low = (*low).min(candidate);
        }
    }
}

/// Greedy frontier pick: the most urgent pending feature whose dependencies are all tested.
///
/// Ties on priority go to the earlier feature.
pub fn next_ready(features: &[Feature]) -> Option<&Feature> {
    let status_by_id: HashMap<&str, FeatureStatus> = features
        .iter()
        .map(|f| (f.id.as_str(), f.status))
        .collect();
    features
        .iter()
        .enumerate()
        .filter(|(_, f)| f.status == FeatureStatus::Pending)
        .filter(|(_, f)| {
            f.dependencies
                .iter()
                .all(|dep| status_by_id.get(dep.as_str()) == Some(&FeatureStatus::Tested))
        })
        .min_by_key(|(idx, f)| (f.priority, *idx))
        .map(|(_, f)| f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::feature;

    #[test]
    fn transition_table_accepts_only_declared_edges() {
        use FeatureStatus::{Blocked, Implemented, InProgress, Pending, Tested};
        let allowed: Vec<(FeatureStatus, FeatureStatus)> = FeatureStatus::ALL
            .iter()
            .flat_map(|from| FeatureStatus::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_allowed_transition(*from, *to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Pending, InProgress),
                (InProgress, Implemented),
                (InProgress, Blocked),
                (Implemented, Blocked),
                (Implemented, Tested),
                (Blocked, Pending),
            ]
        );
    }

    #[test]
    fn rejected_transition_names_the_edge() {
        let err = check_transition("F1", FeatureStatus::Pending, FeatureStatus::Tested)
            .expect_err("illegal");
        assert_eq!(
            err.to_string(),
            "illegal status transition for feature 'F1': pending -> tested"
        );
    }

    #[test]
    fn three_feature_cycle_reports_all_members() {
        let features = vec![
            feature("A", 1, &["B"]),
            feature("B", 2, &["C"]),
            feature("C", 3, &["A"]),
        ];
        let errors = validate_graph(&features);
        assert_eq!(
            errors,
            vec![GraphError::Cycle(vec![
                "A".to_string(),
                "B".to_string(),
                "C".to_string()
            ])]
        );
    }

    #[test]
    fn cycle_closing_through_visited_feature_names_every_member() {
        let features = vec![
            feature("A", 1, &["B", "C"]),
            feature("B", 1, &["A"]),
            feature("C", 1, &["B"]),
        ];
        let errors = validate_graph(&features);
        assert_eq!(
            errors,
            vec![GraphError::Cycle(vec![
                "A".to_string(),
                "B".to_string(),
                "C".to_string()
            ])]
        );
    }

    #[test]
    fn valid_dag_has_no_errors() {
        let features = vec![
            feature("F1", 1, &[]),
            feature("F2", 2, &["F1"]),
            feature("F3", 3, &["F1", "F2"]),
        ];
        assert!(validate_graph(&features).is_empty());
    }

    #[test]
    fn missing_dependency_and_duplicates_are_reported() {
        let features = vec![
            feature("F1", 1, &["ghost"]),
            feature("F1", 2, &[]),
        ];
        let errors = validate_graph(&features);
        assert!(errors.contains(&GraphError::DuplicateId("F1".to_string())));
        assert!(errors.contains(&GraphError::MissingDependency {
            feature: "F1".to_string(),
            dependency: "ghost".to_string()
        }));
    }

    #[test]
    fn separate_cycles_are_all_reported() {
        let features = vec![
            feature("A", 1, &["B"]),
            feature("B", 1, &["A"]),
            feature("C", 1, &["C"]),
            feature("D", 1, &["A"]),
        ];
        let errors = validate_graph(&features);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&GraphError::Cycle(vec!["A".to_string(), "B".to_string()])));
        assert!(errors.contains(&GraphError::Cycle(vec!["C".to_string()])));
    }

    #[test]
    fn next_ready_requires_tested_dependencies() {
        let mut features = vec![
            feature("F1", 5, &[]),
            feature("F2", 1, &["F1"]),
            feature("F3", 3, &[]),
        ];
        assert_eq!(next_ready(&features).map(|f| f.id.as_str()), Some("F3"));

        features[0].status = FeatureStatus::Implemented;
        features[2].status = FeatureStatus::Tested;
        assert_eq!(next_ready(&features), None);

        features[0].status = FeatureStatus::Tested;
        assert_eq!(next_ready(&features).map(|f| f.id.as_str()), Some("F2"));
    }

    #[test]
    fn next_ready_breaks_priority_ties_by_insertion_order() {
        let features = vec![
            feature("late", 2, &[]),
            feature("first", 1, &[]),
            feature("second", 1, &[]),
        ];
        assert_eq!(next_ready(&features).map(|f| f.id.as_str()), Some("first"));
    }
}
