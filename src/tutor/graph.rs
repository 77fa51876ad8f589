//! Versioned, immutable concept relationship graph.
//!
//! Readers clone the current `Arc` and work against that snapshot for the whole
//! interaction; a reload validates the new snapshot and swaps the pointer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{TutorError, TutorResult, ValidationCode};
use crate::tutor::types::{Concept, TransferEdge};

#[derive(Debug, Clone, Default)]
pub struct ConceptGraph {
    version: u64,
    concepts: HashMap<String, Concept>,
}

impl ConceptGraph {
    pub fn new(version: u64, concepts: Vec<Concept>) -> TutorResult<Self> {
        let mut map = HashMap::with_capacity(concepts.len());
        for concept in concepts {
            if concept.id.trim().is_empty() {
                return Err(invalid("concept with empty id"));
            }
            if map.insert(concept.id.clone(), concept).is_some() {
                return Err(invalid("duplicate concept id in snapshot"));
            }
        }
        let graph = Self {
            version,
            concepts: map,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    pub fn get(&self, concept_id: &str) -> Option<&Concept> {
        self.concepts.get(concept_id)
    }

    pub fn contains(&self, concept_id: &str) -> bool {
        self.concepts.contains_key(concept_id)
    }

    pub fn prerequisites(&self, concept_id: &str) -> impl Iterator<Item = &str> {
        self.concepts
            .get(concept_id)
            .into_iter()
            .flat_map(|c| c.prerequisites.iter().map(String::as_str))
    }

    pub fn transfer_edges(&self, concept_id: &str) -> &[TransferEdge] {
        self.concepts
            .get(concept_id)
            .map(|c| c.transfer_edges.as_slice())
            .unwrap_or(&[])
    }

    fn validate(&self) -> TutorResult<()> {
        for concept in self.concepts.values() {
            for prereq in &concept.prerequisites {
                if prereq == &concept.id {
                    return Err(invalid(format!("{} lists itself as prerequisite", concept.id)));
                }
                if !self.concepts.contains_key(prereq) {
                    return Err(invalid(format!(
                        "{} references unknown prerequisite {prereq}",
                        concept.id
                    )));
                }
            }
            for edge in &concept.transfer_edges {
                if !(0.0..=1.0).contains(&edge.strength) {
                    return Err(invalid(format!(
                        "transfer edge {} -> {} has strength {} outside [0, 1]",
                        concept.id, edge.target_concept, edge.strength
                    )));
                }
                if edge.target_concept == concept.id {
                    return Err(invalid(format!("{} has a transfer edge to itself", concept.id)));
                }
                if !self.concepts.contains_key(&edge.target_concept) {
                    return Err(invalid(format!(
                        "{} references unknown transfer target {}",
                        concept.id, edge.target_concept
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    /// Kahn's algorithm over the prerequisite relation.
    fn check_acyclic(&self) -> TutorResult<()> {
        let mut indegree: HashMap<&str, usize> =
            self.concepts.keys().map(|k| (k.as_str(), 0)).collect();
        for concept in self.concepts.values() {
            if let Some(d) = indegree.get_mut(concept.id.as_str()) {
                *d = concept.prerequisites.len();
            }
        }
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for concept in self.concepts.values() {
            for prereq in &concept.prerequisites {
                dependents
                    .entry(prereq.as_str())
                    .or_default()
                    .push(concept.id.as_str());
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(id) = ready.pop() {
            visited.insert(id);
            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*dependent);
                    }
                }
            }
        }

        if visited.len() != self.concepts.len() {
            return Err(invalid("prerequisite relation contains a cycle"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> TutorError {
    TutorError::validation(ValidationCode::InvalidGraph, message)
}

/// Shared handle over the active graph snapshot.
#[derive(Debug, Default)]
pub struct ConceptGraphHandle {
    current: RwLock<Arc<ConceptGraph>>,
}

impl ConceptGraphHandle {
    pub fn new(graph: ConceptGraph) -> Self {
        Self {
            current: RwLock::new(Arc::new(graph)),
        }
    }

    pub fn snapshot(&self) -> Arc<ConceptGraph> {
        Arc::clone(&self.current.read())
    }

    /// Swaps in a newer snapshot. Older or equal versions are rejected.
    pub fn load(&self, graph: ConceptGraph) -> TutorResult<u64> {
        let mut guard = self.current.write();
        if !guard.is_empty() && graph.version() <= guard.version() {
            return Err(invalid(format!(
                "snapshot version {} is not newer than active version {}",
                graph.version(),
                guard.version()
            )));
        }
        let version = graph.version();
        let concepts = graph.len();
        *guard = Arc::new(graph);
        tracing::info!(version, concepts, "concept graph snapshot swapped");
        Ok(version)
    }
}
