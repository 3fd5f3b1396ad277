//! Static graph indexing over a `WorkflowDefinition`. Built once per scope
//! at activation time and used for join discovery and ordered outgoing
//! lookups. Connections are indexed by id rather than owned by nodes
//! (spec §9's "do not build ownership cycles" design note), the same
//! non-owning-index idiom as the teacher's `compiler/ir.rs` `IRGraph`
//! (a `petgraph::DiGraph` addressed by `NodeIndex`, never by ownership).

use crate::types::{Connection, Element, ElementType, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};

pub struct ProcessGraph<'a> {
    def: &'a WorkflowDefinition,
    graph: DiGraph<&'a str, &'a str>,
    node_of: HashMap<&'a str, NodeIndex>,
}

impl<'a> ProcessGraph<'a> {
    pub fn build(def: &'a WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut node_of = HashMap::new();
        for el in &def.elements {
            let idx = graph.add_node(el.id.as_str());
            node_of.insert(el.id.as_str(), idx);
        }
        for conn in &def.connections {
            if let (Some(&from), Some(&to)) = (node_of.get(conn.from.as_str()), node_of.get(conn.to.as_str())) {
                graph.add_edge(from, to, conn.id.as_str());
            }
        }
        Self { def, graph, node_of }
    }

    /// Outgoing connections of `element_id`, in declaration order (spec
    /// §4.5 tie-break rule: "first in declaration order wins").
    pub fn outgoing(&self, element_id: &str) -> Vec<&'a Connection> {
        self.def.outgoing(element_id)
    }

    pub fn incoming(&self, element_id: &str) -> Vec<&'a Connection> {
        self.def.incoming(element_id)
    }

    /// Walks forward from each of `branch_starts` along single-outgoing,
    /// non-branching elements, looking for a gateway with more than one
    /// incoming connection that every branch reaches in common. This is
    /// the "propagate a fork stamp through connections" resolution spec §9
    /// asks for, generalized as structural reachability rather than a
    /// wire-level stamp, since the fork and its join are not otherwise
    /// linked in the data model. Returns `None` when branches never
    /// reconverge (e.g. each leads to its own end event) — those forks have
    /// no formal join and each branch simply runs to completion
    /// independently.
    pub fn find_matching_join(&self, branch_starts: &[String]) -> Option<String> {
        if branch_starts.is_empty() {
            return None;
        }
        let mut candidate_sets: Vec<std::collections::HashSet<String>> = Vec::new();
        for start in branch_starts {
            candidate_sets.push(self.reachable_gateways(start));
        }
        let mut common = candidate_sets[0].clone();
        for set in &candidate_sets[1..] {
            common = common.intersection(set).cloned().collect();
        }
        // Prefer the closest common join: the one with the smallest combined
        // hop distance isn't tracked precisely here, so any common
        // multi-incoming gateway found within the bounded BFS is accepted —
        // ties are resolved by iteration order, which is stable for a given
        // definition.
        common.into_iter().next()
    }

    fn reachable_gateways(&self, start: &str) -> std::collections::HashSet<String> {
        const MAX_HOPS: usize = 64;
        let mut seen = std::collections::HashSet::new();
        let mut found = std::collections::HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.to_string(), 0usize));
        seen.insert(start.to_string());
        while let Some((id, hops)) = queue.pop_front() {
            if hops > MAX_HOPS {
                continue;
            }
            if id != start {
                if let Some(el) = self.def.element(&id) {
                    if el.kind.is_gateway() && self.incoming(&id).len() > 1 {
                        found.insert(id.clone());
                        continue; // don't walk past a join candidate
                    }
                }
            }
            for conn in self.outgoing(&id) {
                if seen.insert(conn.to.clone()) {
                    queue.push_back((conn.to.clone(), hops + 1));
                }
            }
        }
        found
    }

    pub fn element(&self, id: &str) -> Option<&'a Element> {
        self.def.element(id)
    }

    pub fn is_event_based_gateway(&self, id: &str) -> bool {
        self.element(id)
            .map(|e| e.kind == ElementType::EventBasedGateway)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::BTreeMap;

    fn el(id: &str, kind: ElementType) -> Element {
        Element {
            id: id.to_string(),
            kind,
            name: None,
            properties: BTreeMap::new(),
            attached_to_ref: None,
            child_elements: vec![],
            child_connections: vec![],
        }
    }

    fn conn(id: &str, from: &str, to: &str) -> Connection {
        Connection {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn finds_common_parallel_join() {
        let def = WorkflowDefinition {
            id: "p".to_string(),
            name: "p".to_string(),
            elements: vec![
                el("fork", ElementType::ParallelGateway),
                el("a", ElementType::Task),
                el("b", ElementType::Task),
                el("join", ElementType::ParallelGateway),
            ],
            connections: vec![
                conn("f1", "fork", "a"),
                conn("f2", "fork", "b"),
                conn("f3", "a", "join"),
                conn("f4", "b", "join"),
            ],
            pools: vec![],
            subprocess_definitions: BTreeMap::new(),
        };
        let graph = ProcessGraph::build(&def);
        let join = graph.find_matching_join(&["a".to_string(), "b".to_string()]);
        assert_eq!(join.as_deref(), Some("join"));
    }

    #[test]
    fn disjoint_branches_have_no_join() {
        let def = WorkflowDefinition {
            id: "p".to_string(),
            name: "p".to_string(),
            elements: vec![
                el("fork", ElementType::ParallelGateway),
                el("a", ElementType::Task),
                el("b", ElementType::Task),
                el("enda", ElementType::EndEvent),
                el("endb", ElementType::EndEvent),
            ],
            connections: vec![
                conn("f1", "fork", "a"),
                conn("f2", "fork", "b"),
                conn("f3", "a", "enda"),
                conn("f4", "b", "endb"),
            ],
            pools: vec![],
            subprocess_definitions: BTreeMap::new(),
        };
        let graph = ProcessGraph::build(&def);
        let join = graph.find_matching_join(&["a".to_string(), "b".to_string()]);
        assert_eq!(join, None);
    }
}
