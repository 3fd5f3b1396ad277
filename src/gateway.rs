//! Gateway decision and merge-synchronization logic (spec §4.5). Pure with
//! respect to events — the scheduler calls into this module then emits
//! `gateway.evaluating` / `gateway.path_taken` / `gateway.path_not_taken`
//! from the returned decision, keeping this module unit-testable without a
//! running instance.

use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::types::{Connection, Element, ElementType};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Outcome of evaluating a diverging gateway's outgoing connections.
pub struct Decision<'a> {
    pub taken: Vec<&'a Connection>,
    pub not_taken: Vec<&'a Connection>,
}

/// Outcome of a fork arriving at its matching join.
#[derive(Debug, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Every expected branch has arrived (or this is a first-arrival race
    /// join) — the caller proceeds past the gateway.
    Proceed,
    /// Other branches are still outstanding; the calling task suspends.
    Wait,
}

#[derive(Default)]
struct MergeState {
    expected: usize,
    arrived: HashSet<String>,
}

/// Per-instance gateway state: `GatewayMergeState` (arrival tracking) and
/// `CompletedGateways` (the once-only idempotency guard, invariant 1 of
/// spec §3).
#[derive(Default)]
pub struct GatewayEvaluator {
    merge: Mutex<HashMap<String, MergeState>>,
    completed: Mutex<HashSet<String>>,
}

impl GatewayEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive (XOR): first true condition in declaration order wins;
    /// else the default; else `NoPathMatched`.
    pub fn evaluate_exclusive<'a>(
        &self,
        gateway_id: &str,
        outgoing: &'a [&'a Connection],
        ctx: &Json,
        evaluator: &ExpressionEvaluator,
    ) -> Result<Decision<'a>, EngineError> {
        let mut default: Option<&Connection> = None;
        for conn in outgoing {
            if conn.is_default() {
                default = Some(conn);
                continue;
            }
            if let Some(cond) = conn.condition() {
                if evaluator.evaluate(cond, ctx).unwrap_or(false) {
                    let taken = vec![*conn];
                    let not_taken = outgoing
                        .iter()
                        .filter(|c| c.id != conn.id)
                        .copied()
                        .collect();
                    return Ok(Decision { taken, not_taken });
                }
            } else if default.is_none() {
                // An unconditional, non-default flow is effectively always true.
                let taken = vec![*conn];
                let not_taken = outgoing
                    .iter()
                    .filter(|c| c.id != conn.id)
                    .copied()
                    .collect();
                return Ok(Decision { taken, not_taken });
            }
        }
        if let Some(def) = default {
            let taken = vec![def];
            let not_taken = outgoing
                .iter()
                .filter(|c| c.id != def.id)
                .copied()
                .collect();
            return Ok(Decision { taken, not_taken });
        }
        Err(EngineError::NoPathMatched {
            element_id: gateway_id.to_string(),
        })
    }

    /// Inclusive (OR): every true condition is taken (at least one); else
    /// the default; else `NoPathMatched`.
    pub fn evaluate_inclusive<'a>(
        &self,
        gateway_id: &str,
        outgoing: &'a [&'a Connection],
        ctx: &Json,
        evaluator: &ExpressionEvaluator,
    ) -> Result<Decision<'a>, EngineError> {
        let mut default: Option<&Connection> = None;
        let mut taken: Vec<&Connection> = Vec::new();
        for conn in outgoing {
            if conn.is_default() {
                default = Some(conn);
                continue;
            }
            match conn.condition() {
                Some(cond) if evaluator.evaluate(cond, ctx).unwrap_or(false) => taken.push(conn),
                Some(_) => {}
                None => taken.push(conn),
            }
        }
        if taken.is_empty() {
            if let Some(def) = default {
                taken.push(def);
            } else {
                return Err(EngineError::NoPathMatched {
                    element_id: gateway_id.to_string(),
                });
            }
        }
        let taken_ids: HashSet<&str> = taken.iter().map(|c| c.id.as_str()).collect();
        let not_taken = outgoing
            .iter()
            .filter(|c| !taken_ids.contains(c.id.as_str()))
            .copied()
            .collect();
        Ok(Decision { taken, not_taken })
    }

    /// Parallel (AND): all outgoing flows are taken unconditionally.
    pub fn evaluate_parallel<'a>(&self, outgoing: &'a [&'a Connection]) -> Decision<'a> {
        Decision {
            taken: outgoing.to_vec(),
            not_taken: Vec::new(),
        }
    }

    /// Registers the expected arrival count for a fork's matching join
    /// (parallel, or inclusive used as a synchronizing join). Propagates a
    /// fork stamp through `gateway_id` rather than counting raw incoming
    /// connections, resolving spec §9's open question in the "preferred"
    /// direction.
    pub async fn set_expected_arrivals(&self, gateway_id: &str, expected: usize) {
        let mut guard = self.merge.lock().await;
        let entry = guard.entry(gateway_id.to_string()).or_default();
        entry.expected = expected;
    }

    /// One branch arrives at a synchronizing join. Returns `Proceed` once
    /// every expected branch (for this fork stamp) has arrived, `Wait`
    /// otherwise. A gateway only ever proceeds once per instance — after
    /// that, this method is not called again for the same `gateway_id`
    /// (the scheduler does not re-enter a completed join).
    pub async fn arrive(&self, gateway_id: &str, from_element_id: &str) -> ArrivalOutcome {
        let mut merge = self.merge.lock().await;
        let entry = merge.entry(gateway_id.to_string()).or_default();
        entry.arrived.insert(from_element_id.to_string());
        let expected = entry.expected.max(1);
        if entry.arrived.len() >= expected {
            drop(merge);
            self.mark_completed(gateway_id).await;
            ArrivalOutcome::Proceed
        } else {
            ArrivalOutcome::Wait
        }
    }

    /// First-arrival race join (inclusive-as-race, or event-based): the
    /// first caller wins and the scheduler cancels sibling incoming paths.
    /// Returns `true` exactly once per `gateway_id`.
    pub async fn race_arrive(&self, gateway_id: &str) -> bool {
        let mut completed = self.completed.lock().await;
        if completed.contains(gateway_id) {
            false
        } else {
            completed.insert(gateway_id.to_string());
            true
        }
    }

    async fn mark_completed(&self, gateway_id: &str) {
        let mut completed = self.completed.lock().await;
        completed.insert(gateway_id.to_string());
    }

    pub async fn is_completed(&self, gateway_id: &str) -> bool {
        self.completed.lock().await.contains(gateway_id)
    }
}

pub fn gateway_kind_label(kind: ElementType) -> &'static str {
    match kind {
        ElementType::ExclusiveGateway => "exclusive",
        ElementType::InclusiveGateway => "inclusive",
        ElementType::ParallelGateway => "parallel",
        ElementType::EventBasedGateway => "event_based",
        _ => "unknown",
    }
}

pub fn is_gateway_element(el: &Element) -> bool {
    el.kind.is_gateway()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Connection;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn conn(id: &str, from: &str, to: &str, condition: Option<&str>, default: bool) -> Connection {
        let mut properties = BTreeMap::new();
        if let Some(c) = condition {
            properties.insert("condition".to_string(), json!(c));
        }
        if default {
            properties.insert("isDefault".to_string(), json!(true));
        }
        Connection {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            properties,
        }
    }

    #[test]
    fn exclusive_picks_first_true_else_default() {
        let gw = GatewayEvaluator::new();
        let eval = ExpressionEvaluator::new();
        let a = conn("f1", "xor", "taskA", Some("${sum} > 10"), false);
        let b = conn("f2", "xor", "taskB", None, true);
        let outgoing = vec![&a, &b];
        let ctx = json!({"sum": 12});
        let decision = gw
            .evaluate_exclusive("xor", &outgoing, &ctx, &eval)
            .unwrap();
        assert_eq!(decision.taken.len(), 1);
        assert_eq!(decision.taken[0].id, "f1");
        assert_eq!(decision.not_taken[0].id, "f2");
    }

    #[test]
    fn exclusive_falls_back_to_default() {
        let gw = GatewayEvaluator::new();
        let eval = ExpressionEvaluator::new();
        let a = conn("f1", "xor", "taskA", Some("${sum} > 100"), false);
        let b = conn("f2", "xor", "taskB", None, true);
        let outgoing = vec![&a, &b];
        let ctx = json!({"sum": 12});
        let decision = gw
            .evaluate_exclusive("xor", &outgoing, &ctx, &eval)
            .unwrap();
        assert_eq!(decision.taken[0].id, "f2");
    }

    #[test]
    fn exclusive_no_match_no_default_fails() {
        let gw = GatewayEvaluator::new();
        let eval = ExpressionEvaluator::new();
        let a = conn("f1", "xor", "taskA", Some("${sum} > 100"), false);
        let outgoing = vec![&a];
        let ctx = json!({"sum": 12});
        let err = gw
            .evaluate_exclusive("xor", &outgoing, &ctx, &eval)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPathMatched { .. }));
    }

    #[tokio::test]
    async fn parallel_join_proceeds_once_all_arrive() {
        let gw = GatewayEvaluator::new();
        gw.set_expected_arrivals("join1", 3).await;
        assert_eq!(gw.arrive("join1", "a").await, ArrivalOutcome::Wait);
        assert_eq!(gw.arrive("join1", "b").await, ArrivalOutcome::Wait);
        assert_eq!(gw.arrive("join1", "c").await, ArrivalOutcome::Proceed);
        assert!(gw.is_completed("join1").await);
    }

    #[tokio::test]
    async fn race_join_resolves_on_first_arrival_only() {
        let gw = GatewayEvaluator::new();
        assert!(gw.race_arrive("race1").await);
        assert!(!gw.race_arrive("race1").await);
    }
}
