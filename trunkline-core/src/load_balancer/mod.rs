//! Per-request load balancers.
//!
//! A [`LoadBalancer`] snapshots its candidates when it is built and hands each
//! one out at most once. Balancers are owned by a single request and never
//! shared between requests.

pub mod selector;

use rand::Rng;
use std::collections::{HashSet, VecDeque};

use crate::domain::element::ServerGroupElement;
use crate::domain::server_group::{LbType, ServerGroup};
use crate::domain::status::HealthState;
use crate::domain::trunk::EgressGroupRef;

/// Anything a balancer can rank and pick.
pub trait Candidate: Clone {
    /// Ranking value; higher is visited first.
    fn rank(&self) -> f32;
    /// Share among candidates of equal rank.
    fn weight(&self) -> u32;
    /// Unique identity used for de-duplication and tie-breaks.
    fn key(&self) -> String;
}

impl Candidate for ServerGroupElement {
    fn rank(&self) -> f32 {
        self.q_value
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn key(&self) -> String {
        ServerGroupElement::key(self)
    }
}

impl Candidate for EgressGroupRef {
    fn rank(&self) -> f32 {
        self.priority
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Stateful selector over a snapshot of candidates.
#[derive(Debug, Clone)]
pub struct LoadBalancer<T> {
    pending: VecDeque<T>,
    current: Option<T>,
    tried: HashSet<String>,
}

impl<T: Candidate> LoadBalancer<T> {
    /// Build a balancer using the thread-local RNG for weighted ordering.
    pub fn of(candidates: impl IntoIterator<Item = T>, lb_type: LbType, call_id: &str) -> Self {
        Self::with_rng(candidates, lb_type, call_id, &mut rand::thread_rng())
    }

    /// Build a balancer with an explicit RNG.
    pub fn with_rng<R: Rng + ?Sized>(
        candidates: impl IntoIterator<Item = T>,
        lb_type: LbType,
        call_id: &str,
        rng: &mut R,
    ) -> Self {
        let mut keys = HashSet::new();
        let unique: Vec<T> = candidates
            .into_iter()
            .filter(|c| keys.insert(c.key()))
            .collect();

        Self {
            pending: selector::order_candidates(unique, lb_type, call_id, rng).into(),
            current: None,
            tried: HashSet::new(),
        }
    }

    /// The candidate most recently handed out, if any.
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Advance to the next untried candidate.
    pub fn next_candidate(&mut self) -> Option<T> {
        while let Some(candidate) = self.pending.pop_front() {
            if self.tried.insert(candidate.key()) {
                self.current = Some(candidate.clone());
                return Some(candidate);
            }
        }
        None
    }

    /// Candidates not yet handed out.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Number of candidates handed out so far.
    pub fn tried(&self) -> usize {
        self.tried.len()
    }
}

impl LoadBalancer<ServerGroupElement> {
    /// Balancer over a group's elements, skipping elements marked down.
    pub fn for_group(group: &ServerGroup, call_id: &str, health: &HealthState) -> Self {
        Self::of(
            group
                .elements
                .iter()
                .filter(|e| health.elements.is_up(&e.key()))
                .cloned(),
            group.lb_type,
            call_id,
        )
    }
}

impl LoadBalancer<EgressGroupRef> {
    /// Balancer over a trunk's server groups, skipping groups marked down.
    pub fn for_egress(
        groups: &[EgressGroupRef],
        lb_type: LbType,
        call_id: &str,
        health: &HealthState,
    ) -> Self {
        Self::of(
            groups
                .iter()
                .filter(|g| health.groups.is_up(&g.name))
                .cloned(),
            lb_type,
            call_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::endpoint::Transport;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn element(host: &str, q: f32, weight: u32) -> ServerGroupElement {
        ServerGroupElement::new(host, 5060, Transport::Udp, q, weight, "SG1")
    }

    #[test]
    fn current_is_none_before_first_pick() {
        let mut lb = LoadBalancer::of(vec![element("1.1.1.1", 0.9, 1)], LbType::HighestQ, "c");
        assert!(lb.current().is_none());
        let picked = lb.next_candidate().unwrap();
        assert_eq!(lb.current().unwrap().host, picked.host);
        assert!(lb.next_candidate().is_none());
        assert_eq!(lb.current().unwrap().host, "1.1.1.1");
    }

    #[test]
    fn first_pick_is_highest_rank() {
        let mut lb = LoadBalancer::of(
            vec![
                element("2.2.2.2", 0.5, 1),
                element("4.4.4.4", 0.1, 1),
                element("1.1.1.1", 0.9, 1),
                element("3.3.3.3", 0.5, 1),
            ],
            LbType::Weight,
            "c",
        );
        assert_eq!(lb.next_candidate().unwrap().host, "1.1.1.1");
    }

    #[test]
    fn duplicates_are_collapsed() {
        let mut lb = LoadBalancer::of(
            vec![element("1.1.1.1", 0.9, 1), element("1.1.1.1", 0.9, 1)],
            LbType::HighestQ,
            "c",
        );
        assert!(lb.next_candidate().is_some());
        assert!(lb.next_candidate().is_none());
    }

    #[test]
    fn skips_elements_marked_down() {
        let group = ServerGroup::builder("SG1")
            .element(element("1.1.1.1", 0.9, 1))
            .element(element("2.2.2.2", 0.5, 1))
            .build();
        let health = HealthState::new();
        health.elements.set("1.1.1.1|5060|udp", false);

        let mut lb = LoadBalancer::for_group(&group, "c", &health);
        assert_eq!(lb.next_candidate().unwrap().host, "2.2.2.2");
        assert!(lb.next_candidate().is_none());
    }

    #[test]
    fn egress_groups_follow_priority() {
        let refs = vec![
            EgressGroupRef::new("backup").ranked(0.2, 100),
            EgressGroupRef::new("primary").ranked(0.8, 100),
        ];
        let health = HealthState::new();
        let mut lb = LoadBalancer::for_egress(&refs, LbType::HighestQ, "c", &health);
        assert_eq!(lb.next_candidate().unwrap().name, "primary");
        assert_eq!(lb.next_candidate().unwrap().name, "backup");
    }

    proptest! {
        #[test]
        fn visits_every_element_exactly_once(
            specs in prop::collection::vec((0u8..4, 0u32..5), 1..24),
            lb in prop_oneof![Just(LbType::HighestQ), Just(LbType::Weight), Just(LbType::CallId)],
            seed in any::<u64>(),
        ) {
            let elements: Vec<_> = specs
                .iter()
                .enumerate()
                .map(|(i, (q, w))| element(&format!("10.0.0.{i}"), *q as f32 / 4.0, *w))
                .collect();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut balancer = LoadBalancer::with_rng(elements.clone(), lb, "call", &mut rng);

            let mut seen = HashSet::new();
            let mut last_rank = f32::INFINITY;
            while let Some(e) = balancer.next_candidate() {
                prop_assert!(seen.insert(e.key()));
                prop_assert!(e.q_value <= last_rank);
                last_rank = e.q_value;
            }
            prop_assert_eq!(seen.len(), elements.len());
            prop_assert_eq!(balancer.tried(), elements.len());
        }
    }
}
