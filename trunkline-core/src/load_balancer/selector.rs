//! Load Balancing Selector logic
//!
//! Turns a candidate snapshot into the full visiting order for one request.
//! Candidates are split into tiers of equal rank, visited from the highest
//! rank down; the strategy only decides the order inside a tier.

use rand::Rng;
use std::cmp::Ordering;

use crate::domain::server_group::LbType;
use crate::load_balancer::Candidate;

/// Compute the visiting order of `candidates` for the given strategy.
pub fn order_candidates<T, R>(
    mut candidates: Vec<T>,
    lb_type: LbType,
    call_id: &str,
    rng: &mut R,
) -> Vec<T>
where
    T: Candidate,
    R: Rng + ?Sized,
{
    candidates.sort_by(deterministic_cmp);

    let mut ordered = Vec::with_capacity(candidates.len());
    let mut tier: Vec<T> = Vec::new();
    for candidate in candidates {
        if let Some(first) = tier.first() {
            if first.rank().total_cmp(&candidate.rank()) != Ordering::Equal {
                ordered.extend(order_tier(std::mem::take(&mut tier), lb_type, call_id, rng));
            }
        }
        tier.push(candidate);
    }
    ordered.extend(order_tier(tier, lb_type, call_id, rng));
    ordered
}

/// Rank descending, weight descending, key ascending.
fn deterministic_cmp<T: Candidate>(a: &T, b: &T) -> Ordering {
    b.rank()
        .total_cmp(&a.rank())
        .then_with(|| b.weight().cmp(&a.weight()))
        .then_with(|| a.key().cmp(&b.key()))
}

fn order_tier<T, R>(mut tier: Vec<T>, lb_type: LbType, call_id: &str, rng: &mut R) -> Vec<T>
where
    T: Candidate,
    R: Rng + ?Sized,
{
    if tier.len() < 2 {
        return tier;
    }
    match lb_type {
        // Already in deterministic order.
        LbType::HighestQ => tier,
        LbType::Weight => weighted_shuffle(tier, rng),
        LbType::CallId => {
            tier.sort_by(|a, b| {
                affinity_score(call_id, &b.key())
                    .cmp(&affinity_score(call_id, &a.key()))
                    .then_with(|| a.key().cmp(&b.key()))
            });
            tier
        }
    }
}

/// Weighted random order without replacement. Zero-weight candidates are
/// only drawn once every weighted candidate has been drawn.
fn weighted_shuffle<T, R>(mut pool: Vec<T>, rng: &mut R) -> Vec<T>
where
    T: Candidate,
    R: Rng + ?Sized,
{
    let mut ordered = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let total: u64 = pool.iter().map(|c| c.weight() as u64).sum();
        let index = if total == 0 {
            0
        } else {
            let mut pick = rng.gen_range(0..total);
            pool.iter()
                .position(|c| {
                    let weight = c.weight() as u64;
                    if pick < weight {
                        true
                    } else {
                        pick -= weight;
                        false
                    }
                })
                .unwrap_or(0)
        };
        ordered.push(pool.remove(index));
    }
    ordered
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Rendezvous score of a candidate for a call; the same Call-ID always
/// prefers the same candidate.
///
/// 64-bit FNV-1a over the Call-ID, a `0xff` separator and the candidate key.
/// The result is fixed across processes and toolchain releases.
pub fn affinity_score(call_id: &str, key: &str) -> u64 {
    call_id
        .bytes()
        .chain(std::iter::once(0xff))
        .chain(key.bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}
