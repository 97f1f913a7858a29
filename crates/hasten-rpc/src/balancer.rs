//! Endpoint selection over a discovered address list.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use hasten_core::error::{Result, RpcError};

/// Picks the next address to dial. Shared across tasks.
pub trait Balancer: Send + Sync {
    fn next(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
}

pub fn new_balancer(strategy: BalanceStrategy, addrs: Vec<String>) -> Result<Box<dyn Balancer>> {
    match strategy {
        BalanceStrategy::RoundRobin => Ok(Box::new(RoundRobin::new(addrs)?)),
    }
}

/// Hands out addresses in list order, wrapping around.
#[derive(Debug)]
pub struct RoundRobin {
    addrs: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(addrs: Vec<String>) -> Result<Self> {
        if addrs.is_empty() {
            return Err(RpcError::NoAddresses);
        }
        Ok(Self {
            addrs,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl Balancer for RoundRobin {
    fn next(&self) -> String {
        let len = self.addrs.len();
        let i = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % len))
            .unwrap_or_else(|i| i);
        self.addrs[i].clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    fn abc() -> Vec<String> {
        ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_wraps() {
        let lb = new_balancer(BalanceStrategy::RoundRobin, abc()).unwrap();
        let got: Vec<String> = (0..4).map(|_| lb.next()).collect();
        assert_eq!(got, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(matches!(RoundRobin::new(vec![]), Err(RpcError::NoAddresses)));
    }

    #[test]
    fn concurrent_callers_share_the_rotation_evenly() {
        let lb = Arc::new(RoundRobin::new(abc()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = Arc::clone(&lb);
                std::thread::spawn(move || (0..300).map(|_| lb.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for a in h.join().unwrap() {
                *counts.entry(a).or_default() += 1;
            }
        }
        // 2400 picks over 3 addresses: no position skipped or repeated.
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 800));
    }

    #[test]
    fn strategy_parses_from_config() {
        let s: BalanceStrategy = serde_yaml::from_str("round_robin").unwrap();
        assert_eq!(s, BalanceStrategy::RoundRobin);
    }
}
