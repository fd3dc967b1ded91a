#![allow(dead_code)]

use rmacoll::{CommContext, LoopbackFabric, RmaCollComponent, RmaCollConfig};
use std::sync::Arc;

/// One communicator per loopback rank, all sharing one component.
pub fn comms(fabric: &LoopbackFabric, config: RmaCollConfig) -> Vec<Arc<CommContext>> {
    let component = RmaCollComponent::new(config);
    fabric
        .transports()
        .into_iter()
        .map(|t| CommContext::new(t, Arc::clone(&component)))
        .collect()
}

/// Run `f` on every rank concurrently, one thread per rank, and collect the
/// results in rank order.
pub fn run_ranks<T, F>(comms: &[Arc<CommContext>], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Arc<CommContext>) -> T + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Exclusive prefix sums: element displacements of consecutive blocks.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}
