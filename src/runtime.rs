//! Process-wide shared state: the FD admission gate and the salt replay
//! filter. Both are constructed once here and injected into every context,
//! so tests can run isolated instances side by side.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::common::FdGate;
use crate::crypto::replay::{
    spawn_clean_task, BloomReplayFilter, NoopReplayFilter, ReplayFilter, CLEAN_PERIOD,
};

pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

pub struct Runtime {
    pub fd_gate: FdGate,
    pub replay: Arc<dyn ReplayFilter>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Stops background maintenance (the replay filter's clean timer).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builds the shared runtime. `replay_defense` selects the Bloom filter
/// (with its periodic clean task) over the no-op filter.
pub fn init_runtime(max_connections: usize, replay_defense: bool) -> Arc<Runtime> {
    let replay: Arc<dyn ReplayFilter> = if replay_defense {
        Arc::new(BloomReplayFilter::new())
    } else {
        Arc::new(NoopReplayFilter)
    };
    init_runtime_with(max_connections, replay, CLEAN_PERIOD)
}

/// As [`init_runtime`], with an explicit filter and clean period. Tests
/// use this to share one small filter between a client and a server.
pub fn init_runtime_with(
    max_connections: usize,
    replay: Arc<dyn ReplayFilter>,
    clean_period: Duration,
) -> Arc<Runtime> {
    let cancel = CancellationToken::new();
    spawn_clean_task(replay.clone(), clean_period, cancel.clone());
    Arc::new(Runtime {
        fd_gate: FdGate::new(max_connections),
        replay,
        cancel,
    })
}
