//! Peer Connector
//!
//! Dials one channel per node with exponential backoff. A node that stays
//! unreachable for the whole retry budget is evicted from membership rather
//! than left unconnected.
//!
//! The retry loop is an explicit state machine ([`ConnectState`]) and all
//! pacing goes through the [`Delay`] trait, so tests run it without real time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::remote::RemotePeerStatus;

use super::channel::Dialer;
use super::directory::{ClusterDirectory, ClusterNode};

/// Retry pacing for dialing a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failed dial
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retries after the first dial; total dials = `max_retries + 1`
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
            max_retries: 100,
        }
    }
}

impl Backoff {
    /// Delay before the next dial, given the delay slept before the last one
    pub fn next_delay(&self, previous: Duration) -> Duration {
        if previous.is_zero() {
            self.initial_delay.min(self.max_delay)
        } else {
            previous.saturating_mul(2).min(self.max_delay)
        }
    }

    /// Every delay slept for a node that never accepts, in order
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_retries as usize);
        let mut delay = Duration::ZERO;
        for _ in 0..self.max_retries {
            delay = self.next_delay(delay);
            delays.push(delay);
        }
        delays
    }
}

/// Connection attempt state for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// About to dial. `attempt` counts retries so far; `delay` is the pause
    /// to take before this dial (zero for the first).
    Connecting { attempt: u32, delay: Duration },
    /// Channel registered in the directory
    Established,
    /// Retry budget exhausted; node removed from membership
    Evicted,
}

impl ConnectState {
    pub fn start() -> Self {
        ConnectState::Connecting {
            attempt: 0,
            delay: Duration::ZERO,
        }
    }

    /// Transition after a successful dial
    pub fn on_success(self) -> Self {
        match self {
            ConnectState::Connecting { .. } => ConnectState::Established,
            other => other,
        }
    }

    /// Transition after a failed dial
    pub fn on_failure(self, backoff: &Backoff) -> Self {
        match self {
            ConnectState::Connecting { attempt, .. } if attempt >= backoff.max_retries => {
                ConnectState::Evicted
            }
            ConnectState::Connecting { attempt, delay } => ConnectState::Connecting {
                attempt: attempt + 1,
                delay: backoff.next_delay(delay),
            },
            other => other,
        }
    }
}

/// How a connection sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Channel installed in the directory
    Established,
    /// Retry budget exhausted, node evicted
    Evicted,
    /// Node left membership while the sequence was running
    Abandoned,
}

/// Pause between dial attempts
#[async_trait]
pub trait Delay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Delay`] backed by the tokio timer
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Establishes and installs peer channels
pub struct PeerConnector {
    directory: Arc<ClusterDirectory>,
    dialer: Arc<dyn Dialer>,
    delay: Arc<dyn Delay>,
    backoff: Backoff,
}

impl PeerConnector {
    pub fn new(
        directory: Arc<ClusterDirectory>,
        dialer: Arc<dyn Dialer>,
        delay: Arc<dyn Delay>,
        backoff: Backoff,
    ) -> Self {
        Self {
            directory,
            dialer,
            delay,
            backoff,
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run the connection sequence for one membership of `node` in its own task
    pub fn spawn(
        self: &Arc<Self>,
        node: ClusterNode,
        generation: u64,
    ) -> JoinHandle<ConnectOutcome> {
        let connector = self.clone();
        tokio::spawn(async move { connector.connect(&node, generation).await })
    }

    /// Dial `node` until a channel is established or the retry budget runs out.
    ///
    /// The sequence only ever acts on the membership it was started for. If
    /// the node is removed, or removed and added again, it stops with
    /// [`ConnectOutcome::Abandoned`] and leaves the newer entry alone.
    pub async fn connect(&self, node: &ClusterNode, generation: u64) -> ConnectOutcome {
        let node_id = node.node_id.as_str();
        let mut state = ConnectState::start();

        loop {
            match state {
                ConnectState::Connecting { attempt, delay } => {
                    if attempt > 0 {
                        self.directory
                            .set_status(node_id, generation, RemotePeerStatus::Backoff);
                        debug!(
                            "ClusterPeer '{}': retry {} in {:?}",
                            node_id, attempt, delay
                        );
                        self.delay.sleep(delay).await;
                    }

                    if !self.directory.is_current(node_id, generation) {
                        info!(
                            "ClusterPeer '{}': left membership, stopping connect",
                            node_id
                        );
                        return ConnectOutcome::Abandoned;
                    }

                    self.directory
                        .set_status(node_id, generation, RemotePeerStatus::Connecting);
                    debug!("ClusterPeer '{}': Connecting to {}", node_id, node.address);

                    state = match self.dialer.dial(node).await {
                        Ok(channel) => {
                            if !self.directory.register(node_id, generation, channel) {
                                info!(
                                    "ClusterPeer '{}': left membership while connecting",
                                    node_id
                                );
                                return ConnectOutcome::Abandoned;
                            }
                            state.on_success()
                        }
                        Err(e) => {
                            error!(
                                "ClusterPeer '{}': connect to {} failed (attempt {}/{}): {}",
                                node_id,
                                node.address,
                                attempt + 1,
                                self.backoff.max_retries + 1,
                                e
                            );
                            state.on_failure(&self.backoff)
                        }
                    };
                }
                ConnectState::Established => {
                    info!("ClusterPeer '{}': channel established", node_id);
                    return ConnectOutcome::Established;
                }
                ConnectState::Evicted => {
                    if self.directory.evict_generation(node_id, generation).is_none() {
                        info!(
                            "ClusterPeer '{}': membership changed, not evicting",
                            node_id
                        );
                        return ConnectOutcome::Abandoned;
                    }
                    warn!(
                        "ClusterPeer '{}': gave up after {} attempts, evicted node",
                        node_id,
                        self.backoff.max_retries + 1
                    );
                    return ConnectOutcome::Evicted;
                }
            }
        }
    }
}
