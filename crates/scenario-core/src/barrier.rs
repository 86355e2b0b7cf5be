//! Reusable rendezvous point for concurrently running scenario actors
//!
//! A [`Barrier`] releases its parties in generations: once `parties` actors
//! have called [`Barrier::wait`], all of them are released together and the
//! next arrival starts a new generation. Every wait is bounded; an actor whose
//! wait times out withdraws its arrival so that a late quorum cannot release a
//! generation it no longer belongs to.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::{ScenarioError, ScenarioResult};

/// Outcome of a successful [`Barrier::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// Generation that was released
    pub generation: u64,
    /// Whether this caller was the last to arrive
    pub is_leader: bool,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Named N-party barrier with bounded waits
#[derive(Debug)]
pub struct Barrier {
    name: String,
    parties: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    // Carries the number of released generations
    released: watch::Sender<u64>,
}

impl Barrier {
    pub fn new(name: impl Into<String>, parties: usize, timeout: Duration) -> ScenarioResult<Self> {
        let name = name.into();
        if parties == 0 {
            return Err(ScenarioError::config(format!(
                "barrier '{}' needs at least one party",
                name
            )));
        }
        let (released, _) = watch::channel(0);
        Ok(Self {
            name,
            parties,
            timeout,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Generation currently gathering arrivals
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Wait for the other parties using the barrier's own timeout
    pub async fn wait(&self) -> ScenarioResult<BarrierWaitResult> {
        self.wait_timeout(self.timeout).await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> ScenarioResult<BarrierWaitResult> {
        let (generation, mut released) = {
            let mut state = self.state.lock();
            let generation = state.generation;
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                self.released.send_replace(state.generation);
                debug!(barrier = %self.name, generation, "barrier released");
                return Ok(BarrierWaitResult {
                    generation,
                    is_leader: true,
                });
            }
            debug!(
                barrier = %self.name,
                generation,
                arrived = state.arrived,
                parties = self.parties,
                "waiting at barrier"
            );
            // Subscribed under the lock, so the release of this generation
            // cannot be missed
            (generation, self.released.subscribe())
        };

        let released_wait = async {
            while *released.borrow_and_update() <= generation {
                if released.changed().await.is_err() {
                    break;
                }
            }
        };

        if tokio::time::timeout(timeout, released_wait).await.is_ok() {
            return Ok(BarrierWaitResult {
                generation,
                is_leader: false,
            });
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            // Released between the timeout firing and taking the lock
            return Ok(BarrierWaitResult {
                generation,
                is_leader: false,
            });
        }
        let arrived = state.arrived;
        state.arrived -= 1;
        warn!(
            barrier = %self.name,
            generation,
            arrived,
            parties = self.parties,
            "barrier wait timed out"
        );
        Err(ScenarioError::BarrierTimeout {
            name: self.name.clone(),
            generation,
            arrived,
            parties: self.parties,
            waited: timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_party_releases_immediately() {
        let barrier = Barrier::new("solo", 1, Duration::from_secs(1)).unwrap();
        let first = barrier.wait().await.unwrap();
        let second = barrier.wait().await.unwrap();
        assert!(first.is_leader && second.is_leader);
        assert_eq!((first.generation, second.generation), (0, 1));
    }

    #[test]
    fn test_zero_parties_rejected() {
        assert!(Barrier::new("none", 0, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_releases_all_parties_once_per_generation() {
        let barrier = Arc::new(Barrier::new("ringing", 3, Duration::from_secs(5)).unwrap());
        for generation in 0..2 {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let barrier = barrier.clone();
                    tokio::spawn(async move { barrier.wait().await })
                })
                .collect();
            let mut leaders = 0;
            for handle in handles {
                let result = handle.await.unwrap().unwrap();
                assert_eq!(result.generation, generation);
                leaders += usize::from(result.is_leader);
            }
            assert_eq!(leaders, 1);
        }
        assert_eq!(barrier.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_arrival_is_withdrawn() {
        let barrier = Arc::new(Barrier::new("ack", 2, Duration::from_secs(1)).unwrap());
        let err = barrier.wait().await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::BarrierTimeout { generation: 0, arrived: 1, parties: 2, .. }
        ));

        // A lone arrival after the withdrawal must still wait for a partner
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait_timeout(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());
        let leader = barrier.wait().await.unwrap();
        assert!(leader.is_leader);
        assert_eq!(waiter.await.unwrap().unwrap().generation, 0);
    }
}
