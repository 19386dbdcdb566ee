//! Rotating credential pool with cooldown.
//!
//! The lock guards membership edits only and is never held across an
//! await point.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use super::credential::ApiCredential;

#[derive(Debug)]
struct PoolState {
    available: VecDeque<ApiCredential>,
    cooling: Vec<(ApiCredential, Instant)>,
}

impl PoolState {
    /// Move every credential whose cooldown has passed back to the pool
    fn reactivate(&mut self, now: Instant) {
        let mut still_cooling = Vec::with_capacity(self.cooling.len());
        for (credential, until) in self.cooling.drain(..) {
            if now >= until {
                info!(credential = %credential, "Credential cooldown over, back in pool");
                self.available.push_back(credential);
            } else {
                still_cooling.push((credential, until));
            }
        }
        self.cooling = still_cooling;
    }
}

/// Point-in-time view for status pages
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub available: Vec<String>,
    pub cooling_down: Vec<CoolingCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoolingCredential {
    pub name: String,
    pub remaining_secs: u64,
}

#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
    cooldown: Duration,
}

impl CredentialPool {
    pub fn new(credentials: Vec<ApiCredential>, cooldown: Duration) -> Self {
        let mut available = VecDeque::with_capacity(credentials.len());
        for credential in credentials {
            if !available.contains(&credential) {
                available.push_back(credential);
            }
        }
        Self {
            state: Mutex::new(PoolState {
                available,
                cooling: Vec::new(),
            }),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // every edit leaves the state valid, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reactivate expired cooldowns, then copy the available credentials
    /// in rotation order
    pub fn snapshot(&self) -> Vec<ApiCredential> {
        let mut state = self.lock();
        state.reactivate(Instant::now());
        state.available.iter().cloned().collect()
    }

    /// Number of credentials currently cooling down
    pub fn cooling_count(&self) -> usize {
        self.lock().cooling.len()
    }

    pub fn is_cooling(&self, credential: &ApiCredential) -> bool {
        self.lock().cooling.iter().any(|(c, _)| c == credential)
    }

    /// Take a credential out of rotation for the cooldown period
    pub fn cool_down(&self, credential: &ApiCredential) {
        let mut state = self.lock();
        let before = state.available.len();
        state.available.retain(|c| c != credential);
        if state.available.len() < before {
            let until = Instant::now() + self.cooldown;
            state.cooling.push((credential.clone(), until));
            info!(
                credential = %credential,
                cooldown_secs = self.cooldown.as_secs(),
                "Credential cooling down"
            );
        }
    }

    /// Send a credential that just succeeded to the back of the rotation
    pub fn rotate_to_back(&self, credential: &ApiCredential) {
        let mut state = self.lock();
        if let Some(pos) = state.available.iter().position(|c| c == credential) {
            if let Some(c) = state.available.remove(pos) {
                state.available.push_back(c);
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let mut state = self.lock();
        let now = Instant::now();
        state.reactivate(now);
        PoolStatus {
            available: state
                .available
                .iter()
                .map(|c| c.display_name().to_string())
                .collect(),
            cooling_down: state
                .cooling
                .iter()
                .map(|(c, until)| CoolingCredential {
                    name: c.display_name().to_string(),
                    remaining_secs: until.saturating_duration_since(now).as_secs(),
                })
                .collect(),
        }
    }
}
