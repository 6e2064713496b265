//! Tracks which clients are currently polling the proxy.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// How often the background sweep reclaims expired entries.
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Last-seen times per target key. A key is live while its most recent
/// poll is within the registration timeout; the sweep only reclaims
/// memory and never defines liveness.
pub struct ClientRegistry {
    registration_timeout: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl ClientRegistry {
    pub fn new(registration_timeout: Duration) -> Self {
        Self {
            registration_timeout,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records a poll from `key`. Called before the poll parks.
    pub fn touch(&self, key: &str) {
        let mut seen = self.seen.lock().unwrap();
        seen.insert(key.to_string(), Instant::now());
    }

    /// Snapshot of the currently live keys. Entries the sweep has not
    /// reached yet are still filtered out here.
    pub fn live_clients(&self) -> Vec<String> {
        let now = Instant::now();
        let seen = self.seen.lock().unwrap();
        seen.iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) <= self.registration_timeout)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops entries older than the registration timeout, returning how
    /// many were reclaimed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        seen.retain(|_, last_seen| now.duration_since(*last_seen) <= self.registration_timeout);
        before - seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn liveness_follows_the_registration_window() {
        let registry = ClientRegistry::new(Duration::from_secs(300));
        registry.touch("host1:80");
        assert_eq!(registry.live_clients(), vec!["host1:80".to_string()]);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(registry.live_clients(), vec!["host1:80".to_string()]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(registry.live_clients().is_empty());

        registry.touch("host1:80");
        assert_eq!(registry.live_clients(), vec!["host1:80".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_only_expired_entries() {
        let registry = ClientRegistry::new(Duration::from_secs(300));
        registry.touch("old:80");
        tokio::time::advance(Duration::from_secs(200)).await;
        registry.touch("young:80");
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.live_clients(), vec!["young:80".to_string()]);
        assert_eq!(registry.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn churn_of_many_clients_settles_to_the_final_set() {
        let registry = ClientRegistry::new(Duration::from_secs(300));
        for round in 0..2 {
            for i in 0..100 {
                registry.touch(&format!("host{i}:80"));
            }
            if round == 0 {
                tokio::time::advance(Duration::from_secs(10)).await;
            }
        }
        assert_eq!(registry.live_clients().len(), 100);

        tokio::time::advance(Duration::from_secs(301) + GC_INTERVAL).await;
        assert_eq!(registry.sweep(), 100);
        assert!(registry.live_clients().is_empty());
    }
}
