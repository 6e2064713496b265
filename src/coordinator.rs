//! The rendezvous broker at the heart of the proxy.
//!
//! A scrape is a three-party exchange over three independent HTTP
//! connections: the collector's GET, a client's long poll, and the
//! client's result push. The [Coordinator] matches the collector request
//! to a poll by target key, matches the pushed response back to the
//! waiting collector handler by scrape id, and bounds every wait with the
//! deadlines both sides carry. Any party may disconnect at any moment;
//! dropping a handler future withdraws its side of the rendezvous.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use http::HeaderValue;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use url::Url;

use crate::{
    registry::{ClientRegistry, GC_INTERVAL},
    rendezvous::{Offered, Rendezvous},
    wire::{self, ScrapeRequest, ScrapeResponse, ID_HEADER, SCRAPE_TIMEOUT_HEADER},
};

const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_SCRAPE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// The scrape deadline passed before any client polled the target key.
    #[error("Matching client not found for \"{url}\": scrape deadline exceeded")]
    NoClientMatched { url: Url },
    /// A client accepted the scrape but no response arrived in time.
    #[error("scrape of \"{url}\" timed out awaiting the client's response")]
    ScrapeTimedOut { url: Url },
    /// A pushed response found no waiting collector within its deadline.
    #[error("scrape result {id} had no waiting scrape and timed out")]
    PushTimedOut { id: String },
    /// A pushed response did not echo the correlation id.
    #[error("scrape result is missing the id header")]
    MissingId,
}

/// Normalizes a polled FQDN into a target key, defaulting the port to 80.
pub fn normalize_fqdn(raw: &str) -> String {
    let fqdn = raw.trim();
    if fqdn.contains(':') {
        fqdn.to_string()
    } else {
        format!("{fqdn}:80")
    }
}

/// The target key a collector request routes on.
pub fn target_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(80)
    )
}

/// Mints correlation ids unique for the lifetime of this process: a start
/// marker plus a counter. Ids are opaque to the protocol and are not
/// authentication tokens.
struct IdSource {
    prefix: String,
    counter: AtomicU64,
}

impl IdSource {
    fn new() -> Self {
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_millis();
        Self {
            prefix: format!("{}-{}", start_millis, std::process::id()),
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> String {
        format!("{}-{}", self.prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Coordinator {
    ids: IdSource,
    waiting: Rendezvous<ScrapeRequest>,
    responses: Rendezvous<ScrapeResponse>,
    registry: ClientRegistry,
    default_scrape_timeout: Duration,
    max_scrape_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CoordinatorBuilder {
    registration_timeout: Duration,
    default_scrape_timeout: Duration,
    max_scrape_timeout: Duration,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            default_scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
            max_scrape_timeout: DEFAULT_MAX_SCRAPE_TIMEOUT,
        }
    }
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window within which a client's last poll keeps it listed as live.
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Deadline applied when the collector does not send one.
    pub fn default_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.default_scrape_timeout = timeout;
        self
    }

    /// Upper bound on collector-supplied deadlines.
    pub fn max_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.max_scrape_timeout = timeout;
        self
    }

    pub fn build(self) -> Coordinator {
        Coordinator {
            ids: IdSource::new(),
            waiting: Rendezvous::new(),
            responses: Rendezvous::new(),
            registry: ClientRegistry::new(self.registration_timeout),
            default_scrape_timeout: self.default_scrape_timeout,
            max_scrape_timeout: self.max_scrape_timeout,
        }
    }
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Drives one end-to-end scrape on behalf of the collector: tags the
    /// request with a fresh id, hands it to a polling client, and awaits
    /// the pushed response. Dropping the returned future (the collector
    /// hung up) withdraws the request and the response slot.
    pub async fn do_scrape(
        &self,
        mut request: ScrapeRequest,
    ) -> Result<ScrapeResponse, ScrapeError> {
        let deadline = self.scrape_deadline(&request.headers);
        let id = self.ids.next();
        request
            .headers
            .insert(ID_HEADER, HeaderValue::from_str(&id).expect("can't fail"));
        let key = target_key(&request.url);
        let url = request.url.clone();
        tracing::debug!(%key, %id, %url, ?deadline, "dispatching scrape");

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(deadline, self.waiting.offer(&key, request)).await {
            Ok(Offered::Claimed) => {}
            Ok(Offered::Lost) => {
                // The poll connection died at the instant of pickup. The
                // response can never come; wait out the deadline below so
                // the collector sees an ordinary timeout.
                tracing::debug!(%key, %id, "scrape instruction lost at pickup");
            }
            Err(_) => return Err(ScrapeError::NoClientMatched { url }),
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, self.responses.take(&id)).await {
            Ok(response) => {
                tracing::debug!(%key, %id, status = %response.status(), "scrape complete");
                Ok(response)
            }
            Err(_) => Err(ScrapeError::ScrapeTimedOut { url }),
        }
    }

    /// Parks a polling client until a scrape request targets `key`.
    /// Requests whose collector has already given up are never handed out.
    pub async fn wait_for_instruction(&self, key: &str) -> ScrapeRequest {
        self.registry.touch(key);
        self.waiting.take(key).await
    }

    /// Accepts a pushed scrape response and routes it to the waiting
    /// collector handler. The push carries its own delivery deadline: the
    /// scrape time the client had left.
    pub async fn scrape_result(&self, mut response: ScrapeResponse) -> Result<(), ScrapeError> {
        let id = response
            .headers()
            .get(&ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(ScrapeError::MissingId)?;
        let push_timeout =
            wire::scrape_timeout(response.headers()).unwrap_or(self.default_scrape_timeout);
        response.headers_mut().remove(&ID_HEADER);
        response.headers_mut().remove(&SCRAPE_TIMEOUT_HEADER);

        match tokio::time::timeout(push_timeout, self.responses.offer(&id, response)).await {
            Ok(Offered::Claimed | Offered::Lost) => Ok(()),
            Err(_) => Err(ScrapeError::PushTimedOut { id }),
        }
    }

    /// Snapshot of live clients for service discovery.
    pub fn live_clients(&self) -> Vec<String> {
        self.registry.live_clients()
    }

    /// Background reclamation of expired registry entries.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let evicted = coordinator.registry.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "dropped expired clients");
                }
            }
        })
    }

    fn scrape_deadline(&self, headers: &http::HeaderMap) -> Duration {
        wire::scrape_timeout(headers)
            .unwrap_or(self.default_scrape_timeout)
            .min(self.max_scrape_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use tokio::time::timeout;

    use super::*;

    fn scrape_request(url: &str, timeout_secs: &str) -> ScrapeRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            SCRAPE_TIMEOUT_HEADER,
            HeaderValue::from_str(timeout_secs).unwrap(),
        );
        ScrapeRequest {
            method: Method::GET,
            url: Url::parse(url).unwrap(),
            headers,
        }
    }

    fn pushed_response(id: &HeaderValue, body: &[u8], timeout_secs: &str) -> ScrapeResponse {
        let mut response = http::Response::new(body.to_vec());
        response.headers_mut().insert(ID_HEADER, id.clone());
        response.headers_mut().insert(
            SCRAPE_TIMEOUT_HEADER,
            HeaderValue::from_str(timeout_secs).unwrap(),
        );
        response
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_delivers_a_scrubbed_response() {
        let coordinator = Arc::new(Coordinator::builder().build());
        let scrape = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics", "10"))
                    .await
            }
        });

        let instruction = coordinator.wait_for_instruction("host1:80").await;
        assert_eq!(instruction.method, Method::GET);
        assert_eq!(instruction.url.as_str(), "http://host1/metrics");
        let id = instruction.headers.get(&ID_HEADER).unwrap().clone();
        assert_eq!(coordinator.live_clients(), vec!["host1:80".to_string()]);

        coordinator
            .scrape_result(pushed_response(&id, b"m 1\n", "9.5"))
            .await
            .unwrap();

        let response = scrape.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"m 1\n");
        assert!(response.headers().get(&ID_HEADER).is_none());
        assert!(response.headers().get(&SCRAPE_TIMEOUT_HEADER).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn absent_client_fails_with_the_target_url() {
        let coordinator = Coordinator::builder().build();
        let err = coordinator
            .do_scrape(scrape_request("http://absent/", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::NoClientMatched { .. }));
        assert!(err
            .to_string()
            .contains("Matching client not found for \"http://absent/\""));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_scrape_is_never_handed_to_a_late_poller() {
        let coordinator = Coordinator::builder().build();
        let err = coordinator
            .do_scrape(scrape_request("http://host1/metrics", "0.2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::NoClientMatched { .. }));

        // The poll parks instead of receiving the abandoned request.
        assert!(
            timeout(
                Duration::from_millis(100),
                coordinator.wait_for_instruction("host1:80")
            )
            .await
            .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_push_and_collector_timeout_pair_up() {
        let coordinator = Arc::new(Coordinator::builder().build());
        let scrape = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics", "1"))
                    .await
            }
        });

        let instruction = coordinator.wait_for_instruction("host1:80").await;
        let id = instruction.headers.get(&ID_HEADER).unwrap().clone();

        // The client is slower than the scrape deadline.
        let err = scrape.await.unwrap().unwrap_err();
        assert!(matches!(err, ScrapeError::ScrapeTimedOut { .. }));

        let err = coordinator
            .scrape_result(pushed_response(&id, b"late\n", "0.2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::PushTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn a_response_is_delivered_at_most_once() {
        let coordinator = Arc::new(Coordinator::builder().build());
        let scrape = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics", "5"))
                    .await
            }
        });

        let instruction = coordinator.wait_for_instruction("host1:80").await;
        let id = instruction.headers.get(&ID_HEADER).unwrap().clone();

        coordinator
            .scrape_result(pushed_response(&id, b"first\n", "5"))
            .await
            .unwrap();
        assert_eq!(scrape.await.unwrap().unwrap().body(), b"first\n");

        // A duplicate push finds no waiting scrape.
        let err = coordinator
            .scrape_result(pushed_response(&id, b"second\n", "0.2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::PushTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn push_after_collector_gave_up_does_not_wedge_the_key() {
        let coordinator = Arc::new(Coordinator::builder().build());
        let scrape = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics", "0.5"))
                    .await
            }
        });
        let instruction = coordinator.wait_for_instruction("host1:80").await;
        let id = instruction.headers.get(&ID_HEADER).unwrap().clone();
        assert!(scrape.await.unwrap().is_err());

        let err = coordinator
            .scrape_result(pushed_response(&id, b"orphan\n", "0.3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::PushTimedOut { .. }));

        // The next scrape of the same target proceeds normally.
        let scrape = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics", "5"))
                    .await
            }
        });
        let instruction = coordinator.wait_for_instruction("host1:80").await;
        let id = instruction.headers.get(&ID_HEADER).unwrap().clone();
        coordinator
            .scrape_result(pushed_response(&id, b"fresh\n", "5"))
            .await
            .unwrap();
        assert_eq!(scrape.await.unwrap().unwrap().body(), b"fresh\n");
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_response_must_carry_an_id() {
        let coordinator = Coordinator::builder().build();
        let err = coordinator
            .scrape_result(http::Response::new(b"m 1\n".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::MissingId));
    }

    #[test]
    fn fqdn_normalization_defaults_the_port() {
        assert_eq!(normalize_fqdn(" host1 \n"), "host1:80");
        assert_eq!(normalize_fqdn("host1:9100"), "host1:9100");
    }

    #[test]
    fn target_keys_use_the_known_default_port() {
        assert_eq!(target_key(&Url::parse("http://host1/metrics").unwrap()), "host1:80");
        assert_eq!(
            target_key(&Url::parse("https://host1/metrics").unwrap()),
            "host1:443"
        );
        assert_eq!(
            target_key(&Url::parse("http://host1:9100/metrics").unwrap()),
            "host1:9100"
        );
    }

    #[test]
    fn ids_are_unique_within_a_process() {
        let ids = IdSource::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(a.starts_with(&ids.prefix));
    }
}
