//! Command-line surfaces of the two binaries.

use std::time::Duration;

use url::Url;

#[derive(Debug, clap::Parser)]
#[command(name = "pushprox-proxy", version, about = "Reverse-scrape proxy broker")]
pub struct ProxyArgs {
    /// Address on which to expose the proxy and its HTTP API.
    #[arg(
        long = "web.listen-address",
        env = "PUSHPROX_LISTEN_ADDRESS",
        default_value = ":8080"
    )]
    pub listen_address: String,

    /// How long a client stays listed after its last poll.
    #[arg(
        long = "registration.timeout",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub registration_timeout: Duration,

    /// Upper bound applied to collector-supplied scrape deadlines.
    #[arg(
        long = "scrape.max-timeout",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub max_scrape_timeout: Duration,

    /// Scrape deadline used when the collector does not send one.
    #[arg(
        long = "scrape.default-timeout",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub default_scrape_timeout: Duration,

    /// The log verbosity. Accepts tracing filter directives.
    #[arg(long = "log.level", env = "PUSHPROX_LOG", default_value = "info")]
    pub log_level: String,
}

impl ProxyArgs {
    /// A bare `:port` listen address binds all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }
}

#[derive(Debug, clap::Parser)]
#[command(name = "pushprox-client", version, about = "Outbound long-polling scrape agent")]
pub struct ClientArgs {
    /// Base URL of the proxy to poll.
    #[arg(long = "proxy-url", env = "PUSHPROX_PROXY_URL")]
    pub proxy_url: Url,

    /// Name this client registers under; `:port` optional, default 80.
    #[arg(long = "fqdn", env = "PUSHPROX_FQDN")]
    pub fqdn: String,

    /// Base URL scrapes are performed against. The instruction's path and
    /// query are applied to this base.
    #[arg(long = "metrics-url", env = "PUSHPROX_METRICS_URL")]
    pub metrics_url: Url,

    /// Base retry interval after a failed poll cycle.
    #[arg(
        long = "poll.interval",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// Ceiling for the doubling retry interval.
    #[arg(
        long = "poll.max-interval",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub max_poll_interval: Duration,

    /// The log verbosity. Accepts tracing filter directives.
    #[arg(long = "log.level", env = "PUSHPROX_LOG", default_value = "info")]
    pub log_level: String,
}
