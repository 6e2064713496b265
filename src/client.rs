//! The outbound long-polling scrape agent.
//!
//! The client holds an open `/poll` request against the proxy, performs
//! each delivered scrape against its locally reachable metrics endpoint,
//! and pushes the materialized response back. The whole cycle stays
//! outbound-only, which is the point: the proxy never needs a route to
//! the client.

use std::time::Duration;

use http::{header, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use url::Url;

use crate::{
    config::ClientArgs,
    coordinator::normalize_fqdn,
    wire::{self, ScrapeRequest, ScrapeResponse, ID_HEADER, SCRAPE_TIMEOUT_HEADER},
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error")]
    Http(#[from] reqwest::Error),
    #[error("bad scrape instruction")]
    Wire(#[from] wire::WireError),
    #[error("scrape instruction is missing the id header")]
    MissingId,
    #[error("scrape timed out")]
    ScrapeTimedOut,
}

pub struct Client {
    http: reqwest::Client,
    poll_url: Url,
    push_url: Url,
    fqdn: String,
    metrics_url: Url,
    poll_interval: Duration,
    max_poll_interval: Duration,
}

impl Client {
    pub fn new(args: &ClientArgs) -> Result<Self, url::ParseError> {
        Ok(Self {
            http: reqwest::Client::new(),
            poll_url: args.proxy_url.join("poll")?,
            push_url: args.proxy_url.join("push")?,
            fqdn: normalize_fqdn(&args.fqdn),
            metrics_url: args.metrics_url.clone(),
            poll_interval: args.poll_interval,
            max_poll_interval: args.max_poll_interval,
        })
    }

    /// Polls the proxy forever. Failed cycles back off with a doubling
    /// delay; a successful cycle resets it.
    pub async fn run(&self) {
        tracing::info!(fqdn = %self.fqdn, proxy = %self.poll_url, "polling proxy");
        let mut backoff = self.poll_interval;
        loop {
            match self.poll_once().await {
                Ok(()) => backoff = self.poll_interval,
                Err(err) => {
                    tracing::warn!(error = %err, ?backoff, "poll cycle failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_poll_interval);
                }
            }
        }
    }

    /// One full cycle: long-poll an instruction, scrape, push the result.
    async fn poll_once(&self) -> Result<(), ClientError> {
        let instruction = self.poll().await?;
        let id = instruction
            .headers
            .get(&ID_HEADER)
            .cloned()
            .ok_or(ClientError::MissingId)?;
        let deadline = wire::scrape_timeout(&instruction.headers)
            .unwrap_or(Duration::from_secs(15));
        tracing::debug!(url = %instruction.url, id = ?id, "received scrape instruction");

        let started = tokio::time::Instant::now();
        let response = match self.scrape(&instruction, deadline).await {
            Ok(response) => response,
            // The collector should see scrape failures, so they are pushed
            // as synthesized 500s rather than swallowed here.
            Err(err) => failure_response(&err),
        };
        let remaining = deadline.saturating_sub(started.elapsed());
        self.push(id, response, remaining).await
    }

    async fn poll(&self) -> Result<ScrapeRequest, ClientError> {
        let body = self
            .http
            .post(self.poll_url.clone())
            .body(self.fqdn.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(wire::parse_request(&body)?)
    }

    /// Performs the instructed scrape against the configured metrics base,
    /// keeping the instruction's path and query. The response is fully
    /// materialized inside the deadline.
    async fn scrape(
        &self,
        instruction: &ScrapeRequest,
        deadline: Duration,
    ) -> Result<ScrapeResponse, ClientError> {
        let mut url = self.metrics_url.clone();
        url.set_path(instruction.url.path());
        url.set_query(instruction.url.query());

        let mut headers = instruction.headers.clone();
        headers.remove(&ID_HEADER);
        headers.remove(header::HOST);

        tokio::time::timeout(deadline, async {
            let response = self.http.get(url).headers(headers).send().await?;
            let (parts, body) = http::Response::from(response).into_parts();
            let body = BodyExt::collect(body).await.map(|b| b.to_bytes())?.to_vec();
            Ok(http::Response::from_parts(parts, body))
        })
        .await
        .map_err(|_| ClientError::ScrapeTimedOut)?
    }

    async fn push(
        &self,
        id: HeaderValue,
        mut response: ScrapeResponse,
        remaining: Duration,
    ) -> Result<(), ClientError> {
        response.headers_mut().insert(ID_HEADER, id);
        response
            .headers_mut()
            .insert(SCRAPE_TIMEOUT_HEADER, wire::format_scrape_timeout(remaining));
        self.http
            .post(self.push_url.clone())
            .body(wire::encode_response(&response))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn failure_response(err: &ClientError) -> ScrapeResponse {
    let mut response = http::Response::new(format!("scrape failed: {err}\n").into_bytes());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_failures_become_visible_responses() {
        let response = failure_response(&ClientError::ScrapeTimedOut);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(response.body().clone())
            .unwrap()
            .contains("scrape timed out"));
    }
}
