use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::proto::{GrantBody, StatusBody, LEASE_PATH, STATUS_PATH};

use super::error::{Error, Result};

pub const DEFAULT_URL: &str = "http://localhost:3001";

/// How long an acquire waits for an answer when none is given
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(20_000);

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A fresh owner token: `<unix-millis>.<pid>.<seq>`, where `seq` tells
/// apart sessions started by this process within the same millisecond.
pub fn default_owner() -> String {
    format!(
        "{}.{}.{}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        OWNER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL of the lease server
    pub url: String,

    /// Default client-side bound on a single acquire call
    pub acquire_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Per-call overrides for [`LeaseController::acquire_with`]
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub owner: Option<String>,
    pub timeout: Option<Duration>,
}

/// What an acquire call came back with
#[derive(Debug)]
pub enum Acquisition {
    /// The caller holds the lease and must release it when done
    Held(LeaseHandle),

    /// The caller waited behind another holder, which released the lease
    /// leaving this payload
    Delivered(Value),
}

/// Acquires leases from a lease server
#[derive(Debug, Clone)]
pub struct LeaseController {
    client: Client,
    base_url: Url,
    acquire_timeout: Duration,
}

impl LeaseController {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(config.url));
        }
        Ok(Self {
            client: Client::builder().build()?,
            base_url,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Acquire `name` as this process's default owner.
    pub async fn acquire(&self, name: &str) -> Result<Acquisition> {
        self.acquire_with(name, AcquireOptions::default()).await
    }

    /// Acquire `name`, waiting up to the timeout for a held lease to
    /// terminate.
    ///
    /// On grant, a background loop renews the lease every half TTL until
    /// [`LeaseHandle::release`] is called or the handle is dropped.
    #[tracing::instrument(skip(self, options), err)]
    pub async fn acquire_with(&self, name: &str, options: AcquireOptions) -> Result<Acquisition> {
        let owner = options.owner.unwrap_or_else(default_owner);
        let timeout = options.timeout.unwrap_or(self.acquire_timeout);
        let url = self.lease_url(name, &owner);

        let resp = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED => {
                let grant: GrantBody = decode(resp).await?;
                debug!(%owner, ttl = grant.ttl, "lease held");
                Ok(Acquisition::Held(LeaseHandle::start(
                    self.client.clone(),
                    name,
                    owner,
                    url,
                    Duration::from_millis(grant.ttl),
                )))
            }
            StatusCode::OK => {
                let data = decode(resp).await?;
                debug!("lease result delivered");
                Ok(Acquisition::Delivered(data))
            }
            StatusCode::REQUEST_TIMEOUT => Err(Error::Expired),
            status => Err(Error::UnexpectedStatus(status)),
        }
    }

    /// Fetch the server's view of every held lease and its counters.
    pub async fn status(&self) -> Result<StatusBody> {
        let url = self.endpoint(&[STATUS_PATH]);
        let resp = self
            .client
            .get(url)
            .timeout(self.acquire_timeout)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => decode(resp).await,
            status => Err(Error::UnexpectedStatus(status)),
        }
    }

    fn lease_url(&self, name: &str, owner: &str) -> Url {
        let mut url = self.endpoint(&[LEASE_PATH, name]);
        url.query_pairs_mut().append_pair("owner", owner);
        url
    }

    /// `segments` appended below the base URL's own path
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// A held lease, renewed in the background until released
#[derive(Debug)]
pub struct LeaseHandle {
    client: Client,
    name: String,
    owner: String,
    url: Url,
    ttl: Duration,
    renew_interval: Duration,

    /// Set by the first call to release
    released: AtomicBool,
    renewals: CancellationToken,
}

impl LeaseHandle {
    fn start(client: Client, name: &str, owner: String, url: Url, ttl: Duration) -> Self {
        let renew_interval = renew_interval(ttl);
        let renewals = CancellationToken::new();
        tokio::spawn(renew_loop(
            client.clone(),
            name.to_owned(),
            url.clone(),
            renew_interval,
            renewals.child_token(),
        ));
        Self {
            client,
            name: name.to_owned(),
            owner,
            url,
            ttl,
            renew_interval,
            released: AtomicBool::new(false),
            renewals,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The TTL the server granted
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cadence of background renewals, also the release call's timeout
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Release the lease, handing `payload` to everyone waiting on it.
    ///
    /// Only the first call does anything; later calls fail with
    /// [`Error::AlreadyReleased`] without contacting the server. Renewals
    /// stop as soon as this is called, whatever the outcome.
    #[tracing::instrument(skip_all, fields(name = %self.name), err)]
    pub async fn release(&self, payload: Option<Value>) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyReleased);
        }
        self.renewals.cancel();

        let mut req = self
            .client
            .put(self.url.clone())
            .timeout(self.renew_interval);
        if let Some(payload) = payload.filter(|p| !p.is_null()) {
            req = req.json(&payload);
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::OK => {
                debug!("lease released");
                Ok(())
            }
            StatusCode::CONFLICT => Err(Error::OwnershipConflict),
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(Error::UnexpectedStatus(status)),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.renewals.cancel();
    }
}

/// Half the TTL, rounded to the millisecond.
fn renew_interval(ttl: Duration) -> Duration {
    let ms = (ttl.as_millis() as u64).div_ceil(2);
    Duration::from_millis(ms.max(1))
}

/// Renew every `interval` until cancelled. A failed renewal is logged and
/// retried on the next tick.
async fn renew_loop(
    client: Client,
    name: String,
    url: Url,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = sleep(interval) => {}
        }
        let res = select! {
            _ = cancel.cancelled() => return,
            res = client.post(url.clone()).timeout(interval).send() => res,
        };
        match res {
            Ok(resp) if resp.status() == StatusCode::CREATED => {
                trace!(lease = %name, "lease renewed");
            }
            Ok(resp) => {
                warn!(lease = %name, status_code = resp.status().as_u16(), "lease renew failed");
            }
            Err(err) => {
                warn!(lease = %name, err = %err, "lease renew failed");
            }
        }
    }
}
