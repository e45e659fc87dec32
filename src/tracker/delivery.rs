//! Best-effort batch transport.
//!
//! Telemetry loss is acceptable; surfacing it is not. Every failure here ends
//! in a `debug!` line and nothing else.

use reqwest::{header::CONTENT_TYPE, Client};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

/// Batches the beacon worker holds before `send_beacon` starts refusing.
pub const BEACON_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport closed")]
    Closed,

    #[error("no async runtime available")]
    NoRuntime,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

pub trait Delivery {
    /// Fire-and-forget send that outlives the page. `Ok(false)` means the
    /// transport refused to queue the body.
    fn send_beacon(&self, body: &str) -> Result<bool, DeliveryError>;

    /// Asynchronous request flagged to survive teardown.
    fn send_keepalive(&self, body: String) -> Result<(), DeliveryError>;
}

impl<D: Delivery + ?Sized> Delivery for Arc<D> {
    fn send_beacon(&self, body: &str) -> Result<bool, DeliveryError> {
        (**self).send_beacon(body)
    }

    fn send_keepalive(&self, body: String) -> Result<(), DeliveryError> {
        (**self).send_keepalive(body)
    }
}

/// Beacon first, keep-alive request second. Returns whether either path
/// accepted the body.
pub fn deliver<D: Delivery + ?Sized>(delivery: &D, body: String) -> bool {
    match delivery.send_beacon(&body) {
        Ok(true) => return true,
        Ok(false) => debug!("beacon rejected, falling back to keepalive request"),
        Err(err) => debug!("beacon failed: {err}"),
    }

    match delivery.send_keepalive(body) {
        Ok(()) => true,
        Err(err) => {
            debug!("keepalive request failed: {err}");
            false
        }
    }
}

/// Posts batches to the ingestion endpoint over HTTP.
pub struct HttpDelivery {
    endpoint: String,
    client: Client,
    queue: mpsc::Sender<String>,
    runtime: Handle,
}

impl HttpDelivery {
    /// Starts the beacon worker on the current runtime. The worker drains
    /// everything queued before it exits, which happens once the returned
    /// `HttpDelivery` is dropped.
    pub fn spawn(endpoint: impl Into<String>) -> Result<(Self, JoinHandle<()>), DeliveryError> {
        let runtime = Handle::try_current().map_err(|_| DeliveryError::NoRuntime)?;
        let endpoint = endpoint.into();
        let client = Client::builder().cookie_store(true).build()?;
        let (queue, mut pending) = mpsc::channel::<String>(BEACON_QUEUE_DEPTH);

        let worker_client = client.clone();
        let worker_endpoint = endpoint.clone();
        let worker = runtime.spawn(async move {
            while let Some(body) = pending.recv().await {
                if let Err(err) = post(&worker_client, &worker_endpoint, body).await {
                    debug!("beacon delivery failed: {err}");
                }
            }
        });

        Ok((
            Self {
                endpoint,
                client,
                queue,
                runtime,
            },
            worker,
        ))
    }
}

impl Delivery for HttpDelivery {
    fn send_beacon(&self, body: &str) -> Result<bool, DeliveryError> {
        match self.queue.try_send(body.to_string()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    fn send_keepalive(&self, body: String) -> Result<(), DeliveryError> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        self.runtime.spawn(async move {
            if let Err(err) = post(&client, &endpoint, body).await {
                debug!("keepalive delivery failed: {err}");
            }
        });
        Ok(())
    }
}

async fn post(client: &Client, endpoint: &str, body: String) -> Result<(), DeliveryError> {
    client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
