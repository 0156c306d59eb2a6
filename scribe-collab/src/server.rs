//! WebSocket accept loop.
//!
//! ```text
//! TCP accept ──► handshake callback ──┬─ over budget ──► 429
//!                                     ├─ no docId ─────► 400
//!                                     └─ ok ──► Hub::on_connect (own task)
//! ```
//!
//! A client gets `handshake_timeout` to complete the upgrade; silent sockets
//! are dropped when it expires. Connection tasks are tracked so shutdown can wait, up to a grace period,
//! for them to leave their rooms and close their sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::AdmissionControl;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::hub::Hub;
use crate::protocol::DocumentId;

/// Query parameter naming the document to join.
pub const DOC_ID_PARAM: &str = "docId";

pub struct Server {
    config: ServerConfig,
    hub: Arc<Hub>,
    admission: Arc<AdmissionControl>,
    listener: TcpListener,
}

impl Server {
    /// Validate the configuration and bind the listener.
    pub async fn bind(config: ServerConfig, hub: Arc<Hub>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let admission = Arc::new(AdmissionControl::new(config.rate_limit));
        Ok(Self {
            config,
            hub,
            admission,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Accept connections and bridge the bus until `shutdown` fires, then wait
    /// up to the configured grace period for open connections to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        log::info!("Collaboration server listening on {addr}");

        let bridge = tokio::spawn(self.hub.clone().run(shutdown.clone()));
        let tracker = TaskTracker::new();
        let mut prune = interval(self.config.rate_limit.window);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("New TCP connection from {peer}");
                        tracker.spawn(serve_socket(
                            stream,
                            peer,
                            self.hub.clone(),
                            self.admission.clone(),
                            self.config.handshake_timeout,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                _ = prune.tick() => {
                    let pruned = self.admission.prune(Instant::now());
                    if pruned > 0 {
                        log::debug!("Pruned {pruned} expired rate-limit buckets");
                    }
                }
            }
        }

        drop(self.listener);
        tracker.close();
        log::info!("Shutting down, waiting for {} connections", tracker.len());
        if timeout(self.config.shutdown_grace, tracker.wait()).await.is_err() {
            log::warn!(
                "{} connections still open after {:?}, abandoning them",
                tracker.len(),
                self.config.shutdown_grace
            );
        }

        if let Err(e) = bridge.await {
            log::error!("Bus bridge task failed: {e}");
        }
        log::info!("Server stopped");
        Ok(())
    }
}

/// Handshake one socket and hand it to the hub.
async fn serve_socket(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    admission: Arc<AdmissionControl>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut doc_id: Option<DocumentId> = None;
    let callback = |req: &Request, resp: Response| {
        if !admission.check(peer.ip(), Instant::now()) {
            log::debug!("Rate limit exceeded for {}", peer.ip());
            return Err(reject(StatusCode::TOO_MANY_REQUESTS, "rate limit"));
        }
        match doc_id_from_query(req.uri().query()) {
            Some(id) => {
                doc_id = Some(id);
                Ok(resp)
            }
            None => Err(reject(StatusCode::BAD_REQUEST, "docId required")),
        }
    };

    let upgrade = timeout(handshake_timeout, tokio_tungstenite::accept_hdr_async(stream, callback));
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        handshake = upgrade => handshake,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            log::debug!("Handshake with {peer} failed: {e}");
            return;
        }
        Err(_) => {
            log::debug!("Handshake with {peer} timed out after {handshake_timeout:?}");
            return;
        }
    };
    let Some(doc_id) = doc_id else {
        return;
    };

    hub.on_connect(doc_id, ws, &shutdown).await;
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// The non-empty `docId` query value, if present.
pub fn doc_id_from_query(query: Option<&str>) -> Option<DocumentId> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == DOC_ID_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .map(DocumentId::from)
}
