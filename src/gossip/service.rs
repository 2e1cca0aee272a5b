// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Gossip service: owns the router and the worker thread, and exposes the
//! message submission surface used by the node front-ends.

use super::{worker::GossipWorker, GossipSender, Router};
use crate::{
    channel::{simple_channel, Sender},
    Error, ErrorKind, Result,
};
use async_std::{net::TcpListener, task};
use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Gossip service configuration.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Listening IP address.
    pub addr: String,
    /// Listening TCP port (0 to let the system choose).
    pub port: u16,
    /// Peers endpoints (`host:port`) to connect at startup.
    pub peers: Vec<String>,
    /// Node name, returned by heartbeat.
    pub name: String,
    /// Node version, returned by heartbeat.
    pub version: String,
    /// Broadcast groups that must have a listener before starting.
    pub broadcast_groups: Vec<String>,
    /// Outbound connection retries per endpoint.
    pub connect_retries: usize,
    /// Delay between two outbound connection attempts.
    pub connect_retry_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            addr: "127.0.0.1".to_owned(),
            port: 0,
            peers: vec![],
            name: "gossip".to_owned(),
            version: crate::VERSION.to_owned(),
            broadcast_groups: vec![],
            connect_retries: 10,
            connect_retry_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub requester_name: String,
    pub requester_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub responder_name: String,
    pub responder_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessageRequest {
    pub broadcast_group: String,
    pub message_type: String,
    #[serde(with = "serde_bytes")]
    pub buffer: Vec<u8>,
    pub immediate: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnicastMessageRequest {
    pub recipient: String,
    pub broadcast_group: String,
    pub message_type: String,
    #[serde(with = "serde_bytes")]
    pub buffer: Vec<u8>,
    pub immediate: bool,
}

/// Client facing gossip operations.
#[derive(Clone)]
pub struct GossipRpc {
    name: String,
    version: String,
    sender: Arc<dyn GossipSender>,
}

impl GossipRpc {
    pub fn new(name: String, version: String, sender: Arc<dyn GossipSender>) -> Self {
        GossipRpc {
            name,
            version,
            sender,
        }
    }

    pub fn get_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        info!(
            "[gossip] {}: service '{}(v{})' asked for heartbeat",
            self.name, req.requester_name, req.requester_version
        );
        HeartbeatResponse {
            responder_name: self.name.clone(),
            responder_version: self.version.clone(),
        }
    }

    /// # Errors
    ///
    /// `MalformedData` on empty broadcast group.
    pub fn broadcast_message(&self, req: BroadcastMessageRequest) -> Result<()> {
        if req.broadcast_group.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "empty broadcast group",
            ));
        }
        debug!(
            "[gossip] {}: broadcast {}/{} ({} bytes)",
            self.name,
            req.broadcast_group,
            req.message_type,
            req.buffer.len()
        );
        self.sender.broadcast_message(
            &req.broadcast_group,
            &req.message_type,
            req.buffer,
            req.immediate,
        )
    }

    /// # Errors
    ///
    /// `MalformedData` on empty recipient or broadcast group.
    pub fn unicast_message(&self, req: UnicastMessageRequest) -> Result<()> {
        if req.recipient.is_empty() || req.broadcast_group.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "empty recipient or broadcast group",
            ));
        }
        debug!(
            "[gossip] {}: unicast {}/{} to {} ({} bytes)",
            self.name,
            req.broadcast_group,
            req.message_type,
            req.recipient,
            req.buffer.len()
        );
        self.sender.unicast_message(
            &req.recipient,
            &req.broadcast_group,
            &req.message_type,
            req.buffer,
            req.immediate,
        )
    }
}

/// Gossip service data.
pub struct GossipService {
    /// Service configuration.
    config: Arc<GossipConfig>,
    /// Shared router.
    router: Router,
    /// Worker thread handler.
    handler: Option<JoinHandle<()>>,
    /// To stop the worker.
    stop_chan: Option<Sender<()>>,
    /// Actual listening endpoint, once started.
    local_endpoint: Option<SocketAddr>,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl GossipService {
    pub fn new(config: GossipConfig, local_address: String) -> Self {
        GossipService {
            config: Arc::new(config),
            router: Router::new(local_address),
            handler: None,
            stop_chan: None,
            local_endpoint: None,
            canary: Arc::new(()),
        }
    }

    /// Router shared with the service worker.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn rpc(&self) -> GossipRpc {
        GossipRpc::new(
            self.config.name.clone(),
            self.config.version.clone(),
            Arc::new(self.router.clone()),
        )
    }

    /// Listening endpoint bound by `start`.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    /// Start the service.
    ///
    /// # Errors
    ///
    /// `UnknownBroadcastGroup` if a configured group has no listener,
    /// `BadNetwork` if the listening endpoint cannot be bound.
    pub fn start(&mut self) -> Result<()> {
        debug!("[gossip] starting service");
        if self.is_running() {
            warn!("[gossip] service was already running");
            return Ok(());
        }
        self.router.validate_topology(&self.config.broadcast_groups)?;

        let listener =
            task::block_on(TcpListener::bind((self.config.addr.as_str(), self.config.port)))
                .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))?;
        self.local_endpoint = listener.local_addr().ok();
        self.router.open();

        let (stop_tx, stop_rx) = simple_channel();
        let mut worker = GossipWorker::new(
            self.config.clone(),
            self.router.clone(),
            listener,
            stop_rx,
        );
        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
        });
        self.handler = Some(handle);
        self.stop_chan = Some(stop_tx);
        Ok(())
    }

    /// Stop the service.
    pub fn stop(&mut self) {
        debug!("[gossip] stopping service");
        match self.handler.take() {
            Some(handle) => {
                if let Some(stop_chan) = self.stop_chan.take() {
                    if let Err(err) = stop_chan.send_sync(()) {
                        error!("[gossip] error stopping service thread: {}", err);
                    }
                }
                if handle.join().is_err() {
                    error!("[gossip] service thread panicked");
                }
            }
            None => debug!("[gossip] service was not running"),
        }
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2
    }
}
