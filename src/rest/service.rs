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

use crate::{
    channel::{simple_channel, Sender},
    gossip::GossipRpc,
    rest::worker,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

/// REST service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    /// IP address (e.g. 127.0.0.1 for localhost)
    pub addr: String,
    /// TCP port.
    pub port: u16,
}

impl Default for RestConfig {
    fn default() -> Self {
        RestConfig {
            addr: "127.0.0.1".to_owned(),
            port: 8000,
        }
    }
}

/// REST service data.
pub struct RestService {
    /// Server configuration.
    config: RestConfig,
    /// Worker thread handler.
    handle: Option<JoinHandle<()>>,
    /// Gossip operations exposed to clients.
    rpc: GossipRpc,
    /// To stop the server.
    stop_chan: Option<Sender<()>>,
    /// To check if the worker thread is alive.
    canary: Arc<()>,
}

impl RestService {
    pub fn new(config: RestConfig, rpc: GossipRpc) -> Self {
        RestService {
            config,
            handle: None,
            rpc,
            stop_chan: None,
            canary: Arc::new(()),
        }
    }

    /// Start the service.
    pub fn start(&mut self) {
        debug!("[rest] starting service");
        if self.is_running() {
            warn!("[rest] service was already running");
            return;
        }
        let rpc = self.rpc.clone();
        let addr = self.config.addr.clone();
        let port = self.config.port;
        let (stop_tx, stop_rx) = simple_channel();
        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            if let Err(err) = worker::run(addr, port, rpc, stop_rx) {
                error!("[rest] server failure: {}", err.to_string_full());
            }
        });
        self.handle = Some(handle);
        self.stop_chan = Some(stop_tx);
    }

    /// Stop the service.
    pub fn stop(&mut self) {
        debug!("[rest] stopping service");
        match self.handle.take() {
            Some(handle) => {
                if let Some(stop_chan) = self.stop_chan.take() {
                    if let Err(err) = stop_chan.send_sync(()) {
                        debug!("[rest] server already down: {}", err);
                    }
                }
                if handle.join().is_err() {
                    error!("[rest] service thread panicked");
                }
            }
            None => debug!("[rest] service was not running"),
        };
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2
    }
}
