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

//! Gossip Router.
//!
//! Owns the open peer channels (inbound and outbound), registers each of them
//! under the address announced by the remote hello frame and routes inbound
//! application messages to the broadcast group listeners.

use super::{
    frame::{Frame, FramedMessage},
    peer::{self, PeerHandle},
    topology::{GossipListener, Topology},
    GossipSender,
};
use crate::{
    base::{Mutex, RwLock},
    Error, ErrorKind, Result,
};
use async_std::{
    net::{TcpListener, TcpStream},
    stream::StreamExt,
    task,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Gossip router. Cheap to clone, every clone shares the same state.
#[derive(Clone)]
pub struct Router {
    /// Local node address, derived from its identity.
    local_address: Arc<String>,
    /// Connection registry: remote address -> open channel.
    clients: Arc<RwLock<HashMap<String, PeerHandle>>>,
    /// Broadcast group listeners.
    topology: Arc<RwLock<Topology>>,
    /// Endpoints with an outbound connection in progress or established,
    /// tagged with the epoch of the task owning them.
    outbound: Arc<Mutex<HashMap<String, u64>>>,
    /// Every open channel, handshake completed or not.
    channels: Arc<Mutex<HashMap<u64, PeerHandle>>>,
    /// Connection identifiers generator.
    conn_counter: Arc<AtomicU64>,
    /// Set by `shutdown`, cleared by `open`.
    closed: Arc<AtomicBool>,
    /// Bumped by `shutdown`, background tasks of an older epoch give up.
    epoch: Arc<AtomicU64>,
}

impl Router {
    pub fn new(local_address: String) -> Self {
        Router {
            local_address: Arc::new(local_address),
            clients: Arc::new(RwLock::new(HashMap::new())),
            topology: Arc::new(RwLock::new(Topology::new())),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            conn_counter: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Accepts new channels again after a `shutdown`.
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.is_closed() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Handshake frame announcing the local address.
    pub fn hello_message(&self) -> Vec<u8> {
        Frame::Hello(self.local_address.to_string()).encode()
    }

    /// Binds a broadcast group to its listener.
    pub fn register_listener(&self, broadcast_group: &str, listener: Arc<dyn GossipListener>) {
        self.topology.write().register(broadcast_group, listener);
    }

    /// Checks that every configured group has a listener.
    pub fn validate_topology(&self, broadcast_groups: &[String]) -> Result<()> {
        self.topology.read().validate(broadcast_groups)
    }

    /// Addresses with a registered channel, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.clients.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.clients.read().contains_key(address)
    }

    fn register(&self, address: &str, handle: &PeerHandle) {
        let prev = self
            .clients
            .write()
            .insert(address.to_owned(), handle.clone());
        match prev {
            Some(prev) if prev.conn_id() != handle.conn_id() => info!(
                "[gossip] connection {} -> {} replaced (#{} -> #{})",
                self.local_address,
                address,
                prev.conn_id(),
                handle.conn_id()
            ),
            _ => info!(
                "[gossip] registering connection {} -> {}",
                self.local_address, address
            ),
        }
    }

    /// Removes the registry entry only if it still refers to `conn_id`.
    fn unregister(&self, address: &str, conn_id: u64) {
        let mut clients = self.clients.write();
        if clients.get(address).map(|handle| handle.conn_id()) == Some(conn_id) {
            clients.remove(address);
            info!("[gossip] remote {} disconnected", address);
        }
    }

    /// Accepts connections until the listener fails.
    pub async fn listen(self, listener: TcpListener) {
        let mut incoming = listener.incoming();
        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(stream) => {
                    task::spawn(self.clone().prepare_connection(stream));
                }
                Err(err) => {
                    error!("[gossip] accept failure: {}", err);
                    break;
                }
            }
        }
    }

    /// Runs a channel until it terminates.
    ///
    /// The local hello frame is queued first. The first frame received is
    /// always taken as the remote hello and registers the channel. On
    /// termination the registry entry is removed if it still points to this
    /// channel.
    pub async fn prepare_connection(self, stream: TcpStream) {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        let (handle, rx_chan) = PeerHandle::new(conn_id);
        task::spawn(peer::write_loop(stream.clone(), rx_chan));
        self.channels.lock().insert(conn_id, handle.clone());
        if self.is_closed() {
            debug!("[gossip] router closed, dropping channel #{}", conn_id);
            self.channels.lock().remove(&conn_id);
            handle.close();
            return;
        }
        if let Err(err) = handle.send(self.hello_message()) {
            warn!("[gossip] hello send failure: {}", err.to_string_full());
        }

        let mut reader = stream;
        let mut remote: Option<String> = None;
        loop {
            let buf = match peer::read_frame(&mut reader).await {
                Ok(buf) => buf,
                Err(err) => {
                    debug!(
                        "[gossip] channel #{} terminated: {}",
                        conn_id,
                        err.to_string_full()
                    );
                    break;
                }
            };
            match self.handle_frame(&buf, &handle, &mut remote) {
                Ok(true) => (),
                Ok(false) => break,
                Err(err) => warn!(
                    "[gossip] frame from {} dropped: {}",
                    remote.as_deref().unwrap_or("<unknown>"),
                    err.to_string_full()
                ),
            }
        }

        if let Some(address) = remote {
            self.unregister(&address, conn_id);
        }
        self.channels.lock().remove(&conn_id);
        handle.close();
    }

    /// Processes one inbound frame. Returns `false` if the channel must be
    /// closed.
    fn handle_frame(
        &self,
        buf: &[u8],
        handle: &PeerHandle,
        remote: &mut Option<String>,
    ) -> Result<bool> {
        let frame = Frame::decode(buf)?;
        if remote.is_none() {
            let (sender, first) = match frame {
                Frame::Hello(sender) => (sender, None),
                Frame::Message(msg) => {
                    debug!("[gossip] first frame is not a hello, taking its sender");
                    (msg.sender.clone(), Some(msg))
                }
            };
            if sender.is_empty() {
                return Err(Error::new_ext(ErrorKind::MalformedData, "empty hello"));
            }
            if sender == *self.local_address {
                warn!("[gossip] dropping connection to self");
                return Ok(false);
            }
            if self.is_closed() {
                return Ok(false);
            }
            self.register(&sender, handle);
            *remote = Some(sender);
            if let Some(msg) = first {
                self.dispatch(msg)?;
            }
            return Ok(true);
        }
        match frame {
            Frame::Hello(sender) => debug!("[gossip] repeated hello from {}", sender),
            Frame::Message(msg) => self.dispatch(msg)?,
        }
        Ok(true)
    }

    /// Delivers an application message to its group listener.
    ///
    /// Messages addressed to another node are silently dropped.
    ///
    /// # Errors
    ///
    /// `UnknownBroadcastGroup` if the group has no listener, or the listener
    /// error.
    pub fn dispatch(&self, msg: FramedMessage) -> Result<()> {
        if !msg.recipient.is_empty() && msg.recipient != *self.local_address {
            trace!(
                "[gossip] message for {} ignored by {}",
                msg.recipient,
                self.local_address
            );
            return Ok(());
        }
        let listener = self.topology.read().resolve(&msg.broadcast_group)?;
        listener.gossip_message_received(
            &msg.sender,
            &msg.broadcast_group,
            &msg.object_type,
            &msg.payload,
        )
    }

    /// Opens outbound channels to `endpoints` in background tasks.
    ///
    /// Each endpoint is tried up to `retries + 1` times. An endpoint with an
    /// attempt in progress, or an established outbound channel, is skipped.
    pub fn connect(&self, endpoints: &[String], retries: usize, interval: Duration) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        for endpoint in endpoints {
            {
                let mut outbound = self.outbound.lock();
                if outbound.get(endpoint) == Some(&epoch) {
                    debug!("[gossip] already connecting to {}", endpoint);
                    continue;
                }
                outbound.insert(endpoint.clone(), epoch);
            }
            let router = self.clone();
            let endpoint = endpoint.clone();
            task::spawn(async move {
                router
                    .connect_endpoint(endpoint, epoch, retries, interval)
                    .await;
            });
        }
    }

    async fn connect_endpoint(
        self,
        endpoint: String,
        epoch: u64,
        retries: usize,
        interval: Duration,
    ) {
        let mut attempt = 0;
        while self.is_current(epoch) {
            match TcpStream::connect(endpoint.as_str()).await {
                Ok(stream) if self.is_current(epoch) => {
                    debug!("[gossip] connected to {}", endpoint);
                    self.clone().prepare_connection(stream).await;
                    break;
                }
                Ok(_) => {
                    debug!("[gossip] router closed, dropping connection to {}", endpoint);
                    break;
                }
                Err(err) if attempt < retries => {
                    attempt += 1;
                    debug!(
                        "[gossip] connection to {} failed ({}), retry {}/{}",
                        endpoint, err, attempt, retries
                    );
                    task::sleep(interval).await;
                }
                Err(err) => {
                    warn!("[gossip] unable to connect to {}: {}", endpoint, err);
                    break;
                }
            }
        }
        let mut outbound = self.outbound.lock();
        if outbound.get(&endpoint) == Some(&epoch) {
            outbound.remove(&endpoint);
        }
    }

    /// Closes every open channel, registered or still in handshake.
    pub fn close_all(&self) {
        let channels: Vec<PeerHandle> = self.channels.lock().drain().map(|(_, h)| h).collect();
        for handle in channels.iter() {
            handle.close();
        }
        let mut clients = self.clients.write();
        for handle in clients.values() {
            handle.close();
        }
        clients.clear();
    }

    /// Stops the router: pending outbound attempts give up, new channels
    /// are refused and the open ones are closed.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.close_all();
        info!("[gossip] router {} shut down", self.local_address);
    }

    fn build_message(
        &self,
        recipient: &str,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        FramedMessage {
            sender: self.local_address.to_string(),
            recipient: recipient.to_owned(),
            broadcast_group: broadcast_group.to_owned(),
            object_type: object_type.to_owned(),
            payload,
        }
        .encode()
    }

    /// Sends the frame to every registered channel.
    /// Returns the number of channels the frame was queued on.
    fn send_to_all(&self, buf: &[u8]) -> usize {
        let clients = self.clients.read();
        let mut count = 0;
        for (address, handle) in clients.iter() {
            match handle.send(buf.to_vec()) {
                Ok(()) => count += 1,
                Err(err) => debug!(
                    "[gossip] send to {} failed: {}",
                    address,
                    err.to_string_full()
                ),
            }
        }
        count
    }

    /// Broadcast to every registered channel, regardless of the remote group
    /// listeners. Returns the number of channels reached.
    pub fn broadcast(&self, broadcast_group: &str, object_type: &str, payload: Vec<u8>) -> usize {
        let buf = self.build_message("", broadcast_group, object_type, payload);
        self.send_to_all(&buf)
    }

    /// Unicast to `recipient`, falling back to all the registered channels
    /// if the recipient has none. Returns the number of channels reached.
    pub fn unicast(
        &self,
        recipient: &str,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
    ) -> usize {
        let buf = self.build_message(recipient, broadcast_group, object_type, payload);
        let handle = self.clients.read().get(recipient).cloned();
        match handle {
            Some(handle) => match handle.send(buf) {
                Ok(()) => 1,
                Err(err) => {
                    debug!(
                        "[gossip] send to {} failed: {}",
                        recipient,
                        err.to_string_full()
                    );
                    0
                }
            },
            None => {
                debug!("[gossip] {} not connected, falling back to broadcast", recipient);
                self.send_to_all(&buf)
            }
        }
    }
}

impl GossipSender for Router {
    fn broadcast_message(
        &self,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
        _immediate: bool,
    ) -> Result<()> {
        let count = self.broadcast(broadcast_group, object_type, payload);
        trace!(
            "[gossip] broadcast {}/{} to {} peers",
            broadcast_group,
            object_type,
            count
        );
        Ok(())
    }

    fn unicast_message(
        &self,
        recipient: &str,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
        _immediate: bool,
    ) -> Result<()> {
        let count = self.unicast(recipient, broadcast_group, object_type, payload);
        trace!(
            "[gossip] unicast {}/{} for {} to {} peers",
            broadcast_group,
            object_type,
            recipient,
            count
        );
        Ok(())
    }
}
