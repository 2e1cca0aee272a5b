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

//! Gossip service worker: accepts inbound connections and opens the
//! configured outbound ones until stopped.

use super::{service::GossipConfig, Router};
use crate::channel::Receiver;
use async_std::{net::TcpListener, task};
use futures::{future, prelude::*};
use std::{
    sync::Arc,
    task::{Context, Poll},
};

pub(crate) struct GossipWorker {
    config: Arc<GossipConfig>,
    router: Router,
    listener: Option<TcpListener>,
    stop_chan: Receiver<()>,
}

impl GossipWorker {
    pub fn new(
        config: Arc<GossipConfig>,
        router: Router,
        listener: TcpListener,
        stop_chan: Receiver<()>,
    ) -> Self {
        GossipWorker {
            config,
            router,
            listener: Some(listener),
            stop_chan,
        }
    }

    /// Worker asynchronous task.
    /// This can be stopped by sending a unit to the stop channel.
    pub async fn run(&mut self) {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return,
        };
        info!(
            "[gossip] {} listening on {}:{}",
            self.router.local_address(),
            self.config.addr,
            self.config.port
        );
        self.router.connect(
            &self.config.peers,
            self.config.connect_retries,
            self.config.connect_retry_interval,
        );

        let mut listen_fut = Box::pin(self.router.clone().listen(listener));
        let stop_chan = &mut self.stop_chan;
        let future = future::poll_fn(move |cx: &mut Context<'_>| -> Poll<()> {
            match stop_chan.poll_next_unpin(cx) {
                Poll::Ready(_) => return Poll::Ready(()),
                Poll::Pending => (),
            }
            if listen_fut.poll_unpin(cx).is_ready() {
                error!("[gossip] listener terminated");
                return Poll::Ready(());
            }
            Poll::Pending
        });
        future.await;
        self.router.shutdown();
    }

    /// Worker synchronous task.
    pub fn run_sync(&mut self) {
        task::block_on(self.run());
    }
}
