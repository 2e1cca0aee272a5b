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
    base::serialize::{rmp_deserialize, rmp_serialize},
    channel::Receiver,
    gossip::{BroadcastMessageRequest, GossipRpc, HeartbeatRequest, UnicastMessageRequest},
    Error, ErrorKind, Result, VERSION,
};
use async_std::task;
use futures::future::{self, Either};
use tide::{http::mime, Request, Response, StatusCode};

/// Conversion from "core" errors to HTTP errors.
impl From<ErrorKind> for StatusCode {
    fn from(err: ErrorKind) -> StatusCode {
        use crate::error::ErrorKind::*;
        match err {
            MalformedData | UnknownBroadcastGroup => StatusCode::BadRequest,
            BadNetwork | ResourceNotFound => StatusCode::NotFound,
            NotLeader => StatusCode::Conflict,
            BrokenIntegrity => StatusCode::Unauthorized,
            DatabaseFault | ExecutionFault => StatusCode::InternalServerError,
            Timeout => StatusCode::GatewayTimeout,
            NotImplemented => StatusCode::NotImplemented,
            Other => StatusCode::ImATeapot,
        }
    }
}

fn tide_result(result: Result<Vec<u8>>) -> tide::Result {
    let (body, status) = match result {
        Ok(buf) => (buf, StatusCode::Ok),
        Err(err) => {
            debug!("[rest] request rejected: {}", err.to_string_full());
            let buf = err.to_string_full().as_bytes().to_vec();
            (buf, err.kind.into())
        }
    };
    let response = Response::builder(status)
        .body(body)
        .content_type(mime::BYTE_STREAM)
        .build();
    Ok(response)
}

async fn heartbeat(mut req: Request<GossipRpc>) -> tide::Result {
    let body = req.body_bytes().await?;
    let res = rmp_deserialize::<HeartbeatRequest>(&body)
        .and_then(|hb| rmp_serialize(&req.state().get_heartbeat(hb)));
    tide_result(res)
}

async fn broadcast(mut req: Request<GossipRpc>) -> tide::Result {
    let body = req.body_bytes().await?;
    let res = rmp_deserialize::<BroadcastMessageRequest>(&body)
        .and_then(|msg| req.state().broadcast_message(msg))
        .map(|_| vec![]);
    tide_result(res)
}

async fn unicast(mut req: Request<GossipRpc>) -> tide::Result {
    let body = req.body_bytes().await?;
    let res = rmp_deserialize::<UnicastMessageRequest>(&body)
        .and_then(|msg| req.state().unicast_message(msg))
        .map(|_| vec![]);
    tide_result(res)
}

async fn get_index(_req: Request<GossipRpc>) -> tide::Result {
    Ok(format!("TRINCI v{}", VERSION).into())
}

/// Serves the RPC surface until a unit is received on `stop_chan`.
pub fn run(addr: String, port: u16, rpc: GossipRpc, stop_chan: Receiver<()>) -> Result<()> {
    let mut app = tide::with_state(rpc);

    app.at("/api/v1/heartbeat").post(heartbeat);
    app.at("/api/v1/broadcast").post(broadcast);
    app.at("/api/v1/unicast").post(unicast);
    app.at("/").get(get_index);

    info!("[rest] listening on {}:{}", addr, port);
    let listen = Box::pin(app.listen((addr, port)));
    let stop = Box::pin(async move { stop_chan.recv().await });
    match task::block_on(future::select(listen, stop)) {
        Either::Left((Err(err), _)) => Err(Error::new_ext(ErrorKind::BadNetwork, err)),
        _ => Ok(()),
    }
}
