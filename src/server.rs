// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The TCP servers: one accept loop per interface, one dispatch loop per
//! accepted session.

use crate::{
    dispatch::Dispatcher,
    error::Error,
    messaging, proto,
    session::Session,
    task::{self, Runnable, ShutdownListener},
};

use tokio::net::{TcpListener, TcpStream};

use std::sync::Arc;

pub(crate) async fn bind(port: u16) -> Result<TcpListener, Error> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Connection(format!("error binding tcp listener on port {}: {}", port, e)))
}

/// Accepts connections on one listener and spawns a dispatch loop task per
/// session.
pub(crate) struct AcceptLoop {
    listener: TcpListener,
    dispatcher: Dispatcher,
}

impl AcceptLoop {
    pub(crate) fn new(listener: TcpListener, dispatcher: Dispatcher) -> Self {
        Self { listener, dispatcher }
    }
}

#[async_trait::async_trait]
impl Runnable for AcceptLoop {
    const NAME: &'static str = "Accept-Loop";

    async fn run(self, mut shutdown: ShutdownListener) {
        let AcceptLoop { listener, dispatcher } = self;

        // PANIC: the listener was bound a moment ago.
        log::debug!("Accepting connections on {}.", listener.local_addr().expect("bound listener"));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            log::debug!("Connection accepted from {}.", peer_addr);
                            task::spawn_detached("Session", serve_session(stream, dispatcher.clone(), shutdown.clone()));
                        }
                        Err(e) => {
                            log::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// The per-session dispatch loop: receive, route, respond, in request
/// order. Incoming responses are only legal as notification
/// acknowledgements and are discarded.
pub(crate) async fn serve_session(stream: TcpStream, dispatcher: Dispatcher, mut shutdown: ShutdownListener) {
    let (session, mut reader) = match Session::split(stream) {
        Ok(split) => split,
        Err(e) => {
            log::warn!("Failed to set up session: {}", e);
            return;
        }
    };

    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => break,
            received = reader.receive_message() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e @ Error::BadRequest(_)) => {
                // Framing violation: report it before closing.
                log::warn!("Session {} violated the framing: {}", session.id(), e);
                let _ = session
                    .send_message(messaging::response_message(0, messaging::error_response(&e)))
                    .await;
                break;
            }
            Err(e) => {
                log::debug!("Session {} read ended: {}", session.id(), e);
                break;
            }
        };

        let message_id = message.id;
        let (response, terminal) = match handle_message(&dispatcher, message, &session) {
            Ok(None) => continue,
            Ok(Some(response)) => (response, false),
            Err(e) => {
                log::warn!(
                    "Session {} failed to serve request with status {:?}: {}",
                    session.id(),
                    e.to_status(),
                    e
                );
                (messaging::error_response(&e), e.is_terminal())
            }
        };

        if let Err(e) = session
            .send_message(messaging::response_message(message_id, response))
            .await
        {
            log::debug!("Session {} write failed: {}", session.id(), e);
            break;
        }
        if terminal {
            break;
        }
    }

    log::debug!("Request dispatch loop for session {} finished.", session.id());
}

fn handle_message(
    dispatcher: &Dispatcher,
    message: proto::Message,
    session: &Arc<Session>,
) -> Result<Option<proto::Response>, Error> {
    let body = message
        .body
        .ok_or_else(|| Error::BadRequest("missing message body".into()))?;

    match body {
        proto::message::Body::Response(response) => {
            if is_notification_ack(&response) {
                Ok(None)
            } else {
                Err(Error::BadRequest(
                    "incoming response must acknowledge a known notification".into(),
                ))
            }
        }
        proto::message::Body::Request(request) => {
            messaging::check_version(&message.version)?;

            let request = request.request.ok_or_else(|| Error::BadRequest("missing request".into()))?;
            let response = dispatcher.dispatch(request, session)?;

            Ok(Some(messaging::ok_response(response)))
        }
    }
}

fn is_notification_ack(response: &proto::Response) -> bool {
    matches!(
        &response.response,
        Some(proto::response::Response::LocalService(proto::LocalServiceResponse {
            response: Some(proto::local_service_response::Response::NeighbourhoodUpdated(_)),
        }))
    )
}
