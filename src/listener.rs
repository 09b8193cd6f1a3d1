// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Server-push of neighbourhood changes to keepalive local-service
//! sessions.

use crate::{
    event::{ChangeListener, DbChange},
    messaging,
    peer::NodeRelation,
    proto,
    session::Session,
    task,
};

use tokio::sync::mpsc;

use std::sync::{Arc, Weak};

/// A database listener that forwards neighbour-relation changes over the
/// session that registered it.
///
/// The notifier holds its session only weakly, so it never extends the
/// session's life. Delivery is fire-and-post: changes are queued onto a
/// forwarder task in emission order and the incoming acknowledgements are
/// consumed (and discarded) by the session's own dispatch loop. Once the
/// forwarder dies, queuing fails and the database drops the listener, which
/// makes send failures self-healing.
pub(crate) struct NeighbourhoodNotifier {
    session_id: String,
    notification_tx: mpsc::UnboundedSender<proto::NeighbourhoodChange>,
}

impl NeighbourhoodNotifier {
    pub(crate) fn new(session: &Arc<Session>) -> Self {
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();

        task::spawn_detached(
            "Neighbourhood-Notifier",
            forward_notifications(Arc::downgrade(session), notification_rx),
        );

        Self {
            session_id: session.id().to_string(),
            notification_tx,
        }
    }
}

impl ChangeListener for NeighbourhoodNotifier {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn on_change(&self, change: &DbChange) -> bool {
        if change.entry().relation() != NodeRelation::Neighbour {
            return true;
        }

        self.notification_tx.send(messaging::change_to_wire(change)).is_ok()
    }
}

async fn forward_notifications(
    session: Weak<Session>,
    mut notification_rx: mpsc::UnboundedReceiver<proto::NeighbourhoodChange>,
) {
    while let Some(change) = notification_rx.recv().await {
        let session = match session.upgrade() {
            Some(session) => session,
            None => break,
        };

        let message = messaging::request_message(
            session.next_request_id(),
            proto::request::Request::LocalService(proto::LocalServiceRequest {
                request: Some(proto::local_service_request::Request::NeighbourhoodChanged(
                    proto::NeighbourhoodChangedNotification { changes: vec![change] },
                )),
            }),
        );

        if let Err(e) = session.send_message(message).await {
            log::warn!("Failed to send change notification on session {}: {}", session.id(), e);
            break;
        }
    }
}
