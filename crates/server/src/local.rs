//! In-process authority channel.
//!
//! Gives a participant the same request/event queues a TCP connection would,
//! without a socket. Dropping the request sender disconnects.

use std::sync::Arc;

use rally_wire::{AuthorityEvent, AuthorityRequest};
use tokio::sync::mpsc;

use crate::Authority;
use crate::connection::ConnId;

/// Both ends of an in-process authority connection, from the participant's
/// point of view.
#[derive(Debug)]
pub struct LocalChannel {
    pub conn: ConnId,
    pub requests: mpsc::UnboundedSender<AuthorityRequest>,
    pub events: mpsc::UnboundedReceiver<AuthorityEvent>,
}

/// Open a connection to `authority` served by a spawned task.
///
/// Must be called from within a tokio runtime.
pub fn attach(authority: &Arc<Authority>) -> LocalChannel {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (requests, mut request_rx) = mpsc::unbounded_channel::<AuthorityRequest>();
    let conn = authority.connect(event_tx);

    let authority = Arc::clone(authority);
    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            authority.handle(conn, request);
        }
        authority.disconnect(conn);
    });

    LocalChannel {
        conn,
        requests,
        events,
    }
}
