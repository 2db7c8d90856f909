//! Connection table for the authority channel.
//!
//! The authority pushes events to a connection through its outbound
//! queue; the transport task on the other end drains it.

use std::collections::HashMap;

use rally_state::{MemberId, SessionCode};
use rally_wire::AuthorityEvent;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Connection identifier (authority-internal).
pub type ConnId = u64;

/// Outbound queue toward one connected participant.
pub type EventSender = mpsc::UnboundedSender<AuthorityEvent>;

/// The session membership bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub session: SessionCode,
    pub member: MemberId,
}

/// A connected participant.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub sender: EventSender,
    pub membership: Option<Membership>,
    pub connected_at: OffsetDateTime,
}

/// All open connections, plus a reverse index from member to connection.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: HashMap<ConnId, Connection>,
    /// member → connection (for broadcast fan-out)
    by_member: HashMap<MemberId, ConnId>,
    next_id: ConnId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sender: EventSender, now: OffsetDateTime) -> ConnId {
        self.next_id += 1;
        let id = self.next_id;
        self.conns.insert(
            id,
            Connection {
                id,
                sender,
                membership: None,
                connected_at: now,
            },
        );
        id
    }

    /// Drop a connection, returning what it was bound to.
    pub fn unregister(&mut self, conn: ConnId) -> Option<Connection> {
        let connection = self.conns.remove(&conn)?;
        if let Some(m) = &connection.membership {
            self.by_member.remove(&m.member);
        }
        Some(connection)
    }

    pub fn membership(&self, conn: ConnId) -> Option<Membership> {
        self.conns.get(&conn)?.membership.clone()
    }

    /// Bind a connection to a membership. Returns false for unknown connections.
    pub fn bind(&mut self, conn: ConnId, membership: Membership) -> bool {
        let Some(connection) = self.conns.get_mut(&conn) else {
            return false;
        };
        if let Some(previous) = connection.membership.take() {
            self.by_member.remove(&previous.member);
        }
        self.by_member.insert(membership.member, conn);
        connection.membership = Some(membership);
        true
    }

    pub fn unbind(&mut self, conn: ConnId) -> Option<Membership> {
        let membership = self.conns.get_mut(&conn)?.membership.take()?;
        self.by_member.remove(&membership.member);
        Some(membership)
    }

    /// Queue an event for one connection. A closed queue is ignored; the
    /// transport task reports the disconnect separately.
    pub fn send(&self, conn: ConnId, event: AuthorityEvent) -> bool {
        self.conns
            .get(&conn)
            .is_some_and(|c| c.sender.send(event).is_ok())
    }

    pub fn send_to_member(&self, member: &MemberId, event: AuthorityEvent) -> bool {
        match self.by_member.get(member) {
            Some(conn) => self.send(*conn, event),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_wire::{SessionLeft, authority_event::Event};

    fn left() -> AuthorityEvent {
        AuthorityEvent::broadcast(Event::SessionLeft(SessionLeft {}))
    }

    #[test]
    fn test_bind_and_route_by_member() {
        let mut table = ConnectionTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = table.register(tx, OffsetDateTime::UNIX_EPOCH);
        let member = MemberId::new();

        assert!(!table.send_to_member(&member, left()));
        assert!(table.bind(
            conn,
            Membership {
                session: SessionCode::parse("ABCD1234").unwrap(),
                member,
            }
        ));
        assert!(table.send_to_member(&member, left()));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_rebind_drops_old_member_route() {
        let mut table = ConnectionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = table.register(tx, OffsetDateTime::UNIX_EPOCH);
        let code = SessionCode::parse("ABCD1234").unwrap();
        let first = MemberId::new();
        let second = MemberId::new();

        table.bind(conn, Membership { session: code.clone(), member: first });
        table.bind(conn, Membership { session: code, member: second });

        assert!(!table.send_to_member(&first, left()));
        assert!(table.send_to_member(&second, left()));
    }

    #[test]
    fn test_unregister_returns_membership() {
        let mut table = ConnectionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = table.register(tx, OffsetDateTime::UNIX_EPOCH);
        let member = MemberId::new();
        table.bind(
            conn,
            Membership {
                session: SessionCode::parse("ABCD1234").unwrap(),
                member,
            },
        );

        let gone = table.unregister(conn).unwrap();
        assert_eq!(gone.membership.unwrap().member, member);
        assert!(table.is_empty());
        assert!(!table.send_to_member(&member, left()));
        assert!(table.unregister(conn).is_none());
    }

    #[test]
    fn test_send_to_closed_queue_is_false() {
        let mut table = ConnectionTable::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = table.register(tx, OffsetDateTime::UNIX_EPOCH);
        drop(rx);
        assert!(!table.send(conn, left()));
    }
}
