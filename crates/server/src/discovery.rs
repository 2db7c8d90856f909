//! Discovery feed notifications.
//!
//! The public session listing itself lives elsewhere. The authority only
//! tells it when a session becomes listable or stops being listable.

use std::fmt;

use rally_state::SessionCode;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Why a session left the public listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlistReason {
    Started,
    Emptied,
}

impl fmt::Display for UnlistReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Emptied => "emptied",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryNotice {
    /// A public session was created.
    Listed {
        id: SessionCode,
        member_count: usize,
        created_at: OffsetDateTime,
        creator_name: String,
    },
    Unlisted {
        id: SessionCode,
        reason: UnlistReason,
    },
}

impl DiscoveryNotice {
    pub fn id(&self) -> &SessionCode {
        match self {
            Self::Listed { id, .. } | Self::Unlisted { id, .. } => id,
        }
    }
}

/// Sink for discovery notices.
pub trait DiscoveryFeed: Send + Sync {
    fn notify(&self, notice: DiscoveryNotice);
}

/// Fans notices out to any number of subscribers.
///
/// Notices sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastFeed {
    tx: broadcast::Sender<DiscoveryNotice>,
}

impl BroadcastFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryNotice> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DiscoveryFeed for BroadcastFeed {
    fn notify(&self, notice: DiscoveryNotice) {
        let _ = self.tx.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_notices() {
        let feed = BroadcastFeed::default();
        let mut rx = feed.subscribe();
        let id = SessionCode::parse("ABCD1234").unwrap();

        feed.notify(DiscoveryNotice::Unlisted {
            id: id.clone(),
            reason: UnlistReason::Started,
        });

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.id(), &id);
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        let feed = BroadcastFeed::new(0);
        feed.notify(DiscoveryNotice::Unlisted {
            id: SessionCode::parse("ABCD1234").unwrap(),
            reason: UnlistReason::Emptied,
        });
    }
}
