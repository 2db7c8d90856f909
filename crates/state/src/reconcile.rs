//! Participant-side mirror of a session and the merge rules applied to it.
//!
//! Every remote input, whether it arrived through the authority or over a
//! mesh link, goes through the same `apply_*` methods:
//!
//! - counter: `max(local, incoming)`
//! - members: union by id, never removed by a merge
//! - status: one-way latch to `Playing`
//!
//! The counter rule is monotone but not causal. Two participants that
//! increment concurrently from the same value both end up at that value plus
//! one, so one increment is absorbed.

use indexmap::IndexMap;
use time::OffsetDateTime;

use crate::{Member, MemberId, PeerAddress, SessionCode, SessionError, SessionView, Status};

/// What a merge changed, so the caller can react (log, connect, notify).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// True if the local counter moved up.
    pub counter_advanced: bool,
    /// Members that were not present before the merge.
    pub members_added: Vec<Member>,
    /// Members whose transport address was filled in or changed.
    pub addresses_learned: Vec<Member>,
    /// True if the merge flipped status from `Waiting` to `Playing`.
    pub started: bool,
}

/// Local copy of a session as seen by one participant.
#[derive(Debug, Clone)]
pub struct Mirror {
    local: MemberId,
    id: SessionCode,
    status: Status,
    counter: u64,
    is_public: bool,
    created_at: OffsetDateTime,
    creator_id: MemberId,
    members: IndexMap<MemberId, Member>,
}

impl Mirror {
    /// Seed the mirror from the authority's reply to create/join.
    pub fn from_view(local: MemberId, view: SessionView) -> Self {
        Self {
            local,
            id: view.id,
            status: view.status,
            counter: view.counter,
            is_public: view.is_public,
            created_at: view.created_at,
            creator_id: view.creator_id,
            members: view.members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn local_member_id(&self) -> MemberId {
        self.local
    }

    pub fn local_member(&self) -> Option<&Member> {
        self.members.get(&self.local)
    }

    pub fn id(&self) -> &SessionCode {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Transport addresses of every other member that has one.
    pub fn peer_addresses(&self) -> Vec<PeerAddress> {
        self.members
            .values()
            .filter(|m| m.id != self.local)
            .filter_map(|m| m.transport_address.clone())
            .collect()
    }

    /// Owned copy, in the same shape the authority hands out.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            status: self.status,
            counter: self.counter,
            is_public: self.is_public,
            created_at: self.created_at,
            creator_id: self.creator_id,
            members: self.members.values().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Merge rules
    // ------------------------------------------------------------------------

    /// Counter max-merge. Returns true if the local value moved.
    pub fn merge_counter(&mut self, incoming: u64) -> bool {
        if incoming > self.counter {
            self.counter = incoming;
            true
        } else {
            false
        }
    }

    /// Status latch. Returns true only on the first transition.
    pub fn apply_started(&mut self) -> bool {
        if self.status.is_playing() {
            return false;
        }
        self.status = Status::Playing;
        true
    }

    fn merge_status(&mut self, incoming: Status) -> bool {
        match incoming {
            Status::Playing => self.apply_started(),
            Status::Waiting => false,
        }
    }

    /// Union one member into the view.
    ///
    /// An existing entry only gains an address it was missing.
    fn merge_member(&mut self, incoming: Member, outcome: &mut MergeOutcome) {
        match self.members.get_mut(&incoming.id) {
            None => {
                outcome.members_added.push(incoming.clone());
                self.members.insert(incoming.id, incoming);
            }
            Some(existing) => {
                if existing.transport_address.is_none() && incoming.transport_address.is_some() {
                    existing.transport_address = incoming.transport_address;
                    outcome.addresses_learned.push(existing.clone());
                }
            }
        }
    }

    /// Fold a full snapshot (mesh `snapshot` message).
    pub fn apply_snapshot(
        &mut self,
        members: impl IntoIterator<Item = Member>,
        counter: u64,
        status: Status,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for member in members {
            self.merge_member(member, &mut outcome);
        }
        outcome.counter_advanced = self.merge_counter(counter);
        outcome.started = self.merge_status(status);
        outcome
    }

    /// Fold a full session state carried by a `started`/`gameStarted` event.
    pub fn apply_started_state(&mut self, state: SessionView) -> MergeOutcome {
        let mut outcome = self.apply_snapshot(state.members, state.counter, state.status);
        outcome.started |= self.apply_started();
        outcome
    }

    /// A member joined (authority push or mesh mirror).
    pub fn apply_member_joined(&mut self, member: Member) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        self.merge_member(member, &mut outcome);
        outcome
    }

    /// Authority-confirmed address update. Replaces any previous address.
    pub fn apply_address_update(&mut self, member: Member) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        match self.members.get_mut(&member.id) {
            Some(existing) => {
                if existing.transport_address != member.transport_address {
                    existing.transport_address = member.transport_address;
                    outcome.addresses_learned.push(existing.clone());
                }
            }
            None => self.merge_member(member, &mut outcome),
        }
        outcome
    }

    /// Explicit departure. The local member is never removed this way.
    pub fn apply_member_left(&mut self, id: &MemberId) -> Option<Member> {
        if *id == self.local {
            return None;
        }
        self.members.shift_remove(id)
    }

    /// Record the local member's own address once reported.
    pub fn set_local_address(&mut self, address: PeerAddress) {
        if let Some(local) = self.members.get_mut(&self.local) {
            local.transport_address = Some(address);
        }
    }

    /// Local increment. Applied immediately, returns the value to broadcast.
    pub fn local_increment(&mut self) -> Result<u64, SessionError> {
        if !self.status.is_playing() {
            return Err(SessionError::NotStarted);
        }
        self.counter = self.counter.saturating_add(1);
        Ok(self.counter)
    }
}
