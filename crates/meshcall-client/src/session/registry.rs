//! Peer sessions keyed by peer id, owned by the session loop

use meshcall_protocol::PeerId;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::events::PeerSummary;
use super::peer::PeerSession;

#[derive(Default)]
pub(crate) struct PeerRegistry {
    sessions: HashMap<PeerId, PeerSession>,
    last_generation: u64,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Session for `peer`, creating it with `open` if absent.
    /// `open` receives the generation to stamp on the new session.
    pub(crate) fn get_or_open<F>(&mut self, peer: &PeerId, open: F) -> Option<&mut PeerSession>
    where
        F: FnOnce(u64) -> Option<PeerSession>,
    {
        match self.sessions.entry(peer.clone()) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(entry) => {
                let generation = self.last_generation + 1;
                let session = open(generation)?;
                self.last_generation = generation;
                Some(entry.insert(session))
            }
        }
    }

    pub(crate) fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub(crate) fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    /// The session for `peer` only if it is still the given generation
    pub(crate) fn current_mut(&mut self, peer: &PeerId, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer)
            .filter(|session| session.generation() == generation)
    }

    pub(crate) fn remove(&mut self, peer: &PeerId) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    pub(crate) fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub(crate) fn summaries(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self.sessions.values().map(PeerSession::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
