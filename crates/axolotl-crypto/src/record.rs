//! Session record: the current state for one peer device plus a bounded
//! history of states that late messages may still be encrypted under.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::curve::PublicKey;
use crate::error::SessionFault;
use crate::state::SessionState;

/// Leading byte of a serialized record.
pub const RECORD_FORMAT_VERSION: u8 = 1;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// A record with no session yet.
    pub fn new_fresh() -> Self {
        Self::default()
    }

    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.current.is_none() && self.previous.is_empty()
    }

    pub fn session_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Replace the current state without archiving it.
    pub fn set_session_state(&mut self, state: SessionState) {
        self.current = Some(state);
    }

    /// Previous states, most recent first.
    pub fn previous_session_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous.iter()
    }

    pub fn previous_session_state(&self, index: usize) -> Option<&SessionState> {
        self.previous.get(index)
    }

    pub fn previous_session_count(&self) -> usize {
        self.previous.len()
    }

    /// Whether any state (current or archived) was built from this base key.
    pub fn has_session_state(&self, version: u8, alice_base_key: &PublicKey) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|state| state.version() == version && state.alice_base_key() == alice_base_key)
    }

    /// Make `state` current, archiving the old current state.
    pub fn promote_state(&mut self, state: SessionState, max_archived: usize) {
        self.archive_current_state(max_archived);
        self.current = Some(state);
    }

    /// Move the current state to the front of the history.
    pub fn archive_current_state(&mut self, max_archived: usize) {
        if let Some(current) = self.current.take() {
            self.previous.push_front(current);
            self.previous.truncate(max_archived);
        }
    }

    /// Replace archived state `index` with `updated` and make it current.
    pub fn promote_old_session(
        &mut self,
        index: usize,
        updated: SessionState,
        max_archived: usize,
    ) -> Result<(), SessionFault> {
        self.previous
            .remove(index)
            .ok_or(SessionFault::InvalidState("archived session index out of range"))?;
        self.promote_state(updated, max_archived);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SessionFault> {
        let mut out = vec![RECORD_FORMAT_VERSION];
        let body = postcard::to_allocvec(self)
            .map_err(|e| SessionFault::Store(format!("record encoding failed: {e}")))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SessionFault> {
        match bytes.split_first() {
            Some((&RECORD_FORMAT_VERSION, body)) => postcard::from_bytes(body)
                .map_err(|e| SessionFault::Store(format!("record decoding failed: {e}"))),
            Some((&other, _)) => Err(SessionFault::Store(format!(
                "unknown session record format {other}"
            ))),
            None => Err(SessionFault::Store("empty session record".into())),
        }
    }
}
