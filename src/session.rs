//! Per-connection session state machine.
//!
//! A session accepts exactly one newline-terminated message, then plays
//! the log back and closes:
//!
//! ```text
//! Receiving -> Complete -> Responding -> Closed
//!     \_________________________________^   (peer closed or error first)
//! ```

use crate::config::PartialRecords;
use bytes::{Bytes, BytesMut};

/// Record delimiter.
pub const NEWLINE: u8 = b'\n';

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading bytes until a newline shows up.
    Receiving,
    /// A newline was seen; the message is ready to append.
    Complete,
    /// Playing the log back to the peer.
    Responding,
    /// Done. Nothing more is read or written.
    Closed,
}

/// Transient state for one accepted connection.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    /// Received bytes not yet handed to the store.
    pending: BytesMut,
    /// Total bytes received over the session.
    received: usize,
    partial_records: PartialRecords,
}

impl Session {
    /// Create a new session in the receiving state.
    pub fn new(partial_records: PartialRecords) -> Self {
        Self {
            state: SessionState::Receiving,
            pending: BytesMut::new(),
            received: 0,
            partial_records,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Take in one chunk read from the peer.
    ///
    /// Every byte is kept, including anything after the newline in the
    /// chunk that completes the message. Chunks arriving outside
    /// `Receiving` are ignored.
    pub fn receive(&mut self, chunk: &[u8]) -> SessionState {
        if self.state != SessionState::Receiving {
            return self.state;
        }

        self.pending.extend_from_slice(chunk);
        self.received += chunk.len();

        if chunk.contains(&NEWLINE) {
            self.state = SessionState::Complete;
        }
        self.state
    }

    /// Bytes that should be appended to the store now.
    ///
    /// With `Keep` every chunk is released as soon as it arrives; with
    /// `Drop` nothing is released until the message is complete.
    pub fn take_appendable(&mut self) -> Option<Bytes> {
        let ready = match self.partial_records {
            PartialRecords::Keep => true,
            PartialRecords::Drop => self.state == SessionState::Complete,
        };

        if ready && !self.pending.is_empty() {
            Some(self.pending.split().freeze())
        } else {
            None
        }
    }

    /// Transition from `Complete` to `Responding`.
    ///
    /// Returns false if the message was never completed.
    pub fn start_responding(&mut self) -> bool {
        if self.state == SessionState::Complete {
            self.state = SessionState::Responding;
            true
        } else {
            false
        }
    }

    /// Close the session, returning how many received bytes never reached
    /// the store.
    pub fn close(&mut self) -> usize {
        self.state = SessionState::Closed;
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new(PartialRecords::Keep);
        assert_eq!(session.state(), SessionState::Receiving);

        assert_eq!(session.receive(b"hel"), SessionState::Receiving);
        assert_eq!(session.receive(b"lo\n"), SessionState::Complete);

        assert!(session.start_responding());
        assert_eq!(session.state(), SessionState::Responding);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_keep_releases_every_chunk() {
        let mut session = Session::new(PartialRecords::Keep);

        session.receive(b"par");
        assert_eq!(session.take_appendable().unwrap(), &b"par"[..]);
        assert!(session.take_appendable().is_none());

        session.receive(b"tial\n");
        assert_eq!(session.take_appendable().unwrap(), &b"tial\n"[..]);
        assert_eq!(session.received(), 8);
    }

    #[test]
    fn test_drop_holds_until_complete() {
        let mut session = Session::new(PartialRecords::Drop);

        session.receive(b"par");
        assert!(session.take_appendable().is_none());

        session.receive(b"tial\n");
        assert_eq!(session.take_appendable().unwrap(), &b"partial\n"[..]);
    }

    #[test]
    fn test_drop_discards_unterminated_tail() {
        let mut session = Session::new(PartialRecords::Drop);

        session.receive(b"partial");
        assert!(session.take_appendable().is_none());
        assert!(!session.start_responding());
        assert_eq!(session.close(), 7);
    }

    #[test]
    fn test_newline_only_message() {
        let mut session = Session::new(PartialRecords::Drop);

        assert_eq!(session.receive(b"\n"), SessionState::Complete);
        assert_eq!(session.take_appendable().unwrap(), &b"\n"[..]);
    }

    #[test]
    fn test_bytes_after_newline_are_kept() {
        let mut session = Session::new(PartialRecords::Drop);

        assert_eq!(session.receive(b"one\ntwo"), SessionState::Complete);
        assert_eq!(session.take_appendable().unwrap(), &b"one\ntwo"[..]);
    }

    #[test]
    fn test_chunks_after_completion_ignored() {
        let mut session = Session::new(PartialRecords::Keep);

        session.receive(b"done\n");
        session.take_appendable();
        assert_eq!(session.receive(b"more\n"), SessionState::Complete);
        assert!(session.take_appendable().is_none());
        assert_eq!(session.received(), 5);
    }
}
