//! Sessions binding a virtual reader to one native reader on one slave.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;
use uuid::Uuid;

/// One (native reader, slave node) pairing, fixed for the reader's lifetime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualReaderSession {
    session_id: String,
    native_reader_name: String,
    slave_node_id: String,
    master_node_id: String,
}

impl VirtualReaderSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn native_reader_name(&self) -> &str {
        &self.native_reader_name
    }

    pub fn slave_node_id(&self) -> &str {
        &self.slave_node_id
    }

    pub fn master_node_id(&self) -> &str {
        &self.master_node_id
    }
}

/// Issues sessions with fresh unique ids.
#[derive(Debug, Default)]
pub struct SessionFactory {
    issued: AtomicU64,
}

impl SessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always a new session, even for a pair seen before
    pub fn create_session(
        &self,
        native_reader_name: &str,
        slave_node_id: &str,
        master_node_id: &str,
    ) -> VirtualReaderSession {
        let session = VirtualReaderSession {
            session_id: Uuid::new_v4().to_string(),
            native_reader_name: native_reader_name.to_string(),
            slave_node_id: slave_node_id.to_string(),
            master_node_id: master_node_id.to_string(),
        };
        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(
            session = %session.session_id,
            reader = native_reader_name,
            slave = slave_node_id,
            "session created"
        );
        session
    }

    /// Number of sessions issued so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_fields() {
        let factory = SessionFactory::new();
        let session = factory.create_session("R1", "S1", "master");
        assert_eq!(session.native_reader_name(), "R1");
        assert_eq!(session.slave_node_id(), "S1");
        assert_eq!(session.master_node_id(), "master");
        assert!(!session.session_id().is_empty());
    }

    #[test]
    fn test_session_ids_are_unique_even_for_same_pair() {
        let factory = SessionFactory::new();
        let ids: HashSet<_> = (0..100)
            .map(|_| factory.create_session("R1", "S1", "master").session_id().to_string())
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(factory.issued(), 100);
    }
}
