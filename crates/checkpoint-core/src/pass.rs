// Passes
//
// A pass is the caller's proof of a successful acquisition. It is released
// exactly once: explicitly through `Pass::release`, or when it is dropped.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::gate::{AccessMode, ResourceGate, ResourceKey};

/// What a grant holds: the gate, the mode and the issuing checkpoint
pub(crate) struct Ticket<K> {
    pub(crate) gate: Arc<ResourceGate<K>>,
    pub(crate) mode: AccessMode,
    pub(crate) checkpoint: Arc<str>,
}

/// Receives passes when they are released
pub(crate) trait PassSink<K>: Send + Sync {
    /// Undo the grant recorded in `ticket`
    fn return_pass(&self, ticket: &Arc<Ticket<K>>);
}

/// Access to one resource in one mode
///
/// Dropping a pass releases it. Nested passes handed out by a reentrant
/// checkpoint refer to the same grant; see [`Pass::same_grant`].
#[must_use = "dropping a pass releases it immediately"]
pub struct Pass<K: ResourceKey> {
    ticket: Arc<Ticket<K>>,
    sink: Option<Arc<dyn PassSink<K>>>,
}

impl<K: ResourceKey> Pass<K> {
    pub(crate) fn new(ticket: Arc<Ticket<K>>, sink: Arc<dyn PassSink<K>>) -> Self {
        Self {
            ticket,
            sink: Some(sink),
        }
    }

    pub(crate) fn ticket(&self) -> &Arc<Ticket<K>> {
        &self.ticket
    }

    /// The resource this pass grants access to
    pub fn resource_id(&self) -> &K {
        self.ticket.gate.resource_id()
    }

    /// The granted access mode
    pub fn mode(&self) -> AccessMode {
        self.ticket.mode
    }

    /// Whether this is a shared (read-only) pass
    pub fn is_shared(&self) -> bool {
        self.ticket.mode.is_shared()
    }

    /// Whether this is an exclusive (read-write) pass
    pub fn is_exclusive(&self) -> bool {
        self.ticket.mode.is_exclusive()
    }

    /// Name of the checkpoint that issued this pass
    pub fn checkpoint_name(&self) -> &str {
        &self.ticket.checkpoint
    }

    /// Whether both passes stand for the same physical grant
    pub fn same_grant(&self, other: &Pass<K>) -> bool {
        Arc::ptr_eq(&self.ticket, &other.ticket)
    }

    /// Release the pass now
    pub fn release(mut self) {
        self.surrender();
    }

    fn surrender(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.return_pass(&self.ticket);
        }
    }
}

impl<K: ResourceKey> Drop for Pass<K> {
    fn drop(&mut self) {
        self.surrender();
    }
}

impl<K: ResourceKey> Debug for Pass<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pass")
            .field("resource_id", self.resource_id())
            .field("mode", &self.mode())
            .field("checkpoint", &self.checkpoint_name())
            .finish()
    }
}

impl<K: ResourceKey> Display for Pass<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pass to {:?} from {}",
            self.mode(),
            self.resource_id(),
            self.checkpoint_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        returned: Mutex<Vec<(String, AccessMode)>>,
    }

    impl PassSink<String> for RecordingSink {
        fn return_pass(&self, ticket: &Arc<Ticket<String>>) {
            self.returned
                .lock()
                .push((ticket.gate.resource_id().clone(), ticket.mode));
        }
    }

    fn issue(sink: &Arc<RecordingSink>, id: &str, mode: AccessMode) -> Pass<String> {
        let ticket = Arc::new(Ticket {
            gate: Arc::new(ResourceGate::new(id.to_string(), 1, false)),
            mode,
            checkpoint: Arc::from("test"),
        });
        Pass::new(ticket, sink.clone())
    }

    #[test]
    fn test_release_returns_once() {
        let sink = Arc::new(RecordingSink::default());
        let pass = issue(&sink, "a", AccessMode::Exclusive);
        assert!(pass.is_exclusive());
        pass.release();

        assert_eq!(
            *sink.returned.lock(),
            vec![("a".to_string(), AccessMode::Exclusive)]
        );
    }

    #[test]
    fn test_drop_releases() {
        let sink = Arc::new(RecordingSink::default());
        {
            let _pass = issue(&sink, "b", AccessMode::Shared);
        }
        assert_eq!(sink.returned.lock().len(), 1);
    }

    #[test]
    fn test_accessors_and_formatting() {
        let sink = Arc::new(RecordingSink::default());
        let pass = issue(&sink, "disk", AccessMode::Shared);
        let other = issue(&sink, "disk", AccessMode::Shared);

        assert_eq!(pass.resource_id(), "disk");
        assert!(pass.is_shared());
        assert_eq!(pass.checkpoint_name(), "test");
        assert!(pass.same_grant(&pass));
        assert!(!pass.same_grant(&other));
        assert_eq!(pass.to_string(), "shared pass to \"disk\" from test");
        assert!(format!("{:?}", pass).contains("Shared"));
    }
}
