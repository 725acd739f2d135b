//! Write-once completion cell shared between a command list and its users

use std::sync::{Arc, OnceLock};

use super::SyncPoint;

#[derive(Debug)]
enum Completion {
    Submitted(SyncPoint),
    Discarded,
}

/// Completion handle for one recording of a command list
///
/// Starts empty while the list is recording. Submission fills it with the
/// batch's [`SyncPoint`]; discarding an unsubmitted list marks it discarded so
/// nobody waits on work that will never run. Every reuse of a list gets a new
/// token.
#[derive(Debug, Clone, Default)]
pub struct CompletionToken {
    state: Arc<OnceLock<Completion>>,
}

impl CompletionToken {
    /// Token for a list that has just started recording
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn submit(&self, sync_point: SyncPoint) {
        let already_set = self.state.set(Completion::Submitted(sync_point)).is_err();
        assert!(!already_set, "completion token resolved twice");
    }

    pub(crate) fn discard(&self) {
        let already_set = self.state.set(Completion::Discarded).is_err();
        assert!(!already_set, "completion token resolved twice");
    }

    /// Sync point of the submission, if submitted
    pub fn sync_point(&self) -> Option<&SyncPoint> {
        match self.state.get() {
            Some(Completion::Submitted(sync_point)) => Some(sync_point),
            _ => None,
        }
    }

    /// Whether the list was submitted or discarded
    pub fn is_resolved(&self) -> bool {
        self.state.get().is_some()
    }

    /// Whether the GPU can no longer be using anything the list referenced
    ///
    /// False while the list is still recording.
    pub fn is_complete(&self) -> bool {
        match self.state.get() {
            None => false,
            Some(Completion::Discarded) => true,
            Some(Completion::Submitted(sync_point)) => sync_point.is_complete(),
        }
    }

    /// Whether both handles refer to the same recording
    pub fn same_recording(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{NativeDevice, NullDevice, QueueType};
    use crate::sync::Fence;

    #[test]
    fn test_recording_token_is_incomplete() {
        let token = CompletionToken::new();
        assert!(!token.is_resolved());
        assert!(!token.is_complete());
        assert!(token.sync_point().is_none());
    }

    #[test]
    fn test_discarded_token_is_complete() {
        let token = CompletionToken::new();
        token.discard();
        assert!(token.is_complete());
        assert!(token.sync_point().is_none());
    }

    #[test]
    fn test_submitted_token_follows_fence() {
        let device = Arc::new(NullDevice::deferred());
        let queue = device.create_queue(QueueType::Direct).unwrap();
        let fence = Arc::new(Fence::new(Arc::clone(&device) as Arc<dyn NativeDevice>, "token").unwrap());

        let token = CompletionToken::new();
        let observer = token.clone();
        token.submit(SyncPoint::new(Arc::clone(&fence), fence.signal(queue).unwrap()));
        assert!(observer.same_recording(&token));
        assert!(!observer.is_complete());

        device.complete_all();
        assert!(observer.is_complete());
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn test_double_resolution_panics() {
        let token = CompletionToken::new();
        token.discard();
        token.discard();
    }
}
