//! One-off transitions that are undone at scope exit

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{Resource, ResourceStates, Subresource, Subresources, TrackedState};
use crate::command::CommandList;
use crate::hal::ResourceBarrier;

/// Transition recorded on entry and reverted on drop
///
/// When the list already knows the state of the subresource, the barrier is
/// recorded immediately, reverted on drop, and the list's tracked state is left
/// untouched. Otherwise the entry state is only known at submission: the
/// transition goes through the tracker like any first touch, and the list keeps
/// the scoped state afterwards.
pub struct ScopedTransition<'a> {
    list: &'a mut CommandList,
    resource: Arc<Resource>,
    subresource: Subresource,
    before: Option<ResourceStates>,
    after: ResourceStates,
}

impl<'a> ScopedTransition<'a> {
    /// Move `subresource` of `resource` into `after` until the guard is dropped
    pub fn new(
        list: &'a mut CommandList,
        resource: &Arc<Resource>,
        subresource: Subresource,
        after: ResourceStates,
    ) -> Self {
        let before = match subresource {
            Subresource::All => list.tracker().uniform_state(resource).and_then(TrackedState::known),
            Subresource::Index(index) => list.tracked_state(resource, index).known(),
        };

        let mut scoped = Self {
            list,
            resource: Arc::clone(resource),
            subresource,
            before,
            after,
        };
        match before {
            Some(before) => scoped.flush(before, after),
            None => {
                let subresources = match subresource {
                    Subresource::All => Subresources::All,
                    Subresource::Index(index) => Subresources::Single(index),
                };
                log::trace!(
                    "Scoped transition of {:?} deferred to submission; not reverted",
                    resource.raw()
                );
                scoped.list.transition_resource(resource, after, subresources);
            }
        }
        scoped
    }

    /// State the subresource is returned to, if known while recording
    pub const fn before(&self) -> Option<ResourceStates> {
        self.before
    }

    /// State held inside the scope
    pub const fn after(&self) -> ResourceStates {
        self.after
    }

    fn flush(&mut self, from: ResourceStates, to: ResourceStates) {
        if !self.resource.requires_tracking() || from == to {
            return;
        }
        self.list.resource_barriers(vec![ResourceBarrier {
            resource: self.resource.raw(),
            subresource: self.subresource,
            before: from,
            after: to,
        }]);
    }
}

impl Deref for ScopedTransition<'_> {
    type Target = CommandList;

    fn deref(&self) -> &CommandList {
        &*self.list
    }
}

impl DerefMut for ScopedTransition<'_> {
    fn deref_mut(&mut self) -> &mut CommandList {
        &mut *self.list
    }
}

impl Drop for ScopedTransition<'_> {
    fn drop(&mut self) {
        let Some(before) = self.before else {
            return;
        };
        if !self.list.is_open() {
            log::warn!(
                "Command list {:?} closed inside a scoped transition of {:?}; revert skipped",
                self.list.raw(),
                self.resource.raw()
            );
            return;
        }
        self.flush(self.after, before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandQueue;
    use crate::config::DeviceConfig;
    use crate::hal::{HeapKind, NativeDevice, NullDevice, QueueType, RawResource, RecordedOp, ResourceDesc};
    use crate::state::Subresources;
    use std::sync::atomic::AtomicBool;

    fn setup() -> (Arc<NullDevice>, CommandQueue) {
        let device = Arc::new(NullDevice::new());
        let queue = CommandQueue::new(
            Arc::clone(&device) as Arc<dyn NativeDevice>,
            QueueType::Direct,
            &DeviceConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        (device, queue)
    }

    fn barriers(ops: &[RecordedOp]) -> Vec<ResourceBarrier> {
        ops.iter()
            .filter_map(|op| match op {
                RecordedOp::ResourceBarriers(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_scoped_transition_reverts_without_touching_tracker() {
        let (device, queue) = setup();
        let resource = Arc::new(Resource::new(
            RawResource(77),
            ResourceDesc::texture_2d(8, 8, 1, 1),
            ResourceStates::COMMON,
        ));
        let mut list = queue.obtain_command_list().unwrap();
        list.transition_resource(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);

        {
            let mut scoped = ScopedTransition::new(&mut list, &resource, Subresource::All, ResourceStates::COPY_SOURCE);
            assert_eq!(scoped.before(), Some(ResourceStates::PIXEL_SHADER_RESOURCE));
            scoped.draw(3, 1);
        }

        let recorded = barriers(&device.recorded_ops(list.raw()));
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].after, ResourceStates::COPY_SOURCE);
        assert_eq!(recorded[1].after, ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(
            list.tracked_state(&resource, 0),
            TrackedState::Known(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn test_untouched_resource_resolves_entry_state_at_submission() {
        let (device, queue) = setup();
        let resource = Arc::new(Resource::new(
            RawResource(78),
            ResourceDesc::texture_2d(8, 8, 1, 1),
            ResourceStates::COMMON,
        ));

        let mut first = queue.obtain_command_list().unwrap();
        first.transition_resource(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);
        first.close().unwrap();
        queue.execute(vec![first], true).unwrap();

        let mut second = queue.obtain_command_list().unwrap();
        {
            let mut scoped = ScopedTransition::new(&mut second, &resource, Subresource::All, ResourceStates::COPY_SOURCE);
            assert_eq!(scoped.before(), None);
            scoped.draw(3, 1);
        }
        assert!(barriers(&device.recorded_ops(second.raw())).is_empty());
        assert_eq!(
            second.tracked_state(&resource, 0),
            TrackedState::Known(ResourceStates::COPY_SOURCE)
        );

        second.close().unwrap();
        queue.execute(vec![second], true).unwrap();
        let executed = device.executed_barriers(queue.raw());
        let last = executed.last().unwrap();
        assert_eq!(last.before, ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(last.after, ResourceStates::COPY_SOURCE);
        assert_eq!(resource.authoritative_state(0).known(), Some(ResourceStates::COPY_SOURCE));
    }

    #[test]
    fn test_untracked_resource_records_nothing() {
        let (device, queue) = setup();
        let upload = Arc::new(Resource::new(
            RawResource(79),
            ResourceDesc::buffer(64, HeapKind::Upload),
            ResourceStates::GENERIC_READ,
        ));
        let mut list = queue.obtain_command_list().unwrap();

        drop(ScopedTransition::new(&mut list, &upload, Subresource::All, ResourceStates::COPY_SOURCE));
        assert!(device.recorded_ops(list.raw()).is_empty());
    }
}
