//! Per-command-list state tracking and submission-time barrier resolution

use std::collections::HashMap;
use std::sync::Arc;

use super::{Resource, ResourceStates, Subresource, SubresourceStates, Subresources, TrackedState};
use crate::hal::{RawResource, ResourceBarrier};

/// First-touch transition whose source state is only known at submission
#[derive(Debug, Clone)]
pub struct PendingBarrier {
    /// Transitioned resource
    pub resource: Arc<Resource>,
    /// Affected subresource(s)
    pub subresource: Subresource,
    /// State the list expects on entry
    pub target: ResourceStates,
}

#[derive(Debug)]
struct ResourceView {
    resource: Arc<Resource>,
    states: SubresourceStates,
}

/// One command list's tentative view of every resource it touched
///
/// Owned by the recording thread. Transitions against a state the list already
/// knows produce barriers right away; the first touch of a resource produces a
/// [`PendingBarrier`] instead since other lists recorded concurrently may run
/// first.
#[derive(Debug, Default)]
pub struct ListStateTracker {
    views: HashMap<RawResource, ResourceView>,
    pending: Vec<PendingBarrier>,
}

impl ListStateTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `subresources` of `resource` into `target`
    ///
    /// Returns the barriers that must be recorded now. Afterwards the list's
    /// view of every touched subresource is `target`, except that a
    /// subresource in `DEPTH_WRITE` asked for `DEPTH_READ` keeps `DEPTH_WRITE`.
    pub fn transition(
        &mut self,
        resource: &Arc<Resource>,
        target: ResourceStates,
        subresources: Subresources,
    ) -> Vec<ResourceBarrier> {
        if !resource.requires_tracking() {
            return Vec::new();
        }

        let count = resource.subresource_count();
        let indices = match subresources {
            Subresources::All => None,
            Subresources::Single(index) => {
                assert!(index < count, "subresource {index} out of range for {:?}", resource.raw());
                Some(vec![index])
            }
            Subresources::Subset(subset) => {
                let indices = subset.indices(resource.desc());
                (indices.len() as u32 != count).then_some(indices)
            }
        };

        let view = self.views.entry(resource.raw()).or_insert_with(|| ResourceView {
            resource: Arc::clone(resource),
            states: SubresourceStates::uniform(count, TrackedState::Unknown),
        });

        let mut barriers = Vec::new();
        match indices {
            None => match view.states.uniform_state() {
                Some(TrackedState::Unknown) => {
                    self.pending.push(PendingBarrier {
                        resource: Arc::clone(resource),
                        subresource: Subresource::All,
                        target,
                    });
                    view.states.set_all(TrackedState::Known(target));
                }
                Some(TrackedState::Known(current)) => {
                    if !current.satisfies(target) {
                        barriers.push(barrier(resource, Subresource::All, current, target));
                        view.states.set_all(TrackedState::Known(target));
                    }
                }
                None => {
                    for index in 0..count {
                        transition_subresource(view, &mut self.pending, &mut barriers, index, target);
                    }
                    view.states.compact();
                }
            },
            Some(indices) => {
                for index in indices {
                    transition_subresource(view, &mut self.pending, &mut barriers, index, target);
                }
                view.states.compact();
            }
        }

        log::trace!(
            "Transition {:?} to {:?}: {} barriers, {} pending",
            resource.raw(),
            target,
            barriers.len(),
            self.pending.len()
        );
        barriers
    }

    /// This list's view of one subresource
    pub fn state(&self, resource: &Resource, index: u32) -> TrackedState {
        self.views
            .get(&resource.raw())
            .map_or(TrackedState::Unknown, |view| view.states.get(index))
    }

    /// This list's view of the whole resource when uniform
    pub fn uniform_state(&self, resource: &Resource) -> Option<TrackedState> {
        match self.views.get(&resource.raw()) {
            Some(view) => view.states.uniform_state(),
            None => Some(TrackedState::Unknown),
        }
    }

    /// Transitions waiting for submission
    pub fn pending(&self) -> &[PendingBarrier] {
        &self.pending
    }

    /// Number of distinct resources touched
    pub fn tracked_resource_count(&self) -> usize {
        self.views.len()
    }

    /// Resolve pending barriers against the batch's view of authoritative
    /// state, then record this list's final states into that view
    ///
    /// Must run under the submission lock, once per list, in execution order.
    /// Nothing is published until the batch has executed and
    /// [`StagedStates::apply`] is called.
    pub(crate) fn resolve_and_commit(&mut self, staged: &mut StagedStates) -> Vec<ResourceBarrier> {
        let mut barriers = Vec::new();

        for request in self.pending.drain(..) {
            let authoritative = staged.states_mut(&request.resource);
            match request.subresource {
                Subresource::All => match authoritative.uniform_state() {
                    Some(current) => resolve(&request, Subresource::All, current, &mut barriers),
                    None => {
                        for index in 0..authoritative.count() {
                            resolve(&request, Subresource::Index(index), authoritative.get(index), &mut barriers);
                        }
                    }
                },
                Subresource::Index(index) => {
                    resolve(&request, Subresource::Index(index), authoritative.get(index), &mut barriers);
                }
            }
        }

        for view in self.views.values() {
            let authoritative = staged.states_mut(&view.resource);
            match view.states.uniform_state() {
                Some(TrackedState::Known(state)) => authoritative.set_all(TrackedState::Known(state)),
                Some(TrackedState::Unknown) => {}
                None => {
                    for index in 0..view.states.count() {
                        if let TrackedState::Known(state) = view.states.get(index) {
                            authoritative.set(index, TrackedState::Known(state));
                        }
                    }
                    authoritative.compact();
                }
            }
        }

        barriers
    }

    /// Forget everything; used when the owning list is reset
    pub fn clear(&mut self) {
        self.views.clear();
        self.pending.clear();
    }
}

/// Authoritative states as a batch under submission will leave them
///
/// Lists of one batch resolve against the states left by the lists before
/// them. Dropping the staged set without applying it leaves every resource as
/// it was, which is what a failed execution needs.
#[derive(Debug, Default)]
pub(crate) struct StagedStates {
    entries: HashMap<RawResource, (Arc<Resource>, SubresourceStates)>,
}

impl StagedStates {
    fn states_mut(&mut self, resource: &Arc<Resource>) -> &mut SubresourceStates {
        &mut self
            .entries
            .entry(resource.raw())
            .or_insert_with(|| (Arc::clone(resource), resource.lock_authoritative().clone()))
            .1
    }

    /// Publish every staged state as authoritative
    pub(crate) fn apply(self) {
        for (resource, states) in self.entries.into_values() {
            *resource.lock_authoritative() = states;
        }
    }
}

fn barrier(resource: &Resource, subresource: Subresource, before: ResourceStates, after: ResourceStates) -> ResourceBarrier {
    ResourceBarrier {
        resource: resource.raw(),
        subresource,
        before,
        after,
    }
}

fn transition_subresource(
    view: &mut ResourceView,
    pending: &mut Vec<PendingBarrier>,
    barriers: &mut Vec<ResourceBarrier>,
    index: u32,
    target: ResourceStates,
) {
    match view.states.get(index) {
        TrackedState::Unknown => {
            pending.push(PendingBarrier {
                resource: Arc::clone(&view.resource),
                subresource: Subresource::Index(index),
                target,
            });
            view.states.set(index, TrackedState::Known(target));
        }
        TrackedState::Known(current) if current.satisfies(target) => {}
        TrackedState::Known(current) => {
            barriers.push(barrier(&view.resource, Subresource::Index(index), current, target));
            view.states.set(index, TrackedState::Known(target));
        }
    }
}

fn resolve(request: &PendingBarrier, subresource: Subresource, current: TrackedState, barriers: &mut Vec<ResourceBarrier>) {
    match current {
        TrackedState::Known(state) if state == request.target => {}
        TrackedState::Known(state) => barriers.push(barrier(&request.resource, subresource, state, request.target)),
        TrackedState::Unknown => log::warn!(
            "State of {:?} {:?} unknown at submission, assuming {:?}",
            request.resource.raw(),
            subresource,
            request.target
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HeapKind, RawResource, ResourceDesc};
    use crate::state::SubresourceSubset;

    fn texture(id: u64, mips: u16, state: ResourceStates) -> Arc<Resource> {
        Arc::new(Resource::new(RawResource(id), ResourceDesc::texture_2d(32, 32, mips, 1), state))
    }

    fn known(state: ResourceStates) -> TrackedState {
        TrackedState::Known(state)
    }

    fn submit(tracker: &mut ListStateTracker) -> Vec<ResourceBarrier> {
        let mut staged = StagedStates::default();
        let barriers = tracker.resolve_and_commit(&mut staged);
        staged.apply();
        barriers
    }

    #[test]
    fn test_first_touch_is_deferred() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();

        let barriers = tracker.transition(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);
        assert!(barriers.is_empty());
        assert_eq!(tracker.pending().len(), 1);
        assert_eq!(tracker.state(&resource, 0), known(ResourceStates::PIXEL_SHADER_RESOURCE));
    }

    #[test]
    fn test_known_state_emits_immediate_barrier() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::RENDER_TARGET, Subresources::All);

        let barriers = tracker.transition(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);
        assert_eq!(
            barriers,
            vec![ResourceBarrier {
                resource: resource.raw(),
                subresource: Subresource::All,
                before: ResourceStates::RENDER_TARGET,
                after: ResourceStates::PIXEL_SHADER_RESOURCE,
            }]
        );

        let repeated = tracker.transition(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);
        assert!(repeated.is_empty());
        assert_eq!(tracker.pending().len(), 1);
    }

    #[test]
    fn test_single_subresource_upgrades_granularity() {
        let resource = texture(1, 4, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);

        let barriers = tracker.transition(&resource, ResourceStates::RENDER_TARGET, Subresources::Single(1));
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].subresource, Subresource::Index(1));
        assert_eq!(tracker.state(&resource, 1), known(ResourceStates::RENDER_TARGET));
        assert_eq!(tracker.state(&resource, 2), known(ResourceStates::PIXEL_SHADER_RESOURCE));
        assert_eq!(tracker.uniform_state(&resource), None);

        // Whole-resource transition diffs each subresource and compacts again
        let barriers = tracker.transition(&resource, ResourceStates::RENDER_TARGET, Subresources::All);
        let touched: Vec<_> = barriers.iter().map(|b| b.subresource).collect();
        assert_eq!(
            touched,
            vec![Subresource::Index(0), Subresource::Index(2), Subresource::Index(3)]
        );
        assert_eq!(tracker.uniform_state(&resource), Some(known(ResourceStates::RENDER_TARGET)));
    }

    #[test]
    fn test_subset_transition_touches_only_subset() {
        let resource = texture(1, 3, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::COPY_DEST, Subresources::All);

        let subset = SubresourceSubset::mip(resource.desc(), 2);
        let barriers = tracker.transition(&resource, ResourceStates::COPY_SOURCE, Subresources::Subset(subset));
        assert_eq!(barriers.len(), 1);
        assert_eq!(tracker.state(&resource, 2), known(ResourceStates::COPY_SOURCE));
        assert_eq!(tracker.state(&resource, 0), known(ResourceStates::COPY_DEST));
    }

    #[test]
    fn test_depth_write_kept_for_depth_read() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::DEPTH_WRITE, Subresources::All);

        let barriers = tracker.transition(&resource, ResourceStates::DEPTH_READ, Subresources::All);
        assert!(barriers.is_empty());
        assert_eq!(tracker.state(&resource, 0), known(ResourceStates::DEPTH_WRITE));
    }

    #[test]
    fn test_untracked_resource_bypasses_tracker() {
        let upload = Arc::new(Resource::new(
            RawResource(9),
            ResourceDesc::buffer(256, HeapKind::Upload),
            ResourceStates::GENERIC_READ,
        ));
        let mut tracker = ListStateTracker::new();

        let barriers = tracker.transition(&upload, ResourceStates::COPY_SOURCE, Subresources::All);
        assert!(barriers.is_empty());
        assert!(tracker.pending().is_empty());
        assert_eq!(tracker.tracked_resource_count(), 0);
    }

    #[test]
    fn test_concurrent_lists_resolve_once() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut list_a = ListStateTracker::new();
        let mut list_b = ListStateTracker::new();
        list_a.transition(&resource, ResourceStates::UNORDERED_ACCESS, Subresources::All);
        list_b.transition(&resource, ResourceStates::UNORDERED_ACCESS, Subresources::All);

        let first = submit(&mut list_a);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].before, ResourceStates::COMMON);
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::UNORDERED_ACCESS));

        assert!(submit(&mut list_b).is_empty());
    }

    #[test]
    fn test_lists_of_one_batch_resolve_in_order() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut list_a = ListStateTracker::new();
        let mut list_b = ListStateTracker::new();
        list_a.transition(&resource, ResourceStates::RENDER_TARGET, Subresources::All);
        list_b.transition(&resource, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All);

        let mut staged = StagedStates::default();
        assert_eq!(list_a.resolve_and_commit(&mut staged)[0].before, ResourceStates::COMMON);
        let second = list_b.resolve_and_commit(&mut staged);
        assert_eq!(second[0].before, ResourceStates::RENDER_TARGET);
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::COMMON));

        staged.apply();
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::PIXEL_SHADER_RESOURCE));
    }

    #[test]
    fn test_unapplied_staging_leaves_authoritative_state() {
        let resource = texture(1, 1, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::COPY_DEST, Subresources::All);

        let mut staged = StagedStates::default();
        assert_eq!(tracker.resolve_and_commit(&mut staged).len(), 1);
        drop(staged);
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::COMMON));
    }

    #[test]
    fn test_commit_publishes_final_per_subresource_states() {
        let resource = texture(1, 2, ResourceStates::COMMON);
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::RENDER_TARGET, Subresources::Single(1));

        let barriers = submit(&mut tracker);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].subresource, Subresource::Index(1));
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::COMMON));
        assert_eq!(resource.authoritative_state(1), known(ResourceStates::RENDER_TARGET));
    }

    #[test]
    fn test_unknown_authoritative_state_adopts_target() {
        let resource = Arc::new(Resource::with_unknown_state(
            RawResource(3),
            ResourceDesc::texture_2d(8, 8, 1, 1),
            ResourceStates::COMMON,
        ));
        let mut tracker = ListStateTracker::new();
        tracker.transition(&resource, ResourceStates::COPY_DEST, Subresources::All);

        assert!(submit(&mut tracker).is_empty());
        assert_eq!(resource.authoritative_state(0), known(ResourceStates::COPY_DEST));
    }
}
