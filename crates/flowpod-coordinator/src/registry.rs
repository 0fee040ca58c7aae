//! Channel registry: the rendezvous between router and coordinators
//!
//! A concurrent map from [`RunId`] to the sending half of that run's
//! channel group. Many coordinators register and remove entries while the
//! router looks them up on every watch event; the map is sharded
//! (`DashMap`), so none of these operations take a global lock and none of
//! them ever wait on a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowpod_core::{RegistryError, RunId};
use tracing::debug;

use crate::channel::{ChannelGroup, ChannelSignaller, channel_group};

/// Concurrent map from run identity to channel group
///
/// Cloning is cheap and every clone refers to the same map; the registry's
/// lifetime is that of its owner (typically an orchestrator and its router).
///
/// Once the router reports the watch stream lost, every group registered
/// from then on starts out resolved to `Unknown`, until the router is
/// started again.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    entries: Arc<DashMap<RunId, Arc<ChannelSignaller>>>,
    observation_lost: Arc<AtomicBool>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a fresh channel group for `run_id`
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRegistered` if an entry already exists.
    pub fn register(&self, run_id: &RunId) -> Result<ChannelGroup, RegistryError> {
        self.insert(run_id).map(|(_, group)| group)
    }

    /// Like [`register`](Self::register), but the entry is removed when the
    /// returned guard is dropped
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRegistered` if an entry already exists.
    pub fn register_scoped(&self, run_id: &RunId) -> Result<Registration, RegistryError> {
        let (signaller, group) = self.insert(run_id)?;
        Ok(Registration {
            registry: self.clone(),
            run_id: run_id.clone(),
            signaller: Arc::downgrade(&signaller),
            group,
        })
    }

    fn insert(
        &self,
        run_id: &RunId,
    ) -> Result<(Arc<ChannelSignaller>, ChannelGroup), RegistryError> {
        match self.entries.entry(run_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered {
                run_id: run_id.clone(),
            }),
            Entry::Vacant(slot) => {
                let (signaller, group) = channel_group(run_id.clone());
                let signaller = Arc::new(signaller);
                slot.insert(Arc::clone(&signaller));
                debug!(run_id = %run_id, "Registered channel group");

                // Pairs with the store in `mark_observation_lost`: either the
                // router's sweep sees this entry or this load sees the latch.
                if self.observation_lost.load(Ordering::SeqCst) {
                    signaller.mark_observation_lost();
                }
                Ok((signaller, group))
            }
        }
    }

    /// Look up the sending half for `run_id`
    ///
    /// Absence is normal: the identity may be untracked or already cleaned up.
    pub fn lookup(&self, run_id: &RunId) -> Option<Arc<ChannelSignaller>> {
        self.entries.get(run_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.entries.contains_key(run_id)
    }

    /// Remove the entry for `run_id`; removing an absent identity is a no-op
    pub fn remove(&self, run_id: &RunId) {
        if self.entries.remove(run_id).is_some() {
            debug!(run_id = %run_id, "Removed channel group");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sending halves of every registered identity
    pub fn signallers(&self) -> Vec<Arc<ChannelSignaller>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Resolve every tracked identity to `Unknown` and latch the loss
    ///
    /// Returns how many identities were signalled. Registrations made after
    /// this call are resolved as they are created.
    pub fn mark_observation_lost(&self) -> usize {
        self.observation_lost.store(true, Ordering::SeqCst);
        let mut signalled = 0;
        for signaller in self.signallers() {
            if signaller.mark_observation_lost() {
                debug!(run_id = %signaller.run_id(), "Observation lost");
                signalled += 1;
            }
        }
        signalled
    }

    /// True between a lost watch stream and the next router start
    pub fn is_observation_lost(&self) -> bool {
        self.observation_lost.load(Ordering::SeqCst)
    }

    pub(crate) fn observation_restored(&self) {
        self.observation_lost.store(false, Ordering::SeqCst);
    }

    fn remove_exact(&self, run_id: &RunId, signaller: &Weak<ChannelSignaller>) {
        let removed = self
            .entries
            .remove_if(run_id, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), signaller.as_ptr())
            })
            .is_some();
        if removed {
            debug!(run_id = %run_id, "Deregistered channel group");
        }
    }
}

/// Scoped registry entry owned by a run coordinator
///
/// Dropping the guard deregisters the run, so cleanup happens on every
/// exit path including early returns and panics. Only the entry this
/// guard created is removed; a later registration under the same identity
/// is left alone.
#[derive(Debug)]
pub struct Registration {
    registry: ChannelRegistry,
    run_id: RunId,
    signaller: Weak<ChannelSignaller>,
    group: ChannelGroup,
}

impl Registration {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn group(&mut self) -> &mut ChannelGroup {
        &mut self.group
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove_exact(&self.run_id, &self.signaller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpod_core::{Phase, WatchEvent};
    use futures::FutureExt;

    fn id(s: &str) -> RunId {
        RunId::parse(s).unwrap()
    }

    #[test]
    fn test_contains_lifecycle() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-a");

        assert!(!registry.contains(&run_id));
        let _group = registry.register(&run_id).unwrap();
        assert!(registry.contains(&run_id));
        registry.remove(&run_id);
        assert!(!registry.contains(&run_id));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = ChannelRegistry::new();
        registry.remove(&id("never-registered"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_register_fails() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-b");

        let _group = registry.register(&run_id).unwrap();
        let err = registry.register(&run_id).unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered {
                run_id: run_id.clone()
            }
        );

        registry.remove(&run_id);
        assert!(registry.register(&run_id).is_ok());
    }

    #[test]
    fn test_lookup_absent_is_none() {
        let registry = ChannelRegistry::new();
        assert!(registry.lookup(&id("ghost")).is_none());
    }

    #[test]
    fn test_scoped_registration_removes_on_drop() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-c");

        {
            let registration = registry.register_scoped(&run_id).unwrap();
            assert_eq!(registration.run_id(), &run_id);
            assert!(registry.contains(&run_id));
        }
        assert!(!registry.contains(&run_id));
    }

    #[test]
    fn test_stale_guard_leaves_new_entry() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-d");

        let stale = registry.register_scoped(&run_id).unwrap();
        registry.remove(&run_id);
        let _fresh = registry.register(&run_id).unwrap();

        drop(stale);
        assert!(registry.contains(&run_id));
    }

    #[test]
    fn test_registration_after_loss_resolves_unknown() {
        let registry = ChannelRegistry::new();
        let mut tracked = registry.register(&id("run-g")).unwrap();
        assert_eq!(registry.mark_observation_lost(), 1);
        assert!(registry.is_observation_lost());

        let mut late = registry.register(&id("run-h")).unwrap();
        tokio_test::block_on(async {
            assert_eq!(tracked.next_update().await, Some(Phase::Unknown));
            assert_eq!(late.next_update().await, Some(Phase::Unknown));
        });

        registry.observation_restored();
        let mut fresh = registry.register(&id("run-i")).unwrap();
        assert!(fresh.next_update().now_or_never().is_none());
    }

    #[test]
    fn test_removed_group_sees_closed_queue() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-f");
        let mut group = registry.register(&run_id).unwrap();

        let signaller = registry.lookup(&run_id).unwrap();
        signaller.deliver(&WatchEvent::added(run_id.clone(), Phase::Pending));
        registry.remove(&run_id);
        drop(signaller);

        tokio_test::block_on(async {
            assert_eq!(group.next_update().await, Some(Phase::Pending));
            assert_eq!(group.next_update().await, None);
        });
    }

    #[tokio::test]
    async fn test_lookup_reaches_registered_group() {
        let registry = ChannelRegistry::new();
        let run_id = id("run-e");
        let mut registration = registry.register_scoped(&run_id).unwrap();

        let signaller = registry.lookup(&run_id).unwrap();
        signaller.deliver(&WatchEvent::updated(run_id.clone(), Phase::Running));

        assert_eq!(
            registration.group().next_update().await,
            Some(Phase::Running)
        );
        assert!(registration.group().try_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_remove() {
        let registry = ChannelRegistry::new();
        let mut handles = Vec::new();

        for i in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let run_id = RunId::parse(format!("run-{i}")).unwrap();
                for _ in 0..50 {
                    let registration = registry.register_scoped(&run_id).unwrap();
                    assert!(registry.contains(&run_id));
                    drop(registration);
                    assert!(!registry.contains(&run_id));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
