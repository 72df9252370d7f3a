//! Local contributors to channel state.

use std::any::TypeId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::data::ChannelData;

/// A local object that contributes to, and follows, one channel's state.
///
/// Removal is two-phase: [`set_removed`](Self::set_removed) marks the provider,
/// it contributes once more (so the tombstone reaches the hub), and the next
/// flush reaps it.
pub trait ChannelDataProvider: Send {
    /// [`TypeId`] of the state type this provider writes.
    fn data_type(&self) -> TypeId;

    /// Entity this provider represents, if any.
    fn entity_id(&self) -> Option<u32> {
        None
    }

    /// Write this provider's pending delta into `data`. Returns whether
    /// anything was written.
    fn update_channel_data(&mut self, data: &mut dyn ChannelData) -> bool;

    /// Apply state received from the hub.
    fn on_channel_data_updated(&mut self, data: &dyn ChannelData);

    /// Whether the provider is marked for removal.
    fn is_removed(&self) -> bool;

    /// Mark or unmark the provider for removal.
    fn set_removed(&mut self, removed: bool);
}

/// A provider shared between the game layer and the view.
pub type SharedProvider = Arc<Mutex<dyn ChannelDataProvider>>;

/// Wrap a provider for registration with the view.
pub fn shared<P: ChannelDataProvider + 'static>(provider: P) -> SharedProvider {
    Arc::new(Mutex::new(provider))
}

/// Lock a provider, recovering from a poisoned lock.
pub fn lock(provider: &SharedProvider) -> MutexGuard<'_, dyn ChannelDataProvider + 'static> {
    provider.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ordered set of providers, compared by identity.
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: Vec<SharedProvider>,
}

impl ProviderSet {
    /// Add `provider`. Returns `false` if it was already present.
    pub fn insert(&mut self, provider: SharedProvider) -> bool {
        if self.contains(&provider) {
            return false;
        }
        self.providers.push(provider);
        true
    }

    /// Whether `provider` is in the set.
    pub fn contains(&self, provider: &SharedProvider) -> bool {
        self.providers.iter().any(|p| Arc::ptr_eq(p, provider))
    }

    /// Drop every provider marked removed. Returns how many were dropped.
    pub fn reap(&mut self) -> usize {
        let before = self.providers.len();
        self.providers.retain(|p| !lock(p).is_removed());
        before - self.providers.len()
    }

    /// Remove and return the providers representing `entity_id`.
    pub fn take_entity(&mut self, entity_id: u32) -> Vec<SharedProvider> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.providers)
            .into_iter()
            .partition(|p| lock(p).entity_id() == Some(entity_id));
        self.providers = kept;
        taken
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The providers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SharedProvider> {
        self.providers.iter()
    }

    /// Take the providers out of the set.
    pub fn into_vec(self) -> Vec<SharedProvider> {
        self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dummy {
        removed: bool,
        entity_id: Option<u32>,
    }

    impl ChannelDataProvider for Dummy {
        fn data_type(&self) -> TypeId {
            TypeId::of::<()>()
        }

        fn entity_id(&self) -> Option<u32> {
            self.entity_id
        }

        fn update_channel_data(&mut self, _data: &mut dyn ChannelData) -> bool {
            false
        }

        fn on_channel_data_updated(&mut self, _data: &dyn ChannelData) {}

        fn is_removed(&self) -> bool {
            self.removed
        }

        fn set_removed(&mut self, removed: bool) {
            self.removed = removed;
        }
    }

    #[test]
    fn test_insert_deduplicates_by_identity() {
        let a = shared(Dummy::default());
        let b = shared(Dummy::default());
        let mut set = ProviderSet::default();

        assert!(set.insert(Arc::clone(&a)));
        assert!(!set.insert(Arc::clone(&a)));
        assert!(set.insert(b));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reap_drops_only_removed() {
        let a = shared(Dummy::default());
        let b = shared(Dummy::default());
        let mut set = ProviderSet::default();
        set.insert(Arc::clone(&a));
        set.insert(Arc::clone(&b));

        lock(&b).set_removed(true);
        assert_eq!(set.reap(), 1);
        assert!(set.contains(&a));
        assert!(!set.contains(&b));
    }

    #[test]
    fn test_take_entity_keeps_others_in_order() {
        let a = shared(Dummy { entity_id: Some(1), ..Dummy::default() });
        let b = shared(Dummy { entity_id: Some(2), ..Dummy::default() });
        let c = shared(Dummy::default());
        let mut set = ProviderSet::default();
        set.insert(Arc::clone(&a));
        set.insert(Arc::clone(&b));
        set.insert(Arc::clone(&c));

        let taken = set.take_entity(2);
        assert_eq!(taken.len(), 1);
        assert!(Arc::ptr_eq(&taken[0], &b));
        let left: Vec<SharedProvider> = set.iter().cloned().collect();
        assert!(Arc::ptr_eq(&left[0], &a));
        assert!(Arc::ptr_eq(&left[1], &c));
        assert!(set.take_entity(9).is_empty());
    }
}
