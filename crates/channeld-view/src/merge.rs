//! Field-level merge policy for channel state deltas.
//!
//! Deltas are sparse: an absent field means "untouched", never "cleared".
//! Map entries carry a removal flag; a flagged entry deletes the destination
//! key instead of being merged into it.
//!
//! Pending outbound deltas are combined with [`Merge::accumulate`] instead,
//! which keeps tombstones so they still reach the hub.

use std::collections::HashMap;
use std::hash::Hash;

/// Apply a sparse delta onto `self`.
pub trait Merge {
    /// Merge `delta` into `self`. Fields absent in `delta` are left alone.
    fn merge(&mut self, delta: &Self);

    /// Fold `delta` into a pending outbound delta. Defaults to [`merge`](Self::merge).
    fn accumulate(&mut self, delta: &Self) {
        self.merge(delta);
    }
}

/// Map entries that can carry a removal tombstone.
pub trait Removable {
    /// Whether this entry marks its key for deletion.
    fn is_removed(&self) -> bool;
}

/// Overwrite `dst` when `src` is present.
pub fn merge_option<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(value) = src {
        *dst = Some(value.clone());
    }
}

/// Merge a present nested value into `dst`, inserting it when `dst` is empty.
pub fn merge_nested<T: Merge + Clone>(dst: &mut Option<T>, src: &Option<T>) {
    match (dst.as_mut(), src) {
        (Some(existing), Some(delta)) => existing.merge(delta),
        (None, Some(delta)) => *dst = Some(delta.clone()),
        (_, None) => {}
    }
}

/// Merge map entries key by key.
///
/// Removed entries delete their key; existing keys merge field-wise; new keys
/// are inserted as-is.
pub fn merge_map<K, V>(dst: &mut HashMap<K, V>, src: &HashMap<K, V>)
where
    K: Eq + Hash + Clone,
    V: Merge + Removable + Clone,
{
    for (key, delta) in src {
        if delta.is_removed() {
            dst.remove(key);
            continue;
        }
        match dst.get_mut(key) {
            Some(existing) => existing.merge(delta),
            None => {
                dst.insert(key.clone(), delta.clone());
            }
        }
    }
}

/// Combine two pending map deltas, keeping tombstones.
///
/// A tombstone replaces whatever is pending for its key; a live entry merges
/// into a live pending entry and replaces a pending tombstone. In that last
/// case the receiver merges the new entry over whatever it still holds.
pub fn accumulate_map<K, V>(dst: &mut HashMap<K, V>, src: &HashMap<K, V>)
where
    K: Eq + Hash + Clone,
    V: Merge + Removable + Clone,
{
    for (key, delta) in src {
        match dst.get_mut(key) {
            Some(existing) if !delta.is_removed() && !existing.is_removed() => {
                existing.accumulate(delta)
            }
            _ => {
                dst.insert(key.clone(), delta.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Transform {
        removed: bool,
        x: Option<f32>,
        y: Option<f32>,
    }

    impl Merge for Transform {
        fn merge(&mut self, delta: &Self) {
            merge_option(&mut self.x, &delta.x);
            merge_option(&mut self.y, &delta.y);
        }
    }

    impl Removable for Transform {
        fn is_removed(&self) -> bool {
            self.removed
        }
    }

    fn at(x: f32, y: f32) -> Transform {
        Transform {
            removed: false,
            x: Some(x),
            y: Some(y),
        }
    }

    #[test]
    fn test_absent_option_leaves_destination() {
        let mut dst = Some(3);
        merge_option(&mut dst, &None);
        assert_eq!(dst, Some(3));

        merge_option(&mut dst, &Some(7));
        assert_eq!(dst, Some(7));
    }

    #[test]
    fn test_nested_merge_inserts_then_merges() {
        let mut dst: Option<Transform> = None;
        merge_nested(&mut dst, &Some(at(1.0, 2.0)));
        assert_eq!(dst, Some(at(1.0, 2.0)));

        let partial = Transform {
            x: Some(5.0),
            ..Transform::default()
        };
        merge_nested(&mut dst, &Some(partial));
        assert_eq!(dst, Some(at(5.0, 2.0)));
    }

    #[test]
    fn test_map_entries_merge_field_wise() {
        let mut dst = HashMap::from([(1u32, at(1.0, 1.0))]);
        let delta = HashMap::from([
            (
                1u32,
                Transform {
                    y: Some(9.0),
                    ..Transform::default()
                },
            ),
            (2u32, at(4.0, 4.0)),
        ]);

        merge_map(&mut dst, &delta);
        assert_eq!(dst[&1], at(1.0, 9.0));
        assert_eq!(dst[&2], at(4.0, 4.0));
    }

    #[test]
    fn test_tombstone_removes_key() {
        let mut dst = HashMap::from([(1u32, at(1.0, 1.0)), (2u32, at(2.0, 2.0))]);
        let delta = HashMap::from([(
            1u32,
            Transform {
                removed: true,
                ..Transform::default()
            },
        )]);

        merge_map(&mut dst, &delta);
        assert!(!dst.contains_key(&1));
        assert!(dst.contains_key(&2));
    }

    #[test]
    fn test_accumulate_keeps_tombstones() {
        let mut pending = HashMap::from([(1u32, at(1.0, 1.0))]);
        let removal = HashMap::from([
            (
                1u32,
                Transform {
                    removed: true,
                    ..Transform::default()
                },
            ),
            (
                2u32,
                Transform {
                    removed: true,
                    ..Transform::default()
                },
            ),
        ]);

        accumulate_map(&mut pending, &removal);
        assert!(pending[&1].removed);
        assert!(pending[&2].removed);

        accumulate_map(&mut pending, &HashMap::from([(2u32, at(3.0, 3.0))]));
        assert_eq!(pending[&2], at(3.0, 3.0));
    }

    #[test]
    fn test_tombstone_for_missing_key_is_not_inserted() {
        let mut dst: HashMap<u32, Transform> = HashMap::new();
        let delta = HashMap::from([(
            5u32,
            Transform {
                removed: true,
                ..at(0.0, 0.0)
            },
        )]);

        merge_map(&mut dst, &delta);
        assert!(dst.is_empty());
    }
}
