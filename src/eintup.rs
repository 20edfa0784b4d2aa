//! Named index groups ("EinTups") and the arena holding their [Shape]s.
//!
//! A primary group owns a slot in the arena. A shadow group stores the [ShapeId] of the group it
//! shadows, so resizing the owner is observed through every shadow.

use indexmap::IndexMap;
use std::fmt;

use crate::common::{DimSize, Dims};
use crate::shape::{Shape, ShapeError};
use crate::utils::join_into_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(usize);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("cannot set dims of non-primary EinTup '{0}'")]
    IllegalMutation(String),
    #[error("unknown EinTup '{0}'")]
    UnknownGroup(String),
    #[error("EinTup '{name}' shadows '{owner}', which does not exist")]
    UnknownOwner { name: String, owner: String },
    #[error("EinTup '{name}': {source}")]
    Shape {
        name: String,
        #[source]
        source: ShapeError,
    },
    #[error("element count of EinTup '{0}' overflows")]
    ElementCountOverflow(String),
}

#[derive(Debug, Clone)]
pub struct EinTup {
    name: String,
    shadow_of: Option<GroupId>,
    shape: ShapeId,
}

#[derive(Debug, Default, Clone)]
pub struct GroupRegistry {
    shapes: Vec<Shape>,
    tups: IndexMap<String, EinTup>,
}

/// A borrowed view of one registered group.
#[derive(Clone, Copy)]
pub struct Group<'a> {
    registry: &'a GroupRegistry,
    id: GroupId,
}

/// Row-major iterator over every multi-index within some dims.
///
/// Zero-length dims yield exactly one (empty) index; any zero-sized axis yields none.
#[derive(Debug, Clone)]
pub struct MultiIndexIter {
    dims: Dims,
    next: Option<Dims>,
}

impl EinTup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> bool {
        self.shadow_of.is_none()
    }

    pub fn shadow_of(&self) -> Option<GroupId> {
        self.shadow_of
    }
}

impl GroupRegistry {
    pub fn new() -> Self {
        GroupRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.tups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tups.is_empty()
    }

    /// Return the group named `name`, registering it first if needed.
    ///
    /// New groups are primary unless `shadow_of` names an existing group, in which case the new
    /// group aliases that group's [Shape]. An existing group is returned as-is.
    pub fn maybe_add(&mut self, name: &str, shadow_of: Option<&str>) -> Result<GroupId, GroupError> {
        if let Some(idx) = self.tups.get_index_of(name) {
            return Ok(GroupId(idx));
        }
        let tup = match shadow_of {
            None => {
                self.shapes.push(Shape::new());
                EinTup {
                    name: name.to_owned(),
                    shadow_of: None,
                    shape: ShapeId(self.shapes.len() - 1),
                }
            }
            Some(owner_name) => {
                let Some((owner_idx, _, owner)) = self.tups.get_full(owner_name) else {
                    return Err(GroupError::UnknownOwner {
                        name: name.to_owned(),
                        owner: owner_name.to_owned(),
                    });
                };
                EinTup {
                    name: name.to_owned(),
                    shadow_of: Some(GroupId(owner_idx)),
                    shape: owner.shape,
                }
            }
        };
        log::debug!("Registering {}", tup_description(&tup, self));
        let (idx, _) = self.tups.insert_full(name.to_owned(), tup);
        Ok(GroupId(idx))
    }

    pub fn id(&self, name: &str) -> Result<GroupId, GroupError> {
        self.tups
            .get_index_of(name)
            .map(GroupId)
            .ok_or_else(|| GroupError::UnknownGroup(name.to_owned()))
    }

    pub fn get(&self, name: &str) -> Result<Group<'_>, GroupError> {
        self.id(name).map(|id| self.group(id))
    }

    /// Panics if `id` did not come from this registry.
    pub fn group(&self, id: GroupId) -> Group<'_> {
        assert!(id.0 < self.tups.len(), "GroupId from another registry");
        Group { registry: self, id }
    }

    pub fn iter(&self) -> impl Iterator<Item = Group<'_>> + '_ {
        (0..self.tups.len()).map(|i| self.group(GroupId(i)))
    }

    pub fn primary_ids(&self) -> Vec<GroupId> {
        self.iter().filter(|g| g.is_primary()).map(|g| g.id).collect()
    }

    pub fn set_dims(
        &mut self,
        id: GroupId,
        dims: impl IntoIterator<Item = DimSize>,
    ) -> Result<(), GroupError> {
        let tup = self.tup(id);
        if !tup.primary() {
            return Err(GroupError::IllegalMutation(tup.name.clone()));
        }
        let shape = tup.shape;
        self.shapes[shape.0].set(dims);
        Ok(())
    }

    /// Set a single axis of a group. Unlike [GroupRegistry::set_dims], this also applies to
    /// shadows and so writes through to the shadowed group.
    pub fn set_dim(&mut self, id: GroupId, index: usize, dim: DimSize) -> Result<(), GroupError> {
        let tup = self.tup(id);
        let (name, shape) = (tup.name.clone(), tup.shape);
        self.shapes[shape.0]
            .set_elem(index, dim)
            .map_err(|source| GroupError::Shape { name, source })
    }

    fn tup(&self, id: GroupId) -> &EinTup {
        &self.tups[id.0]
    }
}

impl<'a> Group<'a> {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        &self.registry.tup(self.id).name
    }

    pub fn tup(&self) -> &'a EinTup {
        self.registry.tup(self.id)
    }

    pub fn shape_id(&self) -> ShapeId {
        self.tup().shape
    }

    pub fn is_primary(&self) -> bool {
        self.tup().primary()
    }

    pub fn dims(&self) -> Result<&'a [DimSize], GroupError> {
        self.registry.shapes[self.shape_id().0]
            .get()
            .map_err(|source| GroupError::Shape {
                name: self.name().to_owned(),
                source,
            })
    }

    pub fn rank(&self) -> Result<usize, GroupError> {
        self.dims().map(|d| d.len())
    }

    pub fn element_count(&self) -> Result<u64, GroupError> {
        self.dims()?
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(u64::from(d)))
            .ok_or_else(|| GroupError::ElementCountOverflow(self.name().to_owned()))
    }

    /// Whether both groups alias the same [Shape], not merely equal dims.
    pub fn same_shape_as(&self, other: &Group<'_>) -> bool {
        self.shape_id() == other.shape_id()
    }

    /// A fresh iterator over all of this group's multi-indices.
    pub fn indices(&self) -> Result<MultiIndexIter, GroupError> {
        Ok(MultiIndexIter::new(self.dims()?))
    }
}

impl fmt::Debug for Group<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name())
            .field("id", &self.id)
            .finish()
    }
}

impl fmt::Display for Group<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", tup_description(self.tup(), self.registry))
    }
}

fn tup_description(tup: &EinTup, registry: &GroupRegistry) -> String {
    let dimstring = match registry.shapes[tup.shape.0].get() {
        Ok(dims) => join_into_string(dims, ","),
        Err(_) => "?".to_owned(),
    };
    match tup.shadow_of {
        None => format!("EinTup '{}': [{dimstring}]", tup.name),
        Some(owner) => format!(
            "EinTup '{}': [{dimstring}] (shadowing {})",
            tup.name,
            registry.tup(owner).name
        ),
    }
}

impl MultiIndexIter {
    pub fn new(dims: &[DimSize]) -> Self {
        let next = if dims.contains(&0) {
            None
        } else {
            Some(dims.iter().map(|_| 0).collect())
        };
        MultiIndexIter {
            dims: dims.into(),
            next,
        }
    }
}

impl Iterator for MultiIndexIter {
    type Item = Dims;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for axis in (0..self.dims.len()).rev() {
            advanced[axis] += 1;
            if advanced[axis] < self.dims[axis] {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[axis] = 0;
        }
        // Wrapped around every axis (or there were none): `current` was the last index.
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use smallvec::smallvec;

    #[test]
    fn test_iterates_row_major_and_restarts() {
        let mut reg = GroupRegistry::new();
        let id = reg.maybe_add("batch", None).unwrap();
        reg.set_dims(id, [2, 3]).unwrap();
        let expected: Vec<Dims> = vec![
            smallvec![0, 0],
            smallvec![0, 1],
            smallvec![0, 2],
            smallvec![1, 0],
            smallvec![1, 1],
            smallvec![1, 2],
        ];
        let group = reg.group(id);
        assert_eq!(group.indices().unwrap().collect::<Vec<_>>(), expected);
        assert_eq!(group.indices().unwrap().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_rank_zero_yields_single_empty_index() {
        let indices = MultiIndexIter::new(&[]).collect::<Vec<_>>();
        assert_eq!(indices, vec![Dims::new()]);
    }

    #[test]
    fn test_zero_sized_axis_yields_nothing() {
        assert_eq!(MultiIndexIter::new(&[3, 0, 2]).count(), 0);
    }

    #[test]
    fn test_shadow_aliases_owner_shape() {
        let mut reg = GroupRegistry::new();
        let p = reg.maybe_add("slice", None).unwrap();
        let sh = reg.maybe_add("slice2", Some("slice")).unwrap();
        assert!(reg.group(sh).same_shape_as(&reg.group(p)));
        assert!(!reg.group(sh).is_primary());

        reg.set_dims(p, [7, 8]).unwrap();
        assert!(reg.group(sh).same_shape_as(&reg.group(p)));
        assert_eq!(reg.group(sh).dims().unwrap(), &[7, 8]);

        reg.set_dims(p, [1]).unwrap();
        assert_eq!(reg.group(sh).rank().unwrap(), 1);
    }

    #[test]
    fn test_shadow_set_dims_is_illegal() {
        let mut reg = GroupRegistry::new();
        reg.maybe_add("a", None).unwrap();
        let sh = reg.maybe_add("b", Some("a")).unwrap();
        assert_eq!(
            reg.set_dims(sh, [3]),
            Err(GroupError::IllegalMutation("b".to_owned()))
        );
    }

    #[test]
    fn test_shadow_of_shadow_shares_root_shape() {
        let mut reg = GroupRegistry::new();
        let a = reg.maybe_add("a", None).unwrap();
        reg.maybe_add("b", Some("a")).unwrap();
        let c = reg.maybe_add("c", Some("b")).unwrap();
        reg.set_dims(a, [4]).unwrap();
        assert!(reg.group(c).same_shape_as(&reg.group(a)));
        assert_eq!(reg.group(c).dims().unwrap(), &[4]);
    }

    #[test]
    fn test_equal_dims_are_not_same_shape() {
        let mut reg = GroupRegistry::new();
        let a = reg.maybe_add("a", None).unwrap();
        let b = reg.maybe_add("b", None).unwrap();
        reg.set_dims(a, [2, 2]).unwrap();
        reg.set_dims(b, [2, 2]).unwrap();
        assert!(!reg.group(a).same_shape_as(&reg.group(b)));
    }

    #[test]
    fn test_unknown_owner_is_rejected() {
        let mut reg = GroupRegistry::new();
        assert!(matches!(
            reg.maybe_add("x", Some("nope")),
            Err(GroupError::UnknownOwner { .. })
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_maybe_add_is_idempotent() {
        let mut reg = GroupRegistry::new();
        let a1 = reg.maybe_add("a", None).unwrap();
        let a2 = reg.maybe_add("a", None).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reads_before_set_are_uninitialized() {
        let mut reg = GroupRegistry::new();
        let a = reg.maybe_add("a", None).unwrap();
        assert!(matches!(
            reg.group(a).rank(),
            Err(GroupError::Shape {
                source: ShapeError::Uninitialized,
                ..
            })
        ));
    }

    #[test]
    fn test_set_dim_through_shadow_writes_owner() {
        let mut reg = GroupRegistry::new();
        let a = reg.maybe_add("a", None).unwrap();
        let b = reg.maybe_add("b", Some("a")).unwrap();
        reg.set_dims(a, [3, 3]).unwrap();
        reg.set_dim(b, 1, 5).unwrap();
        assert_eq!(reg.group(a).dims().unwrap(), &[3, 5]);
    }

    #[test]
    fn test_display_marks_shadows() {
        let mut reg = GroupRegistry::new();
        let a = reg.maybe_add("a", None).unwrap();
        let b = reg.maybe_add("b", Some("a")).unwrap();
        assert_eq!(reg.group(b).to_string(), "EinTup 'b': [?] (shadowing a)");
        reg.set_dims(a, [2, 4]).unwrap();
        assert_eq!(reg.group(a).to_string(), "EinTup 'a': [2,4]");
    }

    proptest! {
        #[test]
        fn test_index_count_matches_element_count(
            dims in proptest::collection::vec(0..4u32, 0..5)
        ) {
            let mut reg = GroupRegistry::new();
            let id = reg.maybe_add("g", None).unwrap();
            reg.set_dims(id, dims.iter().copied()).unwrap();
            let group = reg.group(id);
            let count = group.indices().unwrap().count();
            prop_assert_eq!(count as u64, group.element_count().unwrap());
        }

        #[test]
        fn test_indices_are_within_bounds(
            dims in proptest::collection::vec(1..4u32, 0..4)
        ) {
            for idx in MultiIndexIter::new(&dims) {
                prop_assert_eq!(idx.len(), dims.len());
                for (i, d) in idx.iter().zip(&dims) {
                    prop_assert!(i < d);
                }
            }
        }
    }
}
