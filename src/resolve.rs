//! Name to entity resolution over a freshly fetched listing.
//!
//! Names are expected to be unique. A name shared by several entries is an
//! error, never a silent pick.

use std::collections::HashSet;

use crate::{
    error::{Error, Result},
    records::{Entity, EntityRef},
};

/// Rejects entities that have not been assigned an id yet.
pub fn require_id<T: Entity>(entity: T) -> Result<T> {
    match entity.id() {
        Some(_) => Ok(entity),
        None => Err(Error::IncompleteReference(format!(
            "{} {} has no id",
            T::KIND,
            entity.name().unwrap_or("<unnamed>")
        ))),
    }
}

fn matching<'a, T: Entity>(name: &'a str, candidates: &'a [T]) -> impl Iterator<Item = &'a T> {
    candidates.iter().filter(move |c| c.name() == Some(name))
}

/// Picks the single entry called `name`.
pub fn select_one<T: Entity + Clone>(name: &str, candidates: &[T]) -> Result<T> {
    let found: Vec<&T> = matching(name, candidates).collect();
    match found.as_slice() {
        [] => Err(Error::NotFound {
            kind: T::KIND,
            names: vec![name.to_string()],
        }),
        [one] => require_id((*one).clone()),
        many => Err(Error::AmbiguousEntity {
            kind: T::KIND,
            name: name.to_string(),
            count: many.len(),
        }),
    }
}

/// Picks one entry per name, in the order requested.
///
/// Fails with every unresolved name when any are missing. A name requested
/// twice is rejected.
pub fn select_all<T: Entity + Clone>(names: &[String], candidates: &[T]) -> Result<Vec<T>> {
    let mut seen = HashSet::new();
    if let Some(repeated) = names.iter().find(|name| !seen.insert(name.as_str())) {
        return Err(Error::InvalidArgument(format!(
            "{} {repeated} is requested more than once",
            T::KIND
        )));
    }

    let mut resolved = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in names {
        match select_one(name, candidates) {
            Ok(entity) => resolved.push(entity),
            Err(Error::NotFound { .. }) => missing.push(name.clone()),
            Err(e) => return Err(e),
        }
    }
    if !missing.is_empty() {
        return Err(Error::NotFound {
            kind: T::KIND,
            names: missing,
        });
    }
    Ok(resolved)
}

/// Names referenced by `refs`, in order.
pub fn names<T>(refs: &[EntityRef<T>]) -> Vec<String> {
    refs.iter()
        .filter_map(|r| match r {
            EntityRef::Name(name) => Some(name.clone()),
            EntityRef::Entity(_) => None,
        })
        .collect()
}

/// Replaces every name in `refs` with the next entry of `resolved`.
///
/// `resolved` must line up with [`names`] of the same refs.
pub fn merge<T: Entity>(refs: Vec<EntityRef<T>>, resolved: Vec<T>) -> Result<Vec<T>> {
    let mut resolved = resolved.into_iter();
    refs.into_iter()
        .map(|r| match r {
            EntityRef::Entity(entity) => require_id(entity),
            EntityRef::Name(name) => resolved.next().ok_or_else(|| Error::NotFound {
                kind: T::KIND,
                names: vec![name],
            }),
        })
        .collect()
}
