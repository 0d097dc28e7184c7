//! Identity records and the process-wide user/group registry.
//!
//! Warp9 carries numeric uid/gid on the wire instead of user-name strings;
//! resolving those numbers to display names and group membership is local
//! policy. This registry mirrors the reference implementation's
//! `w9identity.go`: lookups by numeric id, a default registry seeded with a
//! placeholder `none`/`noworld` pair, and lazy synthesis of a `userN`/
//! `groupN` placeholder name on a miss so identifiers always round-trip to
//! *some* display name.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub name: String,
    /// Group ids this user belongs to, per `w9user.Groups`.
    pub groups: Vec<u32>,
}

impl User {
    /// Mirrors `w9user.IsMember`: true when `group.id` is among this user's
    /// groups.
    pub fn is_member(&self, group: &Group) -> bool {
        self.groups.contains(&group.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    pub name: String,
}

struct Entry {
    name: String,
    groups: Vec<u32>,
}

struct Registry {
    users: HashMap<u32, Entry>,
    groups: HashMap<u32, String>,
}

static REGISTRY: std::sync::OnceLock<RwLock<Registry>> = std::sync::OnceLock::new();

/// The default registry, seeded with Plan 9's conventional anonymous
/// identity: uid 0 is `none`, a member of gid 0, `noworld`.
fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| {
        let mut users = HashMap::new();
        users.insert(0, Entry { name: "none".to_owned(), groups: vec![0] });
        let mut groups = HashMap::new();
        groups.insert(0, "noworld".to_owned());
        RwLock::new(Registry { users, groups })
    })
}

/// Registers (or overwrites) a user's display name and group membership.
pub fn add_user(id: u32, name: impl Into<String>, groups: Vec<u32>) {
    registry().write().unwrap().users.insert(id, Entry { name: name.into(), groups });
}

/// Registers (or overwrites) a group's display name.
pub fn add_group(id: u32, name: impl Into<String>) {
    registry().write().unwrap().groups.insert(id, name.into());
}

/// Looks up a user by id, synthesizing `userN` (with no group memberships)
/// on a miss.
pub fn user(id: u32) -> User {
    let reg = registry().read().unwrap();
    match reg.users.get(&id) {
        Some(entry) => User { id, name: entry.name.clone(), groups: entry.groups.clone() },
        None => User { id, name: format!("user{}", id), groups: Vec::new() },
    }
}

/// Looks up a group by id, synthesizing `groupN` on a miss.
pub fn group(id: u32) -> Group {
    let name = registry()
        .read()
        .unwrap()
        .groups
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("group{}", id));
    Group { id, name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_synthesizes_placeholder() {
        let u = user(999_001);
        assert_eq!(u.name, "user999001");
        assert!(u.groups.is_empty());
    }

    #[test]
    fn registered_name_and_groups_are_returned() {
        add_group(20, "staff");
        add_user(501, "larry", vec![20]);
        let u = user(501);
        assert_eq!(u.name, "larry");
        assert!(u.is_member(&group(20)));
        assert!(!u.is_member(&group(1)));
    }

    #[test]
    fn default_registry_seeds_none_and_noworld() {
        let u = user(0);
        assert_eq!(u.name, "none");
        let g = group(0);
        assert_eq!(g.name, "noworld");
        assert!(u.is_member(&g));
    }
}
