//! Per-object edit locks.
//!
//! One mutex guards the whole table; every check-and-mutate happens
//! under it and never spans an await. Tree topology is passed in as a
//! snapshot so the table stays ignorant of session internals.
//!
//! Discipline:
//! - a read lock blocks writes but not other reads;
//! - no object is write-locked by two users;
//! - a tree write lock excludes any lock anywhere beneath its root.

use std::collections::HashMap;

use parking_lot::Mutex;

use arcor_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topology
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parent/child snapshot of the currently open session's entities.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    parent: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

impl Topology {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut topology = Topology::default();
        for (child, parent) in pairs {
            topology
                .children
                .entry(parent.clone())
                .or_default()
                .push(child.clone());
            topology.parent.insert(child, parent);
        }
        topology
    }

    /// Walk from the immediate parent to the root.
    pub fn ancestors<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> {
        let mut current = self.parent.get(id).map(String::as_str);
        std::iter::from_fn(move || {
            let here = current?;
            current = self.parent.get(here).map(String::as_str);
            Some(here)
        })
    }

    /// Every entity beneath `id`, depth first.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if let Some(children) = self.children.get(node) {
                for child in children {
                    out.push(child.clone());
                    stack.push(child);
                }
            }
        }
        out
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parent.contains_key(id) || self.children.contains_key(id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone)]
struct Entry {
    readers: Vec<String>,
    writer: Option<String>,
    /// The write lock covers the whole subtree rooted here.
    tree: bool,
}

impl Entry {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ── queries ──────────────────────────────────────────────────────

    /// Is `id` covered by a write lock held by `user` (directly or via
    /// an ancestor tree lock)?
    pub fn is_write_locked_by(&self, id: &str, user: &str, topology: &Topology) -> bool {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(id) {
            if entry.writer.as_deref() == Some(user) {
                return true;
            }
        }
        topology.ancestors(id).any(|ancestor| {
            entries
                .get(ancestor)
                .map(|e| e.tree && e.writer.as_deref() == Some(user))
                .unwrap_or(false)
        })
    }

    /// Would a mutation of `id` by `user` conflict with someone else's
    /// lock? (The caller's own locks never conflict.)
    pub fn conflicts_for(&self, id: &str, user: &str, topology: &Topology) -> Option<String> {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(id) {
            if let Some(ref writer) = entry.writer {
                if writer != user {
                    return Some(format!("Object {id} is locked by {writer}."));
                }
            }
            if let Some(reader) = entry.readers.iter().find(|r| r.as_str() != user) {
                return Some(format!("Object {id} is read-locked by {reader}."));
            }
        }
        for ancestor in topology.ancestors(id) {
            if let Some(entry) = entries.get(ancestor) {
                if entry.tree {
                    if let Some(ref writer) = entry.writer {
                        if writer != user {
                            return Some(format!("Tree of {ancestor} is locked by {writer}."));
                        }
                    }
                }
            }
        }
        None
    }

    /// Ids currently locked by the given user.
    pub fn locked_by(&self, user: &str) -> Vec<String> {
        let entries = self.entries.lock();
        let mut out: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                e.writer.as_deref() == Some(user) || e.readers.iter().any(|r| r == user)
            })
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // ── operations ───────────────────────────────────────────────────

    pub fn read_lock(&self, id: &str, user: &str, topology: &Topology) -> Result<()> {
        let mut entries = self.entries.lock();
        check_read(&entries, id, topology)?;
        entries
            .entry(id.to_owned())
            .or_default()
            .readers
            .push(user.to_owned());
        Ok(())
    }

    /// Validation of [`Self::read_lock`] without the mutation (dry run).
    pub fn check_read_lock(&self, id: &str, topology: &Topology) -> Result<()> {
        check_read(&self.entries.lock(), id, topology)
    }

    pub fn read_unlock(&self, id: &str, user: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        check_read_unlock(&entries, id, user)?;
        let entry = entries.get_mut(id).expect("checked above");
        let pos = entry
            .readers
            .iter()
            .position(|r| r == user)
            .expect("checked above");
        entry.readers.remove(pos);
        if entry.is_free() {
            entries.remove(id);
        }
        Ok(())
    }

    pub fn check_read_unlock(&self, id: &str, user: &str) -> Result<()> {
        check_read_unlock(&self.entries.lock(), id, user)
    }

    pub fn write_lock(&self, id: &str, user: &str, tree: bool, topology: &Topology) -> Result<()> {
        let mut entries = self.entries.lock();
        check_write(&entries, id, tree, topology)?;
        let entry = entries.entry(id.to_owned()).or_default();
        entry.writer = Some(user.to_owned());
        entry.tree = tree;
        Ok(())
    }

    /// Validation of [`Self::write_lock`] without the mutation (dry run).
    pub fn check_write_lock(&self, id: &str, tree: bool, topology: &Topology) -> Result<()> {
        check_write(&self.entries.lock(), id, tree, topology)
    }

    pub fn write_unlock(&self, id: &str, user: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        check_write_unlock(&entries, id, user)?;
        let entry = entries.get_mut(id).expect("checked above");
        entry.writer = None;
        entry.tree = false;
        if entry.is_free() {
            entries.remove(id);
        }
        Ok(())
    }

    pub fn check_write_unlock(&self, id: &str, user: &str) -> Result<()> {
        check_write_unlock(&self.entries.lock(), id, user)
    }

    /// Upgrade a plain write lock to a tree lock or back down.
    pub fn update_lock(&self, id: &str, user: &str, tree: bool, topology: &Topology) -> Result<()> {
        let mut entries = self.entries.lock();
        check_update(&entries, id, user, tree, topology)?;
        entries.get_mut(id).expect("checked above").tree = tree;
        Ok(())
    }

    pub fn check_update_lock(
        &self,
        id: &str,
        user: &str,
        tree: bool,
        topology: &Topology,
    ) -> Result<()> {
        check_update(&self.entries.lock(), id, user, tree, topology)
    }

    /// Remove every entry; used when the session closes.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop everything a user holds; returns the affected ids.
    pub fn release_user(&self, user: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let mut released = Vec::new();
        entries.retain(|id, entry| {
            let mut touched = false;
            if entry.writer.as_deref() == Some(user) {
                entry.writer = None;
                entry.tree = false;
                touched = true;
            }
            let before = entry.readers.len();
            entry.readers.retain(|r| r != user);
            touched |= entry.readers.len() != before;
            if touched {
                released.push(id.clone());
            }
            !entry.is_free()
        });
        released.sort();
        released
    }
}

// ── validation shared by the committing and dry-run paths ───────────

fn check_read(entries: &HashMap<String, Entry>, id: &str, topology: &Topology) -> Result<()> {
    if let Some(entry) = entries.get(id) {
        if let Some(ref writer) = entry.writer {
            return Err(Error::Lock(format!("Object {id} is locked by {writer}.")));
        }
    }
    if let Some((ancestor, writer)) = covering_tree_writer(entries, id, topology) {
        return Err(Error::Lock(format!(
            "Tree of {ancestor} is locked by {writer}."
        )));
    }
    Ok(())
}

fn check_read_unlock(entries: &HashMap<String, Entry>, id: &str, user: &str) -> Result<()> {
    let entry = entries
        .get(id)
        .ok_or_else(|| Error::Lock(format!("Object {id} is not locked.")))?;
    if !entry.readers.iter().any(|r| r == user) {
        return Err(Error::Lock(format!(
            "Object {id} is not read-locked by {user}."
        )));
    }
    Ok(())
}

fn check_write(
    entries: &HashMap<String, Entry>,
    id: &str,
    tree: bool,
    topology: &Topology,
) -> Result<()> {
    if let Some(entry) = entries.get(id) {
        if !entry.is_free() {
            return Err(Error::Lock(format!("Object {id} is already locked.")));
        }
    }
    if let Some((ancestor, writer)) = covering_tree_writer(entries, id, topology) {
        return Err(Error::Lock(format!(
            "Tree of {ancestor} is locked by {writer}."
        )));
    }
    if tree {
        check_subtree_free(entries, id, topology)?;
    }
    Ok(())
}

fn check_write_unlock(entries: &HashMap<String, Entry>, id: &str, user: &str) -> Result<()> {
    let entry = entries
        .get(id)
        .ok_or_else(|| Error::Lock(format!("Object {id} is not locked.")))?;
    if entry.writer.as_deref() != Some(user) {
        return Err(Error::Lock(format!(
            "Object {id} is not write-locked by {user}."
        )));
    }
    Ok(())
}

fn check_update(
    entries: &HashMap<String, Entry>,
    id: &str,
    user: &str,
    tree: bool,
    topology: &Topology,
) -> Result<()> {
    let holds = entries
        .get(id)
        .map(|e| e.writer.as_deref() == Some(user))
        .unwrap_or(false);
    if !holds {
        return Err(Error::Lock(format!(
            "Object {id} is not write-locked by {user}."
        )));
    }
    if tree {
        check_subtree_free(entries, id, topology)?;
    }
    Ok(())
}

fn check_subtree_free(
    entries: &HashMap<String, Entry>,
    id: &str,
    topology: &Topology,
) -> Result<()> {
    for descendant in topology.descendants(id) {
        if entries.get(&descendant).map(|e| !e.is_free()).unwrap_or(false) {
            return Err(Error::Lock(format!(
                "Cannot lock tree of {id}: {descendant} is locked."
            )));
        }
    }
    Ok(())
}

/// The nearest ancestor of `id` holding a tree write lock, if any.
fn covering_tree_writer<'a>(
    entries: &'a HashMap<String, Entry>,
    id: &str,
    topology: &Topology,
) -> Option<(String, &'a str)> {
    for ancestor in topology.ancestors(id) {
        if let Some(entry) = entries.get(ancestor) {
            if entry.tree {
                if let Some(ref writer) = entry.writer {
                    return Some((ancestor.to_owned(), writer.as_str()));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// scene ── obj ── ap ── act
    fn topology() -> Topology {
        Topology::from_pairs([
            ("obj".to_owned(), "scene".to_owned()),
            ("ap".to_owned(), "obj".to_owned()),
            ("act".to_owned(), "ap".to_owned()),
        ])
    }

    #[test]
    fn write_locks_are_exclusive() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", false, &topo).unwrap();
        assert!(table.write_lock("obj", "u2", false, &topo).is_err());
        assert!(table.write_lock("obj", "u1", false, &topo).is_err());
        table.write_unlock("obj", "u1").unwrap();
        table.write_lock("obj", "u2", false, &topo).unwrap();
    }

    #[test]
    fn readers_share_but_block_writers() {
        let table = LockTable::new();
        let topo = topology();
        table.read_lock("obj", "u1", &topo).unwrap();
        table.read_lock("obj", "u2", &topo).unwrap();
        assert!(table.write_lock("obj", "u3", false, &topo).is_err());
        table.read_unlock("obj", "u1").unwrap();
        assert!(table.write_lock("obj", "u3", false, &topo).is_err());
        table.read_unlock("obj", "u2").unwrap();
        table.write_lock("obj", "u3", false, &topo).unwrap();
    }

    #[test]
    fn tree_lock_excludes_the_subtree() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", true, &topo).unwrap();
        // Everything beneath obj is covered.
        assert!(table.read_lock("ap", "u2", &topo).is_err());
        assert!(table.write_lock("act", "u2", false, &topo).is_err());
        // Sibling space outside the subtree is unaffected.
        table.read_lock("scene", "u2", &topo).unwrap();
        // The owner's coverage query sees the whole subtree.
        assert!(table.is_write_locked_by("act", "u1", &topo));
        assert!(!table.is_write_locked_by("act", "u2", &topo));
    }

    #[test]
    fn tree_lock_requires_empty_subtree() {
        let table = LockTable::new();
        let topo = topology();
        table.read_lock("act", "u2", &topo).unwrap();
        assert!(table.write_lock("obj", "u1", true, &topo).is_err());
        table.read_unlock("act", "u2").unwrap();
        table.write_lock("obj", "u1", true, &topo).unwrap();
    }

    #[test]
    fn upgrade_and_downgrade() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", false, &topo).unwrap();
        // Plain lock does not cover children.
        table.read_lock("ap", "u2", &topo).unwrap();
        // Upgrade is blocked while a descendant is locked.
        assert!(table.update_lock("obj", "u1", true, &topo).is_err());
        table.read_unlock("ap", "u2").unwrap();
        table.update_lock("obj", "u1", true, &topo).unwrap();
        assert!(table.read_lock("ap", "u2", &topo).is_err());
        // Downgrade frees the subtree again.
        table.update_lock("obj", "u1", false, &topo).unwrap();
        table.read_lock("ap", "u2", &topo).unwrap();
    }

    #[test]
    fn release_user_empties_the_table() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", true, &topo).unwrap();
        table.read_lock("scene", "u1", &topo).unwrap();
        table.read_lock("scene", "u2", &topo).unwrap();

        let released = table.release_user("u1");
        assert_eq!(released, vec!["obj".to_owned(), "scene".to_owned()]);
        assert!(!table.is_empty());

        let released = table.release_user("u2");
        assert_eq!(released, vec!["scene".to_owned()]);
        assert!(table.is_empty());
    }

    #[test]
    fn conflicts_ignore_own_locks() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", false, &topo).unwrap();
        assert!(table.conflicts_for("obj", "u1", &topo).is_none());
        assert!(table.conflicts_for("obj", "u2", &topo).is_some());

        table.write_unlock("obj", "u1").unwrap();
        table.read_lock("obj", "u2", &topo).unwrap();
        assert!(table.conflicts_for("obj", "u1", &topo).is_some());
    }

    #[test]
    fn unlock_requires_matching_owner() {
        let table = LockTable::new();
        let topo = topology();
        table.write_lock("obj", "u1", false, &topo).unwrap();
        assert!(table.write_unlock("obj", "u2").is_err());
        assert!(table.read_unlock("obj", "u1").is_err());
        table.write_unlock("obj", "u1").unwrap();
    }
}
