//! Bidirectional index of which users have which file paths open.
//!
//! Invariant: `path ∈ open_files(user) ⟺ user ∈ subscribers(path)`.
//! A path entry exists only while it has at least one subscriber.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::registry::UserId;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_path: BTreeMap<String, BTreeSet<UserId>>,
    by_user: HashMap<UserId, BTreeSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a user with no open files.
    pub fn track_user(&mut self, user_id: UserId) {
        self.by_user.entry(user_id).or_default();
    }

    /// Mark `path` open for `user_id`. Returns `false` if it already was.
    pub fn open(&mut self, user_id: UserId, path: &str) -> bool {
        let added = self
            .by_path
            .entry(path.to_string())
            .or_default()
            .insert(user_id);
        self.by_user
            .entry(user_id)
            .or_default()
            .insert(path.to_string());
        added
    }

    /// Mark `path` closed for `user_id`. Returns `false` if it was not open.
    pub fn close(&mut self, user_id: UserId, path: &str) -> bool {
        let had_path = self
            .by_user
            .get_mut(&user_id)
            .is_some_and(|paths| paths.remove(path));
        if !had_path {
            return false;
        }
        self.unsubscribe(user_id, path);
        true
    }

    /// Drop a user from every path it had open. Returns the paths it had.
    pub fn remove_user(&mut self, user_id: &UserId) -> BTreeSet<String> {
        let paths = self.by_user.remove(user_id).unwrap_or_default();
        for path in &paths {
            self.unsubscribe(*user_id, path);
        }
        paths
    }

    /// Current subscribers of `path`, in id order. Empty if nobody has it open.
    pub fn subscribers(&self, path: &str) -> Vec<UserId> {
        self.by_path
            .get(path)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn open_files(&self, user_id: &UserId) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every watched path with its subscribers.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<UserId>> {
        self.by_path
            .iter()
            .map(|(path, users)| (path.clone(), users.iter().copied().collect()))
            .collect()
    }

    /// Check both directions agree and no empty path entry is left behind.
    pub fn is_symmetric(&self) -> bool {
        let forward = self.by_path.iter().all(|(path, users)| {
            !users.is_empty()
                && users.iter().all(|user| {
                    self.by_user
                        .get(user)
                        .is_some_and(|paths| paths.contains(path))
                })
        });
        let backward = self.by_user.iter().all(|(user, paths)| {
            paths.iter().all(|path| {
                self.by_path
                    .get(path)
                    .is_some_and(|users| users.contains(user))
            })
        });
        forward && backward
    }

    fn unsubscribe(&mut self, user_id: UserId, path: &str) {
        if let Some(users) = self.by_path.get_mut(path) {
            users.remove(&user_id);
            if users.is_empty() {
                self.by_path.remove(path);
            }
        }
    }
}
