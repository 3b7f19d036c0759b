//! In-memory directory of chat users and rooms.
//!
//! Users live in one authoritative store keyed by JID; the name, mention-name and
//! email indices are derived from it and rewritten together on every upsert, so a
//! lookup through any key always sees the same record. Nothing is ever deleted:
//! stale entries are refreshed the next time the service reports them.

use std::collections::HashMap;

use tracing::debug;

/// Identity record for one chat user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    /// Account-unique handle (local part of the JID).
    pub id: String,
    /// Bare JID.
    pub jid: String,
    /// Display name.
    pub name: String,
    /// Name used in `@mention` tokens.
    pub mention: String,
    pub email: String,
}

/// A group chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Room JID.
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Directory {
    users: HashMap<String, User>,
    by_mention: HashMap<String, String>,
    by_name: HashMap<String, String>,
    by_email: HashMap<String, String>,
    rooms_by_name: HashMap<String, String>,
    rooms_by_id: HashMap<String, String>,
}

/// Drop `key` from a derived index if it still points at `jid`.
fn unindex(index: &mut HashMap<String, String>, key: &str, jid: &str) {
    if index.get(key).map(String::as_str) == Some(jid) {
        index.remove(key);
    }
}

fn reindex(index: &mut HashMap<String, String>, key: &str, jid: &str) {
    if !key.is_empty() {
        index.insert(key.to_string(), jid.to_string());
    }
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user record and all of its index entries.
    ///
    /// Returns `false` (and stores nothing) for a record without a JID.
    pub fn upsert_user(&mut self, user: User) -> bool {
        if user.jid.is_empty() {
            debug!(name = %user.name, "Ignoring user record without a JID");
            return false;
        }

        if let Some(previous) = self.users.remove(&user.jid) {
            unindex(&mut self.by_mention, &previous.mention, &previous.jid);
            unindex(&mut self.by_name, &previous.name, &previous.jid);
            unindex(&mut self.by_email, &previous.email, &previous.jid);
        }

        reindex(&mut self.by_mention, &user.mention, &user.jid);
        reindex(&mut self.by_name, &user.name, &user.jid);
        reindex(&mut self.by_email, &user.email, &user.jid);

        debug!(jid = %user.jid, name = %user.name, mention = %user.mention, "User info stored");
        self.users.insert(user.jid.clone(), user);
        true
    }

    pub fn user_by_jid(&self, jid: &str) -> Option<&User> {
        self.users.get(jid)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.by_name.get(name).and_then(|jid| self.users.get(jid))
    }

    pub fn user_by_mention(&self, mention: &str) -> Option<&User> {
        self.by_mention.get(mention).and_then(|jid| self.users.get(jid))
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.by_email.get(email).and_then(|jid| self.users.get(jid))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Record a room under both its name and its id. Later registrations win in
    /// both directions; an entry displaced on one side is removed from the other.
    pub fn register_room(&mut self, name: &str, id: &str) {
        if let Some(old_id) = self.rooms_by_name.insert(name.to_string(), id.to_string()) {
            if old_id != id {
                unindex(&mut self.rooms_by_id, &old_id, name);
            }
        }
        if let Some(old_name) = self.rooms_by_id.insert(id.to_string(), name.to_string()) {
            if old_name != name {
                unindex(&mut self.rooms_by_name, &old_name, id);
            }
        }
    }

    /// Room id for a display name.
    pub fn room_id(&self, name: &str) -> Option<&str> {
        self.rooms_by_name.get(name).map(String::as_str)
    }

    /// Display name for a room id.
    pub fn room_name(&self, id: &str) -> Option<&str> {
        self.rooms_by_id.get(id).map(String::as_str)
    }

    pub fn room_count(&self) -> usize {
        self.rooms_by_id.len()
    }
}
