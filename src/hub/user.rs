//! Hub user table and identities.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Cid;

/// Identity fields advertised by a user (or ourselves)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Display nick
    pub nick: String,
    /// Stable client id; NMDC peers have none
    pub cid: Option<Cid>,
    /// Free-text description
    pub description: String,
    /// Advertised share size in bytes
    pub share_size: u64,
    /// Advertised upload slots
    pub slots: u32,
    /// Remote address as reported by the hub
    pub ip: Option<String>,
    /// Hub operator
    pub operator: bool,
    /// Registered on this hub
    pub registered: bool,
    /// Advertises MCN support
    pub mcn: bool,
}

/// A user currently online on one hub, keyed by the hub-local short id
#[derive(Clone, Debug)]
pub struct OnlineUser {
    /// Hub-local short id (ADC SID; synthesised for NMDC)
    pub sid: u32,
    /// Last advertised identity
    pub identity: Identity,
}

/// Per-class user counts for hub statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserCounts {
    /// Unregistered users
    pub regular: usize,
    /// Registered users
    pub registered: usize,
    /// Operators
    pub ops: usize,
}

/// The user table of one hub session
#[derive(Debug, Default)]
pub struct UserTable {
    users: HashMap<u32, OnlineUser>,
}

impl UserTable {
    /// Insert or update a user. Returns true when the user was new.
    pub fn put(&mut self, sid: u32, identity: Identity) -> bool {
        match self.users.get_mut(&sid) {
            Some(existing) => {
                existing.identity = identity;
                false
            }
            None => {
                self.users.insert(sid, OnlineUser { sid, identity });
                true
            }
        }
    }

    /// Remove a user by short id
    pub fn remove(&mut self, sid: u32) -> Option<OnlineUser> {
        self.users.remove(&sid)
    }

    /// Lookup by short id
    pub fn get(&self, sid: u32) -> Option<&OnlineUser> {
        self.users.get(&sid)
    }

    /// Lookup by nick (NMDC commands are nick-addressed)
    pub fn by_nick(&self, nick: &str) -> Option<&OnlineUser> {
        self.users.values().find(|u| u.identity.nick == nick)
    }

    /// Lookup by client id
    pub fn by_cid(&self, cid: &Cid) -> Option<&OnlineUser> {
        self.users.values().find(|u| u.identity.cid.as_ref() == Some(cid))
    }

    /// Current per-class counts
    pub fn counts(&self) -> UserCounts {
        let mut counts = UserCounts::default();
        for user in self.users.values() {
            if user.identity.operator {
                counts.ops += 1;
            } else if user.identity.registered {
                counts.registered += 1;
            } else {
                counts.regular += 1;
            }
        }
        counts
    }

    /// Number of users online
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True when nobody is online
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Drop everyone (disconnect)
    pub fn clear(&mut self) {
        self.users.clear();
    }
}
