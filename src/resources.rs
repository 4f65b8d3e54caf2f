//! Resource key builders.
//!
//! Every resource domain shares one key layout:
//!
//! ```text
//! [domain]                          all
//! [domain, "list"]                  lists
//! [domain, "list", {filters}]       list
//! [domain, "detail"]                details
//! [domain, "detail", id]            detail
//! ```
//!
//! so invalidating `lists()` reaches every filtered list and nothing else.

use serde::Serialize;

use crate::cache::{CacheKey, KeyError, KeySegment};

const LIST: &str = "list";
const DETAIL: &str = "detail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceKeys {
    domain: &'static str,
}

impl ResourceKeys {
    pub const DOCUMENTS: Self = Self::new("documents");
    pub const FOLDERS: Self = Self::new("folders");
    pub const NOTIFICATIONS: Self = Self::new("notifications");
    pub const TEAM_MEMBERS: Self = Self::new("team_members");
    pub const WORKFLOWS: Self = Self::new("workflows");
    pub const CHAT_SESSIONS: Self = Self::new("chat_sessions");

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn all(&self) -> CacheKey {
        CacheKey::root(self.domain)
    }

    pub fn lists(&self) -> CacheKey {
        self.all().push(LIST)
    }

    /// A filtered list. Filters serialize to a canonical object segment, so
    /// field order never produces a distinct key.
    pub fn list<F: Serialize + ?Sized>(&self, filters: &F) -> Result<CacheKey, KeyError> {
        self.lists().with_object(filters)
    }

    pub fn details(&self) -> CacheKey {
        self.all().push(DETAIL)
    }

    pub fn detail(&self, id: impl Into<KeySegment>) -> CacheKey {
        self.details().push(id)
    }
}
