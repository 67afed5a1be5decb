//! Id tag authorization for Authorize and StartTransaction

use crate::config::AuthConfig;
use async_trait::async_trait;
use ocpp_types::common::{AuthorizationStatus, IdTagInfo};
use std::collections::HashSet;

/// Decides whether an id tag may charge
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, id_tag: &str) -> IdTagInfo;
}

/// Accepts every id tag
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _id_tag: &str) -> IdTagInfo {
        IdTagInfo::with_status(AuthorizationStatus::Accepted)
    }
}

/// Static allow/deny lists from the configuration file.
///
/// Blocked wins over expired, expired over accepted. Tags on no list get
/// `Accepted` or `Invalid` depending on `accept_unknown`.
#[derive(Debug, Clone)]
pub struct ConfiguredAuthorizer {
    accept_unknown: bool,
    accepted: HashSet<String>,
    blocked: HashSet<String>,
    expired: HashSet<String>,
}

impl ConfiguredAuthorizer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            accept_unknown: config.accept_unknown,
            accepted: config.accepted_id_tags.iter().cloned().collect(),
            blocked: config.blocked_id_tags.iter().cloned().collect(),
            expired: config.expired_id_tags.iter().cloned().collect(),
        }
    }

    fn status_for(&self, id_tag: &str) -> AuthorizationStatus {
        if self.blocked.contains(id_tag) {
            AuthorizationStatus::Blocked
        } else if self.expired.contains(id_tag) {
            AuthorizationStatus::Expired
        } else if self.accepted.contains(id_tag) || self.accept_unknown {
            AuthorizationStatus::Accepted
        } else {
            AuthorizationStatus::Invalid
        }
    }
}

#[async_trait]
impl Authorizer for ConfiguredAuthorizer {
    async fn authorize(&self, id_tag: &str) -> IdTagInfo {
        IdTagInfo::with_status(self.status_for(id_tag))
    }
}
