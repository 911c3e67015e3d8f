//! Trigger driver boundary
//!
//! A trigger driver logs into the platform's admin UI and requests one
//! export per category. The browser automation itself lives outside this
//! crate; [`CommandTriggerDriver`] talks to it over a JSON pipe.

mod command;

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{Category, DateRange, TriggerReport};

pub use command::CommandTriggerDriver;

/// Login for the platform's admin UI
#[derive(Clone, Default)]
pub struct PlatformCredentials {
    pub username: String,
    pub password: String,
}

impl PlatformCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Requests exports from the platform
///
/// Implementations must treat categories independently: a failure for one
/// category goes into `TriggerReport::failed` and must not prevent the
/// others from being requested. An `Err` means the driver could not run
/// at all (e.g. login failed) and fails every category.
pub trait TriggerDriver: Send + Sync {
    fn trigger(
        &self,
        credentials: &PlatformCredentials,
        windows: &BTreeMap<Category, DateRange>,
    ) -> Result<TriggerReport>;
}
