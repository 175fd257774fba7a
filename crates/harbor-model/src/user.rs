//! The simple user catalog.

use serde::{Deserialize, Serialize};

/// A control-plane user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier for the user.
    pub name: String,
    pub password: String,
}

/// Name of the built-in system account used for agent-to-master calls.
pub const SYSTEM_USER_NAME: &str = "system_user";
