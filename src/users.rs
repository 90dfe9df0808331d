use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Assistant,
    Professor,
    BusinessAdmin,
    SysAdmin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::SysAdmin | Role::BusinessAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Student => "student",
            Role::Assistant => "assistant",
            Role::Professor => "professor",
            Role::BusinessAdmin => "business_admin",
            Role::SysAdmin => "sys_admin",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
}

impl User {
    pub fn new(id: UserId, username: &str, role: Role) -> Self {
        Self {
            id,
            email: format!("{username}@example.edu"),
            username: username.to_string(),
            role,
            is_active: true,
        }
    }
}

/// Public projection used in rosters and listings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}
