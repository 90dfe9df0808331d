use serde::{Deserialize, Serialize};

use super::vm::{CourseId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    pub description: Option<String>,
    pub professor_id: UserId,
    /// Hypervisor template cloned for every enrolled student.
    pub template_id: Option<u32>,
}

impl Course {
    /// Courses without a template never auto-provision.
    pub fn provisioning_template(&self) -> Option<u32> {
        self.template_id
    }
}

/// A course before the repository assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCourse {
    pub name: String,
    pub description: Option<String>,
    pub professor_id: UserId,
    pub template_id: Option<u32>,
}
