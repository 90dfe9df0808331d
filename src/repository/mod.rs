pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    Course, CourseId, NewCourse, NewVirtualMachine, UserId, VirtualMachine, VmRecordId,
};
use crate::users::{Role, User};

pub use memory::MemoryRepository;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{entity} {key} does not exist")]
    Missing { entity: &'static str, key: String },

    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },

    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Which VM records a listing should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmScope {
    All,
    OwnedBy(UserId),
    InCourses(Vec<CourseId>),
}

/// Persistence seam. Everything the orchestration layer reads or writes goes
/// through here; the storage technology is somebody else's problem.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;
    /// All users, optionally only those holding `role`.
    async fn list_users(&self, role: Option<Role>) -> Result<Vec<User>, RepositoryError>;

    async fn course(&self, id: CourseId) -> Result<Option<Course>, RepositoryError>;
    async fn list_courses(&self) -> Result<Vec<Course>, RepositoryError>;
    async fn insert_course(&self, course: NewCourse) -> Result<Course, RepositoryError>;
    async fn courses_owned_by(&self, professor: UserId) -> Result<Vec<Course>, RepositoryError>;
    async fn courses_assisted_by(&self, assistant: UserId) -> Result<Vec<Course>, RepositoryError>;
    async fn courses_enrolled_by(&self, student: UserId) -> Result<Vec<Course>, RepositoryError>;
    async fn set_course_professor(
        &self,
        course: CourseId,
        professor: UserId,
    ) -> Result<(), RepositoryError>;

    async fn enrolled_students(&self, course: CourseId) -> Result<Vec<User>, RepositoryError>;
    async fn course_assistants(&self, course: CourseId) -> Result<Vec<User>, RepositoryError>;
    async fn is_enrolled(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError>;
    async fn is_assistant(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError>;
    /// Returns false when the user was already enrolled.
    async fn enroll_student(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError>;
    /// Returns false when the user was already assisting.
    async fn add_assistant(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError>;

    async fn vm(&self, id: VmRecordId) -> Result<Option<VirtualMachine>, RepositoryError>;
    async fn vm_for_student(
        &self,
        owner: UserId,
        course: CourseId,
    ) -> Result<Option<VirtualMachine>, RepositoryError>;
    async fn list_vms(&self, scope: VmScope) -> Result<Vec<VirtualMachine>, RepositoryError>;
    /// Fails with `Duplicate` when the hypervisor already has a record for
    /// the same backend VM id.
    async fn insert_vm(&self, vm: NewVirtualMachine) -> Result<VirtualMachine, RepositoryError>;
    async fn update_vm(&self, vm: &VirtualMachine) -> Result<(), RepositoryError>;
}
