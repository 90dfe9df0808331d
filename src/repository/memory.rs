use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use super::{Repository, RepositoryError, VmScope};
use crate::core::{
    Course, CourseId, NewCourse, NewVirtualMachine, UserId, VirtualMachine, VmRecordId,
};
use crate::users::{Role, User};

#[derive(Default)]
struct State {
    users: BTreeMap<UserId, User>,
    courses: BTreeMap<CourseId, Course>,
    students: BTreeSet<(CourseId, UserId)>,
    assistants: BTreeSet<(CourseId, UserId)>,
    vms: BTreeMap<VmRecordId, VirtualMachine>,
    next_vm_id: VmRecordId,
}

/// In-process repository. Good enough for a single instance and for tests.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn put_course(&self, course: Course) {
        self.state.write().await.courses.insert(course.id, course);
    }

    pub async fn vm_count(&self) -> usize {
        self.state.read().await.vms.len()
    }
}

fn members(set: &BTreeSet<(CourseId, UserId)>, users: &BTreeMap<UserId, User>, course: CourseId) -> Vec<User> {
    set.range((course, UserId::MIN)..=(course, UserId::MAX))
        .filter_map(|(_, user)| users.get(user).cloned())
        .collect()
}

fn courses_where(
    set: &BTreeSet<(CourseId, UserId)>,
    courses: &BTreeMap<CourseId, Course>,
    user: UserId,
) -> Vec<Course> {
    set.iter()
        .filter(|(_, u)| *u == user)
        .filter_map(|(c, _)| courses.get(c).cloned())
        .collect()
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| role.map_or(true, |r| u.role == r))
            .cloned()
            .collect())
    }

    async fn course(&self, id: CourseId) -> Result<Option<Course>, RepositoryError> {
        Ok(self.state.read().await.courses.get(&id).cloned())
    }

    async fn list_courses(&self) -> Result<Vec<Course>, RepositoryError> {
        Ok(self.state.read().await.courses.values().cloned().collect())
    }

    async fn insert_course(&self, course: NewCourse) -> Result<Course, RepositoryError> {
        let mut state = self.state.write().await;
        // Seeded courses carry their own ids; continue after the highest.
        let id = state.courses.keys().next_back().map_or(1, |last| last + 1);
        let record = Course {
            id,
            name: course.name,
            description: course.description,
            professor_id: course.professor_id,
            template_id: course.template_id,
        };
        state.courses.insert(id, record.clone());
        Ok(record)
    }

    async fn courses_owned_by(&self, professor: UserId) -> Result<Vec<Course>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .courses
            .values()
            .filter(|c| c.professor_id == professor)
            .cloned()
            .collect())
    }

    async fn courses_assisted_by(&self, assistant: UserId) -> Result<Vec<Course>, RepositoryError> {
        let state = self.state.read().await;
        Ok(courses_where(&state.assistants, &state.courses, assistant))
    }

    async fn courses_enrolled_by(&self, student: UserId) -> Result<Vec<Course>, RepositoryError> {
        let state = self.state.read().await;
        Ok(courses_where(&state.students, &state.courses, student))
    }

    async fn set_course_professor(
        &self,
        course: CourseId,
        professor: UserId,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let entry = state.courses.get_mut(&course).ok_or(RepositoryError::Missing {
            entity: "course",
            key: course.to_string(),
        })?;
        entry.professor_id = professor;
        Ok(())
    }

    async fn enrolled_students(&self, course: CourseId) -> Result<Vec<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(members(&state.students, &state.users, course))
    }

    async fn course_assistants(&self, course: CourseId) -> Result<Vec<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(members(&state.assistants, &state.users, course))
    }

    async fn is_enrolled(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError> {
        Ok(self.state.read().await.students.contains(&(course, user)))
    }

    async fn is_assistant(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError> {
        Ok(self.state.read().await.assistants.contains(&(course, user)))
    }

    async fn enroll_student(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError> {
        Ok(self.state.write().await.students.insert((course, user)))
    }

    async fn add_assistant(&self, course: CourseId, user: UserId) -> Result<bool, RepositoryError> {
        Ok(self.state.write().await.assistants.insert((course, user)))
    }

    async fn vm(&self, id: VmRecordId) -> Result<Option<VirtualMachine>, RepositoryError> {
        Ok(self.state.read().await.vms.get(&id).cloned())
    }

    async fn vm_for_student(
        &self,
        owner: UserId,
        course: CourseId,
    ) -> Result<Option<VirtualMachine>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .vms
            .values()
            .find(|vm| vm.owner_id == owner && vm.course_id == Some(course))
            .cloned())
    }

    async fn list_vms(&self, scope: VmScope) -> Result<Vec<VirtualMachine>, RepositoryError> {
        let state = self.state.read().await;
        let vms = state.vms.values();
        let selected = match scope {
            VmScope::All => vms.cloned().collect(),
            VmScope::OwnedBy(owner) => vms.filter(|vm| vm.owner_id == owner).cloned().collect(),
            VmScope::InCourses(courses) => vms
                .filter(|vm| vm.course_id.is_some_and(|c| courses.contains(&c)))
                .cloned()
                .collect(),
        };
        Ok(selected)
    }

    async fn insert_vm(&self, vm: NewVirtualMachine) -> Result<VirtualMachine, RepositoryError> {
        let mut state = self.state.write().await;
        let taken = state
            .vms
            .values()
            .any(|v| v.hypervisor_id == vm.hypervisor_id && v.backend_vm_id == vm.backend_vm_id);
        if taken {
            return Err(RepositoryError::Duplicate {
                entity: "vm",
                key: format!("{}/{}", vm.hypervisor_id, vm.backend_vm_id),
            });
        }
        state.next_vm_id += 1;
        let record = VirtualMachine {
            id: state.next_vm_id,
            backend_vm_id: vm.backend_vm_id,
            name: vm.name,
            status: vm.status,
            owner_id: vm.owner_id,
            course_id: vm.course_id,
            hypervisor_id: vm.hypervisor_id,
            details: vm.details,
            created_at: Utc::now(),
        };
        state.vms.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_vm(&self, vm: &VirtualMachine) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.vms.get_mut(&vm.id) {
            Some(existing) => {
                *existing = vm.clone();
                Ok(())
            }
            None => Err(RepositoryError::Missing {
                entity: "vm",
                key: vm.id.to_string(),
            }),
        }
    }
}
