//! Role based access decisions.
//!
//! `decide` is a pure function of the actor's role, the requested action and
//! the ownership facts the caller looked up for this request. Nothing here
//! touches storage; the service re-fetches facts on every call.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::errors::{LabError, LabResult};
use crate::users::{Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    ListVms,
    ViewVm,
    ViewVmStats,
    StartVm,
    StopVm,
    ShutdownVm,
    OpenConsole,
    CreateVm,
    AssignVm,
    CreateCourse,
    ListCourses,
    EnrollMember,
    ProvisionCourse,
    ViewCourse,
    ViewCourseStudents,
    ViewCourseAssistants,
    AssignProfessor,
    ListTemplates,
    ListIsos,
    DownloadIso,
    BuildTemplate,
    FinalizeTemplate,
    ViewTask,
    CancelTask,
    ViewAnalytics,
    ListUsers,
    ViewUser,
}

impl Action {
    pub const ALL: [Action; 27] = [
        Action::ListVms,
        Action::ViewVm,
        Action::ViewVmStats,
        Action::StartVm,
        Action::StopVm,
        Action::ShutdownVm,
        Action::OpenConsole,
        Action::CreateVm,
        Action::AssignVm,
        Action::CreateCourse,
        Action::ListCourses,
        Action::EnrollMember,
        Action::ProvisionCourse,
        Action::ViewCourse,
        Action::ViewCourseStudents,
        Action::ViewCourseAssistants,
        Action::AssignProfessor,
        Action::ListTemplates,
        Action::ListIsos,
        Action::DownloadIso,
        Action::BuildTemplate,
        Action::FinalizeTemplate,
        Action::ViewTask,
        Action::CancelTask,
        Action::ViewAnalytics,
        Action::ListUsers,
        Action::ViewUser,
    ];

    fn is_power(self) -> bool {
        matches!(self, Action::StartVm | Action::StopVm | Action::ShutdownVm)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Relationships between the actor and the target of the action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnershipFacts {
    pub owns_vm: bool,
    pub course_professor: bool,
    pub course_assistant: bool,
}

impl OwnershipFacts {
    pub const NONE: OwnershipFacts = OwnershipFacts {
        owns_vm: false,
        course_professor: false,
        course_assistant: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

pub fn decide(role: Role, action: Action, facts: OwnershipFacts) -> Decision {
    use Action::*;

    let allowed = match role {
        Role::SysAdmin => true,
        Role::BusinessAdmin => matches!(
            action,
            ListVms | ViewVm | ViewVmStats | OpenConsole | ListTemplates | ListCourses
                | ViewAnalytics
        ),
        Role::Professor => match action {
            ListVms | ListTemplates | ListIsos | ListCourses | CreateCourse => true,
            CreateVm | EnrollMember | ProvisionCourse | ViewCourse | ViewCourseStudents
            | ViewCourseAssistants => facts.course_professor,
            ViewVm | ViewVmStats | StartVm | StopVm | ShutdownVm | OpenConsole | AssignVm => {
                facts.owns_vm || facts.course_professor
            }
            _ => false,
        },
        Role::Assistant => match action {
            ListVms | ListTemplates | ListCourses => true,
            ViewCourse | ViewCourseStudents => facts.course_assistant,
            ViewVm | ViewVmStats | OpenConsole => facts.owns_vm || facts.course_assistant,
            a if a.is_power() => facts.owns_vm,
            _ => false,
        },
        Role::Student => match action {
            ListVms | ListTemplates | ListCourses => true,
            ViewVm | ViewVmStats | OpenConsole => facts.owns_vm,
            a if a.is_power() => facts.owns_vm,
            _ => false,
        },
    };

    Decision::from(allowed)
}

/// `decide` plus the error the service layer returns on denial.
pub fn authorize(actor: &User, action: Action, facts: OwnershipFacts) -> LabResult<()> {
    if !actor.is_active {
        return Err(LabError::AccessDenied(format!("user {} is inactive", actor.id)));
    }
    match decide(actor.role, action, facts) {
        Decision::Allow => Ok(()),
        Decision::Deny => {
            debug!(user_id = actor.id, role = %actor.role, %action, ?facts, "Access denied");
            Err(LabError::AccessDenied(format!(
                "{} may not perform {action}",
                actor.role
            )))
        }
    }
}
