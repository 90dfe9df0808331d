//! Request-level entry points.
//!
//! Every operation follows the same shape: load the actor, fetch the facts
//! the decision needs, consult `access::authorize`, then act on the
//! repository and the hypervisor. Facts are never cached between calls.

use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{authorize, Action, OwnershipFacts};
use crate::billing::CostEstimate;
use crate::core::{
    BackendVmId, Course, CourseId, HypervisorId, NewCourse, NewVirtualMachine, UserId,
    VirtualMachine, VmDetailsBag, VmRecordId, VmStatus,
};
use crate::errors::{HypervisorError, LabError, LabResult};
use crate::hypervisor::{
    BackendStatus, CloneRequest, ClusterAnalytics, ConsoleTicket, CreatedVm, HypervisorClient,
    IsoBuildConfig, IsoImage, TaskHandle, TaskState, TaskTracker, VmStats, VmSummary,
};
use crate::provisioning::{
    BulkProvisioning, ProvisionDefaults, ProvisionTargets, ProvisioningOrchestrator,
};
use crate::repository::{Repository, VmScope};
use crate::users::{Role, User, UserSummary};

/// Log lines shown with a task status.
pub const TASK_LOG_TAIL: usize = 5;
pub const DEFAULT_ISO_STORAGE: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDefaults {
    pub cpu: u32,
    pub memory_mib: u64,
    pub disk_size: String,
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            cpu: 2,
            memory_mib: 2048,
            disk_size: "32G".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub hypervisor_id: HypervisorId,
    pub provisioning: ProvisionDefaults,
    pub templates: TemplateDefaults,
    pub default_task_node: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            hypervisor_id: 1,
            provisioning: ProvisionDefaults::default(),
            templates: TemplateDefaults::default(),
            default_task_node: "pve".to_string(),
        }
    }
}

fn default_vm_cpu() -> u32 {
    2
}

fn default_vm_memory() -> u64 {
    2048
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub template_id: u32,
    pub course_id: CourseId,
    #[serde(default = "default_vm_cpu")]
    pub cpu: u32,
    #[serde(default = "default_vm_memory")]
    pub memory: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCourseRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub template_id: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignVmRequest {
    pub email: String,
    #[serde(default)]
    pub course_id: Option<CourseId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildTemplateRequest {
    pub name: String,
    pub iso_file: String,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub disk_size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadIsoRequest {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub storage: Option<String>,
}

/// A VM record as shown to a caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmView {
    pub id: VmRecordId,
    pub name: String,
    pub vm_id: BackendVmId,
    pub status: VmStatus,
    pub ip_address: Option<String>,
    pub owner_email: Option<String>,
    pub course_name: Option<String>,
    pub details: VmDetailsBag,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PowerReceipt {
    pub vm_id: VmRecordId,
    pub status: VmStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmStatsView {
    #[serde(flatten)]
    pub stats: VmStats,
    pub cost_estimate: CostEstimate,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsoleView {
    pub ticket: ConsoleTicket,
    pub direct_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchReceipt {
    pub batch_id: Uuid,
    pub scheduled: usize,
}

impl From<&BulkProvisioning> for BatchReceipt {
    fn from(batch: &BulkProvisioning) -> Self {
        Self {
            batch_id: batch.batch_id,
            scheduled: batch.scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Student,
    Assistant,
}

/// Result of an enrollment. `provisioning` is the batch started for a newly
/// enrolled student; dropping it leaves the work running.
#[derive(Debug)]
pub struct Enrollment {
    pub user: UserSummary,
    pub course_id: CourseId,
    pub membership: Membership,
    pub newly_added: bool,
    pub provisioning: Option<BulkProvisioning>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrollmentReceipt {
    pub message: String,
    pub user: UserSummary,
    pub membership: Membership,
    pub newly_added: bool,
    pub provisioning: Option<BatchReceipt>,
}

impl Enrollment {
    pub fn receipt(&self) -> EnrollmentReceipt {
        let message = match (&self.provisioning, self.newly_added) {
            (Some(_), _) => format!(
                "User {} enrolled in course {}. VM provisioning started.",
                self.user.email, self.course_id
            ),
            (None, true) => format!("User {} added to course {}", self.user.email, self.course_id),
            (None, false) => format!(
                "User {} already a member of course {}",
                self.user.email, self.course_id
            ),
        };
        EnrollmentReceipt {
            message,
            user: self.user.clone(),
            membership: self.membership,
            newly_added: self.newly_added,
            provisioning: self.provisioning.as_ref().map(BatchReceipt::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StudentVm {
    pub id: VmRecordId,
    pub name: String,
    pub status: VmStatus,
    pub ip: Option<String>,
}

impl From<VirtualMachine> for StudentVm {
    fn from(vm: VirtualMachine) -> Self {
        Self {
            id: vm.id,
            ip: vm.details.ip().map(str::to_string),
            name: vm.name,
            status: vm.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RosterEntry {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub vm: Option<StudentVm>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CourseDetails {
    #[serde(flatten)]
    pub course: Course,
    pub professor: Option<UserSummary>,
    pub students: Vec<UserSummary>,
    pub assistants: Vec<UserSummary>,
}

/// A user with the VMs they own and the courses their role ties them to.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    pub vms: Vec<StudentVm>,
    pub courses: Vec<Course>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatusView {
    pub upid: String,
    pub node: String,
    pub status: TaskState,
    pub progress: u8,
    pub running: bool,
    pub logs: Vec<String>,
}

pub struct LabService {
    repository: Arc<dyn Repository>,
    hypervisor: Arc<dyn HypervisorClient>,
    orchestrator: ProvisioningOrchestrator,
    tasks: TaskTracker,
    options: ServiceOptions,
}

impl LabService {
    pub fn new(
        repository: Arc<dyn Repository>,
        hypervisor: Arc<dyn HypervisorClient>,
        options: ServiceOptions,
    ) -> Self {
        let orchestrator = ProvisioningOrchestrator::new(
            repository.clone(),
            hypervisor.clone(),
            options.hypervisor_id,
            options.provisioning,
        );
        let tasks = TaskTracker::new(hypervisor.clone(), options.default_task_node.clone());
        Self {
            repository,
            hypervisor,
            orchestrator,
            tasks,
            options,
        }
    }

    pub fn orchestrator(&self) -> &ProvisioningOrchestrator {
        &self.orchestrator
    }

    async fn actor(&self, user_id: UserId) -> LabResult<User> {
        match self.repository.user(user_id).await? {
            Some(user) => Ok(user),
            None => Err(LabError::AccessDenied(format!("unknown user {user_id}"))),
        }
    }

    async fn vm_record(&self, vm_id: VmRecordId) -> LabResult<VirtualMachine> {
        self.repository
            .vm(vm_id)
            .await?
            .ok_or_else(|| LabError::not_found("vm", vm_id))
    }

    async fn course_record(&self, course_id: CourseId) -> LabResult<Course> {
        self.repository
            .course(course_id)
            .await?
            .ok_or_else(|| LabError::not_found("course", course_id))
    }

    async fn user_by_email(&self, email: &str) -> LabResult<User> {
        self.repository
            .user_by_email(email)
            .await?
            .ok_or_else(|| LabError::not_found("user", email))
    }

    async fn course_facts(&self, actor: &User, course: &Course) -> LabResult<OwnershipFacts> {
        Ok(OwnershipFacts {
            owns_vm: false,
            course_professor: course.professor_id == actor.id,
            course_assistant: self.repository.is_assistant(course.id, actor.id).await?,
        })
    }

    async fn vm_facts(&self, actor: &User, vm: &VirtualMachine) -> LabResult<OwnershipFacts> {
        let mut facts = OwnershipFacts {
            owns_vm: vm.owner_id == actor.id,
            ..OwnershipFacts::NONE
        };
        if let Some(course_id) = vm.course_id {
            if let Some(course) = self.repository.course(course_id).await? {
                facts.course_professor = course.professor_id == actor.id;
            }
            facts.course_assistant = self.repository.is_assistant(course_id, actor.id).await?;
        }
        Ok(facts)
    }

    /// Loads actor and VM record and checks `action` against them.
    async fn authorized_vm(
        &self,
        actor_id: UserId,
        vm_id: VmRecordId,
        action: Action,
    ) -> LabResult<(User, VirtualMachine)> {
        let actor = self.actor(actor_id).await?;
        let vm = self.vm_record(vm_id).await?;
        let facts = self.vm_facts(&actor, &vm).await?;
        authorize(&actor, action, facts)?;
        Ok((actor, vm))
    }

    async fn authorized_course(
        &self,
        actor_id: UserId,
        course_id: CourseId,
        action: Action,
    ) -> LabResult<(User, Course)> {
        let actor = self.actor(actor_id).await?;
        let course = self.course_record(course_id).await?;
        let facts = self.course_facts(&actor, &course).await?;
        authorize(&actor, action, facts)?;
        Ok((actor, course))
    }

    async fn authorized_global(&self, actor_id: UserId, action: Action) -> LabResult<User> {
        let actor = self.actor(actor_id).await?;
        authorize(&actor, action, OwnershipFacts::NONE)?;
        Ok(actor)
    }

    async fn view(&self, vm: VirtualMachine) -> LabResult<VmView> {
        let owner_email = self.repository.user(vm.owner_id).await?.map(|u| u.email);
        let course_name = match vm.course_id {
            Some(id) => self.repository.course(id).await?.map(|c| c.name),
            None => None,
        };
        let mut ip_address = vm.details.ip().map(str::to_string);
        if vm.status == VmStatus::Running {
            match self.hypervisor.vm_details(vm.backend_vm_id).await {
                Ok(details) => ip_address = details.ip.or(ip_address),
                Err(e) => warn!(vm_id = vm.id, error = %e, "Could not refresh VM address"),
            }
        }
        Ok(VmView {
            id: vm.id,
            name: vm.name,
            vm_id: vm.backend_vm_id,
            status: vm.status,
            ip_address,
            owner_email,
            course_name,
            details: vm.details,
        })
    }

    /// VMs visible to the actor; running ones carry their current address.
    pub async fn list_vms(&self, actor_id: UserId) -> LabResult<Vec<VmView>> {
        let actor = self.authorized_global(actor_id, Action::ListVms).await?;
        let scope = match actor.role {
            role if role.is_admin() => VmScope::All,
            Role::Professor => VmScope::InCourses(
                self.repository
                    .courses_owned_by(actor.id)
                    .await?
                    .into_iter()
                    .map(|c| c.id)
                    .collect(),
            ),
            Role::Assistant => VmScope::InCourses(
                self.repository
                    .courses_assisted_by(actor.id)
                    .await?
                    .into_iter()
                    .map(|c| c.id)
                    .collect(),
            ),
            _ => VmScope::OwnedBy(actor.id),
        };

        let vms = self.repository.list_vms(scope).await?;
        try_join_all(vms.into_iter().map(|vm| self.view(vm))).await
    }

    pub async fn vm(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<VmView> {
        let (_, vm) = self.authorized_vm(actor_id, vm_id, Action::ViewVm).await?;
        self.view(vm).await
    }

    /// Clones a course VM for the calling professor (or a sys admin).
    pub async fn create_course_vm(
        &self,
        actor_id: UserId,
        request: CreateVmRequest,
    ) -> LabResult<VirtualMachine> {
        let (actor, course) = self
            .authorized_course(actor_id, request.course_id, Action::CreateVm)
            .await?;

        let clone = CloneRequest {
            template_id: request.template_id,
            cpu: Some(request.cpu),
            memory_mib: Some(request.memory),
        };
        let CreatedVm { backend_id, node } = self.hypervisor.create_vm(&request.name, &clone).await?;

        let vm = self
            .repository
            .insert_vm(NewVirtualMachine {
                backend_vm_id: backend_id,
                name: request.name,
                status: VmStatus::Creating,
                owner_id: actor.id,
                course_id: Some(course.id),
                hypervisor_id: self.options.hypervisor_id,
                details: VmDetailsBag::with_node(node),
            })
            .await?;
        info!(vm_id = vm.id, backend_vm_id = backend_id, course_id = course.id, "Course VM created");
        Ok(vm)
    }

    pub async fn start_vm(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<PowerReceipt> {
        self.power(actor_id, vm_id, Action::StartVm).await
    }

    pub async fn stop_vm(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<PowerReceipt> {
        self.power(actor_id, vm_id, Action::StopVm).await
    }

    /// Graceful shutdown. The guest powers off on its own schedule, so the
    /// stored status is left alone.
    pub async fn shutdown_vm(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<PowerReceipt> {
        self.power(actor_id, vm_id, Action::ShutdownVm).await
    }

    async fn power(&self, actor_id: UserId, vm_id: VmRecordId, action: Action) -> LabResult<PowerReceipt> {
        let (actor, mut vm) = self.authorized_vm(actor_id, vm_id, action).await?;
        let backend_id = vm.backend_vm_id;

        let (accepted, verb, next, message) = match action {
            Action::StartVm => (
                self.hypervisor.start_vm(backend_id).await?,
                "start",
                Some(VmStatus::Running),
                "VM started",
            ),
            Action::StopVm => (
                self.hypervisor.stop_vm(backend_id).await?,
                "stop",
                Some(VmStatus::Stopped),
                "VM stopped",
            ),
            _ => (
                self.hypervisor.shutdown_vm(backend_id).await?,
                "shutdown",
                None,
                "VM shutdown initiated",
            ),
        };

        if !accepted {
            return Err(HypervisorError::operation_failed(
                verb,
                format!("hypervisor refused to {verb} VM {backend_id}"),
            )
            .into());
        }

        if let Some(next) = next {
            if vm.status != next && vm.status.can_transition_to(next) {
                vm.status = next;
                self.repository.update_vm(&vm).await?;
            }
        }
        info!(vm_id, backend_vm_id = backend_id, user_id = actor.id, verb, "Power action applied");

        Ok(PowerReceipt {
            vm_id,
            status: vm.status,
            message: message.to_string(),
        })
    }

    /// Live counters plus a flat-rate monthly cost for the VM's size.
    pub async fn vm_stats(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<VmStatsView> {
        let (_, vm) = self.authorized_vm(actor_id, vm_id, Action::ViewVmStats).await?;
        let stats = self.hypervisor.vm_stats(vm.backend_vm_id).await?;
        let details = self.hypervisor.vm_details(vm.backend_vm_id).await?;
        Ok(VmStatsView {
            stats,
            cost_estimate: CostEstimate::from_config(&details.config),
        })
    }

    pub async fn open_console(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<ConsoleView> {
        let (_, vm) = self.authorized_vm(actor_id, vm_id, Action::OpenConsole).await?;
        let ticket = self.hypervisor.console_ticket(vm.backend_vm_id).await?;
        let direct_url = ticket.direct_url(vm.backend_vm_id);
        Ok(ConsoleView { ticket, direct_url })
    }

    /// Hands the VM to another user and optionally moves it to a course the
    /// actor may manage.
    pub async fn assign_vm(
        &self,
        actor_id: UserId,
        vm_id: VmRecordId,
        request: AssignVmRequest,
    ) -> LabResult<VirtualMachine> {
        let (actor, mut vm) = self.authorized_vm(actor_id, vm_id, Action::AssignVm).await?;
        let target = self.user_by_email(&request.email).await?;

        if let Some(course_id) = request.course_id {
            let course = self.course_record(course_id).await?;
            let facts = self.course_facts(&actor, &course).await?;
            authorize(&actor, Action::AssignVm, facts)?;
            vm.course_id = Some(course.id);
        }

        vm.owner_id = target.id;
        self.repository.update_vm(&vm).await?;
        info!(vm_id, owner = %target.username, course_id = ?vm.course_id, "VM reassigned");
        Ok(vm)
    }

    /// Adds a student or assistant to the course. A newly enrolled student
    /// gets a VM provisioned in the background when the course has a
    /// template.
    pub async fn enroll(&self, actor_id: UserId, course_id: CourseId, email: &str) -> LabResult<Enrollment> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::EnrollMember)
            .await?;
        let member = self.user_by_email(email).await?;

        let (membership, newly_added) = match member.role {
            Role::Student => (
                Membership::Student,
                self.repository.enroll_student(course.id, member.id).await?,
            ),
            Role::Assistant => (
                Membership::Assistant,
                self.repository.add_assistant(course.id, member.id).await?,
            ),
            other => {
                return Err(LabError::InvalidRequest(format!(
                    "can only enroll students or assistants, {} is a {other}",
                    member.email
                )))
            }
        };

        let provisioning = if membership == Membership::Student
            && newly_added
            && course.provisioning_template().is_some()
        {
            Some(
                self.orchestrator
                    .provision_bulk(course.clone(), ProvisionTargets::Student(member.id))
                    .await?,
            )
        } else {
            None
        };

        info!(course_id, user = %member.username, ?membership, newly_added, "Enrollment processed");
        Ok(Enrollment {
            user: UserSummary::from(&member),
            course_id,
            membership,
            newly_added,
            provisioning,
        })
    }

    /// New course owned by the caller.
    pub async fn create_course(&self, actor_id: UserId, request: CreateCourseRequest) -> LabResult<Course> {
        let actor = self.authorized_global(actor_id, Action::CreateCourse).await?;
        let name = request.name.trim();
        if name.is_empty() {
            return Err(LabError::InvalidRequest("course name must not be empty".into()));
        }

        let course = self
            .repository
            .insert_course(NewCourse {
                name: name.to_string(),
                description: request.description,
                professor_id: actor.id,
                template_id: request.template_id,
            })
            .await?;
        info!(course_id = course.id, name = %course.name, professor = %actor.username, "Course created");
        Ok(course)
    }

    /// Courses the caller teaches, assists, or attends. Sys admins see all of
    /// them; business admins none.
    pub async fn list_courses(&self, actor_id: UserId) -> LabResult<Vec<Course>> {
        let actor = self.authorized_global(actor_id, Action::ListCourses).await?;
        let courses = match actor.role {
            Role::SysAdmin => self.repository.list_courses().await?,
            Role::BusinessAdmin => Vec::new(),
            Role::Professor => self.repository.courses_owned_by(actor.id).await?,
            Role::Assistant => self.repository.courses_assisted_by(actor.id).await?,
            Role::Student => self.repository.courses_enrolled_by(actor.id).await?,
        };
        Ok(courses)
    }

    /// Provisions one enrolled student, or every enrolled student, of a course.
    pub async fn provision_course(
        &self,
        actor_id: UserId,
        course_id: CourseId,
        student_email: Option<&str>,
    ) -> LabResult<BulkProvisioning> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::ProvisionCourse)
            .await?;

        let targets = match student_email {
            Some(email) => {
                let student = self.user_by_email(email).await.map_err(|_| {
                    LabError::InvalidRequest(format!("student {email} not found or not enrolled"))
                })?;
                ProvisionTargets::Student(student.id)
            }
            None => ProvisionTargets::AllEnrolled,
        };

        self.orchestrator.provision_bulk(course, targets).await
    }

    pub async fn course_details(&self, actor_id: UserId, course_id: CourseId) -> LabResult<CourseDetails> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::ViewCourse)
            .await?;
        let professor = self
            .repository
            .user(course.professor_id)
            .await?
            .as_ref()
            .map(UserSummary::from);
        let students = self.repository.enrolled_students(course.id).await?;
        let assistants = self.repository.course_assistants(course.id).await?;
        Ok(CourseDetails {
            course,
            professor,
            students: students.iter().map(UserSummary::from).collect(),
            assistants: assistants.iter().map(UserSummary::from).collect(),
        })
    }

    /// Roster with each student's VM for this course, if any.
    pub async fn course_students(&self, actor_id: UserId, course_id: CourseId) -> LabResult<Vec<RosterEntry>> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::ViewCourseStudents)
            .await?;

        let mut roster = Vec::new();
        for student in self.repository.enrolled_students(course.id).await? {
            let vm = self
                .repository
                .vm_for_student(student.id, course.id)
                .await?
                .map(StudentVm::from);
            roster.push(RosterEntry {
                id: student.id,
                username: student.username,
                email: student.email,
                vm,
            });
        }
        Ok(roster)
    }

    pub async fn course_assistants(&self, actor_id: UserId, course_id: CourseId) -> LabResult<Vec<UserSummary>> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::ViewCourseAssistants)
            .await?;
        let assistants = self.repository.course_assistants(course.id).await?;
        Ok(assistants.iter().map(UserSummary::from).collect())
    }

    pub async fn assign_professor(&self, actor_id: UserId, course_id: CourseId, email: &str) -> LabResult<Course> {
        let (_, course) = self
            .authorized_course(actor_id, course_id, Action::AssignProfessor)
            .await?;
        let professor = self.user_by_email(email).await?;
        if professor.role != Role::Professor {
            return Err(LabError::InvalidRequest(format!(
                "{} is not a professor",
                professor.email
            )));
        }

        self.repository.set_course_professor(course.id, professor.id).await?;
        info!(course_id, professor = %professor.username, "Professor assigned");
        Ok(Course {
            professor_id: professor.id,
            ..course
        })
    }

    pub async fn list_users(&self, actor_id: UserId, role: Option<Role>) -> LabResult<Vec<User>> {
        self.authorized_global(actor_id, Action::ListUsers).await?;
        Ok(self.repository.list_users(role).await?)
    }

    pub async fn user_details(&self, actor_id: UserId, user_id: UserId) -> LabResult<UserDetails> {
        self.authorized_global(actor_id, Action::ViewUser).await?;
        let user = self
            .repository
            .user(user_id)
            .await?
            .ok_or_else(|| LabError::not_found("user", user_id))?;

        let vms = self.repository.list_vms(VmScope::OwnedBy(user.id)).await?;
        let courses = match user.role {
            Role::Professor => self.repository.courses_owned_by(user.id).await?,
            Role::Assistant => self.repository.courses_assisted_by(user.id).await?,
            Role::Student => self.repository.courses_enrolled_by(user.id).await?,
            Role::SysAdmin | Role::BusinessAdmin => Vec::new(),
        };
        Ok(UserDetails {
            user,
            vms: vms.into_iter().map(StudentVm::from).collect(),
            courses,
        })
    }

    /// Creates a draft VM booting the given ISO; finalize it once the OS is
    /// installed.
    pub async fn build_template(&self, actor_id: UserId, request: BuildTemplateRequest) -> LabResult<VirtualMachine> {
        let actor = self.authorized_global(actor_id, Action::BuildTemplate).await?;
        let defaults = &self.options.templates;
        let config = IsoBuildConfig {
            cpu: request.cpu.unwrap_or(defaults.cpu),
            memory_mib: request.memory.unwrap_or(defaults.memory_mib),
            disk_size: request.disk_size.unwrap_or_else(|| defaults.disk_size.clone()),
        };

        let created = self
            .hypervisor
            .create_vm_from_iso(&request.name, &request.iso_file, &config)
            .await?;

        let mut details = VmDetailsBag::with_node(created.node);
        details.set(VmDetailsBag::ISO, request.iso_file);
        let vm = self
            .repository
            .insert_vm(NewVirtualMachine {
                backend_vm_id: created.backend_id,
                name: request.name,
                status: VmStatus::DraftTemplate,
                owner_id: actor.id,
                course_id: None,
                hypervisor_id: self.options.hypervisor_id,
                details,
            })
            .await?;
        info!(vm_id = vm.id, backend_vm_id = vm.backend_vm_id, "Draft template VM created");
        Ok(vm)
    }

    pub async fn finalize_template(&self, actor_id: UserId, vm_id: VmRecordId) -> LabResult<VirtualMachine> {
        let (_, mut vm) = self
            .authorized_vm(actor_id, vm_id, Action::FinalizeTemplate)
            .await?;
        if !vm.status.can_transition_to(VmStatus::Template) {
            return Err(LabError::InvalidRequest(format!(
                "VM {vm_id} is {} and cannot become a template",
                vm.status
            )));
        }

        if !self.hypervisor.convert_to_template(vm.backend_vm_id).await? {
            return Err(HypervisorError::operation_failed(
                "convert to template",
                format!("hypervisor refused to convert VM {}", vm.backend_vm_id),
            )
            .into());
        }

        vm.status = VmStatus::Template;
        self.repository.update_vm(&vm).await?;
        info!(vm_id, backend_vm_id = vm.backend_vm_id, "VM finalized as template");
        Ok(vm)
    }

    pub async fn list_templates(&self, actor_id: UserId) -> LabResult<Vec<VmSummary>> {
        self.authorized_global(actor_id, Action::ListTemplates).await?;
        Ok(self.hypervisor.list_templates().await?)
    }

    pub async fn list_isos(&self, actor_id: UserId) -> LabResult<Vec<IsoImage>> {
        self.authorized_global(actor_id, Action::ListIsos).await?;
        Ok(self.hypervisor.list_isos().await?)
    }

    pub async fn download_iso(&self, actor_id: UserId, request: DownloadIsoRequest) -> LabResult<TaskHandle> {
        self.authorized_global(actor_id, Action::DownloadIso).await?;
        if request.url.trim().is_empty() || request.filename.trim().is_empty() {
            return Err(LabError::InvalidRequest("url and filename are required".into()));
        }
        let storage = request.storage.as_deref().unwrap_or(DEFAULT_ISO_STORAGE);
        Ok(self
            .tasks
            .start_iso_download(&request.url, &request.filename, storage)
            .await?)
    }

    /// Status, progress and the last few log lines of a backend task.
    pub async fn task_status(&self, actor_id: UserId, upid: &str) -> LabResult<TaskStatusView> {
        self.authorized_global(actor_id, Action::ViewTask).await?;
        let progress = self.tasks.poll_status(upid).await?;
        let skip = progress.log.len().saturating_sub(TASK_LOG_TAIL);
        Ok(TaskStatusView {
            upid: progress.handle.raw,
            node: progress.handle.node,
            status: progress.status,
            progress: progress.progress,
            running: progress.running,
            logs: progress.log.into_iter().skip(skip).collect(),
        })
    }

    pub async fn cancel_task(&self, actor_id: UserId, upid: &str) -> LabResult<bool> {
        self.authorized_global(actor_id, Action::CancelTask).await?;
        Ok(self.tasks.cancel(upid).await)
    }

    pub async fn analytics(&self, actor_id: UserId) -> LabResult<ClusterAnalytics> {
        self.authorized_global(actor_id, Action::ViewAnalytics).await?;
        Ok(self.hypervisor.analytics().await?)
    }

    /// Reachability of the backend; any active user may ask.
    pub async fn backend_status(&self, actor_id: UserId) -> LabResult<BackendStatus> {
        let actor = self.actor(actor_id).await?;
        if !actor.is_active {
            return Err(LabError::AccessDenied(format!("user {} is inactive", actor.id)));
        }
        Ok(self.hypervisor.status().await)
    }

    pub async fn health(&self) -> Value {
        let status = self.hypervisor.status().await;
        serde_json::json!({ "status": "ok", "hypervisor_online": status.online })
    }
}
