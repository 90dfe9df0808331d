//! Per-student course VM provisioning.
//!
//! `provision_student` is idempotent per (student, course) and never returns
//! an error: every failure is logged and folded into a `ProvisionOutcome`.
//! `provision_bulk` fans the same unit of work out onto a bounded pool and
//! hands back immediately. The pool belongs to the orchestrator, so the limit
//! holds across every batch in flight, not just within one.

pub mod naming;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use naming::derive_vm_name;

use crate::core::{
    BackendVmId, Course, HypervisorId, NewVirtualMachine, UserId, VmDetailsBag, VmRecordId,
    VmStatus,
};
use crate::errors::{LabError, LabResult};
use crate::hypervisor::{CloneRequest, HypervisorClient};
use crate::repository::Repository;
use crate::users::User;

pub const DEFAULT_STUDENT_CPU: u32 = 2;
pub const DEFAULT_STUDENT_MEMORY_MIB: u64 = 1024;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Sizing for auto-provisioned student VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionDefaults {
    pub cpu: u32,
    pub memory_mib: u64,
    pub max_concurrency: usize,
}

impl Default for ProvisionDefaults {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_STUDENT_CPU,
            memory_mib: DEFAULT_STUDENT_MEMORY_MIB,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created {
        vm_id: VmRecordId,
        backend_vm_id: BackendVmId,
        node: String,
    },
    AlreadyProvisioned {
        vm_id: VmRecordId,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ProvisionOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, ProvisionOutcome::Created { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionTargets {
    /// One named student; must already be enrolled.
    Student(UserId),
    AllEnrolled,
}

/// Handle to a running batch. Dropping it leaves the work running.
#[derive(Debug)]
pub struct BulkProvisioning {
    pub batch_id: Uuid,
    pub scheduled: usize,
    pub handle: JoinHandle<Vec<(UserId, ProvisionOutcome)>>,
}

impl BulkProvisioning {
    /// Waits for every unit. A batch task that died yields no outcomes.
    pub async fn wait(self) -> Vec<(UserId, ProvisionOutcome)> {
        match self.handle.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(batch_id = %self.batch_id, error = %e, "Provisioning batch aborted");
                Vec::new()
            }
        }
    }
}

#[derive(Clone)]
pub struct ProvisioningOrchestrator {
    repository: Arc<dyn Repository>,
    hypervisor: Arc<dyn HypervisorClient>,
    hypervisor_id: HypervisorId,
    defaults: ProvisionDefaults,
    pool: Arc<Semaphore>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        hypervisor: Arc<dyn HypervisorClient>,
        hypervisor_id: HypervisorId,
        defaults: ProvisionDefaults,
    ) -> Self {
        Self {
            repository,
            hypervisor,
            hypervisor_id,
            defaults,
            pool: Arc::new(Semaphore::new(defaults.max_concurrency.max(1))),
        }
    }

    pub fn defaults(&self) -> ProvisionDefaults {
        self.defaults
    }

    /// Worker slots currently free across all batches.
    pub fn available_workers(&self) -> usize {
        self.pool.available_permits()
    }

    /// Ensures `student` has a VM for `course`. An existing record for the
    /// pair makes this a no-op.
    pub async fn provision_student(&self, course: &Course, student: &User) -> ProvisionOutcome {
        let Some(template_id) = course.provisioning_template() else {
            return ProvisionOutcome::Skipped {
                reason: format!("course {} has no template", course.id),
            };
        };

        match self.repository.vm_for_student(student.id, course.id).await {
            Ok(Some(existing)) => {
                info!(
                    student = %student.username,
                    course_id = course.id,
                    vm_id = existing.id,
                    "Student already has a course VM"
                );
                return ProvisionOutcome::AlreadyProvisioned { vm_id: existing.id };
            }
            Ok(None) => {}
            Err(e) => {
                error!(student = %student.username, course_id = course.id, error = %e, "VM lookup failed");
                return ProvisionOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        }

        let name = derive_vm_name(&course.name, &student.username);
        let request = CloneRequest {
            template_id,
            cpu: Some(self.defaults.cpu),
            memory_mib: Some(self.defaults.memory_mib),
        };

        let created = match self.hypervisor.create_vm(&name, &request).await {
            Ok(created) => created,
            Err(e) => {
                error!(
                    student = %student.username,
                    course_id = course.id,
                    template_id,
                    error = %e,
                    "Failed to provision course VM"
                );
                return ProvisionOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let record = NewVirtualMachine {
            backend_vm_id: created.backend_id,
            name: name.clone(),
            status: VmStatus::Creating,
            owner_id: student.id,
            course_id: Some(course.id),
            hypervisor_id: self.hypervisor_id,
            details: VmDetailsBag::with_node(created.node.clone()),
        };

        match self.repository.insert_vm(record).await {
            Ok(vm) => {
                info!(
                    vm_name = %name,
                    student = %student.username,
                    backend_vm_id = created.backend_id,
                    node = %created.node,
                    "Provisioned course VM"
                );
                ProvisionOutcome::Created {
                    vm_id: vm.id,
                    backend_vm_id: created.backend_id,
                    node: created.node,
                }
            }
            Err(e) => {
                // The guest exists on the cluster but is not tracked.
                error!(
                    vm_name = %name,
                    backend_vm_id = created.backend_id,
                    error = %e,
                    "VM created but record could not be saved"
                );
                ProvisionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn resolve_targets(
        &self,
        course: &Course,
        targets: ProvisionTargets,
    ) -> LabResult<Vec<User>> {
        match targets {
            ProvisionTargets::AllEnrolled => Ok(self.repository.enrolled_students(course.id).await?),
            ProvisionTargets::Student(user_id) => {
                let student = self
                    .repository
                    .user(user_id)
                    .await?
                    .ok_or_else(|| LabError::not_found("user", user_id))?;
                if !self.repository.is_enrolled(course.id, user_id).await? {
                    return Err(LabError::InvalidRequest(format!(
                        "{} is not enrolled in course {}",
                        student.username, course.id
                    )));
                }
                Ok(vec![student])
            }
        }
    }

    /// Schedules one unit of work per target and returns without waiting.
    pub async fn provision_bulk(
        &self,
        course: Course,
        targets: ProvisionTargets,
    ) -> LabResult<BulkProvisioning> {
        if course.provisioning_template().is_none() {
            return Err(LabError::InvalidRequest(format!(
                "course {} has no template to provision from",
                course.id
            )));
        }

        let students = self.resolve_targets(&course, targets).await?;
        let batch_id = Uuid::new_v4();
        let scheduled = students.len();
        let course = Arc::new(course);
        let orchestrator = self.clone();

        info!(%batch_id, course_id = course.id, scheduled, "Scheduling course VM provisioning");

        let handle = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for student in students {
                let pool = Arc::clone(&orchestrator.pool);
                let course = Arc::clone(&course);
                let orchestrator = orchestrator.clone();
                workers.spawn(async move {
                    let Ok(_permit) = pool.acquire_owned().await else {
                        return (
                            student.id,
                            ProvisionOutcome::Failed {
                                reason: "worker pool closed".to_string(),
                            },
                        );
                    };
                    let outcome = orchestrator.provision_student(&course, &student).await;
                    (student.id, outcome)
                });
            }

            let mut outcomes = Vec::with_capacity(scheduled);
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => warn!(%batch_id, error = %e, "Provisioning worker did not finish"),
                }
            }

            let created = outcomes.iter().filter(|(_, o)| o.is_created()).count();
            let failed = outcomes
                .iter()
                .filter(|(_, o)| matches!(o, ProvisionOutcome::Failed { .. }))
                .count();
            info!(%batch_id, scheduled, created, failed, "Provisioning batch finished");
            outcomes
        });

        Ok(BulkProvisioning {
            batch_id,
            scheduled,
            handle,
        })
    }
}
