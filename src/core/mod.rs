pub mod course;
pub mod vm;

pub use course::{Course, NewCourse};
pub use vm::{
    BackendVmId, CourseId, HypervisorId, NewVirtualMachine, UserId, VirtualMachine,
    VmDetailsBag, VmRecordId, VmStatus,
};
