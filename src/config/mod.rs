pub mod settings;

pub use settings::{
    HypervisorSettings, LoggingSettings, ProvisioningSettings, SeedCourse, SeedSettings, SeedUser,
    ServerSettings, Settings, TemplateSettings,
};
