/*
* Configuration
* -------------
* Layered with the `config` crate, lowest priority first:
*
*   1. hardcoded defaults (set_default below)
*   2. {config_dir}/default.toml
*   3. {config_dir}/local.toml, optional
*   4. environment, APP__SECTION__KEY (e.g. APP__HYPERVISOR__URL)
*
* Sections:
*   server        listen address and API prefix
*   hypervisor    the managed cluster plus client-side request timeout
*   provisioning  student VM sizing and worker pool width
*   templates     ISO build defaults and the stop-wait retry policy
*   logging       EnvFilter directive and json output toggle
*   seed          users and courses loaded into the in-memory repository
*/

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::{Course, CourseId, UserId};
use crate::errors::handlers::RetryPolicy;
use crate::hypervisor::{HypervisorKind, HypervisorRecord};
use crate::provisioning::ProvisionDefaults;
use crate::users::{Role, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub hypervisor: HypervisorSettings,
    pub provisioning: ProvisioningSettings,
    pub templates: TemplateSettings,
    pub logging: LoggingSettings,
    #[serde(default)]
    pub seed: SeedSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HypervisorSettings {
    pub id: u64,
    pub name: String,
    pub kind: HypervisorKind,
    pub url: String,
    pub auth_user: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub verify_ssl: bool,
    pub request_timeout_secs: u64,
    /// Node assumed for task handles that do not name one.
    pub default_task_node: String,
}

impl std::fmt::Debug for HypervisorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorSettings")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("auth_user", &self.auth_user)
            .field("verify_ssl", &self.verify_ssl)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("default_task_node", &self.default_task_node)
            .finish_non_exhaustive()
    }
}

impl HypervisorSettings {
    pub fn record(&self) -> HypervisorRecord {
        HypervisorRecord {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            url: self.url.clone(),
            auth_user: self.auth_user.clone(),
            auth_token: self.auth_token.clone(),
            verify_ssl: self.verify_ssl,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSettings {
    pub default_cpu: u32,
    pub default_memory_mib: u64,
    pub max_concurrency: usize,
}

impl ProvisioningSettings {
    pub fn defaults(&self) -> ProvisionDefaults {
        ProvisionDefaults {
            cpu: self.default_cpu,
            memory_mib: self.default_memory_mib,
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub default_cpu: u32,
    pub default_memory_mib: u64,
    pub default_disk_size: String,
    pub stop_wait_attempts: u32,
    pub stop_wait_initial_ms: u64,
    pub stop_wait_max_ms: u64,
    pub stop_wait_multiplier: u32,
}

impl TemplateSettings {
    pub fn stop_wait(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.stop_wait_attempts.max(1),
            initial_delay: Duration::from_millis(self.stop_wait_initial_ms),
            max_delay: Duration::from_millis(self.stop_wait_max_ms),
            multiplier: self.stop_wait_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// EnvFilter directive; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedSettings {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub courses: Vec<SeedCourse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
}

impl SeedUser {
    pub fn to_user(&self) -> User {
        let mut user = User::new(self.id, &self.username, self.role);
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        user
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedCourse {
    pub id: CourseId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub professor_id: UserId,
    #[serde(default)]
    pub template_id: Option<u32>,
    #[serde(default)]
    pub students: Vec<UserId>,
    #[serde(default)]
    pub assistants: Vec<UserId>,
}

impl SeedCourse {
    pub fn to_course(&self) -> Course {
        Course {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            professor_id: self.professor_id,
            template_id: self.template_id,
        }
    }
}

impl Settings {
    /// Loads `{config_dir}/default.toml`, `{config_dir}/local.toml` and the
    /// `APP__` environment on top of the built-in defaults.
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_dir);

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.api_prefix", "/api/v1")?
            .set_default("hypervisor.id", 1)?
            .set_default("hypervisor.name", "default")?
            .set_default("hypervisor.kind", "proxmox")?
            .set_default("hypervisor.url", "https://127.0.0.1:8006")?
            .set_default("hypervisor.auth_user", "root@pam")?
            .set_default("hypervisor.auth_token", "")?
            .set_default("hypervisor.verify_ssl", false)?
            .set_default("hypervisor.request_timeout_secs", 30)?
            .set_default("hypervisor.default_task_node", "pve")?
            .set_default("provisioning.default_cpu", 2)?
            .set_default("provisioning.default_memory_mib", 1024)?
            .set_default("provisioning.max_concurrency", 4)?
            .set_default("templates.default_cpu", 2)?
            .set_default("templates.default_memory_mib", 2048)?
            .set_default("templates.default_disk_size", "32G")?
            .set_default("templates.stop_wait_attempts", 10)?
            .set_default("templates.stop_wait_initial_ms", 1000)?
            .set_default("templates.stop_wait_max_ms", 5000)?
            .set_default("templates.stop_wait_multiplier", 2)?
            .set_default("logging.filter", "labvm_manager=info,tower_http=info")?
            .set_default("logging.json", false)?
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

/// Same values `Settings::load` falls back to with no files and no
/// environment.
pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
        },
        hypervisor: HypervisorSettings {
            id: 1,
            name: "default".to_string(),
            kind: HypervisorKind::Proxmox,
            url: "https://127.0.0.1:8006".to_string(),
            auth_user: "root@pam".to_string(),
            auth_token: String::new(),
            verify_ssl: false,
            request_timeout_secs: 30,
            default_task_node: "pve".to_string(),
        },
        provisioning: ProvisioningSettings {
            default_cpu: 2,
            default_memory_mib: 1024,
            max_concurrency: 4,
        },
        templates: TemplateSettings {
            default_cpu: 2,
            default_memory_mib: 2048,
            default_disk_size: "32G".to_string(),
            stop_wait_attempts: 10,
            stop_wait_initial_ms: 1000,
            stop_wait_max_ms: 5000,
            stop_wait_multiplier: 2,
        },
        logging: LoggingSettings {
            filter: "labvm_manager=info,tower_http=info".to_string(),
            json: false,
        },
        seed: SeedSettings::default(),
    }
}
