/*
* Command line
* ------------
*
* labvm-manager [--config <dir>]
* ├── serve [--port]   run the HTTP API
* └── status           print backend reachability and the guests it reports
*
* Both commands load Settings the same way, connect the configured hypervisor
* and seed the in-memory repository from the `seed` section.
*/

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use crate::api::{create_router, AppState};
use crate::config::Settings;
use crate::hypervisor::{HypervisorClient, HypervisorManager};
use crate::logging::init_tracing;
use crate::repository::{MemoryRepository, Repository};
use crate::service::{LabService, ServiceOptions, TemplateDefaults};

#[derive(Parser)]
#[command(name = "labvm-manager")]
#[command(about = "Course VM orchestration for Proxmox clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml and local.toml
    #[arg(short, long, value_name = "DIR", default_value = "config")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Check the hypervisor connection
    Status,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    init_tracing(&settings.logging);

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.server.port);
            run_server(settings, port).await
        }
        Commands::Status => print_status(&settings).await,
    }
}

pub fn service_options(settings: &Settings) -> ServiceOptions {
    ServiceOptions {
        hypervisor_id: settings.hypervisor.id,
        provisioning: settings.provisioning.defaults(),
        templates: TemplateDefaults {
            cpu: settings.templates.default_cpu,
            memory_mib: settings.templates.default_memory_mib,
            disk_size: settings.templates.default_disk_size.clone(),
        },
        default_task_node: settings.hypervisor.default_task_node.clone(),
    }
}

fn connect(settings: &Settings) -> anyhow::Result<Arc<dyn HypervisorClient>> {
    let manager = HypervisorManager::new(
        settings.hypervisor.request_timeout(),
        settings.templates.stop_wait(),
    );
    manager
        .connect(&settings.hypervisor.record())
        .with_context(|| format!("connecting hypervisor '{}'", settings.hypervisor.name))
}

/// Loads users, courses and memberships from the `seed` section.
pub async fn seed_repository(settings: &Settings) -> anyhow::Result<Arc<MemoryRepository>> {
    let repository = Arc::new(MemoryRepository::new());
    for user in &settings.seed.users {
        repository.put_user(user.to_user()).await;
    }
    for course in &settings.seed.courses {
        repository.put_course(course.to_course()).await;
        for student in &course.students {
            repository.enroll_student(course.id, *student).await?;
        }
        for assistant in &course.assistants {
            repository.add_assistant(course.id, *assistant).await?;
        }
    }
    info!(
        users = settings.seed.users.len(),
        courses = settings.seed.courses.len(),
        "Repository seeded"
    );
    Ok(repository)
}

pub async fn build_service(settings: &Settings) -> anyhow::Result<LabService> {
    let hypervisor = connect(settings)?;
    let repository = seed_repository(settings).await?;
    Ok(LabService::new(repository, hypervisor, service_options(settings)))
}

pub async fn run_server(settings: Settings, port: u16) -> anyhow::Result<()> {
    let service = build_service(&settings).await?;
    let health = service.health().await;
    if health["hypervisor_online"].as_bool() != Some(true) {
        warn!(hypervisor = %settings.hypervisor.name, "Hypervisor not reachable at startup");
    }

    let app = create_router(AppState::new(service), &settings.server.api_prefix);
    let addr: SocketAddr = format!("{}:{}", settings.server.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", settings.server.host, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

async fn print_status(settings: &Settings) -> anyhow::Result<()> {
    let client = connect(settings)?;
    let status = client.status().await;

    println!("{}", format!("Hypervisor '{}'", settings.hypervisor.name).bold());
    if !status.online {
        println!(
            "  {} {}",
            "offline".red(),
            status.details.unwrap_or_default()
        );
        return Ok(());
    }

    let version = status
        .version
        .as_ref()
        .and_then(|v| v.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    println!("  {} (version {})", "online".green(), version);

    match client.list_vms().await {
        Ok(vms) => {
            println!("{}", "Guests:".bold());
            for vm in vms {
                let state = match vm.status.as_str() {
                    "running" => vm.status.green(),
                    "stopped" => vm.status.red(),
                    _ => vm.status.yellow(),
                };
                println!(
                    "- {} {} on {} ({})",
                    vm.vmid,
                    vm.name.as_deref().unwrap_or("-"),
                    vm.node,
                    state
                );
            }
        }
        Err(e) => println!("  {} {}", "could not list guests:".yellow(), e),
    }
    Ok(())
}
