#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use labvm_manager::core::Course;
use labvm_manager::errors::{HypervisorError, HypervisorResult};
use labvm_manager::hypervisor::backend::{
    CloneParams, ClusterBackend, PowerAction, QemuCreateParams, QemuEntry, StorageItem, VncTicket,
};
use labvm_manager::hypervisor::{
    BackendStatus, CloneRequest, ClusterAnalytics, ConsoleTicket, CreatedVm, HypervisorClient,
    IsoBuildConfig, IsoImage, TaskState, VmDetails, VmStats, VmSummary,
};
use labvm_manager::repository::MemoryRepository;
use labvm_manager::users::{Role, User};

#[derive(Debug, Clone)]
pub struct FakeGuest {
    pub node: String,
    pub name: String,
    pub status: String,
    pub template: bool,
    pub config: Map<String, Value>,
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<String>,
    guests: BTreeMap<u32, FakeGuest>,
    storages: BTreeMap<String, Vec<String>>,
    isos: Vec<(String, String, String)>,
    tasks: BTreeMap<String, (TaskState, Vec<String>)>,
    next_id: u32,
    down_nodes: HashSet<String>,
    ignore_stop: bool,
    refuse_config_update: bool,
    refuse_power: bool,
    calls: Vec<String>,
}

/// In-memory cluster speaking the `ClusterBackend` contract: a node that
/// does not host the object rejects, a node marked down is unreachable.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn rejected(operation: &str, message: &str) -> HypervisorError {
    HypervisorError::operation_failed(operation, message)
}

impl FakeCluster {
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                next_id: 200,
                ..Default::default()
            }),
        }
    }

    pub fn with_guest(self, vmid: u32, node: &str, name: &str, status: &str) -> Self {
        self.put_guest(vmid, node, name, status, false);
        self
    }

    pub fn with_template(self, vmid: u32, node: &str, name: &str) -> Self {
        self.put_guest(vmid, node, name, "stopped", true);
        self
    }

    pub fn with_storage(self, node: &str, storage: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .storages
            .entry(node.to_string())
            .or_default()
            .push(storage.to_string());
        self
    }

    pub fn with_iso(self, node: &str, storage: &str, volid: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .isos
            .push((node.to_string(), storage.to_string(), volid.to_string()));
        self
    }

    pub fn with_task(self, node: &str, upid: &str, status: &str, log: &[&str]) -> Self {
        let state = TaskState {
            status: status.to_string(),
            exitstatus: None,
            extra: Map::new(),
        };
        let log = log.iter().map(|l| l.to_string()).collect();
        self.state
            .lock()
            .unwrap()
            .tasks
            .insert(format!("{node}|{upid}"), (state, log));
        self
    }

    fn put_guest(&self, vmid: u32, node: &str, name: &str, status: &str, template: bool) {
        let mut config = Map::new();
        config.insert("name".into(), json!(name));
        config.insert("cores".into(), json!(1));
        config.insert("memory".into(), json!(1024));
        self.state.lock().unwrap().guests.insert(
            vmid,
            FakeGuest {
                node: node.to_string(),
                name: name.to_string(),
                status: status.to_string(),
                template,
                config,
            },
        );
    }

    pub fn node_down(&self, node: &str) {
        self.state.lock().unwrap().down_nodes.insert(node.to_string());
    }

    /// Guests keep reporting `running` after a stop request.
    pub fn ignore_stop(&self) {
        self.state.lock().unwrap().ignore_stop = true;
    }

    pub fn refuse_config_update(&self) {
        self.state.lock().unwrap().refuse_config_update = true;
    }

    pub fn refuse_power(&self) {
        self.state.lock().unwrap().refuse_power = true;
    }

    pub fn guest(&self, vmid: u32) -> Option<FakeGuest> {
        self.state.lock().unwrap().guests.get(&vmid).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn reach(&self, node: &str) -> HypervisorResult<()> {
        if self.state.lock().unwrap().down_nodes.contains(node) {
            return Err(HypervisorError::BackendUnreachable(format!("{node}: connection timed out")));
        }
        Ok(())
    }

    fn guest_on(&self, node: &str, vmid: u32, operation: &str) -> HypervisorResult<FakeGuest> {
        self.reach(node)?;
        match self.state.lock().unwrap().guests.get(&vmid) {
            Some(guest) if guest.node == node => Ok(guest.clone()),
            _ => Err(rejected(
                operation,
                &format!("500 Configuration file 'nodes/{node}/qemu-server/{vmid}.conf' does not exist"),
            )),
        }
    }
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    fn host(&self) -> &str {
        "pve.test.local"
    }

    async fn version(&self) -> HypervisorResult<Value> {
        Ok(json!({"version": "8.1.4", "release": "8.1"}))
    }

    async fn nodes(&self) -> HypervisorResult<Vec<String>> {
        self.record("nodes".into());
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn node_status(&self, node: &str) -> HypervisorResult<Value> {
        self.reach(node)?;
        Ok(json!({"node": node, "cpu": 0.1, "memory": {"used": 1, "total": 4}}))
    }

    async fn list_qemu(&self, node: &str) -> HypervisorResult<Vec<QemuEntry>> {
        self.reach(node)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .guests
            .iter()
            .filter(|(_, g)| g.node == node)
            .map(|(vmid, g)| QemuEntry {
                vmid: *vmid,
                name: Some(g.name.clone()),
                status: g.status.clone(),
                template: g.template.then(|| json!(1)),
                cpus: Some(1),
                maxmem: Some(1024 * 1024 * 1024),
            })
            .collect())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> HypervisorResult<Map<String, Value>> {
        self.record(format!("vm_config {node} {vmid}"));
        Ok(self.guest_on(node, vmid, "guest config")?.config)
    }

    async fn vm_runtime(&self, node: &str, vmid: u32) -> HypervisorResult<labvm_manager::hypervisor::client::VmRuntime> {
        let guest = self.guest_on(node, vmid, "guest status")?;
        self.record(format!("vm_runtime {node} {vmid}"));
        Ok(labvm_manager::hypervisor::client::VmRuntime {
            status: guest.status,
            cpu: 0.5,
            mem: 512,
            maxmem: 1024,
            uptime: 60,
            ..Default::default()
        })
    }

    async fn guest_ipv4(&self, node: &str, vmid: u32) -> HypervisorResult<Option<String>> {
        let guest = self.guest_on(node, vmid, "guest agent")?;
        Ok((guest.status == "running").then(|| format!("10.0.0.{}", vmid % 250)))
    }

    async fn next_vmid(&self) -> HypervisorResult<u32> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        Ok(state.next_id)
    }

    async fn clone_vm(
        &self,
        node: &str,
        source: u32,
        params: &CloneParams,
    ) -> HypervisorResult<Option<String>> {
        self.guest_on(node, source, "clone")?;
        self.record(format!("clone {node} {source} -> {} {} full={}", params.new_id, params.name, params.full));
        self.put_guest(params.new_id, node, &params.name, "stopped", false);
        Ok(Some(format!("UPID:{node}:0001:0002:0003:qmclone:{source}:root@pam:")))
    }

    async fn update_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(String, String)],
    ) -> HypervisorResult<()> {
        self.guest_on(node, vmid, "update config")?;
        let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.record(format!("update_config {node} {vmid} {}", rendered.join(",")));
        let mut state = self.state.lock().unwrap();
        if state.refuse_config_update {
            return Err(rejected("update config", "VM is locked (clone)"));
        }
        if let Some(guest) = state.guests.get_mut(&vmid) {
            for (k, v) in params {
                let value = v.parse::<u64>().map(Value::from).unwrap_or_else(|_| json!(v));
                guest.config.insert(k.clone(), value);
            }
        }
        Ok(())
    }

    async fn create_qemu(
        &self,
        node: &str,
        params: &QemuCreateParams,
    ) -> HypervisorResult<Option<String>> {
        self.reach(node)?;
        self.record(format!(
            "create_qemu {node} {} boot={} scsi0={} net0={}",
            params.vmid, params.boot, params.scsi0, params.net0
        ));
        self.put_guest(params.vmid, node, &params.name, "stopped", false);
        Ok(None)
    }

    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> HypervisorResult<()> {
        self.guest_on(node, vmid, action.verb())?;
        self.record(format!("power {node} {vmid} {}", action.verb()));
        let mut state = self.state.lock().unwrap();
        if state.refuse_power {
            return Err(rejected(action.verb(), "VM is locked"));
        }
        let ignore_stop = state.ignore_stop;
        if let Some(guest) = state.guests.get_mut(&vmid) {
            match action {
                PowerAction::Start => guest.status = "running".into(),
                PowerAction::Stop | PowerAction::Shutdown if !ignore_stop => {
                    guest.status = "stopped".into()
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn make_template(&self, node: &str, vmid: u32) -> HypervisorResult<()> {
        self.guest_on(node, vmid, "convert to template")?;
        self.record(format!("make_template {node} {vmid}"));
        if let Some(guest) = self.state.lock().unwrap().guests.get_mut(&vmid) {
            guest.template = true;
        }
        Ok(())
    }

    async fn storage_status(&self, node: &str, storage: &str) -> HypervisorResult<Value> {
        self.reach(node)?;
        let state = self.state.lock().unwrap();
        let present = state
            .storages
            .get(node)
            .is_some_and(|s| s.iter().any(|name| name == storage));
        if present {
            Ok(json!({"storage": storage, "active": 1}))
        } else {
            Err(rejected("storage status", &format!("storage '{storage}' does not exist")))
        }
    }

    async fn list_storage(&self, node: &str) -> HypervisorResult<Vec<String>> {
        self.reach(node)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .storages
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        _content: &str,
    ) -> HypervisorResult<Vec<StorageItem>> {
        self.reach(node)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .isos
            .iter()
            .filter(|(n, s, _)| n == node && s == storage)
            .map(|(_, _, volid)| StorageItem {
                volid: volid.clone(),
                format: Some("iso".into()),
                size: Some(1024),
            })
            .collect())
    }

    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        url: &str,
        filename: &str,
    ) -> HypervisorResult<String> {
        self.storage_status(node, storage).await?;
        self.record(format!("download_url {node} {storage} {url} {filename}"));
        Ok(format!("UPID:{node}:0000A1B2:0012C3D4:65F1A2B3:download:{filename}:root@pam:"))
    }

    async fn task_status(&self, node: &str, upid: &str) -> HypervisorResult<TaskState> {
        self.reach(node)?;
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&format!("{node}|{upid}"))
            .map(|(state, _)| state.clone())
            .ok_or_else(|| rejected("task status", "no such task"))
    }

    async fn task_log(&self, node: &str, upid: &str) -> HypervisorResult<Vec<String>> {
        self.reach(node)?;
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&format!("{node}|{upid}"))
            .map(|(_, log)| log.clone())
            .ok_or_else(|| rejected("task log", "no such task"))
    }

    async fn stop_task(&self, node: &str, upid: &str) -> HypervisorResult<()> {
        self.reach(node)?;
        self.record(format!("stop_task {node} {upid}"));
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(&format!("{node}|{upid}")) {
            Some((task, _)) => {
                task.status = "stopped".into();
                Ok(())
            }
            None => Err(rejected("stop task", "no such task")),
        }
    }

    async fn vnc_proxy(&self, node: &str, vmid: u32) -> HypervisorResult<VncTicket> {
        self.guest_on(node, vmid, "vncproxy")?;
        Ok(VncTicket {
            ticket: format!("PVEVNC:{vmid}"),
            port: "5900".into(),
            cert: None,
        })
    }
}

/// `HypervisorClient` that records calls and answers from canned values.
#[derive(Default)]
pub struct RecordingHypervisor {
    pub created: Mutex<Vec<(String, CloneRequest)>>,
    pub iso_builds: Mutex<Vec<(String, String, IsoBuildConfig)>>,
    pub power_calls: Mutex<Vec<(&'static str, u32)>>,
    pub converted: Mutex<Vec<u32>>,
    pub fail_create: Mutex<bool>,
    /// Clone requests whose VM name contains one of these fail.
    pub fail_names: Mutex<HashSet<String>>,
    /// Holds every clone request open this long before answering.
    pub create_delay: Mutex<Option<Duration>>,
    pub refuse: Mutex<bool>,
    next_id: Mutex<u32>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(300),
            ..Default::default()
        })
    }

    pub fn created(&self) -> Vec<(String, CloneRequest)> {
        self.created.lock().unwrap().clone()
    }

    pub fn power_calls(&self) -> Vec<(&'static str, u32)> {
        self.power_calls.lock().unwrap().clone()
    }

    pub fn fail_for(&self, fragment: &str) {
        self.fail_names.lock().unwrap().insert(fragment.to_string());
    }

    pub fn slow_creates(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Most clone requests that were ever open at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn clone_guest(&self, name: &str, request: &CloneRequest) -> HypervisorResult<CreatedVm> {
        let failing = *self.fail_create.lock().unwrap()
            || self
                .fail_names
                .lock()
                .unwrap()
                .iter()
                .any(|fragment| name.contains(fragment.as_str()));
        if failing {
            return Err(HypervisorError::TemplateNotFound {
                template_id: request.template_id,
            });
        }
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), request.clone()));
        Ok(CreatedVm {
            backend_id: self.allocate(),
            node: "pve".into(),
        })
    }

    fn allocate(&self) -> u32 {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        *next
    }

    fn power(&self, verb: &'static str, vmid: u32) -> HypervisorResult<bool> {
        self.power_calls.lock().unwrap().push((verb, vmid));
        Ok(!*self.refuse.lock().unwrap())
    }
}

#[async_trait]
impl HypervisorClient for RecordingHypervisor {
    async fn status(&self) -> BackendStatus {
        BackendStatus {
            online: true,
            version: Some(json!({"version": "8.1.4"})),
            details: None,
        }
    }

    async fn list_vms(&self) -> HypervisorResult<Vec<VmSummary>> {
        Ok(Vec::new())
    }

    async fn list_templates(&self) -> HypervisorResult<Vec<VmSummary>> {
        Ok(vec![VmSummary {
            vmid: 100,
            name: Some("ubuntu-22.04".into()),
            status: "stopped".into(),
            node: "pve".into(),
            template: true,
            cpus: Some(2),
            maxmem: Some(2 * 1024 * 1024 * 1024),
        }])
    }

    async fn vm_details(&self, vmid: u32) -> HypervisorResult<VmDetails> {
        let mut config = Map::new();
        config.insert("cores".into(), json!(2));
        config.insert("memory".into(), json!(2048));
        Ok(VmDetails {
            node: "pve".into(),
            config,
            status: Default::default(),
            ip: Some(format!("10.1.0.{}", vmid % 250)),
        })
    }

    async fn create_vm(&self, name: &str, request: &CloneRequest) -> HypervisorResult<CreatedVm> {
        let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(open, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.clone_guest(name, request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn start_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power("start", vmid)
    }

    async fn stop_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power("stop", vmid)
    }

    async fn shutdown_vm(&self, vmid: u32) -> HypervisorResult<bool> {
        self.power("shutdown", vmid)
    }

    async fn analytics(&self) -> HypervisorResult<ClusterAnalytics> {
        Ok(ClusterAnalytics {
            nodes: vec![json!({"node": "pve"})],
        })
    }

    async fn vm_stats(&self, _vmid: u32) -> HypervisorResult<VmStats> {
        Ok(VmStats::from(&labvm_manager::hypervisor::client::VmRuntime {
            status: "running".into(),
            cpu: 0.1,
            ..Default::default()
        }))
    }

    async fn console_ticket(&self, vmid: u32) -> HypervisorResult<ConsoleTicket> {
        Ok(ConsoleTicket {
            ticket: format!("PVEVNC:{vmid}"),
            port: "5900".into(),
            cert: None,
            node: "pve".into(),
            host: "pve.test.local".into(),
        })
    }

    async fn list_isos(&self) -> HypervisorResult<Vec<IsoImage>> {
        Ok(vec![IsoImage {
            volid: "local:iso/debian-12.iso".into(),
            node: "pve".into(),
            storage: "local".into(),
            size: Some(1024),
            format: Some("iso".into()),
        }])
    }

    async fn create_vm_from_iso(
        &self,
        name: &str,
        iso_ref: &str,
        config: &IsoBuildConfig,
    ) -> HypervisorResult<CreatedVm> {
        self.iso_builds
            .lock()
            .unwrap()
            .push((name.to_string(), iso_ref.to_string(), config.clone()));
        Ok(CreatedVm {
            backend_id: self.allocate(),
            node: "pve".into(),
        })
    }

    async fn convert_to_template(&self, vmid: u32) -> HypervisorResult<bool> {
        self.converted.lock().unwrap().push(vmid);
        Ok(!*self.refuse.lock().unwrap())
    }

    async fn download_iso(&self, _url: &str, file_name: &str, _storage: &str) -> HypervisorResult<String> {
        Ok(format!("UPID:pve2:0000A1B2:0012C3D4:65F1A2B3:download:{file_name}:root@pam:"))
    }

    async fn task_status(&self, _upid: &str, _node: &str) -> HypervisorResult<TaskState> {
        Ok(TaskState {
            status: "running".into(),
            exitstatus: None,
            extra: Map::new(),
        })
    }

    async fn task_log(&self, _upid: &str, _node: &str) -> HypervisorResult<Vec<String>> {
        Ok((1..=8).map(|i| format!("downloaded {}%", i * 10)).collect())
    }

    async fn cancel_task(&self, _upid: &str, _node: &str) -> HypervisorResult<bool> {
        Ok(true)
    }
}

pub const ADMIN: u64 = 1;
pub const BIZ: u64 = 2;
pub const PROF: u64 = 10;
pub const OTHER_PROF: u64 = 11;
pub const TA: u64 = 20;
pub const ALICE: u64 = 30;
pub const BOB: u64 = 31;
pub const COURSE: u64 = 500;
pub const OTHER_COURSE: u64 = 501;

/// Users and two courses; `COURSE` clones template 100, `OTHER_COURSE` has
/// no template.
pub async fn campus() -> Arc<MemoryRepository> {
    let repo = Arc::new(MemoryRepository::new());
    for user in [
        User::new(ADMIN, "root", Role::SysAdmin),
        User::new(BIZ, "finance", Role::BusinessAdmin),
        User::new(PROF, "prof.turing", Role::Professor),
        User::new(OTHER_PROF, "prof.hopper", Role::Professor),
        User::new(TA, "ta.lovelace", Role::Assistant),
        User::new(ALICE, "alice", Role::Student),
        User::new(BOB, "bob.smith", Role::Student),
    ] {
        repo.put_user(user).await;
    }
    repo.put_course(Course {
        id: COURSE,
        name: "Intro to CS".into(),
        description: None,
        professor_id: PROF,
        template_id: Some(100),
    })
    .await;
    repo.put_course(Course {
        id: OTHER_COURSE,
        name: "Theory".into(),
        description: None,
        professor_id: OTHER_PROF,
        template_id: None,
    })
    .await;
    repo
}
