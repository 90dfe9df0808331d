//! Proxmox VE REST client.
//!
//! Talks to `/api2/json` with reqwest. Every request carries the client-side
//! timeout from settings; a request that times out or cannot connect is
//! `BackendUnreachable`, a non-2xx answer is `BackendOperationFailed`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{HypervisorError, HypervisorResult};
use crate::hypervisor::backend::{
    CloneParams, ClusterBackend, PowerAction, QemuCreateParams, QemuEntry, StorageItem, VncTicket,
};
use crate::hypervisor::client::{with_default_port, TaskState, VmRuntime};

pub const DEFAULT_API_PORT: u16 = 8006;
const LOG_PAGE_SIZE: usize = 500;
const MAX_LOG_PAGES: usize = 200;

/// How requests authenticate.
#[derive(Clone)]
pub enum ProxmoxAuth {
    /// `user@realm` + password, exchanged for a ticket cookie on first use.
    Password { user: String, password: String },
    /// `user@realm!tokenid` + secret, sent on every request.
    ApiToken { token_id: String, secret: String },
}

impl ProxmoxAuth {
    /// API tokens are recognisable by the `!` in the user part.
    pub fn from_credentials(user: &str, secret: &str) -> Self {
        if user.contains('!') {
            ProxmoxAuth::ApiToken {
                token_id: user.to_string(),
                secret: secret.to_string(),
            }
        } else {
            ProxmoxAuth::Password {
                user: user.to_string(),
                password: secret.to_string(),
            }
        }
    }
}

impl std::fmt::Debug for ProxmoxAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxmoxAuth::Password { user, .. } => write!(f, "Password({user})"),
            ProxmoxAuth::ApiToken { token_id, .. } => write!(f, "ApiToken({token_id})"),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct NodeRow {
    node: String,
}

#[derive(Deserialize)]
struct StorageRow {
    storage: String,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    t: String,
}

#[derive(Deserialize)]
struct LoginData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf: String,
}

#[derive(Debug)]
pub struct ProxmoxApi {
    http: reqwest::Client,
    base_url: String,
    host: String,
    auth: ProxmoxAuth,
    session: RwLock<Option<Session>>,
}

/// Splits a configured URL into the bare `host[:port]` part.
pub fn host_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

impl ProxmoxApi {
    pub fn new(
        url: &str,
        auth: ProxmoxAuth,
        verify_ssl: bool,
        timeout: Duration,
    ) -> HypervisorResult<Self> {
        let host = host_from_url(url);
        if host.is_empty() {
            return Err(HypervisorError::InvalidRequest(format!(
                "hypervisor url '{url}' has no host"
            )));
        }
        let authority = with_default_port(&host, DEFAULT_API_PORT);
        // Plain http only when asked for explicitly.
        let scheme = if url.starts_with("http://") { "http" } else { "https" };

        let mut headers = HeaderMap::new();
        if let ProxmoxAuth::ApiToken { token_id, secret } = &auth {
            let value = HeaderValue::from_str(&format!("PVEAPIToken={token_id}={secret}"))
                .map_err(|_| HypervisorError::InvalidRequest("invalid API token format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_ssl)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| HypervisorError::BackendUnreachable(e.to_string()))?;

        info!(host = %host, auth = ?auth, verify_ssl, timeout_secs = timeout.as_secs(), "Proxmox client configured");

        Ok(Self {
            http,
            base_url: format!("{scheme}://{authority}/api2/json"),
            host,
            auth,
            session: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn unreachable(operation: &str, err: reqwest::Error) -> HypervisorError {
        HypervisorError::BackendUnreachable(format!("{operation}: {err}"))
    }

    async fn login(&self, user: &str, password: &str) -> HypervisorResult<Session> {
        debug!(user, "Requesting Proxmox ticket");
        let resp = self
            .http
            .post(self.url("/access/ticket"))
            .form(&[("username", user), ("password", password)])
            .send()
            .await
            .map_err(|e| Self::unreachable("login", e))?;
        let data: LoginData = Self::decode("login", resp).await?;
        Ok(Session {
            ticket: data.ticket,
            csrf: data.csrf,
        })
    }

    async fn session(&self) -> HypervisorResult<Option<Session>> {
        let ProxmoxAuth::Password { user, password } = &self.auth else {
            return Ok(None);
        };
        if let Some(session) = self.session.read().await.clone() {
            return Ok(Some(session));
        }
        let mut slot = self.session.write().await;
        if let Some(session) = slot.clone() {
            return Ok(Some(session));
        }
        let session = self.login(user, password).await?;
        *slot = Some(session.clone());
        Ok(Some(session))
    }

    async fn decode<T: DeserializeOwned>(operation: &str, resp: reqwest::Response) -> HypervisorResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = status.canonical_reason().unwrap_or("error");
            let message = if body.trim().is_empty() {
                format!("{} {reason}", status.as_u16())
            } else {
                format!("{} {reason}: {}", status.as_u16(), body.trim())
            };
            return Err(HypervisorError::operation_failed(operation, message));
        }
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| HypervisorError::operation_failed(operation, format!("malformed response: {e}")))?;
        serde_json::from_value(envelope.data)
            .map_err(|e| HypervisorError::operation_failed(operation, format!("unexpected payload: {e}")))
    }

    /// Drops the cached ticket unless another caller already replaced it.
    async fn forget_session(&self, stale: &Session) {
        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|s| s.ticket == stale.ticket) {
            *slot = None;
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        form: Option<&[(String, String)]>,
        session: Option<&Session>,
        operation: &str,
    ) -> HypervisorResult<reqwest::Response> {
        let mut request = self.http.request(method.clone(), self.url(path));
        if let Some(session) = session {
            request = request.header(COOKIE, format!("PVEAuthCookie={}", session.ticket));
            if *method != Method::GET {
                request = request.header("CSRFPreventionToken", session.csrf.clone());
            }
        }
        if let Some(form) = form {
            request = request.form(form);
        }
        request
            .send()
            .await
            .map_err(|e| Self::unreachable(operation, e))
    }

    /// Ticket sessions expire after two hours. A 401 on a ticket is answered
    /// with one fresh login and one resend; a second 401 is returned as is.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
        operation: &str,
    ) -> HypervisorResult<T> {
        let session = self.session().await?;
        let resp = self
            .send(&method, path, form, session.as_ref(), operation)
            .await?;

        let resp = match session {
            Some(stale) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                warn!(operation, "Proxmox ticket rejected, logging in again");
                self.forget_session(&stale).await;
                let fresh = self.session().await?;
                self.send(&method, path, form, fresh.as_ref(), operation)
                    .await?
            }
            _ => resp,
        };

        Self::decode(operation, resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, operation: &str) -> HypervisorResult<T> {
        self.call(Method::GET, path, None, operation).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        operation: &str,
    ) -> HypervisorResult<T> {
        self.call(Method::POST, path, Some(form), operation).await
    }
}

fn upid_from(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn string_or_number(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_ipv4(interfaces: &Value) -> Option<String> {
    let list = interfaces.get("result").unwrap_or(interfaces).as_array()?;
    list.iter()
        .filter(|iface| iface.get("name").and_then(Value::as_str) != Some("lo"))
        .flat_map(|iface| {
            iface
                .get("ip-addresses")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .find(|addr| addr.get("ip-address-type").and_then(Value::as_str) == Some("ipv4"))
        .and_then(|addr| addr.get("ip-address").and_then(Value::as_str).map(str::to_string))
}

#[async_trait]
impl ClusterBackend for ProxmoxApi {
    fn host(&self) -> &str {
        &self.host
    }

    async fn version(&self) -> HypervisorResult<Value> {
        self.get("/version", "version").await
    }

    async fn nodes(&self) -> HypervisorResult<Vec<String>> {
        let rows: Vec<NodeRow> = self.get("/nodes", "list nodes").await?;
        Ok(rows.into_iter().map(|r| r.node).collect())
    }

    async fn node_status(&self, node: &str) -> HypervisorResult<Value> {
        let mut status: Value = self.get(&format!("/nodes/{node}/status"), "node status").await?;
        if let Value::Object(map) = &mut status {
            map.insert("node".to_string(), Value::String(node.to_string()));
        }
        Ok(status)
    }

    async fn list_qemu(&self, node: &str) -> HypervisorResult<Vec<QemuEntry>> {
        self.get(&format!("/nodes/{node}/qemu"), "list guests").await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> HypervisorResult<Map<String, Value>> {
        self.get(&format!("/nodes/{node}/qemu/{vmid}/config"), "guest config")
            .await
    }

    async fn vm_runtime(&self, node: &str, vmid: u32) -> HypervisorResult<VmRuntime> {
        self.get(&format!("/nodes/{node}/qemu/{vmid}/status/current"), "guest status")
            .await
    }

    async fn guest_ipv4(&self, node: &str, vmid: u32) -> HypervisorResult<Option<String>> {
        let path = format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces");
        match self.get::<Value>(&path, "guest agent interfaces").await {
            Ok(interfaces) => Ok(first_ipv4(&interfaces)),
            Err(e) if e.is_rejection() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn next_vmid(&self) -> HypervisorResult<u32> {
        let value: Value = self.get("/cluster/nextid", "next vmid").await?;
        string_or_number(Some(&value))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HypervisorError::operation_failed("next vmid", format!("unexpected id {value}")))
    }

    async fn clone_vm(
        &self,
        node: &str,
        source: u32,
        params: &CloneParams,
    ) -> HypervisorResult<Option<String>> {
        let form = vec![
            ("newid".to_string(), params.new_id.to_string()),
            ("name".to_string(), params.name.clone()),
            ("full".to_string(), u8::from(params.full).to_string()),
        ];
        let upid: Value = self
            .post(&format!("/nodes/{node}/qemu/{source}/clone"), &form, "clone")
            .await?;
        Ok(upid_from(upid))
    }

    async fn update_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(String, String)],
    ) -> HypervisorResult<()> {
        let _: Value = self
            .post(&format!("/nodes/{node}/qemu/{vmid}/config"), params, "update config")
            .await?;
        Ok(())
    }

    async fn create_qemu(
        &self,
        node: &str,
        params: &QemuCreateParams,
    ) -> HypervisorResult<Option<String>> {
        let upid: Value = self
            .post(&format!("/nodes/{node}/qemu"), &params.to_form(), "create guest")
            .await?;
        Ok(upid_from(upid))
    }

    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> HypervisorResult<()> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/{}", action.verb());
        let _: Value = self.post(&path, &[], action.verb()).await?;
        Ok(())
    }

    async fn make_template(&self, node: &str, vmid: u32) -> HypervisorResult<()> {
        let _: Value = self
            .post(&format!("/nodes/{node}/qemu/{vmid}/template"), &[], "convert to template")
            .await?;
        Ok(())
    }

    async fn storage_status(&self, node: &str, storage: &str) -> HypervisorResult<Value> {
        self.get(&format!("/nodes/{node}/storage/{storage}/status"), "storage status")
            .await
    }

    async fn list_storage(&self, node: &str) -> HypervisorResult<Vec<String>> {
        let rows: Vec<StorageRow> = self
            .get(&format!("/nodes/{node}/storage"), "list storage")
            .await?;
        Ok(rows.into_iter().map(|r| r.storage).collect())
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: &str,
    ) -> HypervisorResult<Vec<StorageItem>> {
        self.get(
            &format!("/nodes/{node}/storage/{storage}/content?content={content}"),
            "storage content",
        )
        .await
    }

    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        url: &str,
        filename: &str,
    ) -> HypervisorResult<String> {
        let form = vec![
            ("content".to_string(), "iso".to_string()),
            ("filename".to_string(), filename.to_string()),
            ("url".to_string(), url.to_string()),
        ];
        let upid: Value = self
            .post(&format!("/nodes/{node}/storage/{storage}/download-url"), &form, "download url")
            .await?;
        upid_from(upid).ok_or_else(|| {
            HypervisorError::operation_failed("download url", "backend returned no task id")
        })
    }

    async fn task_status(&self, node: &str, upid: &str) -> HypervisorResult<TaskState> {
        self.get(&format!("/nodes/{node}/tasks/{upid}/status"), "task status")
            .await
    }

    /// Pages through the whole log; the API hands out 50 lines by default.
    async fn task_log(&self, node: &str, upid: &str) -> HypervisorResult<Vec<String>> {
        let mut lines = Vec::new();
        for page in 0..MAX_LOG_PAGES {
            let start = page * LOG_PAGE_SIZE;
            let path = format!("/nodes/{node}/tasks/{upid}/log?start={start}&limit={LOG_PAGE_SIZE}");
            let chunk: Vec<LogLine> = self.get(&path, "task log").await?;
            let done = chunk.len() < LOG_PAGE_SIZE;
            lines.extend(chunk.into_iter().map(|l| l.t));
            if done {
                return Ok(lines);
            }
        }
        warn!(upid, lines = lines.len(), "Task log longer than page budget, returning what was read");
        Ok(lines)
    }

    async fn stop_task(&self, node: &str, upid: &str) -> HypervisorResult<()> {
        let _: Value = self
            .call(Method::DELETE, &format!("/nodes/{node}/tasks/{upid}"), None, "stop task")
            .await?;
        Ok(())
    }

    async fn vnc_proxy(&self, node: &str, vmid: u32) -> HypervisorResult<VncTicket> {
        let form = vec![("websocket".to_string(), "1".to_string())];
        let data: Value = self
            .post(&format!("/nodes/{node}/qemu/{vmid}/vncproxy"), &form, "vncproxy")
            .await?;
        Ok(VncTicket {
            ticket: data.get("ticket").and_then(Value::as_str).unwrap_or_default().to_string(),
            port: string_or_number(data.get("port")).unwrap_or_default(),
            cert: data.get("cert").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_parsing() {
        assert_eq!(host_from_url("https://192.168.1.34:8006"), "192.168.1.34:8006");
        assert_eq!(host_from_url("https://pve.lab.local/"), "pve.lab.local");
        assert_eq!(host_from_url("pve.lab.local"), "pve.lab.local");
        assert_eq!(host_from_url("https://"), "");
    }

    #[test]
    fn token_credentials_are_detected() {
        assert!(matches!(
            ProxmoxAuth::from_credentials("root@pam!automation", "secret"),
            ProxmoxAuth::ApiToken { .. }
        ));
        assert!(matches!(
            ProxmoxAuth::from_credentials("root@pam", "password"),
            ProxmoxAuth::Password { .. }
        ));
    }

    #[test]
    fn debug_hides_secrets() {
        let auth = ProxmoxAuth::from_credentials("root@pam", "hunter2");
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[test]
    fn agent_ipv4_skips_loopback() {
        let payload = json!({"result": [
            {"name": "lo", "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "127.0.0.1"}]},
            {"name": "eth0", "ip-addresses": [
                {"ip-address-type": "ipv6", "ip-address": "fe80::1"},
                {"ip-address-type": "ipv4", "ip-address": "10.10.0.23"}
            ]}
        ]});
        assert_eq!(first_ipv4(&payload).as_deref(), Some("10.10.0.23"));
        assert_eq!(first_ipv4(&json!({"result": []})), None);
    }

    #[test]
    fn ports_may_be_numbers() {
        assert_eq!(string_or_number(Some(&json!(5900))).as_deref(), Some("5900"));
        assert_eq!(string_or_number(Some(&json!("5901"))).as_deref(), Some("5901"));
        assert_eq!(string_or_number(None), None);
    }

    #[test]
    fn api_url_defaults_port() {
        let api = ProxmoxApi::new(
            "https://pve.lab.local",
            ProxmoxAuth::from_credentials("root@pam", "x"),
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(api.url("/version"), "https://pve.lab.local:8006/api2/json/version");
        assert_eq!(api.host(), "pve.lab.local");

        let v6 = ProxmoxApi::new(
            "https://[fd00::1]",
            ProxmoxAuth::from_credentials("root@pam", "x"),
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(v6.url("/version"), "https://[fd00::1]:8006/api2/json/version");
    }

    mod session {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        use axum::extract::State;
        use axum::http::StatusCode;
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use reqwest::header::{HeaderMap, COOKIE};
        use serde_json::{json, Value};

        use crate::hypervisor::backend::ClusterBackend;
        use crate::hypervisor::proxmox::api::{ProxmoxApi, ProxmoxAuth};

        /// Answers the ticket endpoint and rejects the first `rejections`
        /// node listings with 401.
        #[derive(Default)]
        struct FakePve {
            rejections: usize,
            logins: AtomicUsize,
            node_calls: AtomicUsize,
        }

        async fn ticket(State(pve): State<Arc<FakePve>>) -> Json<Value> {
            let n = pve.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({"data": {
                "ticket": format!("PVE:root@pam:{n}"),
                "CSRFPreventionToken": "csrf"
            }}))
        }

        async fn nodes(
            State(pve): State<Arc<FakePve>>,
            headers: HeaderMap,
        ) -> Result<Json<Value>, StatusCode> {
            let call = pve.node_calls.fetch_add(1, Ordering::SeqCst);
            let has_ticket = headers
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|c| c.starts_with("PVEAuthCookie=PVE:"));
            if call < pve.rejections || !has_ticket {
                return Err(StatusCode::UNAUTHORIZED);
            }
            Ok(Json(json!({"data": [{"node": "pve1"}]})))
        }

        async fn serve(rejections: usize, user: &str) -> (ProxmoxApi, Arc<FakePve>) {
            let pve = Arc::new(FakePve {
                rejections,
                ..Default::default()
            });
            let app = Router::new()
                .route("/api2/json/access/ticket", post(ticket))
                .route("/api2/json/nodes", get(nodes))
                .with_state(pve.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

            let api = ProxmoxApi::new(
                &format!("http://{addr}"),
                ProxmoxAuth::from_credentials(user, "secret"),
                true,
                Duration::from_secs(5),
            )
            .unwrap();
            (api, pve)
        }

        #[tokio::test]
        async fn expired_ticket_is_renewed_once() {
            let (api, pve) = serve(1, "root@pam").await;

            assert_eq!(api.nodes().await.unwrap(), vec!["pve1".to_string()]);
            assert_eq!(pve.logins.load(Ordering::SeqCst), 2);
            assert_eq!(pve.node_calls.load(Ordering::SeqCst), 2);

            api.nodes().await.unwrap();
            assert_eq!(pve.logins.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn persistent_rejection_is_not_retried_forever() {
            let (api, pve) = serve(usize::MAX, "root@pam").await;

            let err = api.nodes().await.unwrap_err();
            assert!(err.is_rejection(), "{err}");
            assert_eq!(pve.logins.load(Ordering::SeqCst), 2);
            assert_eq!(pve.node_calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn api_tokens_never_log_in() {
            let (api, pve) = serve(0, "root@pam!ci").await;

            assert!(api.nodes().await.is_err());
            assert_eq!(pve.logins.load(Ordering::SeqCst), 0);
            assert_eq!(pve.node_calls.load(Ordering::SeqCst), 1);
        }
    }
}
