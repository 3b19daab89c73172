//! Port-forward tunnels into cluster workloads
//!
//! Each tunnel owns a local listener and a watchdog task. Both stop when the
//! session's cancellation token fires, whether from an explicit close, a
//! superseding open with the same id, a watchdog failure or shutdown.

use crate::config::TunnelConfig;
use crate::error::{TunnelError, WorkloadError};
use crate::registry::ProxyRegistry;
use crate::workload::{WorkloadClient, WorkloadConnector, WorkloadStream, WorkloadTransport, POD_RUNNING};
use dashmap::DashMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelStatus {
    Running,
    Stopped,
    Error,
}

/// A request to open (or re-open) a tunnel
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub service_namespace: String,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub cluster: String,
    /// Local port; a free one is picked when absent
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
}

impl OpenRequest {
    fn validate(&self) -> Result<u16, TunnelError> {
        let missing = |what: &str| Err(TunnelError::Validation(format!("{} is required", what)));
        if self.namespace.is_empty() {
            return missing("namespace");
        }
        if self.pod.is_empty() {
            return missing("pod name");
        }
        let Some(target_port) = self.target_port else {
            return missing("targetPort");
        };
        if self.cluster.is_empty() {
            return missing("cluster name");
        }
        Ok(target_port)
    }
}

/// Ports arrive either as JSON numbers or numeric strings; empty means unset
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match Option::<PortValue>::deserialize(deserializer)? {
        None | Some(PortValue::Number(0)) => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => match text.trim().parse::<u16>() {
            Ok(0) => Ok(None),
            Ok(port) => Ok(Some(port)),
            Err(_) => Err(D::Error::custom(format!("invalid port '{}'", text))),
        },
    }
}

/// One tunnel's identity and state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSession {
    pub id: String,
    pub pod: String,
    pub service: String,
    pub service_namespace: String,
    pub namespace: String,
    pub cluster: String,
    pub port: u16,
    pub target_port: u16,
    pub status: TunnelStatus,
    pub error: String,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl TunnelSession {
    /// The reduced view served by `GET /portforward`
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            pod: self.pod.clone(),
            service: self.service.clone(),
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionView {
    pub id: String,
    pub pod: String,
    pub service: String,
    pub cluster: String,
    pub namespace: String,
}

type SessionMap = Arc<DashMap<String, Vec<TunnelSession>>>;

/// Starts, tracks and stops tunnels
pub struct TunnelManager {
    registry: Arc<ProxyRegistry>,
    connector: Arc<dyn WorkloadConnector>,
    sessions: SessionMap,
    generations: AtomicU64,
    watchdog_interval: Duration,
    ready_timeout: Duration,
}

impl TunnelManager {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        connector: Arc<dyn WorkloadConnector>,
        config: &TunnelConfig,
    ) -> Arc<Self> {
        Self::with_timing(
            registry,
            connector,
            config.watchdog_interval(),
            config.ready_timeout(),
        )
    }

    pub fn with_timing(
        registry: Arc<ProxyRegistry>,
        connector: Arc<dyn WorkloadConnector>,
        watchdog_interval: Duration,
        ready_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connector,
            sessions: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
            watchdog_interval,
            ready_timeout,
        })
    }

    /// Open a tunnel and wait until it is ready.
    ///
    /// `caller_token` comes from the request; the cluster's static token is
    /// used when it is absent.
    pub async fn open(
        &self,
        request: OpenRequest,
        caller_token: Option<String>,
    ) -> Result<TunnelSession, TunnelError> {
        let target_port = request.validate()?;

        let entry = self
            .registry
            .lookup(&request.cluster)
            .ok_or_else(|| TunnelError::TargetNotFound(request.cluster.clone()))?;

        let id = if request.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            request.id.clone()
        };

        let port = match request.port {
            Some(port) => port,
            None => free_port().map_err(TunnelError::NoFreePort)?,
        };

        let token = caller_token
            .filter(|t| !t.is_empty())
            .or_else(|| entry.target().credentials().bearer_token().map(str::to_string));

        let client = self.connector.connect(WorkloadTransport {
            server: entry.handler().server().clone(),
            tls: entry.handler().tls_config(),
            http: entry.handler().http_client().clone(),
            token,
        });

        let cancel = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let tunnel = TunnelTask {
            client: Arc::clone(&client),
            namespace: request.namespace.clone(),
            pod: request.pod.clone(),
            local_port: port,
            target_port,
            cancel: cancel.clone(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let failure = FailureSink {
            sessions: Arc::clone(&self.sessions),
            cluster: request.cluster.clone(),
            id: id.clone(),
            generation,
        };
        tokio::spawn(tunnel.run(ready_tx, failure.clone()));

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                cancel.cancel();
                error!(cluster = %request.cluster, id = %id, error = %e, "Failed to start portforward");
                return Err(e);
            }
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(TunnelError::Aborted);
            }
            Err(_) => {
                cancel.cancel();
                warn!(cluster = %request.cluster, id = %id, "Portforward not ready in time");
                return Err(TunnelError::ReadyTimeout(self.ready_timeout));
            }
        }

        let session = TunnelSession {
            id: id.clone(),
            pod: request.pod,
            service: request.service,
            service_namespace: request.service_namespace,
            namespace: request.namespace,
            cluster: request.cluster,
            port,
            target_port,
            status: TunnelStatus::Running,
            error: String::new(),
            generation,
            cancel: cancel.clone(),
        };
        self.store(session.clone());

        let watchdog = Watchdog {
            client,
            namespace: session.namespace.clone(),
            pod: session.pod.clone(),
            interval: self.watchdog_interval,
            cancel,
        };
        tokio::spawn(watchdog.run(failure));

        info!(
            cluster = %session.cluster,
            id = %session.id,
            pod = %session.pod,
            namespace = %session.namespace,
            port = session.port,
            target_port = session.target_port,
            "Portforward running"
        );

        Ok(session)
    }

    /// Insert a session, replacing (and cancelling) one with the same id
    fn store(&self, session: TunnelSession) {
        let mut sessions = self.sessions.entry(session.cluster.clone()).or_default();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => {
                if existing.generation != session.generation {
                    existing.cancel.cancel();
                }
                *existing = session;
            }
            None => sessions.push(session),
        }
    }

    /// Stop (`stop = true`, kept as Stopped) or delete a session
    pub fn close(&self, cluster: &str, id: &str, stop: bool) -> Result<(), TunnelError> {
        let mut sessions = self
            .sessions
            .get_mut(cluster)
            .ok_or(TunnelError::SessionNotFound)?;
        let index = sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or(TunnelError::SessionNotFound)?;

        if stop {
            let session = &mut sessions[index];
            session.cancel.cancel();
            session.status = TunnelStatus::Stopped;
            info!(cluster, id, "Portforward stopped");
        } else {
            let session = sessions.remove(index);
            session.cancel.cancel();
            info!(cluster, id, "Portforward deleted");
        }
        Ok(())
    }

    /// All sessions for a cluster
    pub fn list(&self, cluster: &str) -> Vec<TunnelSession> {
        self.sessions
            .get(cluster)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn get(&self, cluster: &str, id: &str) -> Option<TunnelSession> {
        self.sessions
            .get(cluster)
            .and_then(|s| s.iter().find(|s| s.id == id).cloned())
    }

    /// Cancel every tunnel; sessions stay queryable
    pub fn shutdown(&self) {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            for session in entry.value() {
                if !session.cancel.is_cancelled() {
                    session.cancel.cancel();
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled portforwards");
        }
    }
}

/// Records an asynchronous failure against the session that spawned it
#[derive(Clone)]
struct FailureSink {
    sessions: SessionMap,
    cluster: String,
    id: String,
    generation: u64,
}

impl FailureSink {
    /// Running -> Error, applied at most once and only to our own generation
    fn record(&self, message: String) {
        let Some(mut sessions) = self.sessions.get_mut(&self.cluster) else {
            return;
        };
        let Some(session) = sessions
            .iter_mut()
            .find(|s| s.id == self.id && s.generation == self.generation)
        else {
            return;
        };
        if session.status != TunnelStatus::Running {
            return;
        }
        session.status = TunnelStatus::Error;
        session.error = message;
        session.cancel.cancel();
        warn!(cluster = %self.cluster, id = %self.id, error = %session.error, "Portforward failed");
    }
}

struct TunnelTask {
    client: Arc<dyn WorkloadClient>,
    namespace: String,
    pod: String,
    local_port: u16,
    target_port: u16,
    cancel: CancellationToken,
}

impl TunnelTask {
    async fn run(self, ready: oneshot::Sender<Result<(), TunnelError>>, failure: FailureSink) {
        let listener = match TcpListener::bind(("127.0.0.1", self.local_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready.send(Err(TunnelError::Bind {
                    port: self.local_port,
                    source,
                }));
                return;
            }
        };

        // Keep the first stream for the first local connection
        let mut spare = match self.open_stream().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        if ready.send(Ok(())).is_err() {
            // open() gave up waiting
            return;
        }

        let this = Arc::new(self);
        loop {
            tokio::select! {
                _ = this.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        debug!(peer = %peer, pod = %this.pod, "Portforward connection accepted");
                        let tunnel = Arc::clone(&this);
                        let stream = spare.take();
                        tokio::spawn(async move { tunnel.forward(inbound, stream).await });
                    }
                    Err(e) => {
                        failure.record(e.to_string());
                        break;
                    }
                }
            }
        }

        debug!(port = this.local_port, pod = %this.pod, "Portforward listener closed");
    }

    async fn open_stream(&self) -> Result<WorkloadStream, WorkloadError> {
        self.client
            .open_stream(&self.namespace, &self.pod, self.target_port)
            .await
    }

    async fn forward(&self, mut inbound: TcpStream, spare: Option<WorkloadStream>) {
        let mut upstream = match spare {
            Some(stream) => stream,
            None => match self.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(pod = %self.pod, error = %e, "Failed to open portforward stream");
                    return;
                }
            },
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => {
                if let Err(e) = result {
                    debug!(pod = %self.pod, error = %e, "Portforward connection ended");
                }
            }
        }
    }
}

/// Periodically checks that the pod behind a tunnel is still running
struct Watchdog {
    client: Arc<dyn WorkloadClient>,
    namespace: String,
    pod: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl Watchdog {
    async fn run(self, failure: FailureSink) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    match self.client.pod_phase(&self.namespace, &self.pod).await {
                        Ok(phase) if phase == POD_RUNNING => {}
                        Ok(phase) => {
                            debug!(pod = %self.pod, phase = %phase, "Pod left the running phase");
                            failure.record("Pod is not running".to_string());
                            break;
                        }
                        Err(WorkloadError::ConnectionRefused(e)) => {
                            debug!(pod = %self.pod, error = %e, "API server refused connection, retrying");
                        }
                        Err(e) => {
                            failure.record(e.to_string());
                            break;
                        }
                    }
                }
            }
        }
        self.cancel.cancel();
    }
}

/// Reserve an ephemeral local port.
///
/// The port is released before the tunnel binds it, so another process may
/// take it in between.
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialMaterial;
    use crate::factory::ProxyFactory;
    use crate::target::{Provenance, ProxyTarget};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes every stream and reports a scripted pod phase
    struct FakeClient {
        phase: Mutex<Result<String, WorkloadError>>,
        phase_calls: AtomicUsize,
        streams: AtomicUsize,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl FakeClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                phase: Mutex::new(Ok(POD_RUNNING.to_string())),
                phase_calls: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            })
        }

        fn set_phase(&self, phase: Result<String, WorkloadError>) {
            *self.phase.lock() = phase;
        }
    }

    #[async_trait]
    impl WorkloadClient for FakeClient {
        async fn open_stream(
            &self,
            _namespace: &str,
            _pod: &str,
            _port: u16,
        ) -> Result<WorkloadStream, WorkloadError> {
            self.streams.fetch_add(1, Ordering::SeqCst);
            let (local, mut remote) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = remote.read(&mut buf).await {
                    if n == 0 || remote.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(local))
        }

        async fn pod_phase(&self, _namespace: &str, _pod: &str) -> Result<String, WorkloadError> {
            self.phase_calls.fetch_add(1, Ordering::SeqCst);
            self.phase.lock().clone()
        }
    }

    struct FakeConnector(Arc<FakeClient>);

    impl WorkloadConnector for FakeConnector {
        fn connect(&self, transport: WorkloadTransport) -> Arc<dyn WorkloadClient> {
            self.0.tokens.lock().push(transport.token);
            self.0.clone()
        }
    }

    fn manager(client: Arc<FakeClient>, watchdog_ms: u64) -> Arc<TunnelManager> {
        let registry = ProxyRegistry::new(ProxyFactory::default());
        let credentials = CredentialMaterial::new().with_bearer_token(Some("static".into()));
        registry
            .add(
                ProxyTarget::new("c1", "https://10.0.0.1:6443", credentials, Provenance::StaticConfig)
                    .unwrap(),
            )
            .unwrap();

        TunnelManager::with_timing(
            registry,
            Arc::new(FakeConnector(client)),
            Duration::from_millis(watchdog_ms),
            Duration::from_secs(5),
        )
    }

    fn request(id: &str) -> OpenRequest {
        OpenRequest {
            id: id.to_string(),
            namespace: "ns1".to_string(),
            pod: "pod1".to_string(),
            target_port: Some(8080),
            cluster: "c1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_accepts_string_and_number_ports() {
        let req: OpenRequest = serde_json::from_str(
            r#"{"namespace":"ns1","pod":"pod1","targetPort":"8080","cluster":"c1","port":""}"#,
        )
        .unwrap();
        assert_eq!(req.target_port, Some(8080));
        assert_eq!(req.port, None);

        let req: OpenRequest =
            serde_json::from_str(r#"{"targetPort":8080,"port":"9000"}"#).unwrap();
        assert_eq!(req.port, Some(9000));

        assert!(serde_json::from_str::<OpenRequest>(r#"{"targetPort":"http"}"#).is_err());
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 1000);

        let cases = [
            (OpenRequest { namespace: String::new(), ..request("a") }, "namespace is required"),
            (OpenRequest { pod: String::new(), ..request("a") }, "pod name is required"),
            (OpenRequest { target_port: None, ..request("a") }, "targetPort is required"),
            (OpenRequest { cluster: String::new(), ..request("a") }, "cluster name is required"),
        ];
        for (req, message) in cases {
            let err = manager.open(req, None).await.unwrap_err();
            assert!(matches!(err, TunnelError::Validation(_)));
            assert!(err.to_string().contains(message));
        }
        assert_eq!(client.streams.load(Ordering::SeqCst), 0);
        assert!(manager.list("c1").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let manager = manager(FakeClient::new(), 1000);
        let err = manager
            .open(OpenRequest { cluster: "nope".into(), ..request("") }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn test_open_forwards_bytes() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 1000);

        let session = manager.open(request(""), None).await.unwrap();
        assert!(!session.id.is_empty());
        assert_ne!(session.port, 0);
        assert_eq!(session.status, TunnelStatus::Running);

        let mut conn = TcpStream::connect(("127.0.0.1", session.port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The first connection reuses the stream opened at startup
        assert_eq!(client.streams.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_caller_token_preferred_over_static() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 1000);

        manager.open(request("a"), Some("caller".into())).await.unwrap();
        manager.open(request("b"), None).await.unwrap();

        let tokens = client.tokens.lock().clone();
        assert_eq!(
            tokens,
            vec![Some("caller".to_string()), Some("static".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reopen_same_id_updates_in_place() {
        let manager = manager(FakeClient::new(), 1000);

        let first = manager.open(request("fixed"), None).await.unwrap();
        let second = manager.open(request("fixed"), None).await.unwrap();

        let sessions = manager.list("c1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].port, second.port);
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_then_delete() {
        let manager = manager(FakeClient::new(), 1000);
        let session = manager.open(request("x"), None).await.unwrap();

        manager.close("c1", "x", true).unwrap();
        let stopped = manager.get("c1", "x").unwrap();
        assert_eq!(stopped.status, TunnelStatus::Stopped);
        assert!(session.cancel.is_cancelled());

        manager.close("c1", "x", false).unwrap();
        assert!(manager.get("c1", "x").is_none());
        assert!(matches!(
            manager.close("c1", "x", false),
            Err(TunnelError::SessionNotFound)
        ));
        assert!(matches!(
            manager.close("other", "x", true),
            Err(TunnelError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_pod_not_running_errors_once() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 20);
        manager.open(request("w"), None).await.unwrap();

        client.set_phase(Ok("Succeeded".to_string()));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let session = manager.get("c1", "w").unwrap();
        assert_eq!(session.status, TunnelStatus::Error);
        assert_eq!(session.error, "Pod is not running");

        let calls = client.phase_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.phase_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_connection_refused_is_tolerated() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 20);
        manager.open(request("r"), None).await.unwrap();

        client.set_phase(Err(WorkloadError::ConnectionRefused("refused".into())));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.get("c1", "r").unwrap().status, TunnelStatus::Running);

        client.set_phase(Err(WorkloadError::Status {
            status: 404,
            message: "pods \"pod1\" not found".into(),
        }));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let session = manager.get("c1", "r").unwrap();
        assert_eq!(session.status, TunnelStatus::Error);
        assert!(session.error.contains("404"));
    }

    #[tokio::test]
    async fn test_stopped_session_not_marked_error() {
        let client = FakeClient::new();
        let manager = manager(Arc::clone(&client), 20);
        manager.open(request("s"), None).await.unwrap();
        manager.close("c1", "s", true).unwrap();

        client.set_phase(Ok("Failed".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get("c1", "s").unwrap().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let manager = manager(FakeClient::new(), 1000);
        let err = manager
            .open(OpenRequest { port: Some(port), ..request("b") }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Bind { .. }));
        assert!(manager.list("c1").is_empty());
    }

    #[test]
    fn test_session_json_shape() {
        let session = TunnelSession {
            id: "abc".into(),
            pod: "pod1".into(),
            service: String::new(),
            service_namespace: String::new(),
            namespace: "ns1".into(),
            cluster: "c1".into(),
            port: 40000,
            target_port: 8080,
            status: TunnelStatus::Running,
            error: String::new(),
            generation: 1,
            cancel: CancellationToken::new(),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["port"], 40000);
        assert_eq!(json["targetPort"], 8080);
        assert_eq!(json["status"], "Running");
        assert_eq!(json["serviceNamespace"], "");
        assert!(json.get("generation").is_none());

        let view = serde_json::to_value(session.view()).unwrap();
        assert_eq!(view.as_object().unwrap().len(), 5);
    }
}
