//! Control-plane endpoints: cluster management, port-forwards and OIDC login

use crate::config::ClusterConfig;
use crate::error::{
    full_body, json_error_response, json_error_with_status, BoxError, ErrorCode, GatewayBody,
    RegistryError,
};
use crate::oidc::{callback_url, AuthFlowBroker};
use crate::registry::ProxyRegistry;
use crate::target::{Metadata, Provenance};
use crate::tunnel::{OpenRequest, TunnelManager};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(bytes))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(
            ErrorCode::InternalError,
            format!("failed to encode response: {}", e),
        ),
    }
}

/// Helper to create a plain-text response
fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn redirect(status: StatusCode, location: &str) -> Response<GatewayBody> {
    match Response::builder()
        .status(status)
        .header(LOCATION, location)
        .body(full_body(Bytes::new()))
    {
        Ok(response) => response,
        Err(e) => json_error_response(
            ErrorCode::InternalError,
            format!("invalid redirect location: {}", e),
        ),
    }
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<GatewayBody>>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| {
            json_error_response(
                ErrorCode::InvalidRequest,
                format!("failed to read body: {}", Into::<BoxError>::into(e)),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&bytes).map_err(|e| {
        json_error_response(ErrorCode::InvalidRequest, format!("invalid request {}", e))
    })
}

fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Body of `POST /cluster`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddClusterRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    server: String,
    #[serde(default, rename = "insecureSkipTLSVerify")]
    insecure_skip_tls_verify: bool,
    /// Base64-encoded PEM bundle
    certificate_authority_data: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

/// Body of `DELETE /portforward`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosePortForwardRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    stop_or_delete: bool,
}

#[derive(Debug, Serialize)]
struct ConfigSnapshot {
    clusters: Vec<crate::target::ClusterSummary>,
}

/// Handlers for everything that is not proxied traffic
pub struct AdminApi {
    registry: Arc<ProxyRegistry>,
    tunnels: Arc<TunnelManager>,
    auth: Arc<AuthFlowBroker>,
    base_url: String,
    dynamic_clusters: bool,
}

impl AdminApi {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        tunnels: Arc<TunnelManager>,
        auth: Arc<AuthFlowBroker>,
        base_url: &str,
        dynamic_clusters: bool,
    ) -> Self {
        Self {
            registry,
            tunnels,
            auth,
            base_url: base_url.to_string(),
            dynamic_clusters,
        }
    }

    /// Dispatch on method and path; `path` has the base URL removed
    pub async fn handle<B>(&self, req: Request<B>, path: &str) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        debug!(%method, path, "Admin API request");

        match (&method, path) {
            (&Method::GET, "/version") => json_response(
                StatusCode::OK,
                &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            ),

            (&Method::GET, "/config") => self.config(StatusCode::OK),

            (&Method::POST, "/cluster") if self.dynamic_clusters => self.add_cluster(req).await,

            (&Method::DELETE, path) if self.dynamic_clusters && path.starts_with("/cluster/") => {
                let name = path.strip_prefix("/cluster/").unwrap_or_default();
                let name = urlencoding::decode(name)
                    .map(|n| n.into_owned())
                    .unwrap_or_else(|_| name.to_string());
                self.delete_cluster(&name)
            }

            (&Method::POST, "/portforward") => self.open_port_forward(req).await,
            (&Method::DELETE, "/portforward") => self.close_port_forward(req).await,
            (&Method::GET, "/portforward/list") => self.list_port_forwards(&req),
            (&Method::GET, "/portforward") => self.get_port_forward(&req),

            (&Method::GET, "/oidc") => {
                let cluster = query_params(&req).remove("cluster").unwrap_or_default();
                let redirect_url = callback_url(req.headers(), &self.base_url);
                self.begin_login(&cluster, redirect_url).await
            }
            (&Method::GET, "/oidc-callback") => {
                let mut params = query_params(&req);
                let state = params.remove("state").unwrap_or_default();
                let code = params.remove("code").unwrap_or_default();
                self.finish_login(&state, &code).await
            }

            _ => json_error_response(ErrorCode::UnknownRoute, "not found"),
        }
    }

    fn config(&self, status: StatusCode) -> Response<GatewayBody> {
        json_response(
            status,
            &ConfigSnapshot {
                clusters: self.registry.summaries(),
            },
        )
    }

    async fn add_cluster<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let request: AddClusterRequest = match read_json(req).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        if request.name.is_empty() || request.server.is_empty() {
            return json_error_response(
                ErrorCode::InvalidRequest,
                "Error creating cluster with invalid info; please provide a 'name' and 'server' fields at least.",
            );
        }

        let definition = ClusterConfig {
            server: request.server,
            certificate_authority_data: request.certificate_authority_data,
            insecure_skip_tls_verify: request.insecure_skip_tls_verify,
            metadata: request.metadata,
            ..Default::default()
        };
        if let Err(reason) = definition.validate(&request.name) {
            return json_error_response(ErrorCode::InvalidCluster, reason);
        }

        let result = definition
            .to_target(&request.name, Provenance::RuntimeAdded, false)
            .map_err(RegistryError::from)
            .and_then(|target| self.registry.add(target));

        match result {
            Ok(()) => {
                info!(cluster = %request.name, "Cluster added through the API");
                self.config(StatusCode::CREATED)
            }
            Err(e) => {
                warn!(cluster = %request.name, error = %e, "Error setting up cluster");
                json_error_response(e.code(), e.to_string())
            }
        }
    }

    fn delete_cluster(&self, name: &str) -> Response<GatewayBody> {
        match self.registry.remove(name) {
            Ok(_) => self.config(StatusCode::OK),
            Err(e) => json_error_response(e.code(), e.to_string()),
        }
    }

    async fn open_port_forward<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let token = bearer_token(&req);
        let request: OpenRequest = match read_json(req).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        match self.tunnels.open(request, token).await {
            Ok(session) => json_response(StatusCode::OK, &session),
            Err(e) => {
                warn!(error = %e, "Failed to open portforward");
                json_error_response(e.code(), e.to_string())
            }
        }
    }

    async fn close_port_forward<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let request: ClosePortForwardRequest = match read_json(req).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        if request.id.is_empty() {
            return json_error_response(ErrorCode::InvalidRequest, "id is required");
        }
        if request.cluster.is_empty() {
            return json_error_response(ErrorCode::InvalidRequest, "cluster is required");
        }

        match self
            .tunnels
            .close(&request.cluster, &request.id, request.stop_or_delete)
        {
            Ok(()) => text_response(StatusCode::OK, "stopped"),
            Err(e) => json_error_with_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.code(),
                format!("failed to delete port forward {}", e),
            ),
        }
    }

    fn list_port_forwards<B>(&self, req: &Request<B>) -> Response<GatewayBody> {
        let params = query_params(req);
        let Some(cluster) = params.get("cluster").filter(|c| !c.is_empty()) else {
            return json_error_response(ErrorCode::InvalidRequest, "cluster is required");
        };
        json_response(StatusCode::OK, &self.tunnels.list(cluster))
    }

    fn get_port_forward<B>(&self, req: &Request<B>) -> Response<GatewayBody> {
        let params = query_params(req);
        let Some(cluster) = params.get("cluster").filter(|c| !c.is_empty()) else {
            return json_error_response(ErrorCode::InvalidRequest, "cluster is required");
        };
        let Some(id) = params.get("id").filter(|i| !i.is_empty()) else {
            return json_error_response(ErrorCode::InvalidRequest, "id is required");
        };

        match self.tunnels.get(cluster, id) {
            Some(session) => json_response(StatusCode::OK, &session.view()),
            None => json_error_response(
                ErrorCode::SessionNotFound,
                format!("no portforward running with id {}", id),
            ),
        }
    }

    async fn begin_login(&self, cluster: &str, redirect_url: String) -> Response<GatewayBody> {
        match self.auth.begin(cluster, redirect_url).await {
            Ok(url) => redirect(StatusCode::FOUND, url.as_str()),
            Err(e) => {
                warn!(cluster, error = %e, "Cannot start OIDC login");
                json_error_response(e.code(), e.to_string())
            }
        }
    }

    async fn finish_login(&self, state: &str, code: &str) -> Response<GatewayBody> {
        match self.auth.callback(state, code).await {
            Ok(completion) => {
                redirect(StatusCode::SEE_OTHER, &self.auth.completion_redirect(&completion))
            }
            Err(e) => {
                warn!(error = %e, "OIDC callback failed");
                json_error_response(e.code(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::factory::ProxyFactory;
    use crate::credentials::CredentialMaterial;
    use crate::target::ProxyTarget;
    use crate::workload::KubeConnector;
    use http_body_util::Full;

    fn api(dynamic_clusters: bool) -> (AdminApi, Arc<ProxyRegistry>) {
        let registry = ProxyRegistry::new(ProxyFactory::default());
        let tunnels = TunnelManager::new(
            Arc::clone(&registry),
            Arc::new(KubeConnector),
            &TunnelConfig::default(),
        );
        let auth = AuthFlowBroker::new(Arc::clone(&registry), None, false, false, "").unwrap();
        (
            AdminApi::new(Arc::clone(&registry), tunnels, auth, "", dynamic_clusters),
            registry,
        )
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_delete_cluster() {
        let (api, registry) = api(true);

        let response = api
            .handle(
                request(
                    Method::POST,
                    "/cluster",
                    r#"{"name":"c1","server":"https://10.0.0.1:6443","metadata":{"source":"dynamic"}}"#,
                ),
                "/cluster",
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["clusters"][0]["name"], "c1");
        assert_eq!(json["clusters"][0]["metadata"]["source"], "dynamic");
        assert_eq!(
            registry.lookup("c1").unwrap().provenance(),
            Provenance::RuntimeAdded
        );

        let response = api
            .handle(request(Method::DELETE, "/cluster/c1", ""), "/cluster/c1")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["clusters"], serde_json::json!([]));

        let response = api
            .handle(request(Method::DELETE, "/cluster/c1", ""), "/cluster/c1")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_cluster_requires_name_and_server() {
        let (api, registry) = api(true);
        let response = api
            .handle(request(Method::POST, "/cluster", r#"{"name":"c1"}"#), "/cluster")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api
            .handle(request(Method::POST, "/cluster", "not json"), "/cluster")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_static_cluster_is_protected() {
        let (api, registry) = api(true);
        let target = ProxyTarget::new(
            "prod",
            "https://10.0.0.2",
            CredentialMaterial::new(),
            Provenance::StaticConfig,
        )
        .unwrap();
        registry.add(target).unwrap();

        let response = api
            .handle(request(Method::DELETE, "/cluster/prod", ""), "/cluster/prod")
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = api
            .handle(
                request(
                    Method::POST,
                    "/cluster",
                    r#"{"name":"prod","server":"https://10.0.0.3"}"#,
                ),
                "/cluster",
            )
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            registry.lookup("prod").unwrap().target().server().as_str(),
            "https://10.0.0.2/"
        );
    }

    #[tokio::test]
    async fn test_cluster_routes_hidden_when_dynamic_clusters_disabled() {
        let (api, _) = api(false);
        let response = api
            .handle(
                request(Method::POST, "/cluster", r#"{"name":"c1","server":"https://x"}"#),
                "/cluster",
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_port_forward_validation() {
        let (api, _) = api(false);

        let response = api
            .handle(
                request(Method::POST, "/portforward", r#"{"pod":"p","targetPort":"80","cluster":"c1"}"#),
                "/portforward",
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["message"]
            .as_str()
            .unwrap()
            .contains("namespace is required"));

        let response = api
            .handle(
                request(Method::POST, "/portforward", r#"{"namespace":"ns","pod":"p","targetPort":"80","cluster":"nope"}"#),
                "/portforward",
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = api
            .handle(request(Method::DELETE, "/portforward", r#"{"cluster":"c1"}"#), "/portforward")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api
            .handle(
                request(Method::DELETE, "/portforward", r#"{"id":"x","cluster":"c1","stopOrDelete":true}"#),
                "/portforward",
            )
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["message"],
            "failed to delete port forward PortForward not found"
        );
    }

    #[tokio::test]
    async fn test_port_forward_queries() {
        let (api, _) = api(false);

        let response = api
            .handle(request(Method::GET, "/portforward/list", ""), "/portforward/list")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api
            .handle(
                request(Method::GET, "/portforward/list?cluster=c1", ""),
                "/portforward/list",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));

        let response = api
            .handle(request(Method::GET, "/portforward?cluster=c1", ""), "/portforward")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api
            .handle(
                request(Method::GET, "/portforward?cluster=c1&id=abc", ""),
                "/portforward",
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oidc_errors() {
        let (api, _) = api(false);

        let response = api.handle(request(Method::GET, "/oidc", ""), "/oidc").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api
            .handle(request(Method::GET, "/oidc?cluster=missing", ""), "/oidc")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = api
            .handle(request(Method::GET, "/oidc-callback?code=x", ""), "/oidc-callback")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let state = crate::oidc::encode_state("c1");
        let uri = format!("/oidc-callback?state={}&code=x", urlencoding::encode(&state));
        let response = api.handle(request(Method::GET, &uri, ""), "/oidc-callback").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "invalid request");
    }

    #[test]
    fn test_bearer_token_extraction() {
        let req = Request::builder()
            .header(AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(bearer_token(&req), Some("abc".to_string()));

        let req = Request::builder()
            .header(AUTHORIZATION, "Basic abc")
            .body(())
            .unwrap();
        assert_eq!(bearer_token(&req), None);
    }
}
