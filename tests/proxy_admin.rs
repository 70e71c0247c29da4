//! CaddyAdminClient and ProxyConfigManager against an in-process admin API.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::net::TcpListener;

use infracore::config::ProxyConfig;
use infracore::proxy::{CaddyAdminClient, ProxyConfigManager, ProxyError, ProxyRoute};

#[derive(Default)]
struct AdminState {
    document: Value,
    loads: u32,
    reject_loads: bool,
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<Mutex<AdminState>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let (status, body) = match (method, path.as_str()) {
        (Method::GET, "/config/") => {
            let document = state.lock().unwrap().document.clone();
            (StatusCode::OK, format!("{document}\n"))
        }
        (Method::POST, "/load") => {
            let mut state = state.lock().unwrap();
            if state.reject_loads {
                (
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"loading config: decoding request body"}"#.to_string(),
                )
            } else {
                state.document = serde_json::from_slice(&body).unwrap_or(Value::Null);
                state.loads += 1;
                (StatusCode::OK, String::new())
            }
        }
        _ => (StatusCode::NOT_FOUND, String::new()),
    };
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

async fn start_admin() -> (ProxyConfig, Arc<Mutex<AdminState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(Mutex::new(AdminState::default()));

    let shared = state.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let shared = shared.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, shared.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let config = ProxyConfig {
        admin_port: port,
        ..Default::default()
    };
    (config, state)
}

#[tokio::test]
async fn test_routes_round_trip_through_admin_api() {
    let (config, state) = start_admin().await;
    let manager = ProxyConfigManager::new(Arc::new(CaddyAdminClient::new(&config)), None);

    assert!(manager.list_routes("127.0.0.1").await.unwrap().is_empty());

    let app = ProxyRoute::new("App.Example.com", "127.0.0.1:10000").unwrap();
    let api = ProxyRoute::new("api.example.com", "127.0.0.1:10001").unwrap();
    manager.add_route("127.0.0.1", &app).await.unwrap();
    manager.add_route("127.0.0.1", &api).await.unwrap();

    let mut routes = manager.list_routes("127.0.0.1").await.unwrap();
    routes.sort_by(|a, b| a.domain.cmp(&b.domain));
    assert_eq!(routes, vec![api.clone(), app.clone()]);

    manager.remove_route("127.0.0.1", "app.example.com").await.unwrap();
    assert_eq!(manager.list_routes("127.0.0.1").await.unwrap(), vec![api]);
    assert_eq!(state.lock().unwrap().loads, 3);
}

#[tokio::test]
async fn test_removing_unknown_domain_does_not_load() {
    let (config, state) = start_admin().await;
    let manager = ProxyConfigManager::new(Arc::new(CaddyAdminClient::new(&config)), None);

    manager.remove_route("127.0.0.1", "nothing.example.com").await.unwrap();
    assert_eq!(state.lock().unwrap().loads, 0);
}

#[tokio::test]
async fn test_rejected_load_surfaces_admin_error() {
    let (config, state) = start_admin().await;
    state.lock().unwrap().reject_loads = true;
    let manager = ProxyConfigManager::new(Arc::new(CaddyAdminClient::new(&config)), None);

    let route = ProxyRoute::new("app.example.com", "127.0.0.1:10000").unwrap();
    let err = manager.add_route("127.0.0.1", &route).await.unwrap_err();
    match err {
        ProxyError::Api { status, message, .. } => {
            assert_eq!(status, 400);
            assert_eq!(message, "loading config: decoding request body");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
