//! HTTP transport: Alpaca REST routes, management endpoints and setup pages

use alpaca_host::{device_page, index_page, AlpacaRequest, AlpacaResponse, Dispatcher, FormParams, Verb};
use anyhow::Result;
use axum::{
    extract::{rejection::FormRejection, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

type AppState = Arc<Dispatcher>;
type Pairs = Vec<(String, String)>;

pub fn router(dispatcher: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/{device_type}/{device_number}/{command}",
            get(device_get).put(device_put),
        )
        .route("/management/apiversions", get(api_versions))
        .route("/management/v1/{command}", get(management_get))
        .route("/setup", get(setup_index))
        .route("/setup/v1/{device_type}/{device_number}/setup", get(setup_device))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Serve until `shutdown` resolves
pub async fn run(
    dispatcher: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Starting Alpaca HTTP server");
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn dispatch(dispatcher: &Dispatcher, request: AlpacaRequest) -> Json<AlpacaResponse> {
    Json(dispatcher.handle(&request).await)
}

async fn device_get(
    State(dispatcher): State<AppState>,
    Path((device_type, device_number, command)): Path<(String, String, String)>,
    Query(query): Query<Pairs>,
) -> Json<AlpacaResponse> {
    let params: FormParams = query.into_iter().collect();
    let request = AlpacaRequest::new(device_type, device_number, command, Verb::Get).with_params(params);
    dispatch(&dispatcher, request).await
}

/// Form body and query string are merged; body keys take precedence.
///
/// A PUT without a form body (no content type) is served from the query alone.
async fn device_put(
    State(dispatcher): State<AppState>,
    Path((device_type, device_number, command)): Path<(String, String, String)>,
    Query(query): Query<Pairs>,
    body: Result<Form<Pairs>, FormRejection>,
) -> Json<AlpacaResponse> {
    let mut params: FormParams = match body {
        Ok(Form(pairs)) => pairs.into_iter().collect(),
        Err(rejection) => {
            debug!(command = %command, error = %rejection, "PUT without a form body");
            FormParams::new()
        }
    };
    params.extend(query);
    let request = AlpacaRequest::new(device_type, device_number, command, Verb::Put).with_params(params);
    dispatch(&dispatcher, request).await
}

async fn api_versions(State(dispatcher): State<AppState>, Query(query): Query<Pairs>) -> Json<AlpacaResponse> {
    management(&dispatcher, "apiversions", query).await
}

async fn management_get(
    State(dispatcher): State<AppState>,
    Path(command): Path<String>,
    Query(query): Query<Pairs>,
) -> Json<AlpacaResponse> {
    management(&dispatcher, &command, query).await
}

async fn management(dispatcher: &Dispatcher, command: &str, query: Pairs) -> Json<AlpacaResponse> {
    let params: FormParams = query.into_iter().collect();
    let request = AlpacaRequest::new("management", 0, command, Verb::Get).with_params(params);
    dispatch(dispatcher, request).await
}

async fn setup_index(State(dispatcher): State<AppState>) -> Html<String> {
    Html(index_page(&dispatcher).await)
}

async fn setup_device(
    State(dispatcher): State<AppState>,
    Path((device_type, device_number)): Path<(String, String)>,
) -> Response {
    match device_page(&dispatcher, &device_type, &device_number).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.message).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpaca_host::{FocuserDriver, ManagementDriver, RegisterOptions, Registry, ServerInfo};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let registry = Arc::new(Registry::new());
        registry.register(Box::new(ManagementDriver::new()), RegisterOptions::connected()).unwrap();
        registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::connected()).unwrap();
        router(Arc::new(Dispatcher::new(registry, ServerInfo::default())))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(app: Router, request: Request<Body>) -> Value {
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_get_echoes_client_transaction() {
        let request = Request::builder()
            .uri("/api/v1/focuser/0/position?ClientID=3&clienttransactionid=41")
            .body(Body::empty())
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["Value"], 4570);
        assert_eq!(json["ClientTransactionID"], 41);
        assert_eq!(json["ErrorNumber"], 0);
        assert_eq!(json["ErrorMessage"], "");
        assert!(json["ServerTransactionID"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_put_form_body() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/v1/focuser/0/move")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("position=99999999&ClientTransactionID=7"))
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ErrorNumber"], 0x401);
        assert_eq!(json["ClientTransactionID"], 7);
    }

    #[tokio::test]
    async fn test_form_values_are_percent_decoded() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/v1/focuser/0/move?ClientTransactionID=9")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("Position=%35%30%30%30&ClientID=1"))
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ErrorNumber"], 0);
        assert_eq!(json["ClientTransactionID"], 9);

        let request = Request::builder()
            .uri("/api/v1/focuser/0/position?ClientTransactionID=%34%32&ClientID=a+b")
            .body(Body::empty())
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ClientTransactionID"], 42);
    }

    #[tokio::test]
    async fn test_body_keys_take_precedence() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/v1/focuser/0/connected?Connected=true&ClientTransactionID=1")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("connected=false&clienttransactionid=2"))
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ErrorNumber"], 0);
        assert_eq!(json["ClientTransactionID"], 2);
    }

    #[tokio::test]
    async fn test_put_without_body_uses_query() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/v1/focuser/0/halt?ClientTransactionID=5")
            .body(Body::empty())
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ErrorNumber"], 0);
        assert_eq!(json["ClientTransactionID"], 5);
    }

    #[tokio::test]
    async fn test_bad_device_number_is_envelope_error() {
        let request = Request::builder()
            .uri("/api/v1/focuser/abc/position")
            .body(Body::empty())
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["ErrorNumber"], 0x401);
    }

    #[tokio::test]
    async fn test_management_routes() {
        let request = Request::builder().uri("/management/apiversions").body(Body::empty()).unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["Value"], serde_json::json!([1]));

        let request = Request::builder()
            .uri("/management/v1/configureddevices")
            .body(Body::empty())
            .unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["Value"].as_array().unwrap().len(), 1);

        let request = Request::builder().uri("/management/v1/description").body(Body::empty()).unwrap();
        let json = send_json(test_router(), request).await;
        assert_eq!(json["Value"]["ServerName"], "Alpaca Device Host");
    }

    #[tokio::test]
    async fn test_setup_pages() {
        let request = Request::builder().uri("/setup").body(Body::empty()).unwrap();
        let (status, body) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("/setup/v1/focuser/0/setup"));

        let request = Request::builder().uri("/setup/v1/focuser/0/setup").body(Body::empty()).unwrap();
        let (status, _) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder().uri("/setup/v1/rotator/0/setup").body(Body::empty()).unwrap();
        let (status, _) = send(test_router(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
