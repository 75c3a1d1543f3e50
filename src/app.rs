use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    admin, auth, csrf::middleware::csrf_protect, rate_limit::middleware::rate_limit,
    state::AppState, storage::Store,
};

/// Request pipeline, outermost first: trace, CORS, rate limit, CSRF, router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_info))
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .merge(auth::router())
                .merge(admin::router()),
        )
        .layer(from_fn_with_state(state.clone(), csrf_protect))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "register": "POST /api/auth/register",
            "login": "POST /api/auth/login",
            "logout": "POST /api/auth/logout",
            "profile": "GET|PUT /api/profile",
            "admin_users": "GET /api/admin/users",
            "admin_role": "PUT /api/admin/users/:id/role",
            "admin_logs": "GET /api/admin/logs",
        },
    }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "database": "connected",
                "timestamp": timestamp,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "database": "disconnected",
                    "timestamp": timestamp,
                })),
            )
        }
    }
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{
            header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, RETRY_AFTER, SET_COOKIE},
            Method, Request,
        },
        response::Response,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        auth::claims::Role,
        config::{AppConfig, RateLimitRule},
        storage::memory::MemoryStore,
    };

    const PASSWORD: &str = "StrongPass123";

    struct Client {
        app: Router,
        cookies: String,
        csrf: String,
    }

    impl Client {
        async fn new(state: AppState) -> Self {
            let app = build_app(state);
            let res = app
                .clone()
                .oneshot(Request::get("/").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let pairs: Vec<String> = res
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string())
                .collect();
            let csrf = pairs
                .iter()
                .find_map(|c| c.strip_prefix("CSRF-TOKEN="))
                .expect("csrf cookie issued")
                .to_string();
            Self {
                app,
                cookies: pairs.join("; "),
                csrf,
            }
        }

        fn request(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> Request<Body> {
            let mut req = Request::builder()
                .method(method)
                .uri(uri)
                .header(COOKIE, &self.cookies)
                .header("x-csrf-token", &self.csrf)
                .header("x-forwarded-for", "203.0.113.10");
            if let Some(token) = token {
                req = req.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            let body = match body {
                Some(v) => {
                    req = req.header(CONTENT_TYPE, "application/json");
                    Body::from(v.to_string())
                }
                None => Body::empty(),
            };
            req.body(body).unwrap()
        }

        async fn raw(&self, req: Request<Body>) -> Response {
            self.app.clone().oneshot(req).await.unwrap()
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let res = self.raw(self.request(method, uri, token, body)).await;
            let status = res.status();
            let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn register(&self, email: &str) -> (StatusCode, Value) {
            self.send(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({ "email": email, "password": PASSWORD, "name": "Test" })),
            )
            .await
        }

        async fn login(&self, email: &str, password: &str) -> (StatusCode, Value) {
            self.send(
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await
        }

        async fn token_for(&self, email: &str) -> String {
            let (status, body) = self.login(email, PASSWORD).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            body["token"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn register_and_login_flow() {
        let client = Client::new(AppState::fake()).await;

        let (status, body) = client.register("User@Example.com").await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["email"], "user@example.com");
        assert_eq!(body["user"]["role"], "user");
        assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(body["user"].get("password_hash").is_none());

        let (status, body) = client.login("user@example.com", PASSWORD).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["token"].is_string());
        assert_eq!(body["user"]["name"], "Test");

        let (status, wrong) = client.login("user@example.com", "WrongPass999").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, unknown) = client.login("nobody@example.com", PASSWORD).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong["error"], unknown["error"]);

        let (status, body) = client.register("user@example.com").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Email already registered");
    }

    #[tokio::test]
    async fn registration_validation() {
        let client = Client::new(AppState::fake()).await;
        let cases = [
            json!({ "password": PASSWORD }),
            json!({ "email": "a@example.com" }),
            json!({ "email": "not-an-email", "password": PASSWORD }),
            json!({ "email": "a@example.com", "password": "short1" }),
            json!({ "email": "a@example.com", "password": "lettersonly" }),
        ];
        for case in cases {
            let (status, body) = client
                .send(Method::POST, "/api/register", None, Some(case.clone()))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{case} -> {body}");
            assert!(body["error"].is_string());
        }

        let res = client
            .raw(
                Request::post("/api/auth/login")
                    .header(COOKIE, &client.cookies)
                    .header("x-csrf-token", &client.csrf)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn profile_requires_live_session() {
        let client = Client::new(AppState::fake()).await;
        client.register("p@example.com").await;
        let token = client.token_for("p@example.com").await;

        let (status, body) = client.send(Method::GET, "/api/profile", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authorization token not provided");

        let (status, _) = client
            .send(Method::GET, "/api/profile", Some("garbage"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = client
            .send(Method::GET, "/api/profile", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "p@example.com");
        assert!(body["user"]["last_login"].is_string());

        let (status, body) = client
            .send(
                Method::PUT,
                "/api/profile",
                Some(&token),
                Some(json!({ "name": "  Renamed  " })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Renamed");

        let (status, _) = client
            .send(Method::PUT, "/api/profile", Some(&token), Some(json!({ "name": " " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_revokes_token() {
        let client = Client::new(AppState::fake()).await;
        let (_, body) = client.register("out@example.com").await;
        let token = body["token"].as_str().unwrap().to_string();

        let (status, _) = client
            .send(Method::GET, "/api/profile", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = client
            .send(Method::POST, "/api/auth/logout", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = client
            .send(Method::GET, "/api/profile", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Session revoked");

        let (status, _) = client.send(Method::POST, "/api/logout", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_enforce_roles() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(AppState::fake_with(store.clone(), AppState::test_config())).await;

        client.register("user@example.com").await;
        client.register("admin@example.com").await;
        client.register("root@example.com").await;
        store.set_role("admin@example.com", Role::Admin);
        store.set_role("root@example.com", Role::SuperAdmin);

        let user = client.token_for("user@example.com").await;
        let admin = client.token_for("admin@example.com").await;
        let root = client.token_for("root@example.com").await;

        let (status, _) = client.send(Method::GET, "/api/admin/users", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = client
            .send(Method::GET, "/api/admin/users", Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Insufficient permissions");

        let (status, body) = client
            .send(Method::GET, "/api/admin/users?limit=2", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["users"].as_array().unwrap().len(), 2);

        let (status, _) = client
            .send(Method::GET, "/api/admin/logs", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = client
            .send(Method::GET, "/api/admin/users", Some(&admin), None)
            .await;
        let target = body["users"]
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["email"] == "user@example.com")
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        let role_uri = format!("/api/admin/users/{target}/role");

        let (status, _) = client
            .send(Method::PUT, &role_uri, Some(&admin), Some(json!({ "role": "admin" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = client
            .send(Method::PUT, &role_uri, Some(&root), Some(json!({ "role": "owner" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = format!("/api/admin/users/{}/role", uuid::Uuid::new_v4());
        let (status, _) = client
            .send(Method::PUT, &missing, Some(&root), Some(json!({ "role": "admin" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = client
            .send(Method::PUT, &role_uri, Some(&root), Some(json!({ "role": "admin" })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["user"]["role"], "admin");

        let (status, body) = client
            .send(Method::GET, "/api/admin/logs", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["action"], "role_change");
        assert_eq!(logs[0]["meta"]["user_id"], target.as_str());
        assert_eq!(logs[0]["meta"]["role"], "admin");
        assert_eq!(logs[0]["meta"]["previous_role"], "user");
    }

    #[tokio::test]
    async fn role_change_revokes_target_sessions() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(AppState::fake_with(store.clone(), AppState::test_config())).await;

        let (_, body) = client.register("admin@example.com").await;
        let admin_id = body["user"]["id"].as_str().unwrap().to_string();
        client.register("root@example.com").await;
        store.set_role("admin@example.com", Role::Admin);
        store.set_role("root@example.com", Role::SuperAdmin);
        let admin = client.token_for("admin@example.com").await;
        let root = client.token_for("root@example.com").await;

        let (status, _) = client
            .send(Method::GET, "/api/admin/users", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = client
            .send(
                Method::PUT,
                &format!("/api/admin/users/{admin_id}/role"),
                Some(&root),
                Some(json!({ "role": "user" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["role"], "user");

        let (status, body) = client
            .send(Method::GET, "/api/admin/users", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Session revoked");

        let fresh = client.token_for("admin@example.com").await;
        let (status, _) = client
            .send(Method::GET, "/api/admin/users", Some(&fresh), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The acting super-admin keeps its session.
        let (status, _) = client
            .send(Method::GET, "/api/admin/logs", Some(&root), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn login_is_rate_limited() {
        let mut config: AppConfig = AppState::test_config();
        config.rate_limit.login = RateLimitRule {
            max: 2,
            window_seconds: 300,
        };
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(AppState::fake_with(store, config)).await;

        for _ in 0..2 {
            let (status, _) = client.login("x@example.com", PASSWORD).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let res = client
            .raw(client.request(
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({ "email": "x@example.com", "password": PASSWORD })),
            ))
            .await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = res.headers()[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry >= 1 && retry <= 300);

        // A different client address has its own budget.
        let res = client
            .raw(
                Request::post("/api/auth/login")
                    .header(COOKIE, &client.cookies)
                    .header("x-csrf-token", &client.csrf)
                    .header("x-forwarded-for", "198.51.100.1")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "email": "x@example.com", "password": PASSWORD }).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn csrf_rejects_missing_or_mismatched_token() {
        let client = Client::new(AppState::fake()).await;
        let body = json!({ "email": "c@example.com", "password": PASSWORD }).to_string();

        let res = client
            .raw(
                Request::post("/api/auth/register")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = client
            .raw(
                Request::post("/api/auth/register")
                    .header(COOKIE, &client.cookies)
                    .header("x-csrf-token", "0".repeat(64))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "Invalid CSRF token");

        let (status, _) = client.register("c@example.com").await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn csrf_cookies_are_not_rotated_when_present() {
        let client = Client::new(AppState::fake()).await;

        let res = client.raw(client.request(Method::GET, "/health", None, None)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(SET_COOKIE).is_none());

        let res = client
            .raw(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        let cookies: Vec<_> = res.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies
            .iter()
            .any(|c| c.to_str().unwrap().contains("HttpOnly")));
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(AppState::fake_with(store.clone(), AppState::test_config())).await;

        let (status, body) = client.send(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "connected");

        store.set_unhealthy();
        let (status, body) = client.send(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn api_info_lists_endpoints() {
        let client = Client::new(AppState::fake()).await;
        let (status, body) = client.send(Method::GET, "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "webapp-auth");
        assert!(body["endpoints"]["login"].is_string());
    }
}
