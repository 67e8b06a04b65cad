//! Application startup and lifecycle management.

use crate::config::CredentialServiceConfig;
use crate::grpc::{
    proto::{credential_service_server::CredentialServiceServer, FILE_DESCRIPTOR_SET},
    CredentialServiceImpl,
};
use crate::services::metrics::{get_metrics, init_metrics};
use crate::services::{CredentialServices, Database, XChaChaCipher};
use crate::workers::RotationScheduler;
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::transport::Server as GrpcServer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: CredentialServiceConfig,
    pub db: Arc<Database>,
    pub services: CredentialServices,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "credential-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "credential-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CredentialServiceConfig) -> Result<Self, AppError> {
        init_metrics();

        // Reject a bad key before touching the database
        let cipher = XChaChaCipher::from_base64_key(&config.encryption_key).map_err(|e| {
            tracing::error!(error = %e, "Invalid CREDENTIAL_ENCRYPTION_KEY");
            AppError::ConfigError(anyhow::anyhow!("CREDENTIAL_ENCRYPTION_KEY: {}", e))
        })?;

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let services = CredentialServices::new(
            db.clone(),
            Arc::new(cipher),
            config.rotation_settings(),
            config.tier_thresholds(),
        );

        let state = AppState {
            config: config.clone(),
            db: Arc::new(db),
            services,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        // gRPC listens on port + 1
        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port + 1));
        let grpc_listener = TcpListener::bind(grpc_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %grpc_addr, "Failed to bind gRPC listener");
            AppError::from(e)
        })?;
        let grpc_port = grpc_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            "Credential service listeners bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn services(&self) -> &CredentialServices {
        &self.state.services
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let scheduler_token = if self.state.config.scheduler.enabled {
            let scheduler = RotationScheduler::new(
                self.state.services.schedules.clone(),
                self.state.services.engine.clone(),
                self.state.config.scheduler.interval(),
            );
            let token = scheduler.shutdown_token();
            tokio::spawn(scheduler.start());
            Some(token)
        } else {
            tracing::info!("Rotation scheduler disabled by configuration");
            None
        };

        let credential_service = CredentialServiceImpl::new(self.state.services.clone());

        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<CredentialServiceServer<CredentialServiceImpl>>()
            .await;

        // Reflection service for debugging
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| {
                std::io::Error::other(format!("Failed to build reflection service: {}", e))
            })?;

        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServer::builder()
            .layer(grpc_trace_layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(CredentialServiceServer::new(credential_service))
            .serve_with_incoming(incoming);

        tracing::info!(
            service = "credential-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            "Service ready to accept connections"
        );

        let result = tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                result.map_err(|e| {
                    tracing::error!(error = %e, "HTTP server error");
                    std::io::Error::other(format!("HTTP server error: {}", e))
                })
            }
            result = grpc_server => {
                result.map_err(|e| {
                    tracing::error!(error = %e, "gRPC server error");
                    std::io::Error::other(format!("gRPC server error: {}", e))
                })
            }
        };

        if let Some(token) = scheduler_token {
            token.cancel();
        }

        result
    }
}
