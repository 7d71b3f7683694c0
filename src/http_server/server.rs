//! # HTTP Server
//!
//! Main HTTP server combining all endpoint routers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::config::HttpServerConfig;
use super::observability_routes::observability_routes;
use super::state::GatewayState;
use super::write_routes::{page_view_routes, sql_routes};
use crate::gateway::Gateway;
use crate::observability::{Event, Logger, Severity};

/// HTTP front of a [`Gateway`]
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
    shutdown: watch::Receiver<bool>,
}

impl HttpServer {
    /// Serve `gateway` until `shutdown` turns true. In-flight requests are
    /// cancelled at that point.
    pub fn new(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) -> Self {
        let config = gateway.config().http.clone();
        let expose_sql = gateway.config().expose_sql_endpoint;
        let state = Arc::new(GatewayState::new(gateway, shutdown.clone()));
        let router = Self::build_router(&config, state, expose_sql);
        Self {
            config,
            router,
            shutdown,
        }
    }

    /// Build the combined router with all endpoints
    fn build_router(config: &HttpServerConfig, state: Arc<GatewayState>, expose_sql: bool) -> Router {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        let mut router = Router::new()
            .merge(page_view_routes(state.clone()))
            .merge(observability_routes(state.clone()));
        if expose_sql {
            router = router.merge(sql_routes(state));
        }
        router.layer(cors)
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve
    pub async fn start(self) -> io::Result<()> {
        let addr: SocketAddr = self.config.socket_addr().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address {}: {}", self.config.socket_addr(), e),
            )
        })?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        Logger::event(
            Severity::Info,
            Event::Serving,
            &[("addr", &local.to_string())],
        );

        let mut shutdown = self.shutdown;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    }
}
