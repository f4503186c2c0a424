//! Client agent: a long-running process that accepts load specifications
//! from the driver over plain HTTP, runs the campaign with its worker pool
//! and reports the aggregate back as JSON.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::{self, TransportCredentials};
use crate::types::LoadRequest;

pub struct AgentState {
    credentials: TransportCredentials,
    shutdown: mpsc::Sender<()>,
}

/// The control-plane server of a client process.
pub struct Agent {
    addr: String,
    credentials: TransportCredentials,
}

impl Agent {
    pub fn new(addr: &str, credentials: TransportCredentials) -> Self {
        Self {
            addr: addr.to_string(),
            credentials,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.run_with(listener).await
    }

    /// Serve control requests from an already-bound listener. Returns after
    /// `POST /stop` has been acknowledged and in-flight requests finished.
    pub async fn run_with(&self, listener: TcpListener) -> anyhow::Result<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(AgentState {
            credentials: self.credentials.clone(),
            shutdown: shutdown_tx,
        });

        let app = Router::new()
            .route("/load", post(handle_load))
            .route("/stop", post(handle_stop))
            .with_state(state);

        info!("client agent listening on http://{}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;
        info!("client agent stopped");
        Ok(())
    }
}

async fn handle_load(State(state): State<Arc<AgentState>>, body: Bytes) -> Response {
    let payload: LoadRequest = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    debug!("received load request {:?}", payload);

    if let Err(message) = payload.validate() {
        return (StatusCode::BAD_REQUEST, message).into_response();
    }

    match engine::run_campaign(&payload, &state.credentials).await {
        Ok(summary) => {
            debug!("sending response {:?}", summary);
            Json(summary).into_response()
        }
        Err(e) => {
            error!("error processing load request: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn handle_stop(State(state): State<Arc<AgentState>>) -> StatusCode {
    info!("stop requested, shutting down");
    let _ = state.shutdown.send(()).await;
    StatusCode::OK
}
