use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StubState {
    ready: AtomicBool,
    hits: AtomicU32,
}

/// In-process readiness endpoint whose answer the test controls
pub struct HealthStub {
    addr: SocketAddr,
    state: Arc<StubState>,
}

impl HealthStub {
    /// Starts a stub that answers 200 on `/q/health/ready` when `ready`,
    /// 503 otherwise.
    pub async fn start(ready: bool) -> anyhow::Result<Self> {
        let state = Arc::new(StubState::default());
        state.ready.store(ready, Ordering::SeqCst);

        let app = Router::new()
            .route("/q/health/ready", get(readiness))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/q/health/ready", self.addr)
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    pub fn hits(&self) -> u32 {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn readiness(State(state): State<Arc<StubState>>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
