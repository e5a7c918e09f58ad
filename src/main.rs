use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use clap::Parser;
use http::Method;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rangeproxy::{proxy, statics, Store, VhostTable};

#[derive(Parser, Debug)]
#[command(name = "rangeproxy", version, about = "Caching HTTP range proxy")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = 6060)]
    port: u16,
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Virtual host config file
    #[arg(short, long, default_value = "vhost.json")]
    config: PathBuf,
    /// Cache database path
    #[arg(short, long, default_value = "cache.db")]
    db: PathBuf,
}

struct App {
    store: Arc<Store>,
    vhosts: Arc<VhostTable>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let store = Arc::new(Store::open(&args.db).context("open cache database")?);
    let vhosts = Arc::new(VhostTable::new(&args.config));
    if let Err(err) = vhosts.reload() {
        warn!(%err, "vhost config not loaded; proxying disabled until a reload succeeds");
    }

    tokio::spawn(maintenance(store.clone(), vhosts.clone()));

    let app = Arc::new(App {
        store: store.clone(),
        vhosts,
    });
    let router = Router::new().fallback(handle).with_state(app);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    store.flush();
    Ok(())
}

async fn handle(State(app): State<Arc<App>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().map(str::to_owned);
    let headers = req.headers().clone();

    let Some(mut route) = app.vhosts.resolve(&path) else {
        return statics::serve(&path).await;
    };
    if method != Method::GET && method != Method::HEAD {
        let mut resp = Response::new(axum::body::Body::empty());
        *resp.status_mut() = http::StatusCode::METHOD_NOT_ALLOWED;
        return resp;
    }
    if route.with_query {
        if let Some(query) = query {
            route.url = format!("{}?{}", route.url, query);
        }
    }
    proxy::serve(app.store.clone(), route, &method, &headers).await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

/// Background maintenance: a TTL sweep every five minutes, an immediate
/// sweep on SIGUSR2, and a vhost config reload on SIGUSR1.
#[cfg(unix)]
async fn maintenance(store: Arc<Store>, vhosts: Arc<VhostTable>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut reload = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "SIGUSR1 handler unavailable");
            return;
        }
    };
    let mut sweep = match signal(SignalKind::user_defined2()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "SIGUSR2 handler unavailable");
            return;
        }
    };
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            _ = tick.tick() => run_sweep(&store),
            _ = sweep.recv() => run_sweep(&store),
            _ = reload.recv() => {
                if let Err(err) = vhosts.reload() {
                    warn!(%err, "vhost reload failed, keeping previous rules");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn maintenance(store: Arc<Store>, _vhosts: Arc<VhostTable>) {
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        run_sweep(&store);
    }
}

fn run_sweep(store: &Store) {
    match store.expire() {
        Ok(removed) => info!(removed, "ttl sweep"),
        Err(err) => warn!(%err, "ttl sweep failed"),
    }
}
