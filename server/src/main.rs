mod activity;
mod error;
mod render;
mod upstream;

use activity::PosterLinks;
use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use error::ApiError;
use render::{Layout, OutputMode, Renderer};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use upstream::Endpoint;

const ACTIVITY_PARAMS_MISSING: &str =
    "Missing required query parameters: 'tautulli_url' and 'api_key'";
const IMAGE_PARAMS_MISSING: &str = "Missing required query parameters for image proxy";

#[derive(Parser, Debug)]
#[command(name = "trmnl-activity-server")]
struct Args {
    /// Bind address (e.g. 0.0.0.0:8080)
    #[arg(long, env = "TRMNL_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Where the Tautulli URL and API key come from
    #[arg(long, env = "TRMNL_CREDENTIALS", value_enum, default_value_t = CredentialSource::Query)]
    credentials: CredentialSource,

    /// Tautulli base URL (required with --credentials config)
    #[arg(long, env = "TAUTULLI_URL")]
    tautulli_url: Option<String>,

    /// Tautulli API key (required with --credentials config)
    #[arg(long, env = "TAUTULLI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Response format for `/`
    #[arg(long, env = "TRMNL_OUTPUT", value_enum, default_value_t = OutputMode::Markup)]
    output: OutputMode,

    /// How poster images are linked from the page
    #[arg(long, env = "TRMNL_POSTERS", value_enum, default_value_t = PosterStrategy::Proxy)]
    posters: PosterStrategy,

    /// Markup view size
    #[arg(long, env = "TRMNL_LAYOUT", value_enum, default_value_t = Layout::Full)]
    layout: Layout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum CredentialSource {
    /// `tautulli_url` and `api_key` on every request's query string.
    Query,
    /// `--tautulli-url` and `--api-key` at startup.
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum PosterStrategy {
    /// Link posters through this server's `/image` route.
    Proxy,
    /// Link posters straight at Tautulli's image endpoint.
    Direct,
}

#[derive(Debug)]
struct Config {
    /// Set in the config deployment; `None` means every request brings its own.
    endpoint: Option<Endpoint>,
    posters: PosterStrategy,
}

impl Config {
    fn from_args(args: &Args) -> anyhow::Result<Self> {
        let endpoint = match args.credentials {
            CredentialSource::Query => None,
            CredentialSource::Config => {
                let url = non_blank(args.tautulli_url.as_deref())
                    .context("--tautulli-url (TAUTULLI_URL) is required with --credentials config")?;
                let key = non_blank(args.api_key.as_deref())
                    .context("--api-key (TAUTULLI_API_KEY) is required with --credentials config")?;
                Some(Endpoint::new(url, key))
            }
        };
        Ok(Self {
            endpoint,
            posters: args.posters,
        })
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    http: reqwest::Client,
    renderer: Arc<Renderer>,
}

impl AppState {
    fn endpoint_for(&self, tautulli_url: Option<&str>, api_key: Option<&str>) -> Option<Endpoint> {
        if let Some(fixed) = &self.config.endpoint {
            return Some(fixed.clone());
        }
        let url = non_blank(tautulli_url)?;
        let key = non_blank(api_key)?;
        Some(Endpoint::new(url, key))
    }

    fn poster_links<'a>(&self, endpoint: &'a Endpoint) -> PosterLinks<'a> {
        match self.config.posters {
            PosterStrategy::Direct => PosterLinks::Direct {
                base_url: endpoint.base_url(),
                api_key: endpoint.api_key(),
            },
            PosterStrategy::Proxy if self.config.endpoint.is_some() => {
                PosterLinks::Proxy { credentials: None }
            }
            PosterStrategy::Proxy => PosterLinks::Proxy {
                credentials: Some((endpoint.base_url(), endpoint.api_key())),
            },
        }
    }
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Deserialize)]
struct ActivityQuery {
    #[serde(default)]
    tautulli_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

async fn activity_page(
    State(state): State<AppState>,
    Query(q): Query<ActivityQuery>,
) -> Result<Response, ApiError> {
    let endpoint = state
        .endpoint_for(q.tautulli_url.as_deref(), q.api_key.as_deref())
        .ok_or(ApiError::MissingParams(ACTIVITY_PARAMS_MISSING))?;

    let raw = upstream::fetch_activity(&state.http, &endpoint).await?;
    let page = activity::assemble(raw, &state.poster_links(&endpoint), &chrono::Local::now());
    debug!(
        stream_count = page.stream_count,
        shown = page.sessions.len(),
        "assembled activity page"
    );

    Ok(state.renderer.render(&page)?.into_response())
}

#[derive(Deserialize)]
struct ImageQuery {
    #[serde(default)]
    img: Option<String>,
    #[serde(default)]
    tautulli_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHENTICATE,
];

async fn image_proxy(
    State(state): State<AppState>,
    Query(q): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    let img = non_blank(q.img.as_deref()).ok_or(ApiError::MissingParams(IMAGE_PARAMS_MISSING))?;
    let endpoint = state
        .endpoint_for(q.tautulli_url.as_deref(), q.api_key.as_deref())
        .ok_or(ApiError::MissingParams(IMAGE_PARAMS_MISSING))?;

    let fetched = upstream::fetch_image(&state.http, &endpoint, img)
        .await
        .map_err(ApiError::Image)?;

    let status = fetched.status();
    if !status.is_success() {
        warn!(%status, "image proxy: upstream returned non-success");
    }
    let mut headers: HeaderMap = fetched.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let mut resp = Response::new(Body::from_stream(fetched.bytes_stream()));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok(resp)
}

async fn healthz() -> &'static str {
    "ok"
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(activity_page))
        .route("/image", get(image_proxy))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let bind: SocketAddr = args
        .bind
        .parse()
        .context("invalid --bind (expected ip:port)")?;

    let config = Config::from_args(&args)?;
    let renderer = Renderer::new(args.output, args.layout).context("compile activity template")?;
    let http = upstream::build_client().context("build upstream http client")?;

    let state = AppState {
        config: Arc::new(config),
        http,
        renderer: Arc::new(renderer),
    };
    let app = build_router(state);

    info!(
        credentials = ?args.credentials,
        output = ?args.output,
        posters = ?args.posters,
        layout = ?args.layout,
        "listening on http://{bind}"
    );
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}
