// HTTP front for the compute engine: maps `/t/<tenant>/<path>` onto the
// request dispatcher, exposes tenant status and the live-update upload
// endpoint, and serves Prometheus counters. The dispatcher is synchronous
// (it blocks on VM executors), so calls run under spawn_blocking.

use std::sync::Arc;
use std::time::Duration;

use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use pingora::server::configuration::{Opt, ServerConf};
use pingora::server::Server;
use pingora::services::listening::Service;
use pingora_timeout::timeout;

use async_trait::async_trait;
use clap::Parser;
use http::{header, Method, Response, StatusCode};
use log::{error, info};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

use fccore::dispatch::{self, CallInputs};
use fccore::error::CallError;
use fccore::tenant_instance::UpdateOutcome;
use fccore::{BinaryStorage, TenantRegistry};

static REQ_CALL_COUNT: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("fcgate_req_call", "Number of backend calls").unwrap());

static ERR_CALL_COUNT: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("fcgate_err_call", "Number of failed backend calls").unwrap());

static LIVE_UPDATE_COUNT: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("fcgate_live_update", "Number of live updates").unwrap());

const TENANT_PREFIX: &str = "/t/";
const BODY_READ_TIMEOUT: Duration = Duration::from_millis(2000);
const MAX_BODY_SIZE: usize = 64 << 20;
const STREAM_CHUNK: u64 = 64 << 10;

struct GateApp {
    registry: Arc<TenantRegistry>,
}

fn response_no_body(status: StatusCode) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, 0)
        .body(Vec::new())
        .unwrap()
}

fn response_string(status: StatusCode, body: &str) -> Response<Vec<u8>> {
    let body: Vec<u8> = body.into();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, body.len())
        .body(body)
        .unwrap()
}

fn response_json(status: StatusCode, value: serde_json::Value) -> Response<Vec<u8>> {
    let body = value.to_string().into_bytes();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(body)
        .unwrap()
}

async fn read_full_request_body(session: &mut ServerSession, cap: usize) -> Option<Vec<u8>> {
    let mut acc = Vec::new();
    loop {
        match session.read_request_body().await {
            Ok(Some(bytes)) => {
                if acc.len() + bytes.len() > cap {
                    return None;
                }
                acc.extend_from_slice(&bytes);
            }
            Ok(None) => return Some(acc),
            Err(_) => return None,
        }
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Run the whole backend call against a tenant; executes on a blocking
/// thread because reservation and VM futures block.
fn run_backend_call(
    registry: &TenantRegistry,
    tenant_name: &str,
    inputs: CallInputs,
) -> Result<(u16, String, Vec<String>, Vec<u8>), CallError> {
    let tenant = registry
        .find(tenant_name)
        .ok_or_else(|| CallError::NoProgram(format!("no such tenant: {}", tenant_name)))?;
    let prog = tenant.ref_program(false)?;
    let resv = prog.reserve_vm()?;
    let result = dispatch::backend_call(&resv, &inputs)?;
    let body = if result.is_streamed() {
        dispatch::collect_streamed(&resv, &result, STREAM_CHUNK)?
    } else {
        dispatch::collect_body(&resv, &result)?
    };
    let mut headers = result.headers;
    if let Some(cache) = result.cache {
        if cache.cached {
            headers.push(format!(
                "Cache-Control: max-age={}, stale-while-revalidate={}",
                cache.ttl as u64, cache.grace as u64
            ));
        }
    }
    Ok((result.status, result.content_type, headers, body))
}

impl GateApp {
    async fn tenant_call(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        REQ_CALL_COUNT.inc();
        let req_parts: &http::request::Parts = session.req_header();
        let path = req_parts.uri.path().to_string();
        let rest = &path[TENANT_PREFIX.len()..];
        let (tenant_name, guest_path) = match rest.split_once('/') {
            Some((t, p)) => (t.to_string(), format!("/{}", p)),
            None => (rest.to_string(), "/".to_string()),
        };
        if tenant_name.is_empty() {
            return response_no_body(StatusCode::NOT_FOUND);
        }

        let method = req_parts.method.to_string();
        let argument = req_parts.uri.query().unwrap_or("").to_string();
        let content_type = req_parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let headers: Vec<String> = req_parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| format!("{}: {}", k, v)))
            .collect();

        let body = if req_parts.method == Method::POST || req_parts.method == Method::PUT {
            match timeout(BODY_READ_TIMEOUT, read_full_request_body(session, MAX_BODY_SIZE)).await {
                Ok(Some(b)) => Some(b),
                Ok(None) => return response_no_body(StatusCode::PAYLOAD_TOO_LARGE),
                Err(_) => return response_no_body(StatusCode::REQUEST_TIMEOUT),
            }
        } else {
            None
        };

        let inputs = CallInputs {
            method,
            url: guest_path,
            argument,
            content_type,
            headers,
            body,
            warmup: false,
        };

        let registry = self.registry.clone();
        let outcome =
            tokio::task::spawn_blocking(move || run_backend_call(&registry, &tenant_name, inputs)).await;

        match outcome {
            Ok(Ok((status, content_type, headers, body))) => {
                let mut builder = Response::builder()
                    .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                    .header(header::CONTENT_LENGTH, body.len());
                if !content_type.is_empty() {
                    builder = builder.header(header::CONTENT_TYPE, content_type);
                }
                for line in &headers {
                    if let Some((name, value)) = line.split_once(':') {
                        builder = builder.header(name.trim(), value.trim());
                    }
                }
                builder.body(body).unwrap_or_else(|_| response_no_body(StatusCode::INTERNAL_SERVER_ERROR))
            }
            Ok(Err(e)) => {
                ERR_CALL_COUNT.inc();
                error!("backend call failed: {}", e);
                let status =
                    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                response_string(status, &e.to_string())
            }
            Err(e) => {
                ERR_CALL_COUNT.inc();
                error!("backend call panicked: {}", e);
                response_no_body(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn live_update(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let req_parts: &http::request::Parts = session.req_header();
        let query = req_parts.uri.query().unwrap_or("").to_string();
        let Some(tenant_name) = query_param(&query, "tenant").map(String::from) else {
            return response_string(StatusCode::BAD_REQUEST, "missing tenant parameter");
        };
        let key = query_param(&query, "key").unwrap_or("").to_string();
        // the access key gates every live-update endpoint
        let Some(tenant) = self.registry.find_key(&tenant_name, &key) else {
            return response_no_body(StatusCode::FORBIDDEN);
        };

        let body = match timeout(BODY_READ_TIMEOUT, read_full_request_body(session, MAX_BODY_SIZE)).await {
            Ok(Some(b)) if !b.is_empty() => b,
            Ok(Some(_)) => return response_string(StatusCode::BAD_REQUEST, "empty file received"),
            Ok(None) => return response_no_body(StatusCode::PAYLOAD_TOO_LARGE),
            Err(_) => return response_no_body(StatusCode::REQUEST_TIMEOUT),
        };

        let outcome = tokio::task::spawn_blocking(move || tenant.live_update(body, false)).await;
        match outcome {
            Ok(Ok(UpdateOutcome::Stored)) => {
                LIVE_UPDATE_COUNT.inc();
                response_string(StatusCode::OK, "Update successful (stored)\n")
            }
            Ok(Ok(UpdateOutcome::NotStored)) => {
                LIVE_UPDATE_COUNT.inc();
                response_string(StatusCode::OK, "Update successful (not stored)\n")
            }
            Ok(Err(msg)) => response_string(StatusCode::BAD_REQUEST, &msg),
            Err(e) => {
                error!("live update panicked: {}", e);
                response_no_body(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[async_trait]
impl ServeHttp for GateApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let req_parts: &http::request::Parts = session.req_header();
        match (&req_parts.method, req_parts.uri.path()) {
            (&Method::GET, "/__status") => response_json(StatusCode::OK, self.registry.status_report()),
            (&Method::POST, "/__live_update") => self.live_update(session).await,
            (_, path) if path.starts_with(TENANT_PREFIX) => self.tenant_call(session).await,
            _ => response_no_body(StatusCode::NOT_FOUND),
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Tenant manifest (JSON file or URI)
    #[arg(long)]
    config: String,

    #[arg(long)]
    tcp: Option<String>,

    #[arg(long)]
    uds: Option<String>,

    /// Prometheus scrape endpoint
    #[arg(long)]
    prom: Option<String>,

    /// Initialize tenants on first request instead of at startup
    #[arg(long)]
    lazy: bool,

    /// Loader image substituted for dynamically linked guests
    #[arg(long)]
    dynamic_loader: Option<String>,

    /// Pin the server threads, e.g. "0-3"
    #[arg(long)]
    cpuset: Option<String>,
}

fn parse_cpuset_range(x: &str) -> Option<(usize, usize)> {
    let (a, b) = x.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn apply_cpuset(spec: &str) {
    let Some((begin, end)) = parse_cpuset_range(spec) else {
        error!("bad --cpuset {:?}, expected begin-end", spec);
        std::process::exit(1);
    };
    let mut set = nix::sched::CpuSet::new();
    for cpu in begin..=end {
        set.set(cpu).expect("cpu index out of range");
    }
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set).expect("sched_setaffinity");
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    if args.tcp.is_none() && args.uds.is_none() {
        eprintln!("--tcp or --uds must be provided");
        std::process::exit(1);
    }
    if let Some(spec) = &args.cpuset {
        apply_cpuset(spec);
    }
    if let Some(path) = &args.dynamic_loader {
        match BinaryStorage::map(path) {
            Ok(bin) => fccore::machine::install_dynamic_loader(bin),
            Err(e) => {
                eprintln!("could not load dynamic loader {}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let mut registry = TenantRegistry::new();
    let eager = !args.lazy;
    let loaded = if args.config.contains("://") {
        registry.load_uri(&args.config, eager)
    } else {
        registry.load_file(&args.config, eager)
    };
    match loaded {
        Ok(n) => info!("serving {} tenants", n),
        Err(e) => {
            eprintln!("could not load tenants from {}: {}", args.config, e);
            std::process::exit(1);
        }
    }

    let opt = Some(Opt { upgrade: false, daemon: false, nocapture: false, test: false, conf: None });
    let conf = ServerConf::default();
    let mut server = Server::new_with_opt_and_conf(opt, conf);
    server.bootstrap();

    let app = GateApp { registry: Arc::new(registry) };
    let mut service = Service::new("Compute Gate".to_string(), app);
    if let Some(addr) = &args.tcp {
        info!("listening on tcp {}", addr);
        service.add_tcp(addr);
    }
    if let Some(path) = &args.uds {
        info!("listening on uds {}", path);
        service.add_uds(path, None);
    }
    if let Some(addr) = &args.prom {
        let mut prom = Service::prometheus_http_service();
        prom.add_tcp(addr);
        server.add_service(prom);
    }
    server.add_service(service);
    server.run_forever();
}
