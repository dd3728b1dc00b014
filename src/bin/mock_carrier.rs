//! Mock carrier tracking API
//!
//! Local stand-in for the external carrier HTTP API.
//!
//! Routes:
//! - `GET /health` - no auth
//! - `GET /admin/codes` - fixture listing, no auth
//! - `GET /client/Carriers/Tracking/{code}` - bearer token starting with `eyJ`
//!   - fixture codes answer `{ success, data: { code, carrier, status, events } }`
//!   - `ERROR` answers 500
//!   - `TIMEOUT` never answers
//!   - anything else answers 404
//!
//! Usage:
//!   cargo run --bin mock-carrier -- --port 3002 --delay-ms 500

use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use http_body_util::Full;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const TRACKING_PREFIX: &str = "/client/Carriers/Tracking/";

#[derive(Parser, Debug)]
#[command(name = "mock-carrier")]
#[command(about = "Mock carrier tracking API for local runs")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "3002")]
    port: u16,

    /// Simulated network delay before each tracking answer (ms)
    #[arg(long, default_value = "500")]
    delay_ms: u64,
}

fn event(date: &str, status: &str, location: &str, description: &str) -> Value {
    json!({ "date": date, "status": status, "location": location, "description": description })
}

fn fixtures() -> Vec<Value> {
    let posted = event("2025-01-20T10:30:00Z", "Objeto postado", "São Paulo, SP", "Objeto postado na unidade de origem");
    let transit = event("2025-01-21T14:00:00Z", "Em trânsito", "São Paulo, SP", "Objeto em trânsito para destino");
    let out = event("2025-01-22T08:00:00Z", "Saiu para entrega", "Rio de Janeiro, RJ", "Objeto saiu para entrega");

    vec![
        json!({
            "code": "SM82886187440BM",
            "carrier": "Carriers",
            "status": "Entregue",
            "events": [
                posted.clone(),
                transit.clone(),
                event("2025-01-21T15:00:00Z", "Entregue", "Silvianopolis, MG", "Chegou em Silvianopolis, MG"),
            ],
        }),
        json!({
            "code": "SM82886187441BM",
            "carrier": "Carriers",
            "status": "Saiu para entrega",
            "events": [posted.clone(), transit.clone(), out.clone()],
        }),
        json!({
            "code": "SM82886187442BM",
            "carrier": "Carriers",
            "status": "Entregue",
            "events": [
                posted.clone(),
                transit.clone(),
                out.clone(),
                event("2025-01-22T15:30:00Z", "Entregue", "Rio de Janeiro, RJ", "Objeto entregue ao destinatário"),
            ],
        }),
        json!({
            "code": "SM82886187443BM",
            "carrier": "Carriers",
            "status": "Tentativa de entrega",
            "events": [
                posted.clone(),
                transit.clone(),
                out.clone(),
                event(
                    "2025-01-22T15:30:00Z",
                    "Tentativa de entrega",
                    "Rio de Janeiro, RJ",
                    "Tentativa de entrega - destinatário ausente",
                ),
            ],
        }),
    ]
}

struct MockState {
    fixtures: Vec<Value>,
    delay: Duration,
}

impl MockState {
    fn find(&self, code: &str) -> Option<&Value> {
        self.fixtures.iter().find(|f| f["code"] == code)
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn failure(status: StatusCode, error: &str, code: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        json!({ "success": false, "error": error, "code": code, "timestamp": Utc::now().to_rfc3339() }),
    )
}

/// `Ok(())` for a bearer token starting with `eyJ`
fn authenticate<B>(req: &Request<B>) -> Result<(), Response<Full<Bytes>>> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_whitespace().nth(1));

    match token {
        None => Err(failure(StatusCode::UNAUTHORIZED, "access token required", "MISSING_TOKEN")),
        Some(t) if !t.starts_with("eyJ") => Err(failure(StatusCode::UNAUTHORIZED, "invalid token", "INVALID_TOKEN")),
        Some(_) => Ok(()),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    if req.method() != Method::GET {
        return Ok(failure(StatusCode::NOT_FOUND, "endpoint not found", "NOT_FOUND"));
    }

    match path.as_str() {
        "/health" => {
            return Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "healthy",
                    "timestamp": Utc::now().to_rfc3339(),
                    "service": "mock-carrier",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            ));
        }
        "/admin/codes" => {
            let codes: Vec<Value> = state
                .fixtures
                .iter()
                .map(|f| {
                    json!({
                        "code": f["code"],
                        "status": f["status"],
                        "eventsCount": f["events"].as_array().map_or(0, Vec::len),
                    })
                })
                .collect();
            return Ok(json_response(StatusCode::OK, json!({ "success": true, "data": codes })));
        }
        _ => {}
    }

    let Some(code) = path.strip_prefix(TRACKING_PREFIX) else {
        return Ok(failure(StatusCode::NOT_FOUND, "endpoint not found", "NOT_FOUND"));
    };

    if let Err(response) = authenticate(&req) {
        return Ok(response);
    }

    println!("[MOCK] tracking lookup: {code}");

    match code {
        "ERROR" => Ok(failure(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", "INTERNAL_SERVER_ERROR")),
        "TIMEOUT" => {
            // Hold the connection open until the client gives up
            std::future::pending::<()>().await;
            Ok(failure(StatusCode::GATEWAY_TIMEOUT, "unreachable", "TIMEOUT"))
        }
        _ => {
            tokio::time::sleep(state.delay).await;
            match state.find(code) {
                Some(data) => Ok(json_response(
                    StatusCode::OK,
                    json!({ "success": true, "data": data, "timestamp": Utc::now().to_rfc3339() }),
                )),
                None => Ok(failure(StatusCode::NOT_FOUND, "tracking code not found", "TRACKING_NOT_FOUND")),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let state = Arc::new(MockState { fixtures: fixtures(), delay: Duration::from_millis(args.delay_ms) });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    println!("[MOCK] carrier API listening on {addr}");
    println!("[MOCK] tracking: http://localhost:{}{TRACKING_PREFIX}{{code}}", args.port);
    for fixture in &state.fixtures {
        println!("[MOCK]   {} ({})", fixture["code"], fixture["status"]);
    }
    println!("[MOCK] use any bearer token starting with \"eyJ\"");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("[MOCK] connection error: {e}");
            }
        });
    }
}
