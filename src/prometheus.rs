use crate::metrics::REGISTRY;
use axum::http::Response;
use axum::routing::method_routing;
use axum::Router;
use axum_server::Server;
use prometheus::Encoder;
use std::net::SocketAddr;
use tracing::{error, info};

fn encode(families: &[prometheus::proto::MetricFamily]) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(families, &mut buffer) {
        error!(msg = "Could not encode metrics", ?err);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(err) => {
            error!(msg = "Metrics are not valid UTF-8", ?err);
            String::default()
        }
    }
}

async fn prometheus_metrics() -> axum::response::Response {
    let mut res = encode(&REGISTRY.gather());
    res.push_str(&encode(&prometheus::gather()));
    Response::new(res.into())
}

pub struct Prometheus {
    server: Server,
    addr: SocketAddr,
}

impl Prometheus {
    pub fn new(addr: SocketAddr) -> Self {
        let server = axum_server::bind(addr);

        Self { server, addr }
    }

    pub async fn serve(self) -> std::io::Result<()> {
        info!(msg = "Serving metrics", addr = %self.addr);
        let router = Router::new()
            .route("/metrics", method_routing::get(prometheus_metrics))
            .into_make_service();
        self.server.serve(router).await
    }
}
