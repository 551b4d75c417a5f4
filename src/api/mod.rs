pub mod metrics;
pub mod status;

pub use metrics::get_metrics;
pub use status::{agent_status, list_processes};

use actix_web::{web, HttpResponse, Responder};

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(get_metrics))
        .route("/api/agent/status", web::get().to(agent_status))
        .route("/api/agent/processes", web::get().to(list_processes));
}
