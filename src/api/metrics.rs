use actix_web::{web, HttpResponse, Responder};

use crate::metrics::METRICS;
use crate::state::AgentState;

pub async fn get_metrics(data: web::Data<AgentState>) -> impl Responder {
    // agent_info 跟随最新快照（更新后版本会变）
    {
        let state = match data.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        METRICS.set_agent_info(&state.snapshot.version, &state.snapshot.device_id);
    }

    match METRICS.render() {
        Ok(metrics_text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics_text),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body("Failed to render metrics")
        }
    }
}
