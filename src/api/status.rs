use actix_web::{web, HttpResponse, Responder};

use crate::state::AgentState;

pub async fn agent_status(data: web::Data<AgentState>) -> impl Responder {
    let snapshot = match data.lock() {
        Ok(state) => state.snapshot.clone(),
        Err(poisoned) => poisoned.into_inner().snapshot.clone(),
    };
    HttpResponse::Ok().json(snapshot)
}

/// 现场执行一次进程发现（在阻塞线程池里跑）
pub async fn list_processes(data: web::Data<AgentState>) -> impl Responder {
    let registry = match data.lock() {
        Ok(state) => state.registry.clone(),
        Err(poisoned) => poisoned.into_inner().registry.clone(),
    };

    match web::block(move || registry.discover()).await {
        Ok(Ok(records)) => {
            let list: Vec<_> = records
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "pid": p.pid,
                        "version": p.version,
                        "status": p.status.to_string(),
                        "cmdline": p.command_line,
                    })
                })
                .collect();
            HttpResponse::Ok().json(list)
        }
        Ok(Err(e)) => {
            log::error!("Process discovery failed: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": e.to_string()
            }))
        }
        Err(e) => {
            log::error!("Blocking task failed: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": "discovery task failed"
            }))
        }
    }
}
