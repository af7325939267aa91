pub mod internal;
pub mod presence;
pub mod wsroute;

use actix_web::{web, HttpResponse};

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Every HTTP route the service exposes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(internal::push_to_user)
        .service(internal::push_to_conversation)
        .service(presence::get_presence)
        .service(presence::get_viewing)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(crate::metrics::metrics_handler));
}
