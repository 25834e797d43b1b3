pub mod ai;
pub mod config;
pub mod live;
pub mod ollama;

use crate::{health, websocket};
use actix_web::web;

/// Inline images and media arrive base64-encoded inside JSON.
const JSON_LIMIT_BYTES: usize = 32 * 1024 * 1024;

/// All routes under `/api/v1`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().limit(JSON_LIMIT_BYTES))
        .route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/config", web::get().to(config::get_config))
        .route("/config", web::put().to(config::update_config))
        .service(
            web::scope("/live")
                .route("/connect", web::post().to(live::connect))
                .route("/disconnect", web::post().to(live::disconnect))
                .route("/status", web::get().to(live::status))
                .route("/transcript", web::get().to(live::transcript)),
        )
        .service(
            web::scope("/ai")
                .route("/policy", web::post().to(ai::analyze_policy))
                .route("/suture", web::post().to(ai::query_suture))
                .route("/audit", web::post().to(ai::audit))
                .route("/chat", web::post().to(ai::ask_democracy_bot))
                .route("/image", web::post().to(ai::generate_image))
                .route("/image/edit", web::post().to(ai::edit_image))
                .route("/media", web::post().to(ai::analyze_media))
                .route("/studio", web::post().to(ai::studio))
                .route("/video", web::post().to(ai::animate))
                .route("/tts", web::post().to(ai::speak))
                .route("/tts/wav", web::post().to(ai::speak_wav)),
        )
        .service(
            web::scope("/ollama")
                .route("/models", web::get().to(ollama::list_models))
                .route("/generate", web::post().to(ollama::generate)),
        )
        .route("/ws/live", web::get().to(websocket::live_feed));
}

/// Reject blank required text fields.
pub(crate) fn require_text<'a>(field: &str, value: &'a str) -> crate::error::AppResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(crate::error::AppError::ValidationError(format!("'{}' must not be empty", field)));
    }
    Ok(trimmed)
}
