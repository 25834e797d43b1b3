//! Live voice session control.
//!
//! The session runs server-side: capture and playback use the devices named
//! in `live.capture` / `live.output`, and progress is observable through
//! `/live/status`, `/live/transcript` and the `/ws/live` event feed.

use crate::error::AppError;
use crate::live::session::{LiveDeps, LiveSettings};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Open the session. Calling it while a session is open returns that session.
pub async fn connect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    if !config.gemini.has_api_key() {
        return Err(AppError::Unavailable("gemini.api_key is not set".to_string()));
    }

    let status = state
        .live
        .connect(LiveDeps::from_config(&config), &LiveSettings::from_config(&config))
        .await?;
    info!(session_id = ?status.session_id, "Live session requested");

    Ok(HttpResponse::Ok().json(status))
}

/// Close the session. Succeeds from any state.
pub async fn disconnect(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.live.disconnect().await)
}

pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.live.status())
}

/// Transcript as display lines (`"You: ..."`, `"Mind: ..."`) plus the raw entries.
pub async fn transcript(state: web::Data<AppState>) -> HttpResponse {
    let status = state.live.status();
    let monitor = state.live.monitor();

    HttpResponse::Ok().json(json!({
        "session_id": status.session_id,
        "state": status.state,
        "lines": monitor.transcript_lines(),
        "entries": status.transcript
    }))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::state::AppState;
    use actix_web::{test, web, App};

    fn app_state(api_key: &str) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.gemini.api_key = api_key.to_string();
        web::Data::new(AppState::new(config))
    }

    #[actix_web::test]
    async fn test_connect_without_capture_is_forbidden() {
        let app = test::init_service(
            App::new()
                .app_data(app_state("test-key"))
                .service(web::scope("/api/v1").configure(crate::handlers::routes)),
        )
        .await;

        // Default capture is "none", which always denies
        let req = test::TestRequest::post().uri("/api/v1/live/connect").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status(), 403);

        let req = test::TestRequest::get().uri("/api/v1/live/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["is_active"], false);
    }

    #[actix_web::test]
    async fn test_connect_without_key_is_unavailable() {
        let app = test::init_service(
            App::new()
                .app_data(app_state(""))
                .service(web::scope("/api/v1").configure(crate::handlers::routes)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/live/connect").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 503);
    }

    #[actix_web::test]
    async fn test_disconnect_and_transcript_when_idle() {
        let app = test::init_service(
            App::new()
                .app_data(app_state(""))
                .service(web::scope("/api/v1").configure(crate::handlers::routes)),
        )
        .await;

        for _ in 0..2 {
            let req = test::TestRequest::post().uri("/api/v1/live/disconnect").to_request();
            let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["state"], "idle");
        }

        let req = test::TestRequest::get().uri("/api/v1/live/transcript").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["lines"], serde_json::json!([]));
    }
}
