use crate::error::AppResult;
use crate::genai::OllamaOptions;
use crate::handlers::require_text;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    pub model: Option<String>,
    pub system: Option<String>,
    #[serde(default)]
    pub options: OllamaOptions,
}

/// Installed models. An unreachable server is reported, not raised, so the
/// UI can show the backend as offline.
pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let ollama = state.ollama();
    if !ollama.is_enabled() {
        return HttpResponse::Ok().json(json!({
            "enabled": false,
            "reachable": false,
            "models": []
        }));
    }

    match ollama.list_models().await {
        Ok(models) => HttpResponse::Ok().json(json!({
            "enabled": true,
            "reachable": true,
            "endpoint": ollama.endpoint(),
            "models": models
        })),
        Err(e) => {
            warn!("Failed to fetch Ollama models: {}", e);
            HttpResponse::Ok().json(json!({
                "enabled": true,
                "reachable": false,
                "endpoint": ollama.endpoint(),
                "models": [],
                "error": e.to_string()
            }))
        }
    }
}

pub async fn generate(state: web::Data<AppState>, body: web::Json<GenerateBody>) -> AppResult<HttpResponse> {
    let prompt = require_text("prompt", &body.prompt)?;
    let model = body
        .model
        .clone()
        .unwrap_or_else(|| state.get_config().ollama.default_model);

    let response = state
        .ollama()
        .generate(prompt, Some(&model), body.system.as_deref(), &body.options)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "model": model,
        "response": response
    })))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::state::AppState;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_unreachable_server_lists_nothing() {
        let mut config = AppConfig::default();
        config.ollama.enabled = true;
        // Nothing listens on port 9 locally
        config.ollama.endpoint = "http://127.0.0.1:9".to_string();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .service(web::scope("/api/v1").configure(crate::handlers::routes)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/ollama/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["enabled"], true);
        assert_eq!(body["reachable"], false);
        assert_eq!(body["models"], serde_json::json!([]));
    }

    #[actix_web::test]
    async fn test_generate_when_disabled_is_unavailable() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .service(web::scope("/api/v1").configure(crate::handlers::routes)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/ollama/generate")
            .set_json(serde_json::json!({ "prompt": "hello" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 503);
    }
}
