use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Public view of the configuration. The API key is reduced to whether one is set.
fn config_view(config: &AppConfig) -> Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "realtime": {
            "endpoint": config.realtime.endpoint,
            "model": config.realtime.model,
            "voice": config.realtime.voice,
            "transcription_model": config.realtime.transcription_model,
            "transcription_language": config.realtime.transcription_language,
            "voice_style": config.realtime.voice_style,
            "api_key_configured": !config.realtime.api_key.trim().is_empty()
        },
        "prompt": {
            "system_prompt_path": config.prompt.system_prompt_path
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "heartbeat_interval_secs": config.performance.heartbeat_interval_secs,
            "client_timeout_secs": config.performance.client_timeout_secs,
            "max_frame_bytes": config.performance.max_frame_bytes
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial runtime update. New values apply to voice sessions started afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as actix_test;
    use actix_web::App;

    fn state_with_key() -> AppState {
        let mut config = AppConfig::default();
        config.realtime.api_key = "sk-secret".to_string();
        AppState::new(config, "Be brief.")
    }

    #[test]
    fn test_config_view_redacts_key() {
        let mut config = AppConfig::default();
        config.realtime.api_key = "sk-secret".to_string();
        let view = config_view(&config);
        assert_eq!(view["realtime"]["api_key_configured"], true);
        assert!(view["realtime"].get("api_key").is_none());
        assert!(!view.to_string().contains("sk-secret"));
    }

    #[actix_web::test]
    async fn test_update_config_endpoint() {
        let state = state_with_key();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = actix_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "realtime": { "voice": "verse" } }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.get_config().realtime.voice, "verse");
        assert_eq!(state.get_config().realtime.api_key, "sk-secret");

        let req = actix_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "server": { "port": 0 } }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().server.port, 3000);
    }
}
