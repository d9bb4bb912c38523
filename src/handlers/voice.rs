use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Voice service status: whether the widget can expect a session to start,
/// and how much capacity is left.
pub async fn voice_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let active = state.active_voice_sessions();
    let max = config.performance.max_concurrent_sessions as u32;
    let api_key_configured = std::env::var(&config.live.api_key_env).is_ok();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "available": api_key_configured && active < max,
        "api_key_configured": api_key_configured,
        "active_sessions": active,
        "max_sessions": max,
        "model": config.live.model,
        "voice": config.live.voice,
        "audio": {
            "capture_rate": config.audio.capture_rate,
            "playback_rate": config.audio.playback_rate,
            "channels": config.audio.channels
        }
    })))
}
