use actix_web::http::header;
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::{relay, resolver, state::AppState};

const MISSING_VIDEO_ID: &str = "Missing video_id parameter";
const DOWNLOAD_FAILED: &str = "Failed to download audio";

#[derive(Deserialize)]
pub struct MediaRequest {
    pub video_id: Option<String>,
}

impl MediaRequest {
    fn video_id(&self) -> Option<&str> {
        self.video_id.as_deref().filter(|id| !id.is_empty())
    }
}

fn missing_video_id() -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "error": MISSING_VIDEO_ID
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/stream_audio").route(web::get().to(stream_audio)))
        .service(web::resource("/download_audio").route(web::get().to(download_audio)));
}

pub async fn index() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "service": "YouTube Audio Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /": "Health check",
            "GET /stream_audio?video_id=<id>": "Stream the audio track as mp3 while it is transcoded",
            "GET /download_audio?video_id=<id>": "Download the audio track as mp3 and return its path on the server"
        }
    }))
}

pub async fn stream_audio(query: web::Query<MediaRequest>, state: web::Data<AppState>) -> impl Responder {
    let Some(video_id) = query.video_id() else {
        return missing_video_id();
    };

    log::info!("[STREAM] Request: video_id={}", video_id);

    // The body resolves and transcodes lazily; errors past this point are
    // reported inside the body, not through the status code.
    HttpResponse::Ok()
        .content_type("audio/mpeg")
        .append_header((header::CONTENT_DISPOSITION, "inline"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(relay::audio_stream(state.config.clone(), video_id.to_string()))
}

pub async fn download_audio(query: web::Query<MediaRequest>, state: web::Data<AppState>) -> impl Responder {
    let Some(video_id) = query.video_id() else {
        return missing_video_id();
    };

    log::info!("[DOWNLOAD] Request: video_id={}", video_id);

    let cfg = state.config.as_ref();
    let staged = match resolver::download(cfg, video_id).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("[DOWNLOAD] {} failed: {}", video_id, e);
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": DOWNLOAD_FAILED
            }));
        }
    };
    let title = staged.title().to_string();

    match staged.persist(&cfg.download_dir).await {
        Ok(file) => {
            log::info!(
                "[DOWNLOAD] Saved \"{}\" to {} ({} bytes)",
                title,
                file.path.display(),
                file.bytes_on_disk
            );
            HttpResponse::Ok()
                .content_type("text/plain; charset=utf-8")
                .body(file.path.to_string_lossy().into_owned())
        }
        Err(e) => {
            log::error!("[DOWNLOAD] {} could not be stored: {}", video_id, e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": e.to_string()
            }))
        }
    }
}
