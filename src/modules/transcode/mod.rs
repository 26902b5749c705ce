use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::state::AppState;

pub mod cache;
pub mod dto;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod handler;
pub mod media_handler;
pub mod model;
pub mod publisher;
pub mod repository;
pub mod service;

#[cfg(test)]
pub mod testing;

/// Mount point of `media_handler::serve_media`.
pub const MEDIA_ROUTE: &str = "/api/v1/transcode/media";

/// Public URL of a file in a job's output directory.
pub fn media_path(job_id: &str, file: &str) -> String {
    format!("{}/{}/{}", MEDIA_ROUTE, job_id, file)
}

pub fn router(state: AppState) -> Router<AppState> {
    // Players fetch playlists and segments without credentials.
    let public_routes =
        Router::new().route("/media/{job_id}/{file}", get(media_handler::serve_media));

    let protected_routes = Router::new()
        .route(
            "/jobs",
            post(handler::create_job)
                .get(handler::list_jobs)
                .delete(handler::delete_all_jobs),
        )
        .route("/jobs/all", get(handler::list_all_jobs))
        .route("/jobs/check-fingerprint", get(handler::check_fingerprint))
        .route(
            "/jobs/{job_id}",
            get(handler::get_job).delete(handler::delete_job),
        )
        .route("/jobs/{job_id}/progress", get(handler::get_progress))
        .route("/jobs/{job_id}/stop", post(handler::stop_job))
        .route("/jobs/{job_id}/retry", post(handler::retry_job))
        .route("/subtitle-jobs", post(handler::create_subtitle_job))
        .route("/statistics", get(handler::statistics))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware,
        ));

    public_routes.merge(protected_routes)
}
