use crate::modules::transcode::dto::*;
use crate::modules::transcode::model::{JobStatus, JobType};
use utoipa::Modify;
use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health,
        crate::modules::transcode::handler::create_job,
        crate::modules::transcode::handler::create_subtitle_job,
        crate::modules::transcode::handler::check_fingerprint,
        crate::modules::transcode::handler::get_job,
        crate::modules::transcode::handler::get_progress,
        crate::modules::transcode::handler::list_jobs,
        crate::modules::transcode::handler::list_all_jobs,
        crate::modules::transcode::handler::stop_job,
        crate::modules::transcode::handler::retry_job,
        crate::modules::transcode::handler::delete_job,
        crate::modules::transcode::handler::delete_all_jobs,
        crate::modules::transcode::handler::statistics,
        crate::modules::transcode::media_handler::serve_media,
    ),
    components(
        schemas(
            CreateJobRequest, CreateSubtitleJobRequest, JobResponse, JobPageResponse,
            ProgressResponse, FingerprintCheckResponse, StatisticsResponse,
            OperationResponse, DeleteAllResponse, JobStatus, JobType,
            crate::routes::HealthResponse,
        )
    ),
    tags(
        (name = "Transcode", description = "Transcode job orchestration"),
        (name = "Health", description = "Liveness and encoder load")
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
