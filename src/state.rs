use crate::config::settings::AppConfig;
use crate::modules::transcode::service::JobService;
use crate::supervisor::ProcessSupervisor;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub jobs: JobService,
    pub supervisor: ProcessSupervisor,
}

impl AppState {
    pub fn new(config: AppConfig, jobs: JobService, supervisor: ProcessSupervisor) -> Self {
        Self {
            config,
            jobs,
            supervisor,
        }
    }
}
