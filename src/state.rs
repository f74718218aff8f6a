use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::DbPool;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub queue: RabbitMqService,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool, queue: RabbitMqService) -> Self {
        Self { config, db, queue }
    }
}
