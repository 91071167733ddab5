use std::sync::Arc;

use redis::Client as RedisClient;

use cache::UserCache;
use config::Config;
use fanout::FanoutRegistry;
use notify::NotificationCounter;
use store::ChatStore;

pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod middleware;
pub mod notify;
pub mod store;
pub mod utils;

pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub redis: Arc<RedisClient>,
    pub store: Arc<dyn ChatStore>,
    pub cache: UserCache,
    pub notifier: NotificationCounter,
    pub fanout: Arc<FanoutRegistry>,
}
