use std::sync::Arc;

use pulsemq::broker::handler::{HandlerRegistry, LogHandler};
use pulsemq::broker::scheduler::Scheduler;
use pulsemq::config::load_config;
use pulsemq::transport::websocket::start_websocket_server;
use pulsemq::{Broker, CursorStore, MessageStore, Notifier, utils};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    utils::logging::init("info");

    let config = load_config().expect("Failed to load configuration");
    let db = sled::open(&config.storage.data_dir).expect("Failed to open message store");

    let log = Arc::new(MessageStore::new(db.clone()).expect("Failed to open topic log"));
    let cursors = Arc::new(CursorStore::new(db).expect("Failed to open cursor store"));
    let notifier = Arc::new(Notifier::new());

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(LogHandler));

    let broker = Broker::new(log.clone(), cursors, notifier, Arc::new(handlers));

    let scheduler = Arc::new(Scheduler::new(log, broker.notifier(), &config.scheduler));
    scheduler.spawn();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    start_websocket_server(&addr, broker.notifier()).await;
}
