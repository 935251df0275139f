use std::sync::Arc;

use bus_core::config::Config;

mod chain;
mod invoke;
mod run;

#[tokio::main]
async fn main() -> Result<(), bus_core::Error> {
    bus_core::logging::init("bus-dispatcher")?;

    let cfg = Arc::new(Config::load()?);
    run::run(cfg).await
}
