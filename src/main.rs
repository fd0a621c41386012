use anyhow::Result;
use crate::initialization::init;
use crate::worker::run;

mod arbiter;
mod backup;
mod config;
mod device;
mod errors;
mod events;
mod initialization;
mod manager_prices;
mod manager_weather;
mod manual;
mod models;
mod price_table;
mod publisher;
mod reconciler;
mod scheduling;
mod selector;
mod tariffs;
mod worker;

fn main() -> Result<()> {
    let (config, mgr) = init()?;

    run(config, mgr)
}
