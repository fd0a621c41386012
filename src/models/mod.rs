pub mod nordpool_prices;
pub mod open_meteo;
