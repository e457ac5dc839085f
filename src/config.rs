use color_eyre::eyre::Context;
use once_cell::sync::Lazy;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct Config {
    pub telegram_bot_token: String,
    /// Telegram channel the bot posts to (negative ids for channels).
    pub channel_id: i64,
    /// Address the calendar-export server binds to.
    #[serde(default = "default_listen_address")]
    pub http_listen_address: String,
    /// Public base URL of the export server, used in message buttons
    /// (e.g. "https://trains.example.org").
    pub http_public_address: String,
    /// How far in the future a train may be before it is ignored this cycle.
    /// A negative value in any component means no upper bound.
    #[serde(default)]
    pub horizon_years: i64,
    #[serde(default = "default_horizon_months")]
    pub horizon_months: i64,
    #[serde(default)]
    pub horizon_days: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".into()
}

fn default_horizon_months() -> i64 {
    1
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36".into()
}

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    dotenvy::dotenv().ok();
    envy::from_env::<Config>()
        .wrap_err("failed to load config")
        .unwrap()
});
