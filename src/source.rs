use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::config::CONFIG;
use crate::train::Train;

const LISTING_URL: &str = "https://www.fondazionefs.it/content/fondazionefs/it/treni-storici.html";

pub static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(&CONFIG.user_agent)
        .build()
        .expect("Failed to build scraping client")
});

/// The listing embeds its full train grid as JSON in a hidden input.
#[derive(Deserialize)]
struct GridList {
    #[serde(rename = "trainsList", alias = "TrainsList")]
    trains_list: Vec<Train>,
}

/// Fetches the public listing and returns every train currently advertised.
/// A failure here is non-fatal to the process; the caller logs and retries
/// on the next tick.
pub fn load_trains() -> Result<Vec<Train>> {
    let body = CLIENT
        .get(LISTING_URL)
        .send()?
        .error_for_status()?
        .text()?;
    parse_listing(&body)
}

fn parse_listing(body: &str) -> Result<Vec<Train>> {
    let document = Html::parse_document(body);
    let raw = document
        .select(&Selector::parse("#gridList").unwrap())
        .next()
        .and_then(|input| input.attr("value"))
        .ok_or_else(|| eyre!("cannot find the train grid in the listing page"))?;

    let grid: GridList =
        serde_json::from_str(raw).wrap_err("cannot parse the embedded train grid")?;
    Ok(grid.trains_list)
}
