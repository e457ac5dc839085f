use std::fmt;

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const BASE_URL: &str = "https://www.fondazionefs.it/";

/// All excursion dates on the listing are local to this zone.
pub const ROME: Tz = chrono_tz::Europe::Rome;

const LINK_PREFIX: &str = "/content/fondazionefs/it/treni-storici/";
const LINK_SUFFIX: &str = ".html";

/// e.g. "Dec 30, 2022 12:00:00 AM"
const DATE_FORMAT: &str = "%b %d, %Y %I:%M:%S %p";

/// One excursion as embedded in the listing page's JSON grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Train {
    pub title: String,
    pub subtitle: String,
    /// Relative link to the excursion page; the source of the train's identity.
    pub link: String,
    pub region: String,
    pub locomotive: String,
    pub locomotive_other_details: String,
    pub month: String,
    #[serde(rename = "dateProp")]
    pub date: String,
    pub is_timeless: bool,
    pub departure_station: String,
    pub arrive_station: String,
    pub departure_hour: String,
    pub arrive_hour: String,
    pub return_departure_hour: String,
    pub return_arrive_hour: String,
    pub price_adult: String,
    pub price_child: String,
    #[serde(rename = "image")]
    pub image_url: String,
}

impl Train {
    /// Stable archive key: the link with the listing prefix and `.html`
    /// stripped. Empty when the link is empty, which means the train cannot
    /// be archived.
    pub fn unique_id(&self) -> String {
        let id = self.link.strip_prefix(LINK_PREFIX).unwrap_or(&self.link);
        id.strip_suffix(LINK_SUFFIX).unwrap_or(id).to_string()
    }

    /// Content hash over the whole record, used only for change detection.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        // a struct of strings and bools always serializes
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hex::encode(hasher.finalize())
    }

    /// The excursion date, resolved in the Rome timezone.
    pub fn when(&self) -> Result<DateTime<Tz>> {
        let naive = NaiveDateTime::parse_from_str(&self.date, DATE_FORMAT)
            .wrap_err_with(|| format!("cannot parse train date {:?}", self.date))?;
        ROME.from_local_datetime(&naive)
            .single()
            .ok_or_else(|| eyre!("train date {naive} is not a valid local time"))
    }

    /// Departure/arrival pair for the outbound leg, `None` when either hour
    /// field is missing or unparseable. Absence of a window is not an error.
    pub fn departure_arrival(&self) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        self.leg(&self.departure_hour, &self.arrive_hour)
    }

    /// Same as [`Self::departure_arrival`] for the optional return leg.
    pub fn return_leg(&self) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        self.leg(&self.return_departure_hour, &self.return_arrive_hour)
    }

    fn leg(&self, departure: &str, arrive: &str) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        let date = self.when().ok()?.date_naive();
        let departure = NaiveTime::parse_from_str(departure, "%H:%M").ok()?;
        let arrive = NaiveTime::parse_from_str(arrive, "%H:%M").ok()?;
        let start = ROME.from_local_datetime(&date.and_time(departure)).single()?;
        let end = ROME.from_local_datetime(&date.and_time(arrive)).single()?;
        Some((start, end))
    }

    pub fn page_link(&self) -> String {
        format!("{BASE_URL}{}", self.link.trim_start_matches('/'))
    }

    pub fn image_link(&self) -> String {
        format!("{BASE_URL}{}", self.image_url.trim_start_matches('/'))
    }
}

impl fmt::Display for Train {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn sample() -> Train {
        Train {
            title: "Ferrovia dei Parchi: l'alto Sangro".into(),
            subtitle: "Treno storico da Sulmona a Castel di Sangro".into(),
            link: "/content/fondazionefs/it/treni-storici/2022/12/30/ferrovia-dei-parchi--l-alto-sangro.html".into(),
            region: "Abruzzo".into(),
            locomotive: "Treno con locomotiva diesel".into(),
            date: "Dec 30, 2022 12:00:00 AM".into(),
            departure_station: "Sulmona".into(),
            arrive_station: "Castel di Sangro".into(),
            image_url: "/content/dam/fondazionefs/abruzzo.jpg".into(),
            ..Train::default()
        }
    }

    #[test]
    fn unique_id_strips_prefix_and_suffix() {
        assert_eq!(
            sample().unique_id(),
            "2022/12/30/ferrovia-dei-parchi--l-alto-sangro"
        );
    }

    #[test]
    fn unique_id_of_empty_link_is_empty() {
        let train = Train::default();
        assert_eq!(train.unique_id(), "");
    }

    #[test]
    fn when_resolves_in_rome() {
        let when = sample().when().unwrap();
        assert_eq!(when.to_rfc3339(), "2022-12-30T00:00:00+01:00");
    }

    #[test]
    fn when_rejects_garbage() {
        let mut train = sample();
        train.date = "domani".into();
        assert!(train.when().is_err());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let train = sample();
        let mut changed = train.clone();
        changed.departure_hour = "08:30".into();
        assert_ne!(train.fingerprint(), changed.fingerprint());
        assert_eq!(train.fingerprint(), train.clone().fingerprint());
    }

    #[test]
    fn departure_arrival_needs_both_hours() {
        let mut train = sample();
        assert!(train.departure_arrival().is_none());

        train.departure_hour = "08:30".into();
        assert!(train.departure_arrival().is_none());

        train.arrive_hour = "11:45".into();
        let (start, end) = train.departure_arrival().unwrap();
        assert_eq!((start.hour(), start.minute()), (8, 30));
        assert_eq!((end.hour(), end.minute()), (11, 45));
    }

    #[test]
    fn return_leg_is_optional() {
        let mut train = sample();
        assert!(train.return_leg().is_none());

        train.return_departure_hour = "16:00".into();
        train.return_arrive_hour = "19:10".into();
        let (start, end) = train.return_leg().unwrap();
        assert!(start < end);
    }

    #[test]
    fn absolute_links() {
        let train = sample();
        assert!(train.page_link().starts_with("https://www.fondazionefs.it/content/"));
        assert!(!train.page_link().contains("//content"));
        assert!(train.image_link().ends_with("abruzzo.jpg"));
    }
}
