use actix_web::{App, HttpRequest, HttpResponse, HttpServer, get, web};
use chrono::Utc;
use color_eyre::Result;
use icalendar::{Calendar, Class, Component, Event, EventLike, Property};
use log::{error, info};

use crate::source;
use crate::telegram;
use crate::train::Train;

/// Public page for a train, used as the "add to calendar" target in
/// Telegram messages. `None` when the train has no derivable time window.
pub fn page_url(train: &Train, public_address: &str) -> Option<String> {
    train.departure_arrival()?;
    Some(format!(
        "{}/train/{}",
        public_address.trim_end_matches('/'),
        train.unique_id()
    ))
}

/// Serves the read-only export surface. It never touches the archive: every
/// request re-fetches the listing, so it only needs existence and scheduling
/// data.
pub async fn serve(listen_address: &str) -> Result<()> {
    info!("Listening on {listen_address}");
    HttpServer::new(|| App::new().service(train_calendar).service(train_page))
        .bind(listen_address)?
        .run()
        .await
        .map_err(Into::into)
}

async fn find_train(id: &str) -> Result<Option<Train>, HttpResponse> {
    let trains = match web::block(source::load_trains).await {
        Ok(Ok(trains)) => trains,
        Ok(Err(err)) => {
            error!("Cannot load trains: {err:#}");
            return Err(HttpResponse::InternalServerError().body("cannot load trains"));
        }
        Err(err) => {
            error!("Blocking fetch failed: {err}");
            return Err(HttpResponse::InternalServerError().body("cannot load trains"));
        }
    };
    Ok(trains.into_iter().find(|t| t.unique_id() == id))
}

#[get("/ics/{id:.*}")]
async fn train_calendar(req: HttpRequest, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let id = id.strip_suffix(".ics").unwrap_or(&id).to_string();

    let train = match find_train(&id).await {
        Ok(Some(train)) => train,
        Ok(None) => {
            error!("Cannot find train: {id}");
            return HttpResponse::NotFound().body("train not found");
        }
        Err(res) => return res,
    };

    let host = req.connection_info().host().to_string();
    match calendar_for(&train, &host) {
        Some(calendar) => HttpResponse::Ok()
            .content_type("text/calendar")
            .body(calendar),
        None => HttpResponse::NotFound().body("train has no schedule"),
    }
}

#[get("/train/{id:.*}")]
async fn train_page(path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let train = match find_train(&id).await {
        Ok(Some(train)) => train,
        Ok(None) => {
            error!("Cannot find train: {id}");
            return HttpResponse::NotFound().body("train not found");
        }
        Err(res) => return res,
    };

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_page(&train))
}

/// Serialized iCalendar for the train, with a second event for the return
/// leg when one is scheduled. `None` when the outbound window cannot be
/// derived, which is a client error, not a failure.
fn calendar_for(train: &Train, host: &str) -> Option<String> {
    let (departure, arrive) = train.departure_arrival()?;
    let description = calendar_description(train);

    let mut calendar = Calendar::new();
    calendar.name(&train.title).timezone("Europe/Rome");
    calendar.append_property(Property::new("METHOD", "PUBLISH"));

    let mut outbound = Event::new();
    outbound
        .uid(&format!("{}@trenistorici{host}", train.fingerprint()))
        .summary(&train.title)
        .description(&description)
        .location(&format!("Stazione di {}", train.departure_station))
        .url(&train.page_link())
        .class(Class::Public)
        .starts(departure.with_timezone(&Utc))
        .ends(arrive.with_timezone(&Utc));
    calendar.push(outbound.done());

    if let Some((departure, arrive)) = train.return_leg() {
        let mut ret = Event::new();
        ret.uid(&format!("{}-return@trenistorici{host}", train.fingerprint()))
            .summary(&train.title)
            .description(&description)
            .location(&format!("Stazione di {}", train.arrive_station))
            .url(&train.page_link())
            .class(Class::Public)
            .starts(departure.with_timezone(&Utc))
            .ends(arrive.with_timezone(&Utc));
        calendar.push(ret.done());
    }

    Some(calendar.to_string())
}

fn calendar_description(train: &Train) -> String {
    let mut lines = vec![train.subtitle.clone()];
    if !train.locomotive.is_empty() {
        lines.push(train.locomotive.clone());
    }
    lines.push(train.page_link());
    lines.retain(|l| !l.is_empty());
    lines.join("\n")
}

fn render_page(train: &Train) -> String {
    let mut body = format!(
        "<h1>{}</h1>\n<p><em>{}</em></p>\n",
        escape_html(&train.title),
        escape_html(&train.subtitle)
    );

    if let Some(date) = telegram::italian_date(train) {
        body += &format!("<p>📅 {}</p>\n", escape_html(&date));
    }
    if !train.departure_station.is_empty() && !train.arrive_station.is_empty() {
        body += &format!(
            "<p>📍 {} → {}</p>\n",
            escape_html(&train.departure_station),
            escape_html(&train.arrive_station)
        );
    }
    if !train.departure_hour.is_empty() && !train.arrive_hour.is_empty() {
        body += &format!(
            "<p>🕑 Andata {} – {}</p>\n",
            escape_html(&train.departure_hour),
            escape_html(&train.arrive_hour)
        );
    }
    if !train.return_departure_hour.is_empty() && !train.return_arrive_hour.is_empty() {
        body += &format!(
            "<p>🕑 Ritorno {} – {}</p>\n",
            escape_html(&train.return_departure_hour),
            escape_html(&train.return_arrive_hour)
        );
    }
    if !train.locomotive.is_empty() {
        body += &format!("<p>🚞 {}</p>\n", escape_html(&train.locomotive));
    }

    body += &format!(
        "<p><a href=\"{}\">Maggiori informazioni</a></p>\n",
        escape_html(&train.page_link())
    );
    if train.departure_arrival().is_some() {
        body += &format!(
            "<p><a href=\"/ics/{}.ics\">Aggiungi al calendario</a></p>\n",
            escape_html(&train.unique_id())
        );
    }

    format!(
        "<!DOCTYPE html>\n<html lang=\"it\">\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(&train.title)
    )
}

fn escape_html(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}
