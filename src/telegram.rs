use std::time::{Duration, Instant};

use chrono::Locale;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use image::{ImageFormat, imageops::FilterType};
use log::{debug, info, warn};
use reqwest::blocking::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::Config;
use crate::http;
use crate::run::Notifier;
use crate::train::Train;

/// Telegram rejects photos sent by URL above roughly this size.
const REUPLOAD_THRESHOLD: u64 = 4_718_592; // 4.5 MiB
/// Above this even an upload is rejected, the photo must be downscaled.
const DOWNSCALE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Minimum gap between messages delivered with a notification sound;
/// anything inside the gap goes out silent.
const NOTIFICATION_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct BotFlags {
    /// Don't touch the transport at all; sends report handle 0.
    pub dry_run: bool,
    /// Deliver everything without a notification sound.
    pub silent: bool,
    /// Include region, rolling stock details and prices in captions.
    pub verbose: bool,
}

pub struct TelegramBot {
    client: Client,
    api_base: String,
    channel_id: i64,
    public_address: String,
    flags: BotFlags,
    last_notification: Option<Instant>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Message {
    message_id: i64,
}

#[derive(Deserialize)]
struct User {
    #[serde(default)]
    username: Option<String>,
}

impl TelegramBot {
    /// Builds the bot and verifies the token with `getMe`; an auth failure
    /// here is fatal at startup.
    pub fn new(cfg: &Config, flags: BotFlags) -> Result<Self> {
        let bot = Self {
            client: Client::new(),
            api_base: format!("https://api.telegram.org/bot{}", cfg.telegram_bot_token),
            channel_id: cfg.channel_id,
            public_address: cfg.http_public_address.clone(),
            flags,
            last_notification: None,
        };
        let me: User = bot
            .call("getMe", &json!({}))
            .wrap_err("cannot authenticate with Telegram")?;
        info!(
            "Authorized as @{}",
            me.username.as_deref().unwrap_or("<unknown>")
        );
        Ok(bot)
    }

    pub fn send_train(&mut self, train: &Train) -> Result<i64> {
        let caption = caption(train, self.flags.verbose);
        let keyboard = keyboard(train, &self.public_address);

        if self.flags.dry_run {
            info!("Dry run, skipping delivery of {train}");
            return Ok(0);
        }

        let silent = self.flags.silent || !self.notification_due();
        match self.send_photo(train, &caption, &keyboard, silent) {
            Ok(message_id) => Ok(message_id),
            Err(err) => {
                warn!("Cannot send photo for {train}, retrying without it: {err:#}");
                let message: Message = self.call(
                    "sendMessage",
                    &json!({
                        "chat_id": self.channel_id,
                        "text": caption,
                        "parse_mode": "MarkdownV2",
                        "reply_markup": keyboard,
                        "disable_notification": silent,
                    }),
                )?;
                Ok(message.message_id)
            }
        }
    }

    pub fn edit_message(&self, train: &Train, message_id: i64) -> Result<()> {
        let caption = caption(train, self.flags.verbose);
        let keyboard = keyboard(train, &self.public_address);

        if self.flags.dry_run {
            info!("Dry run, skipping edit of {train}");
            return Ok(());
        }

        let _: Message = self.call(
            "editMessageCaption",
            &json!({
                "chat_id": self.channel_id,
                "message_id": message_id,
                "caption": caption,
                "parse_mode": "MarkdownV2",
                "reply_markup": keyboard,
            }),
        )?;
        Ok(())
    }

    fn send_photo(
        &self,
        train: &Train,
        caption: &str,
        keyboard: &Value,
        silent: bool,
    ) -> Result<i64> {
        let message: Message = match self.photo_for(train) {
            Photo::Url(url) => self.call(
                "sendPhoto",
                &json!({
                    "chat_id": self.channel_id,
                    "photo": url,
                    "caption": caption,
                    "parse_mode": "MarkdownV2",
                    "reply_markup": keyboard,
                    "disable_notification": silent,
                }),
            )?,
            Photo::Upload(bytes) => {
                let form = Form::new()
                    .text("chat_id", self.channel_id.to_string())
                    .text("caption", caption.to_string())
                    .text("parse_mode", "MarkdownV2")
                    .text("reply_markup", keyboard.to_string())
                    .text("disable_notification", silent.to_string())
                    .part("photo", Part::bytes(bytes).file_name("photo.jpg"));
                self.call_multipart("sendPhoto", form)?
            }
        };
        Ok(message.message_id)
    }

    /// Picks how to hand the train photo over: by URL for ordinary sizes,
    /// re-uploaded when the URL path would be rejected, downscaled first
    /// when even the upload would be. Every probe failure falls back to the
    /// plain URL.
    fn photo_for(&self, train: &Train) -> Photo {
        let image = train.image_link();
        let length = match self
            .client
            .head(&image)
            .send()
            .and_then(|res| res.error_for_status())
        {
            Ok(res) => res.content_length().unwrap_or(0),
            Err(err) => {
                warn!("Cannot probe train image {image}: {err}");
                return Photo::Url(image);
            }
        };
        debug!("Train image size: {image} {length} bytes");

        if length > DOWNSCALE_THRESHOLD {
            info!("Image is over {DOWNSCALE_THRESHOLD} bytes ({length}), downscaling");
            match self.download(&image).and_then(|bytes| downscale(&bytes)) {
                Ok(bytes) => Photo::Upload(bytes),
                Err(err) => {
                    warn!("Cannot downscale image {image}: {err:#}");
                    Photo::Url(image)
                }
            }
        } else if length > REUPLOAD_THRESHOLD {
            info!("Image is over {REUPLOAD_THRESHOLD} bytes ({length}), re-uploading");
            match self.download(&image) {
                Ok(bytes) => Photo::Upload(bytes),
                Err(err) => {
                    warn!("Cannot download image {image}: {err:#}");
                    Photo::Url(image)
                }
            }
        } else {
            Photo::Url(image)
        }
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self
            .client
            .get(url)
            .send()?
            .error_for_status()?
            .bytes()?
            .to_vec())
    }

    fn notification_due(&mut self) -> bool {
        match self.last_notification {
            Some(last) if last.elapsed() < NOTIFICATION_INTERVAL => false,
            _ => {
                self.last_notification = Some(Instant::now());
                true
            }
        }
    }

    fn call<T: serde::de::DeserializeOwned>(&self, method: &str, payload: &Value) -> Result<T> {
        let res: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .json(payload)
            .send()?
            .json()?;
        unwrap_response(method, res)
    }

    fn call_multipart<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> Result<T> {
        let res: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .multipart(form)
            .send()?
            .json()?;
        unwrap_response(method, res)
    }
}

impl Notifier for TelegramBot {
    fn create(&mut self, train: &Train) -> Result<i64> {
        self.send_train(train)
    }

    fn update(&mut self, train: &Train, message_id: i64) -> Result<()> {
        self.edit_message(train, message_id)
    }
}

enum Photo {
    Url(String),
    Upload(Vec<u8>),
}

fn unwrap_response<T>(method: &str, res: ApiResponse<T>) -> Result<T> {
    if !res.ok {
        return Err(eyre!(
            "telegram {method} failed: {}",
            res.description.unwrap_or_else(|| "no description".into())
        ));
    }
    res.result
        .ok_or_else(|| eyre!("telegram {method} returned no result"))
}

fn downscale(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).wrap_err("cannot decode image")?;
    let resized = img.resize(img.width() / 3, img.height() / 3, FilterType::Triangle);
    let mut out = std::io::Cursor::new(Vec::new());
    resized.to_rgb8().write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

fn escape_markdown(text: &str) -> String {
    text.chars()
        .flat_map(|c| match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' => vec!['\\', c],
            _ => vec![c],
        })
        .collect()
}

/// "Venerdì 30 dicembre 2022", capitalized the way the channel expects.
pub fn italian_date(train: &Train) -> Option<String> {
    let when = train.when().ok()?;
    let date = when
        .format_localized("%A %-d %B %Y", Locale::it_IT)
        .to_string();
    let mut chars = date.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().collect::<String>() + chars.as_str())
}

fn caption(train: &Train, verbose: bool) -> String {
    let mut text = format!("🚂 *{}*\n", escape_markdown(&train.title));
    if !train.subtitle.is_empty() {
        text += &format!("_{}_\n", escape_markdown(&train.subtitle));
    }
    text.push('\n');

    if let Some(date) = italian_date(train) {
        text += &format!("📅 {}\n", escape_markdown(&date));
    }
    if !train.departure_station.is_empty() && !train.arrive_station.is_empty() {
        text += &format!(
            "📍 {} → {}\n",
            escape_markdown(&train.departure_station),
            escape_markdown(&train.arrive_station)
        );
    }
    if !train.departure_hour.is_empty() && !train.arrive_hour.is_empty() {
        text += &format!(
            "🕑 Andata {} – {}\n",
            escape_markdown(&train.departure_hour),
            escape_markdown(&train.arrive_hour)
        );
    }
    if !train.return_departure_hour.is_empty() && !train.return_arrive_hour.is_empty() {
        text += &format!(
            "🕑 Ritorno {} – {}\n",
            escape_markdown(&train.return_departure_hour),
            escape_markdown(&train.return_arrive_hour)
        );
    }
    if !train.locomotive.is_empty() {
        text += &format!("🚞 {}\n", escape_markdown(&train.locomotive));
    }

    if verbose {
        if !train.region.is_empty() {
            text += &format!("🌍 {}\n", escape_markdown(&train.region));
        }
        if !train.locomotive_other_details.is_empty() {
            text += &format!("ℹ️ {}\n", escape_markdown(&train.locomotive_other_details));
        }
        if !train.price_adult.is_empty() {
            text += &format!("💶 Adulti {}", escape_markdown(&train.price_adult));
            if !train.price_child.is_empty() {
                text += &format!(", bambini {}", escape_markdown(&train.price_child));
            }
            text.push('\n');
        }
    }

    text.trim_end().to_string()
}

fn keyboard(train: &Train, public_address: &str) -> Value {
    let mut rows = vec![vec![json!({
        "text": "Maggiori informazioni",
        "url": train.page_link(),
    })]];
    if let Some(url) = http::page_url(train, public_address) {
        rows.push(vec![json!({
            "text": "Aggiungi al calendario",
            "url": url,
        })]);
    }
    json!({ "inline_keyboard": rows })
}
