// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treasure_common::GameState;

pub const DEFAULT_TELEGRAM_API_BASE_URL: &str = "https://api.telegram.org";

/// Best-effort outbound message channel. `Ok(false)` means the message was
/// skipped or rejected without a transport error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct TelegramSettings {
    pub api_base_url: String,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    settings: TelegramSettings,
}

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

impl TelegramNotifier {
    pub fn new(settings: TelegramSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, bot_token: &str) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.settings.api_base_url.trim_end_matches('/'),
            bot_token
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> anyhow::Result<bool> {
        let (Some(bot_token), Some(chat_id)) =
            (&self.settings.bot_token, &self.settings.chat_id)
        else {
            debug!("telegram bot token or chat id not configured; skipping notification");
            return Ok(false);
        };

        let response = self
            .client
            .post(self.endpoint(bot_token))
            .json(&SendMessagePayload {
                chat_id,
                text: message,
                parse_mode: "HTML",
            })
            .send()
            .await
            .context("failed to call Telegram sendMessage")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            warn!(%status, body = %body, "telegram rejected notification");
            return Ok(false);
        }

        info!("telegram notification sent");
        Ok(true)
    }
}

/// Everything the visit message mentions.
#[derive(Debug, Clone)]
pub struct VisitNotice<'a> {
    pub route_name: &'a str,
    pub route_id: &'a str,
    pub points: u32,
    pub state: &'a GameState,
    pub completed_now: bool,
    pub at: DateTime<Utc>,
}

pub fn format_visit_notification(notice: &VisitNotice<'_>) -> String {
    let state = notice.state;
    let progress = if state.total_routes == 0 {
        0
    } else {
        ((state.visited_routes as f64 / state.total_routes as f64) * 100.0).round() as u32
    };

    let mut message = format!(
        "🏺 <b>Treasure Route Visited!</b>\n\n\
         📍 <b>Location:</b> {}\n\
         🆔 <b>Route ID:</b> <code>{}</code>\n\
         🪙 <b>Points Earned:</b> {}\n\n\
         📊 <b>Progress:</b>\n   \
         • Routes: {}/{} ({}%)\n   \
         • Total Points: {}\n\n\
         ⏰ <b>Time:</b> {}",
        escape_html(notice.route_name),
        escape_html(notice.route_id),
        group_thousands(u64::from(notice.points)),
        state.visited_routes,
        state.total_routes,
        progress,
        group_thousands(state.total_points),
        notice.at.format("%Y-%m-%d %H:%M:%S UTC"),
    );

    if notice.completed_now {
        message.push_str("\n\n🏆 <b>All treasure routes found!</b>");
    }
    message
}

/// Deliver in the background; the outcome is only logged.
pub fn spawn_notification(
    notifier: Arc<dyn Notifier>,
    route_id: String,
    message: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&message).await {
            Ok(true) => debug!(route_id = %route_id, "visit notification delivered"),
            Ok(false) => debug!(route_id = %route_id, "visit notification not delivered"),
            Err(error) => warn!(
                route_id = %route_id,
                error = %format!("{error:#}"),
                "visit notification failed"
            ),
        }
    })
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}
