//! HTML text and keyboards for listing notifications (Telegram HTML subset).

use super::{InlineButton, InlineKeyboard};
use crate::api::Listing;
use crate::core::ListingId;

pub const HIDE_LISTING_CALLBACK: &str = "hide_project";
pub const ENABLE_TRACKING_CALLBACK: &str = "enable_tracking";
pub const DISABLE_TRACKING_CALLBACK: &str = "disable_tracking";

/// Public marketplace URLs derived from the configured base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLinks {
    base_url: String,
}

impl ListingLinks {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn view(&self, id: ListingId) -> String {
        format!("{}/projects/{}/view", self.base_url, id)
    }

    pub fn offer(&self, id: ListingId) -> String {
        format!("{}/new_offer?project={}", self.base_url, id)
    }

    pub fn profile(&self, username: &str) -> String {
        format!("{}/user/{}", self.base_url, username)
    }

    pub fn buyer_listings(&self, username: &str) -> String {
        format!("{}/projects/list/{}", self.base_url, username)
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Remove marketplace emoji markers such as `[:smile]` or `[:thumbs-up]`
/// and trim every line.
pub fn strip_emoji_codes(text: &str) -> String {
    text.split('\n')
        .map(|line| strip_line(line).trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(start) = rest.find("[:") {
        let after = &rest[start + 2..];
        match after.find(']') {
            Some(end) if is_emoji_code(&after[..end]) => {
                out.push_str(rest[..start].trim_end());
                out.push(' ');
                rest = after[end + 1..].trim_start();
            }
            _ => {
                out.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_emoji_code(code: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let (head, tail) = code.split_once('-').unwrap_or((code, ""));
    !head.is_empty() && head.chars().all(is_word) && tail.chars().all(is_word)
}

fn rubles(amount: f64) -> String {
    format!("{} ₽", amount.trunc() as i64)
}

/// Summary message sent after a listing's attachments.
pub fn listing_summary(listing: &Listing, links: &ListingLinks, has_attachments: bool) -> String {
    let title = escape_html(&strip_emoji_codes(&listing.title));
    let description = escape_html(&strip_emoji_codes(&listing.description)).replace('\n', "\n\n");

    let mut text = format!("<blockquote><b>{}</b>\n\n{}</blockquote>\n\n", title, description);

    if let Some(price) = listing.price_limit {
        text.push_str(&format!("Desired budget: up to {}\n", rubles(price)));
    }
    if let Some(price) = listing.possible_price_limit {
        text.push_str(&format!("Acceptable: up to {}\n", rubles(price)));
    }
    text.push('\n');

    if let Some(username) = listing.buyer_username() {
        let username_html = escape_html(username);
        text.push_str(&format!(
            "Buyer: <a href='{}'>{}</a>\n",
            escape_html(&links.profile(username)),
            username_html
        ));

        let stats = listing.buyer_stats();
        if let Some(posted) = stats.wants_count {
            text.push_str(&format!("Listings posted: {}", posted));
            if let Some(open) = listing.buyer_open_listings {
                text.push_str(&format!(
                    "   <a href='{}'>View open ({})</a>",
                    escape_html(&links.buyer_listings(username)),
                    open
                ));
            }
            text.push('\n');
        }
        if let Some(hired) = stats.wants_hired_percent {
            text.push_str(&format!("Hired: {}%\n", hired));
        }
        text.push('\n');
    }

    if let Some(time_left) = &listing.time_left {
        text.push_str(&format!("Time left: {}\n", escape_html(time_left)));
    }
    if let Some(offers) = listing.offer_count {
        text.push_str(&format!("Offers: {}\n", offers));
    }

    let mut text = text.trim_end().to_string();
    if has_attachments {
        text.push_str("\n\n📎 Attachments are posted above this message");
    }
    text
}

/// Caption attached to each forwarded file.
pub fn attachment_caption(listing: &Listing) -> String {
    strip_emoji_codes(&listing.title)
}

pub fn listing_keyboard(id: ListingId, links: &ListingLinks) -> InlineKeyboard {
    InlineKeyboard::single_column([
        InlineButton::link("Open listing", links.view(id)),
        InlineButton::link("Make an offer", links.offer(id)),
        InlineButton::callback("🗑 Hide", HIDE_LISTING_CALLBACK),
    ])
}

pub fn tracking_keyboard(enabled: bool) -> InlineKeyboard {
    let button = if enabled {
        InlineButton::callback("Disable listing tracking", DISABLE_TRACKING_CALLBACK)
    } else {
        InlineButton::callback("Enable listing tracking", ENABLE_TRACKING_CALLBACK)
    };
    InlineKeyboard::single_column([button])
}

pub fn auth_failure_notice(reason: &str) -> String {
    format!(
        "⚠️ Listing tracking was switched off: the marketplace rejected the login (<i>{}</i>).\n\
         Sign in again to resume tracking.",
        escape_html(reason)
    )
}
