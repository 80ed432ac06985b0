//! Publication date recovery.
//!
//! Strategies, first hit wins:
//! 1. Structured metadata (`article:published_time` and friends,
//!    `<time datetime>`, JSON-LD `datePublished`, date-classed elements)
//! 2. Spanish and numeric dates in the extracted article body, then in the
//!    rest of the page minus navigation, headers, footers and asides
//! 3. Dates embedded in the URL path or slug
//! 4. The date printed next to the link on the listing page, or the
//!    sitemap `lastmod` (the latter flagged as inferred)
//!
//! Anything else, or a hit more than a day after the fetch, falls back to
//! the fetch time flagged as inferred. Values without a time of day are
//! UTC midnight.

use crate::scrapers::extract::article_text;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

/// A resolved publication timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedAt {
    pub at: DateTime<Utc>,
    pub inferred: bool,
}

static META_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"meta[property="article:published_time"]"#,
        r#"meta[name="date"]"#,
        r#"meta[name="publish_date"]"#,
        r#"meta[name="pubdate"]"#,
        r#"meta[itemprop="datePublished"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("static selector"))
    .collect()
});

static DATETIME_ATTR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time[datetime], [datetime]").expect("static selector"));
static JSON_LD: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("static selector")
});
static DATE_ELEMENTS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        ".fecha, .date, .entry-date, .post-date, .fecha-publicacion, .noticia-fecha, .published",
    )
    .expect("static selector")
});

static SPANISH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+(?:de\s+)?(\p{L}+)\.?\s+(?:del?\s+)?(\d{4})\b(?:,?\s+(?:a\s+las\s+)?(\d{1,2}):(\d{2}))?",
    )
    .expect("static regex")
});
static DMY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})[/-](\d{1,2})[/-](\d{4})\b(?:,?\s+(\d{1,2}):(\d{2}))?")
        .expect("static regex")
});
static YMD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b(?:[ T](\d{1,2}):(\d{2}))?").expect("static regex")
});

static URL_YMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{4})/(\d{1,2})/(\d{1,2})(?:/|$)").expect("static regex"));
static URL_SLUG_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(\d{2})(\d{2})(\d{2})(?:noti|[-_])[^/]*$").expect("static regex")
});
static URL_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(\d{4})(?:/|$)").expect("static regex"));

fn month_number(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let m = match name.as_str() {
        "enero" | "ene" => 1,
        "febrero" | "feb" => 2,
        "marzo" | "mar" => 3,
        "abril" | "abr" => 4,
        "mayo" | "may" => 5,
        "junio" | "jun" => 6,
        "julio" | "jul" => 7,
        "agosto" | "ago" => 8,
        "septiembre" | "setiembre" | "sep" | "sept" => 9,
        "octubre" | "oct" => 10,
        "noviembre" | "nov" => 11,
        "diciembre" | "dic" => 12,
        _ => return None,
    };
    Some(m)
}

fn num(caps: &Captures<'_>, i: usize) -> Option<u32> {
    caps.get(i)?.as_str().parse().ok()
}

fn plausible_year(year: i32) -> bool {
    (1990..=2100).contains(&year)
}

fn build(year: i32, month: u32, day: u32, hour: Option<u32>, minute: Option<u32>) -> Option<DateTime<Utc>> {
    if !plausible_year(year) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = match (hour, minute) {
        (Some(h), Some(m)) => date.and_hms_opt(h, m, 0)?,
        _ => date.and_hms_opt(0, 0, 0)?,
    };
    Some(time.and_utc())
}

#[derive(Clone, Copy)]
enum Layout {
    DayMonthName,
    DayMonthYear,
    YearMonthDay,
}

fn from_captures(layout: Layout, caps: &Captures<'_>) -> Option<DateTime<Utc>> {
    let (hour, minute) = (num(caps, 4), num(caps, 5));
    match layout {
        Layout::DayMonthName => {
            let month = month_number(caps.get(2)?.as_str())?;
            build(num(caps, 3)? as i32, month, num(caps, 1)?, hour, minute)
        }
        Layout::DayMonthYear => build(num(caps, 3)? as i32, num(caps, 2)?, num(caps, 1)?, hour, minute),
        Layout::YearMonthDay => build(num(caps, 1)? as i32, num(caps, 2)?, num(caps, 3)?, hour, minute),
    }
}

/// The earliest valid date written in `text`, in any supported layout.
///
/// Only four-digit years are accepted.
pub fn parse_text_date(text: &str) -> Option<DateTime<Utc>> {
    let mut best: Option<(usize, DateTime<Utc>)> = None;
    for (re, layout) in [
        (&*SPANISH, Layout::DayMonthName),
        (&*DMY, Layout::DayMonthYear),
        (&*YMD, Layout::YearMonthDay),
    ] {
        for caps in re.captures_iter(text) {
            let Some(start) = caps.get(0).map(|m| m.start()) else {
                continue;
            };
            if best.is_some_and(|(s, _)| s <= start) {
                break;
            }
            if let Some(at) = from_captures(layout, &caps) {
                best = Some((start, at));
                break;
            }
        }
    }
    best.map(|(_, at)| at)
}

/// Parse a machine-readable timestamp (ISO 8601 / RFC 3339 and the usual
/// sloppy variants), falling back to the text layouts.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    parse_text_date(s)
}

fn find_date_published(v: &Value) -> Option<&str> {
    match v {
        Value::Object(map) => map
            .get("datePublished")
            .and_then(Value::as_str)
            .or_else(|| map.values().find_map(find_date_published)),
        Value::Array(items) => items.iter().find_map(find_date_published),
        _ => None,
    }
}

fn from_metadata(doc: &Html) -> Option<DateTime<Utc>> {
    let from_meta = META_SELECTORS.iter().find_map(|sel| {
        doc.select(sel)
            .filter_map(|el| el.value().attr("content"))
            .find_map(parse_datetime)
    });
    if from_meta.is_some() {
        return from_meta;
    }

    let from_attr = doc
        .select(&DATETIME_ATTR)
        .filter_map(|el| el.value().attr("datetime"))
        .find_map(parse_datetime);
    if from_attr.is_some() {
        return from_attr;
    }

    let from_json_ld = doc.select(&JSON_LD).find_map(|el| {
        let raw = el.text().collect::<String>();
        let value: Value = serde_json::from_str(raw.trim()).ok()?;
        find_date_published(&value).and_then(parse_datetime)
    });
    if from_json_ld.is_some() {
        return from_json_ld;
    }

    doc.select(&DATE_ELEMENTS)
        .find_map(|el| parse_text_date(&el.text().collect::<Vec<_>>().join(" ")))
}

/// Dates encoded in the URL. Year-only paths are reported as inferred.
pub fn from_url(url: &str) -> Option<(DateTime<Utc>, bool)> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());

    if let Some(at) = URL_YMD
        .captures(&path)
        .and_then(|c| build(num(&c, 1)? as i32, num(&c, 2)?, num(&c, 3)?, None, None))
    {
        return Some((at, false));
    }
    if let Some(at) = URL_SLUG_CODE
        .captures(&path)
        .and_then(|c| build(2000 + num(&c, 3)? as i32, num(&c, 2)?, num(&c, 1)?, None, None))
    {
        return Some((at, false));
    }
    URL_YEAR
        .captures_iter(&path)
        .find_map(|c| build(num(&c, 1)? as i32, 1, 1, None, None))
        .map(|at| (at, true))
}

/// Pick the final value for `published_at`.
///
/// A date more than one day after `fetched_at` is discarded; anything else
/// later than `fetched_at` is clamped to it and marked inferred.
pub fn resolve(found: Option<(DateTime<Utc>, bool)>, fetched_at: DateTime<Utc>) -> PublishedAt {
    let fallback = PublishedAt {
        at: fetched_at,
        inferred: true,
    };
    match found {
        Some((at, _)) if at > fetched_at + Duration::days(1) => {
            debug!(%at, %fetched_at, "Discarding future publication date");
            fallback
        }
        Some((at, _)) if at > fetched_at => fallback,
        Some((at, inferred)) => PublishedAt { at, inferred },
        None => fallback,
    }
}

/// Recover the publication date of a parsed detail page.
///
/// # Arguments
///
/// * `doc` - The parsed detail page
/// * `body` - Text of the extracted article container, scanned before the
///   rest of the page so dates in sidebars cannot win
/// * `url` - The article URL
/// * `hint` - Date from the listing, with whether it is only approximate
/// * `fetched_at` - When the page was downloaded
///
/// # Returns
///
/// The publication time, or `fetched_at` flagged as inferred when nothing
/// usable was found.
pub fn extract_published_at(
    doc: &Html,
    body: &str,
    url: &str,
    hint: Option<(DateTime<Utc>, bool)>,
    fetched_at: DateTime<Utc>,
) -> PublishedAt {
    let found = from_metadata(doc)
        .map(|at| (at, false))
        .or_else(|| parse_text_date(body).map(|at| (at, false)))
        .or_else(|| parse_text_date(&article_text(doc.root_element())).map(|at| (at, false)))
        .or_else(|| from_url(url))
        .or(hint);
    resolve(found, fetched_at)
}
