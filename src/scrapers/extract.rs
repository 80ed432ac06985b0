//! Text extraction from detail pages.

use crate::error::ParseError;
use crate::utils::collapse_whitespace;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

/// A selector match needs at least this many characters of text to be
/// taken as the article body.
pub const MIN_DETAIL_CHARS: usize = 400;

/// Never contain readable text.
const INVISIBLE: &[&str] = &["script", "style", "noscript", "template", "svg", "iframe"];

/// Page chrome removed before reading the article body.
const CHROME: &[&str] = &["nav", "header", "footer", "aside", "form"];

const BLOCKS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table",
    "section", "article", "blockquote", "figure", "figcaption", "pre", "hr", "dd", "dt",
];

/// Tried after the per-source selectors, in this order.
pub const DEFAULT_DETAIL_SELECTORS: &[&str] = &[
    "article",
    ".entry-content",
    ".post-content",
    ".journal-content-article",
];

pub const DEFAULT_TITLE_SELECTORS: &[&str] = &["h1.entry-title", "article h1", "h1"];

static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("static selector"));
static OG_TITLE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:title"]"#).expect("static selector")
});
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("static selector"));

fn walk(el: ElementRef<'_>, skip: &[&[&str]], out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if skip.iter().any(|list| list.contains(&name)) {
                continue;
            }
            let block = BLOCKS.contains(&name);
            if block {
                out.push('\n');
            }
            walk(child_el, skip, out);
            if block {
                out.push('\n');
            }
        }
    }
}

fn lines(raw: &str) -> String {
    raw.lines()
        .map(collapse_whitespace)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Readable text under `el`, one line per block element, without
/// navigation, headers, footers, asides and forms.
pub fn article_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    walk(el, &[INVISIBLE, CHROME], &mut out);
    lines(&out)
}

/// The article body: the longest match of the first selector that yields
/// at least [`MIN_DETAIL_CHARS`] characters, then `body` with chrome
/// stripped as a last resort.
pub fn extract_body(doc: &Html, selectors: &[Selector]) -> Result<String, ParseError> {
    selectors
        .iter()
        .chain(std::iter::once(&*BODY))
        .find_map(|sel| {
            doc.select(sel)
                .map(article_text)
                .max_by_key(|t| t.chars().count())
                .filter(|t| t.chars().count() >= MIN_DETAIL_CHARS)
        })
        .ok_or(ParseError::NoSelectorMatch)
}

/// The first non-empty headline among `selectors`, `og:title` and `<title>`.
pub fn extract_title(doc: &Html, selectors: &[Selector]) -> Option<String> {
    let from_selectors = selectors.iter().find_map(|sel| {
        doc.select(sel)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .find(|t| !t.is_empty())
    });
    from_selectors
        .or_else(|| {
            doc.select(&OG_TITLE)
                .filter_map(|el| el.value().attr("content"))
                .map(collapse_whitespace)
                .find(|t| !t.is_empty())
        })
        .or_else(|| {
            doc.select(&TITLE)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .find(|t| !t.is_empty())
        })
}
