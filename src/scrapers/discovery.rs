//! Candidate discovery: sitemaps, HTML indexes and short-code homepages.

use crate::dates::{parse_datetime, parse_text_date};
use crate::error::ParseError;
use crate::fetcher::host_allowed;
use crate::models::CandidateRef;
use crate::utils::collapse_whitespace;
use itertools::Itertools;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Link texts that mark site navigation rather than news.
const NAV_TERMS: &[&str] = &[
    "inicio",
    "menu",
    "menú",
    "contacto",
    "transparencia",
    "página",
    "anterior",
    "siguiente",
    "buscar",
    "rss",
    "trámites",
    "formularios",
    "licitaciones",
];

/// Navigation links are a few words long; a headline that merely mentions
/// "contacto" is longer than this.
const NAV_MAX_WORDS: usize = 4;

/// Text around a link is only searched for a date when it is this short,
/// otherwise it probably belongs to several items.
const HINT_CONTEXT_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
}

/// A parsed `<urlset>` or `<sitemapindex>`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Sitemap {
    pub urls: Vec<SitemapEntry>,
    pub nested: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Loc,
    Lastmod,
}

fn xml_error(e: impl std::fmt::Display) -> ParseError {
    ParseError::Listing(format!("invalid sitemap: {e}"))
}

fn named_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => None,
    }
}

/// Parse a sitemap document.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut sitemap = Sitemap::default();
    let mut field = Field::None;
    let mut text = String::new();
    let mut loc: Option<String> = None;
    let mut lastmod: Option<String> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"urlset" | b"sitemapindex" => saw_root = true,
                b"url" | b"sitemap" => {
                    loc = None;
                    lastmod = None;
                }
                b"loc" => {
                    field = Field::Loc;
                    text.clear();
                }
                b"lastmod" => {
                    field = Field::Lastmod;
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) if field != Field::None => {
                text.push_str(&t.decode().map_err(xml_error)?);
            }
            Ok(Event::CData(t)) if field != Field::None => {
                text.push_str(&t.decode().map_err(xml_error)?);
            }
            Ok(Event::GeneralRef(r)) if field != Field::None => {
                if let Some(c) = r.resolve_char_ref().map_err(xml_error)? {
                    text.push(c);
                } else if let Some(c) = named_entity(&r.decode().map_err(xml_error)?) {
                    text.push(c);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" => {
                    loc = Some(text.trim().to_string());
                    field = Field::None;
                }
                b"lastmod" => {
                    lastmod = Some(text.trim().to_string());
                    field = Field::None;
                }
                b"url" => {
                    if let Some(loc) = loc.take().filter(|l| !l.is_empty()) {
                        sitemap.urls.push(SitemapEntry {
                            loc,
                            lastmod: lastmod.take(),
                        });
                    }
                }
                b"sitemap" => {
                    if let Some(loc) = loc.take().filter(|l| !l.is_empty()) {
                        sitemap.nested.push(loc);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }

    if !saw_root {
        return Err(ParseError::Listing("not a sitemap document".to_string()));
    }
    Ok(sitemap)
}

/// Sitemap entries as candidates, newest `lastmod` first, optionally
/// restricted to URLs matching `pattern`.
///
/// `lastmod` is a modification time, so it only ever yields an inferred
/// publication date.
pub fn sitemap_candidates(sitemap: &Sitemap, pattern: Option<&Regex>) -> Vec<CandidateRef> {
    sitemap
        .urls
        .iter()
        .filter(|e| pattern.is_none_or(|re| re.is_match(&e.loc)))
        .map(|e| CandidateRef {
            url: e.loc.clone(),
            title_hint: None,
            date_hint: e.lastmod.as_deref().and_then(parse_datetime),
            date_hint_inferred: true,
        })
        .sorted_by(|a, b| b.date_hint.cmp(&a.date_hint))
        .unique_by(|c| c.url.clone())
        .collect()
}

fn is_navigation(text: &str, exclusions: &[String]) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.len() <= NAV_MAX_WORDS
        && words
            .iter()
            .any(|w| NAV_TERMS.contains(w) || exclusions.iter().any(|e| e.as_str() == *w))
}

/// Resolve `href` against `base`, refusing fragments, scripts and mail
/// links, and dropping any `#fragment`.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    let lower = href.to_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
    {
        return None;
    }
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn date_near(link: ElementRef<'_>) -> Option<chrono::DateTime<chrono::Utc>> {
    let parent = link.parent().and_then(ElementRef::wrap)?;
    let text = collapse_whitespace(&parent.text().collect::<Vec<_>>().join(" "));
    if text.chars().count() > HINT_CONTEXT_CHARS {
        return None;
    }
    parse_text_date(&text)
}

/// Rules for reading article links off an HTML index page.
#[derive(Debug, Clone)]
pub struct LinkRules<'a> {
    pub link_selector: &'a Selector,
    pub href_pattern: Option<&'a Regex>,
    pub allowed_hosts: &'a HashSet<String>,
    /// Source-specific navigation terms, on top of the shared ones.
    pub exclusions: &'a [String],
    pub min_title_len: usize,
}

/// Article links on one index page, in page order, deduplicated by URL.
pub fn index_candidates(html: &str, page_url: &Url, rules: &LinkRules<'_>) -> Vec<CandidateRef> {
    let doc = Html::parse_document(html);
    doc.select(rules.link_selector)
        .filter_map(|a| {
            let url = resolve_link(page_url, a.value().attr("href")?)?;
            if !url.host_str().is_some_and(|h| host_allowed(rules.allowed_hosts, h)) {
                return None;
            }
            if rules.href_pattern.is_some_and(|re| !re.is_match(url.as_str())) {
                return None;
            }
            let mut title = collapse_whitespace(&a.text().collect::<Vec<_>>().join(" "));
            if title.is_empty() {
                title = collapse_whitespace(a.value().attr("title").unwrap_or_default());
            }
            if is_navigation(&title, rules.exclusions) || title.chars().count() < rules.min_title_len {
                return None;
            }
            Some(CandidateRef {
                url: url.to_string(),
                title_hint: Some(title),
                date_hint: date_near(a),
                date_hint_inferred: false,
            })
        })
        .unique_by(|c| c.url.clone())
        .collect()
}

/// Candidates synthesized from article codes embedded anywhere in the page
/// (`{code}` in `url_template` is replaced by each code).
pub fn short_code_candidates(html: &str, code_pattern: &Regex, url_template: &str) -> Vec<CandidateRef> {
    code_pattern
        .find_iter(html)
        .map(|m| m.as_str())
        .unique()
        .map(|code| CandidateRef::new(url_template.replace("{code}", code)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://www.cde.cl/post/antigua/</loc><lastmod>2024-01-10T10:00:00+00:00</lastmod></url>
  <url><loc>https://www.cde.cl/post/nueva/?a=1&amp;b=2</loc><lastmod>2025-07-30T08:00:00+00:00</lastmod></url>
  <url><loc><![CDATA[https://www.cde.cl/categoria/noticias/]]></loc></url>
</urlset>"#;

    #[test]
    fn test_parse_urlset() {
        let sitemap = parse_sitemap(URLSET).unwrap();
        assert_eq!(sitemap.urls.len(), 3);
        assert_eq!(sitemap.urls[1].loc, "https://www.cde.cl/post/nueva/?a=1&b=2");
        assert_eq!(sitemap.urls[2].loc, "https://www.cde.cl/categoria/noticias/");
        assert!(sitemap.urls[2].lastmod.is_none());
        assert!(sitemap.nested.is_empty());
    }

    #[test]
    fn test_parse_sitemap_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
            <sitemap><loc>https://www.cde.cl/post-sitemap1.xml</loc></sitemap>
            <sitemap><loc>https://www.cde.cl/post-sitemap2.xml</loc></sitemap>
        </sitemapindex>"#;
        let sitemap = parse_sitemap(xml).unwrap();
        assert!(sitemap.urls.is_empty());
        assert_eq!(sitemap.nested.len(), 2);
    }

    #[test]
    fn test_parse_sitemap_rejects_html() {
        assert!(parse_sitemap("<html><body>Not found</body></html>").is_err());
    }

    #[test]
    fn test_sitemap_candidates_newest_first_and_filtered() {
        let sitemap = parse_sitemap(URLSET).unwrap();
        let re = Regex::new(r"/post/").unwrap();
        let cands = sitemap_candidates(&sitemap, Some(&re));
        assert_eq!(cands.len(), 2);
        assert!(cands[0].url.contains("nueva"));
        assert_eq!(
            cands[0].date_hint,
            Some(Utc.with_ymd_and_hms(2025, 7, 30, 8, 0, 0).unwrap())
        );
        assert!(cands.iter().all(|c| c.date_hint_inferred));
    }

    fn rules<'a>(sel: &'a Selector, re: Option<&'a Regex>, hosts: &'a HashSet<String>) -> LinkRules<'a> {
        LinkRules {
            link_selector: sel,
            href_pattern: re,
            allowed_hosts: hosts,
            exclusions: &[],
            min_title_len: 10,
        }
    }

    #[test]
    fn test_index_candidates_filters_navigation() {
        let html = r##"<html><body>
            <nav><a href="/">Inicio</a><a href="/contacto">Contacto</a></nav>
            <div class="item"><a href="/noticias/2025/07/corte-acoge">Corte acoge recurso de protección</a><span>31/07/2025</span></div>
            <a href="#top">Volver arriba del listado</a>
            <a href="javascript:void(0)">Imprimir esta página completa</a>
            <a href="https://otro.cl/nota">Nota en otro sitio web externo</a>
            <a href="/noticias/2025/07/corte-acoge#comentarios">Corte acoge recurso de protección</a>
            <a href="/noticias/breve">Breve</a>
            <a href="/noticias/ministerio-contacto">Ministerio retoma contacto con gremios del transporte</a>
        </body></html>"##;
        let sel = Selector::parse("a[href]").unwrap();
        let hosts = HashSet::from(["www.pjud.cl".to_string()]);
        let base = Url::parse("https://www.pjud.cl/noticias").unwrap();
        let cands = index_candidates(html, &base, &rules(&sel, None, &hosts));

        let urls: Vec<&str> = cands.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.pjud.cl/noticias/2025/07/corte-acoge",
                "https://www.pjud.cl/noticias/ministerio-contacto",
            ]
        );
        assert_eq!(
            cands[0].date_hint,
            Some(Utc.with_ymd_and_hms(2025, 7, 31, 0, 0, 0).unwrap())
        );
        assert_eq!(cands[0].title_hint.as_deref(), Some("Corte acoge recurso de protección"));
        assert!(!cands[0].date_hint_inferred);
    }

    #[test]
    fn test_index_candidates_href_pattern() {
        let html = r#"<a href="/sala-de-prensa/detalle-noticia/123">INAPI lanza nueva plataforma</a>
                      <a href="/sala-de-prensa/eventos/9">Seminario de propiedad industrial</a>"#;
        let sel = Selector::parse("a[href]").unwrap();
        let re = Regex::new("detalle-noticia").unwrap();
        let hosts = HashSet::from(["www.inapi.cl".to_string()]);
        let base = Url::parse("https://www.inapi.cl/sala-de-prensa/noticias").unwrap();
        let cands = index_candidates(html, &base, &rules(&sel, Some(&re), &hosts));
        assert_eq!(cands.len(), 1);
        assert!(cands[0].url.ends_with("/detalle-noticia/123"));
    }

    #[test]
    fn test_short_codes() {
        let html = r#"<a href="310725noti01pcr.htm">x</a> <a href="310725noti01pcr.htm">dup</a>
                      <a href="290725noti02jpd.htm">y</a> 2025noti"#;
        let re = Regex::new("[0-9]{6}noti[0-9]{2}[a-z]{3}").unwrap();
        let cands = short_code_candidates(html, &re, "https://www.sii.cl/noticias/2025/{code}.htm");
        let urls: Vec<&str> = cands.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.sii.cl/noticias/2025/310725noti01pcr.htm",
                "https://www.sii.cl/noticias/2025/290725noti02jpd.htm",
            ]
        );
    }

    #[test]
    fn test_resolve_link() {
        let base = Url::parse("https://www.tdlc.cl/noticias/").unwrap();
        assert_eq!(
            resolve_link(&base, "nota-1/#x").unwrap().as_str(),
            "https://www.tdlc.cl/noticias/nota-1/"
        );
        assert!(resolve_link(&base, "mailto:a@b.cl").is_none());
        assert!(resolve_link(&base, "  ").is_none());
    }
}
