//! Source adapters for the Chilean institutional news sites.
//!
//! Every site is described declaratively by a [`SourceConfig`] entry in the
//! source catalogue and driven by the same [`ConfiguredAdapter`]. Each
//! adapter does two things:
//!
//! 1. **Listing**: lazily discover article references ([`CandidateRef`])
//! 2. **Detail parsing**: turn a fetched article page into an [`Article`]
//!
//! Everything else (fetch, dedup, enrich, upsert) is shared by the pipeline.
//!
//! # Discovery kinds
//!
//! | Kind | Used by | Notes |
//! |------|---------|-------|
//! | Sitemap | `cde` | Newest `lastmod` first, follows sitemap indexes |
//! | HTML index | most sites | Link selector + href regex, optional pagination |
//! | Short code | `sii` | Article codes in the homepage mapped to a URL template |

pub mod discovery;
pub mod extract;

use crate::dates;
use crate::dedup::fingerprint;
use crate::error::{ConfigError, ParseError, SourceError};
use crate::fetcher::{Accept, Fetch};
use crate::models::{Article, CandidateRef, SourceId};
use crate::sanitize::{Sanitizer, sanitize_title};
use chrono::{DateTime, Utc};
use discovery::{LinkRules, index_candidates, parse_sitemap, short_code_candidates, sitemap_candidates};
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};
use url::Url;

fn default_min_title_len() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

fn default_max_pages() -> usize {
    1
}

/// How a source's article URLs are discovered.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discovery {
    /// `entry_urls` are sitemaps; nested sitemap indexes are followed.
    Sitemap {
        #[serde(default)]
        url_pattern: Option<String>,
    },
    /// `entry_urls` are HTML listing pages.
    HtmlIndex {
        #[serde(default = "default_link_selector")]
        link_selector: String,
        #[serde(default)]
        href_pattern: Option<String>,
        /// Later listing pages; `{entry}` is the first entry URL and `{n}`
        /// the page number (starting at 2).
        #[serde(default)]
        page_url_template: Option<String>,
        #[serde(default = "default_max_pages")]
        max_pages: usize,
    },
    /// `entry_urls` embed article codes that map onto `url_template`.
    ShortCode {
        code_pattern: String,
        url_template: String,
    },
}

/// One entry of the source catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub display_name: String,
    /// Listing URLs; `{year}` is replaced by the current year.
    pub entry_urls: Vec<String>,
    pub base_host: String,
    pub discovery: Discovery,
    #[serde(default)]
    pub detail_selectors: Vec<String>,
    #[serde(default)]
    pub title_selectors: Vec<String>,
    /// Names of built-in boilerplate denylists.
    #[serde(default)]
    pub denylists: Vec<String>,
    /// Extra boilerplate regexes for this source only.
    #[serde(default)]
    pub boilerplate: Vec<String>,
    #[serde(default)]
    pub title_prefix: Option<String>,
    /// Extra link-text terms that mark navigation on this site.
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default = "default_min_title_len")]
    pub min_title_len: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The two-operation contract every source implements.
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceId;

    fn display_name(&self) -> &str;

    /// Hosts this source may fetch from or be redirected to.
    fn allowed_hosts(&self) -> HashSet<String>;

    /// Lazily yield up to `limit` candidates. An error is only ever the
    /// first item: it means the listing itself could not be read.
    fn list_candidates<'a>(
        &'a self,
        fetcher: &'a dyn Fetch,
        limit: usize,
    ) -> BoxStream<'a, Result<CandidateRef, SourceError>>;

    /// Parse a fetched detail page into an unenriched article.
    fn parse_detail(
        &self,
        candidate: &CandidateRef,
        html: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Article, ParseError>;
}

enum CompiledDiscovery {
    Sitemap {
        url_pattern: Option<Regex>,
    },
    HtmlIndex {
        link_selector: Selector,
        href_pattern: Option<Regex>,
        page_url_template: Option<String>,
        max_pages: usize,
    },
    ShortCode {
        code_pattern: Regex,
        url_template: String,
    },
}

/// A source adapter built from its catalogue entry.
pub struct ConfiguredAdapter {
    config: SourceConfig,
    entry_urls: Vec<String>,
    discovery: CompiledDiscovery,
    detail_selectors: Vec<Selector>,
    title_selectors: Vec<Selector>,
    sanitizer: Sanitizer,
    allowed_hosts: HashSet<String>,
}

impl std::fmt::Debug for ConfiguredAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredAdapter")
            .field("id", &self.config.id)
            .field("entry_urls", &self.entry_urls)
            .finish()
    }
}

fn compile_selectors(id: SourceId, list: &[String], defaults: &[&str]) -> Result<Vec<Selector>, ConfigError> {
    list.iter()
        .map(String::as_str)
        .chain(defaults.iter().copied())
        .map(|s| {
            Selector::parse(s)
                .map_err(|e| ConfigError::Catalogue(format!("{id}: bad selector `{s}`: {e:?}")))
        })
        .collect()
}

fn compile_regex(id: SourceId, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::Catalogue(format!("{id}: bad pattern `{pattern}`: {e}")))
}

impl ConfiguredAdapter {
    /// Compile the selectors and patterns of `config`. `year` fills the
    /// `{year}` placeholders.
    pub fn new(config: SourceConfig, year: i32) -> Result<Self, ConfigError> {
        let id = config.id;
        let fill = |s: &str| s.replace("{year}", &year.to_string());

        let entry_urls: Vec<String> = config.entry_urls.iter().map(|u| fill(u)).collect();
        if entry_urls.is_empty() {
            return Err(ConfigError::Catalogue(format!("{id}: no entry_urls")));
        }

        let mut allowed_hosts = HashSet::from([config.base_host.clone()]);
        for raw in &entry_urls {
            let url = Url::parse(raw)
                .map_err(|e| ConfigError::Catalogue(format!("{id}: bad entry url `{raw}`: {e}")))?;
            if let Some(host) = url.host_str() {
                allowed_hosts.insert(host.to_string());
            }
        }

        let discovery = match &config.discovery {
            Discovery::Sitemap { url_pattern } => CompiledDiscovery::Sitemap {
                url_pattern: url_pattern.as_deref().map(|p| compile_regex(id, p)).transpose()?,
            },
            Discovery::HtmlIndex {
                link_selector,
                href_pattern,
                page_url_template,
                max_pages,
            } => CompiledDiscovery::HtmlIndex {
                link_selector: compile_selectors(id, std::slice::from_ref(link_selector), &[])?
                    .remove(0),
                href_pattern: href_pattern.as_deref().map(|p| compile_regex(id, p)).transpose()?,
                page_url_template: page_url_template.clone(),
                max_pages: (*max_pages).max(1),
            },
            Discovery::ShortCode {
                code_pattern,
                url_template,
            } => CompiledDiscovery::ShortCode {
                code_pattern: compile_regex(id, code_pattern)?,
                url_template: fill(url_template),
            },
        };

        let sanitizer = Sanitizer::from_catalogue(&config.denylists, &config.boilerplate)
            .map_err(|e| ConfigError::Catalogue(format!("{id}: {e}")))?;

        Ok(Self {
            detail_selectors: compile_selectors(id, &config.detail_selectors, extract::DEFAULT_DETAIL_SELECTORS)?,
            title_selectors: compile_selectors(id, &config.title_selectors, extract::DEFAULT_TITLE_SELECTORS)?,
            entry_urls,
            discovery,
            sanitizer,
            allowed_hosts,
            config,
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    fn accept(&self) -> Accept {
        match self.discovery {
            CompiledDiscovery::Sitemap { .. } => Accept::Xml,
            _ => Accept::Html,
        }
    }

    /// Listing pages fetched before anything else is known.
    fn initial_pages(&self) -> VecDeque<String> {
        let mut pages: VecDeque<String> = self.entry_urls.iter().cloned().collect();
        if let CompiledDiscovery::HtmlIndex {
            page_url_template: Some(template),
            max_pages,
            ..
        } = &self.discovery
        {
            let entry = &self.entry_urls[0];
            pages.extend((2..=*max_pages).map(|n| {
                template
                    .replace("{entry}", entry)
                    .replace("{n}", &n.to_string())
            }));
        }
        pages
    }

    /// Candidates on one listing page plus further listing pages it points to.
    fn read_listing(&self, page_url: &str, body: &str) -> Result<(Vec<CandidateRef>, Vec<String>), ParseError> {
        match &self.discovery {
            CompiledDiscovery::Sitemap { url_pattern } => {
                let sitemap = parse_sitemap(body)?;
                Ok((sitemap_candidates(&sitemap, url_pattern.as_ref()), sitemap.nested))
            }
            CompiledDiscovery::HtmlIndex {
                link_selector,
                href_pattern,
                ..
            } => {
                let base = Url::parse(page_url).map_err(|e| ParseError::Listing(e.to_string()))?;
                let rules = LinkRules {
                    link_selector,
                    href_pattern: href_pattern.as_ref(),
                    allowed_hosts: &self.allowed_hosts,
                    exclusions: &self.config.exclusions,
                    min_title_len: self.config.min_title_len,
                };
                Ok((index_candidates(body, &base, &rules), Vec::new()))
            }
            CompiledDiscovery::ShortCode {
                code_pattern,
                url_template,
            } => Ok((short_code_candidates(body, code_pattern, url_template), Vec::new())),
        }
    }
}

struct Listing<'a> {
    adapter: &'a ConfiguredAdapter,
    fetcher: &'a dyn Fetch,
    pages: VecDeque<String>,
    pending: VecDeque<CandidateRef>,
    seen: HashSet<String>,
    pages_read: usize,
    emitted: usize,
    limit: usize,
}

impl SourceAdapter for ConfiguredAdapter {
    fn id(&self) -> SourceId {
        self.config.id
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    fn allowed_hosts(&self) -> HashSet<String> {
        self.allowed_hosts.clone()
    }

    fn list_candidates<'a>(
        &'a self,
        fetcher: &'a dyn Fetch,
        limit: usize,
    ) -> BoxStream<'a, Result<CandidateRef, SourceError>> {
        let listing = Listing {
            adapter: self,
            fetcher,
            pages: self.initial_pages(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            pages_read: 0,
            emitted: 0,
            limit,
        };

        stream::unfold(Some(listing), |state| async move {
            let mut st = state?;
            loop {
                if st.emitted >= st.limit {
                    return None;
                }
                if let Some(candidate) = st.pending.pop_front() {
                    st.emitted += 1;
                    return Some((Ok(candidate), Some(st)));
                }
                let page_url = st.pages.pop_front()?;
                let first_page = st.pages_read == 0;
                st.pages_read += 1;

                let result = match st.fetcher.fetch(&page_url, st.adapter.accept()).await {
                    Ok(page) => st
                        .adapter
                        .read_listing(&page_url, &page.body)
                        .map_err(SourceError::from),
                    Err(e) => Err(SourceError::from(e)),
                };

                match result {
                    Ok((candidates, more_pages)) => {
                        let before = st.pending.len();
                        for c in candidates {
                            if st.seen.insert(c.url.clone()) {
                                st.pending.push_back(c);
                            }
                        }
                        let fresh = st.pending.len() - before;
                        debug!(source_id = %st.adapter.id(), page = %page_url, fresh, "Read listing page");
                        if fresh == 0 && more_pages.is_empty() && !first_page {
                            // Pagination ran past the end of the listing.
                            st.pages.clear();
                        }
                        st.pages.extend(more_pages);
                    }
                    // Nothing listed yet (e.g. a sitemap index whose child
                    // failed): the listing as a whole is unreadable.
                    Err(e) if first_page || st.emitted == 0 => return Some((Err(e), None)),
                    Err(e) => {
                        warn!(
                            metric = "listing_failed",
                            source_id = %st.adapter.id(),
                            page = %page_url,
                            emitted = st.emitted,
                            error = %e,
                            "Listing page failed; ending listing early"
                        );
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    fn parse_detail(
        &self,
        candidate: &CandidateRef,
        html: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Article, ParseError> {
        let doc = Html::parse_document(html);

        let raw_body = extract::extract_body(&doc, &self.detail_selectors)?;
        let raw_title = extract::extract_title(&doc, &self.title_selectors)
            .or_else(|| candidate.title_hint.clone())
            .ok_or(ParseError::EmptyTitle)?;

        let title = sanitize_title(&raw_title, self.config.title_prefix.as_deref())?;
        let body = self.sanitizer.sanitize_body(&raw_body)?;
        let hint = candidate.date_hint.map(|at| (at, candidate.date_hint_inferred));
        let published = dates::extract_published_at(&doc, &raw_body, &candidate.url, hint, fetched_at);

        info!(
            source_id = %self.config.id,
            url = %candidate.url,
            chars = body.chars().count(),
            date_inferred = published.inferred,
            "Parsed article"
        );

        Ok(Article {
            source_id: self.config.id,
            source_display_name: self.config.display_name.clone(),
            fingerprint: fingerprint(&title, &body, &candidate.url),
            origin_url: candidate.url.clone(),
            title,
            body,
            published_at: published.at,
            fetched_at,
            date_inferred: published.inferred,
            enrichment: None,
        })
    }
}
