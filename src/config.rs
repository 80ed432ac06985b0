//! Run settings and the source catalogue.
//!
//! Settings are validated once, before any network traffic, so that a
//! missing credential fails the process with exit code 2 instead of
//! surfacing as a string of per-source failures.

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::models::SourceId;
use crate::scrapers::{ConfiguredAdapter, SourceConfig};
use chrono::{Datelike, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Catalogue compiled into the binary.
pub const BUILTIN_CATALOGUE: &str = include_str!("../config/sources.yaml");

/// The declarative list of sources, in tie-break order.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalogue {
    pub sources: Vec<SourceConfig>,
}

impl Catalogue {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let catalogue: Catalogue =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Catalogue(e.to_string()))?;

        let mut seen = HashSet::new();
        for source in &catalogue.sources {
            if !seen.insert(source.id) {
                return Err(ConfigError::Catalogue(format!("duplicate source `{}`", source.id)));
            }
        }
        Ok(catalogue)
    }

    /// The built-in catalogue, or the one at `path`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let yaml = std::fs::read_to_string(p)
                    .map_err(|e| ConfigError::Catalogue(format!("{}: {e}", p.display())))?;
                info!(path = %p.display(), "Loaded source catalogue");
                Self::from_yaml(&yaml)
            }
            None => Self::from_yaml(BUILTIN_CATALOGUE),
        }
    }

    /// Enabled sources restricted to `wanted` (all when empty), in
    /// catalogue order.
    pub fn select(&self, wanted: &[SourceId]) -> Result<Vec<&SourceConfig>, ConfigError> {
        for id in wanted {
            if !self.sources.iter().any(|s| s.id == *id) {
                return Err(ConfigError::Invalid {
                    var: "--sources",
                    reason: format!("`{id}` is not in the catalogue"),
                });
            }
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| wanted.is_empty() || wanted.contains(&s.id))
            .collect())
    }

    /// Compile adapters for the selected sources.
    pub fn adapters(&self, wanted: &[SourceId]) -> Result<Vec<ConfiguredAdapter>, ConfigError> {
        let year = Utc::now().year();
        self.select(wanted)?
            .into_iter()
            .map(|s| ConfiguredAdapter::new(s.clone(), year))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub base_url: String,
    pub key: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub concurrency: usize,
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_articles: usize,
    pub sources: Vec<SourceId>,
    pub dry_run: bool,
    pub source_concurrency: usize,
    pub host_min_delay: Duration,
    pub run_deadline: Duration,
    pub source_budget: Duration,
}

/// Everything a run needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sink: SinkSettings,
    /// `None` when enrichment is disabled.
    pub llm: Option<LlmSettings>,
    pub run: RunSettings,
}

fn required(value: &Option<String>, var: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(var))
}

fn http_url(value: &str, var: &'static str) -> Result<String, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            var,
            reason: format!("unsupported scheme `{}`", url.scheme()),
        });
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn at_least_one(value: usize, var: &'static str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn seconds(value: u64, var: &'static str) -> Result<Duration, ConfigError> {
    at_least_one(value as usize, var).map(|_| Duration::from_secs(value))
}

impl Settings {
    /// Validate the parsed command line. `need_llm` is false for runs and
    /// maintenance operations that never call the model.
    pub fn from_cli(cli: &Cli, need_llm: bool) -> Result<Self, ConfigError> {
        let sink = SinkSettings {
            base_url: http_url(&required(&cli.sink.sink_url, "SINK_URL")?, "SINK_URL")?,
            key: required(&cli.sink.sink_key, "SINK_KEY")?,
            table: cli.sink.sink_table.clone(),
        };

        let llm = if need_llm {
            Some(LlmSettings {
                api_key: required(&cli.llm.llm_api_key, "LLM_API_KEY")?,
                base_url: http_url(&cli.llm.llm_base_url, "LLM_BASE_URL")?,
                model: cli.llm.llm_model.clone(),
                concurrency: at_least_one(cli.llm.llm_concurrency, "LLM_CONCURRENCY")?,
                requests_per_minute: cli.llm.llm_requests_per_minute.max(1),
            })
        } else {
            None
        };

        let limits = &cli.limits;
        let run = RunSettings {
            max_articles: cli.run.max_articles,
            sources: cli.run.sources.clone(),
            dry_run: cli.run.dry_run,
            source_concurrency: at_least_one(limits.source_concurrency, "SOURCE_CONCURRENCY")?,
            host_min_delay: Duration::from_millis(limits.host_min_delay_ms),
            run_deadline: seconds(limits.run_deadline_secs, "RUN_DEADLINE_SECS")?,
            source_budget: seconds(limits.source_budget_secs, "SOURCE_BUDGET_SECS")?,
        };

        debug!(
            table = %sink.table,
            enrich = llm.is_some(),
            source_concurrency = run.source_concurrency,
            "Settings validated"
        );
        Ok(Self { sink, llm, run })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["chile_legal_news", "--sink-url", "https://db.example.cl/", "--sink-key", "k"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_builtin_catalogue_lists_all_sources_in_order() {
        let catalogue = Catalogue::load(None).unwrap();
        let ids: Vec<SourceId> = catalogue.sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, SourceId::ALL.to_vec());
    }

    #[test]
    fn test_builtin_catalogue_compiles() {
        let adapters = Catalogue::load(None).unwrap().adapters(&[]).unwrap();
        assert_eq!(adapters.len(), 12);
    }

    #[test]
    fn test_environmental_sources_carry_prefix_and_denylist() {
        let catalogue = Catalogue::load(None).unwrap();
        for (id, prefix) in [
            (SourceId::PrimerTribunalAmbiental, "[1TA]"),
            (SourceId::TercerTribunalAmbiental, "[3TA]"),
            (SourceId::TribunalAmbiental, "[2TA]"),
        ] {
            let source = catalogue.sources.iter().find(|s| s.id == id).unwrap();
            assert_eq!(source.title_prefix.as_deref(), Some(prefix));
            assert_eq!(source.denylists, vec!["environmental_tribunal"]);
        }
    }

    #[test]
    fn test_select_keeps_catalogue_order() {
        let catalogue = Catalogue::load(None).unwrap();
        let picked = catalogue.select(&[SourceId::Sii, SourceId::PoderJudicial]).unwrap();
        let ids: Vec<SourceId> = picked.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SourceId::PoderJudicial, SourceId::Sii]);
    }

    #[test]
    fn test_duplicate_sources_rejected() {
        let yaml = r#"
sources:
  - id: sii
    display_name: A
    entry_urls: ["https://www.sii.cl/"]
    base_host: www.sii.cl
    discovery: { kind: sitemap }
  - id: sii
    display_name: B
    entry_urls: ["https://www.sii.cl/"]
    base_host: www.sii.cl
    discovery: { kind: sitemap }
"#;
        assert!(matches!(Catalogue::from_yaml(yaml), Err(ConfigError::Catalogue(_))));
    }

    #[test]
    fn test_settings_require_llm_key_only_when_enriching() {
        let enriching = cli(&[]);
        if enriching.llm.llm_api_key.is_none() {
            let err = Settings::from_cli(&enriching, true).unwrap_err();
            assert!(matches!(err, ConfigError::Missing("LLM_API_KEY")));
        }

        let settings = Settings::from_cli(&cli(&["--no-enrich"]), false).unwrap();
        assert!(settings.llm.is_none());
        assert_eq!(settings.sink.base_url, "https://db.example.cl");
        assert_eq!(settings.sink.table, "noticias_juridicas");
        assert_eq!(settings.run.host_min_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_settings_reject_bad_values() {
        let err = Settings::from_cli(&cli(&["--source-concurrency", "0"]), false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SOURCE_CONCURRENCY", .. }));

        let bad = Cli::parse_from(["chile_legal_news", "--sink-url", "ftp://x", "--sink-key", "k"]);
        assert!(matches!(
            Settings::from_cli(&bad, false),
            Err(ConfigError::Invalid { var: "SINK_URL", .. })
        ));
    }

    #[test]
    fn test_missing_sink_is_reported() {
        let bare = Cli::parse_from(["chile_legal_news", "--sink-key", "k"]);
        // SINK_URL may be set in the developer's environment.
        if bare.sink.sink_url.is_none() {
            assert!(matches!(
                Settings::from_cli(&bare, false),
                Err(ConfigError::Missing("SINK_URL"))
            ));
        }
    }
}
