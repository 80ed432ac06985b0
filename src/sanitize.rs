//! Title and body clean-up shared by ingestion and the maintenance rescan.
//!
//! Both entry points are pure functions of their input and the active
//! denylist, and both are idempotent: running them on their own output
//! returns it unchanged.

use crate::error::ParseError;
use crate::utils::collapse_whitespace;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Bodies shorter than this (in characters) are discarded.
pub const MIN_BODY_CHARS: usize = 200;

/// Bumped whenever a built-in denylist changes; logged on every run so a
/// stored body can be traced back to the rules that produced it.
pub const DENYLIST_VERSION: u32 = 3;

/// Applied to every source: share widgets and print links.
const SHARED: &[&str] = &[
    r"Compartir en (?:Facebook|Twitter|X|LinkedIn|WhatsApp)\b",
    r"Imprimir noticia",
];

/// Contact trailers of the environmental tribunals. Longest patterns first
/// so the short ones only mop up leftovers.
const ENVIRONMENTAL_TRIBUNAL: &[&str] = &[
    r"Acceder al expediente.*?contacto@tribunalambiental\.cl\.?",
    r"Morandé 360, Piso 8, Santiago.*?contacto@tribunalambiental\.cl\.?",
    r"\([0-9\s+]+\)\s*contacto@tribunalambiental\.cl\.?",
    r"contacto@tribunalambiental\.cl\.?",
    r"R-[0-9-]+ Morandé 360, Piso 8, Santiago",
    r"Morandé 360, Piso 8, Santiago(?:\([0-9\s+]+\))?",
];

/// Look up a built-in denylist by the name used in the source catalogue.
pub fn named_denylist(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "shared" => Some(SHARED),
        "environmental_tribunal" => Some(ENVIRONMENTAL_TRIBUNAL),
        _ => None,
    }
}

/// Compile a boilerplate pattern: case-insensitive, `.` spans newlines.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
}

static TRAILING_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,2}[-/]\d{1,2}[-/]\d{4}(?:\s+\d{1,2}:\d{2})?\s*$").expect("static regex")
});
static TRAILING_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}:\d{2}\s*$").expect("static regex"));

const TRAILING_SEPARATORS: &[char] = &['-', '–', '—', '|', ',', '·', ':'];

/// Clean a title and prepend the source's disambiguation prefix.
///
/// Trailing `DD/MM/YYYY [HH:MM]` and bare `HH:MM` tokens are removed
/// repeatedly, together with any separator they leave dangling.
pub fn sanitize_title(raw: &str, prefix: Option<&str>) -> Result<String, ParseError> {
    let mut title = collapse_whitespace(raw);
    loop {
        let before = title.len();
        title = title
            .trim_end_matches(|c: char| c.is_whitespace() || TRAILING_SEPARATORS.contains(&c))
            .to_string();
        title = TRAILING_DATE.replace(&title, "").into_owned();
        title = TRAILING_TIME.replace(&title, "").into_owned();
        if title.len() == before {
            break;
        }
    }
    let title = title.trim().to_string();

    let bare = match prefix {
        Some(p) => title.strip_prefix(p).map(str::trim_start).unwrap_or(&title),
        None => &title,
    };
    if bare.is_empty() {
        return Err(ParseError::EmptyTitle);
    }

    Ok(match prefix {
        Some(p) if !title.starts_with(p) => format!("{p} {title}"),
        _ => title,
    })
}

/// Body clean-up with the effective denylist of one source.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<Regex>,
}

const MAX_PASSES: usize = 8;

impl Sanitizer {
    /// A sanitizer with exactly these patterns (the shared list is not
    /// added implicitly).
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// The shared list, the named built-in lists, then source-specific
    /// extra patterns.
    pub fn from_catalogue(denylists: &[String], extra: &[String]) -> Result<Self, String> {
        let mut sources: Vec<&str> = SHARED.to_vec();
        for name in denylists {
            let list = named_denylist(name).ok_or_else(|| format!("unknown denylist `{name}`"))?;
            sources.extend_from_slice(list);
        }
        sources.extend(extra.iter().map(String::as_str));

        let patterns = sources
            .into_iter()
            .unique()
            .map(|p| compile_pattern(p).map_err(|e| format!("bad pattern `{p}`: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Clean a body without enforcing the minimum length.
    pub fn clean_body(&self, raw: &str) -> String {
        let mut current = normalize_paragraphs(raw);
        for _ in 0..MAX_PASSES {
            let next = normalize_paragraphs(&self.strip_denylisted(&current));
            if next == current {
                break;
            }
            current = next;
        }
        if self.has_boilerplate(&current) {
            warn!(passes = MAX_PASSES, "Boilerplate left after the last cleaning pass");
        }
        current
    }

    /// Clean a body and reject it when too short to be an article.
    pub fn sanitize_body(&self, raw: &str) -> Result<String, ParseError> {
        let body = self.clean_body(raw);
        if body.chars().count() < MIN_BODY_CHARS {
            return Err(ParseError::BodyTooShort);
        }
        Ok(body)
    }

    /// Whether any pattern still matches `text`.
    pub fn has_boilerplate(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    fn strip_denylisted(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |acc, re| {
            re.replace_all(&acc, " ").into_owned()
        })
    }
}

/// One paragraph per non-blank line, whitespace collapsed, consecutive
/// repeats (compared case-insensitively) dropped, joined by blank lines.
fn normalize_paragraphs(text: &str) -> String {
    text.lines()
        .map(collapse_whitespace)
        .filter(|p| !p.is_empty())
        .dedup_by(|a, b| a.to_lowercase() == b.to_lowercase())
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environmental() -> Sanitizer {
        Sanitizer::from_catalogue(&["environmental_tribunal".to_string()], &[]).unwrap()
    }

    fn long_paragraph(seed: &str) -> String {
        format!("{seed} ").repeat(30)
    }

    #[test]
    fn test_title_strips_trailing_date_and_time() {
        assert_eq!(
            sanitize_title("Corte acoge recurso 31/07/2025 10:45", None).unwrap(),
            "Corte acoge recurso"
        );
        assert_eq!(
            sanitize_title("Corte acoge recurso - 31-07-2025", None).unwrap(),
            "Corte acoge recurso"
        );
        assert_eq!(
            sanitize_title("Audiencia pública | 09:30 ", None).unwrap(),
            "Audiencia pública"
        );
    }

    #[test]
    fn test_title_collapses_whitespace() {
        assert_eq!(
            sanitize_title("  Nuevo \n régimen\t simplificado ", None).unwrap(),
            "Nuevo régimen simplificado"
        );
    }

    #[test]
    fn test_title_prefix_added_once() {
        let once = sanitize_title("Tribunal dicta sentencia", Some("[1TA]")).unwrap();
        assert_eq!(once, "[1TA] Tribunal dicta sentencia");
        let twice = sanitize_title(&once, Some("[1TA]")).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_title_only_date_is_empty() {
        assert_eq!(sanitize_title("31/07/2025 10:45", None), Err(ParseError::EmptyTitle));
        assert_eq!(sanitize_title("12:00", Some("[3TA]")), Err(ParseError::EmptyTitle));
    }

    #[test]
    fn test_title_never_ends_with_date_or_time() {
        let date_tail = Regex::new(r".*\d{1,2}[-/]\d{1,2}[-/]\d{4}(\s+\d{1,2}:\d{2})?\s*$").unwrap();
        let time_tail = Regex::new(r".*\b\d{1,2}:\d{2}\s*$").unwrap();
        let samples = [
            "Fallo 1/2/2025 3:04 12:30",
            "Resolución 01-02-2025 - 10:00 |",
            "Minuta 10:00 10:00",
            "Sesión del pleno, 5/5/2024",
            "Nada que quitar",
        ];
        for raw in samples {
            let t = sanitize_title(raw, None).unwrap();
            assert!(!date_tail.is_match(&t), "{t}");
            assert!(!time_tail.is_match(&t), "{t}");
            assert_eq!(sanitize_title(&t, None).unwrap(), t);
        }
    }

    #[test]
    fn test_body_removes_environmental_contact_trailer() {
        let raw = format!(
            "{}\nAcceder al expediente de la causaR-498-2025 Morandé 360, Piso 8, Santiago(56) 2 2393 69 00…contacto@tribunalambiental.cl.",
            long_paragraph("El tribunal rechazó la reclamación ambiental.")
        );
        let s = environmental();
        let body = s.sanitize_body(&raw).unwrap();
        assert!(!body.contains("Morandé 360"));
        assert!(!body.contains("contacto@tribunalambiental.cl"));
        assert!(!body.contains("Acceder al expediente"));
        assert!(!s.has_boilerplate(&body));
    }

    #[test]
    fn test_body_fixpoint_handles_exposed_matches() {
        // Removing "a b" from "aa bb" leaves "a b" again.
        let s = Sanitizer::new(vec![compile_pattern("a b").unwrap()]);
        let raw = format!("{}\naa bb", long_paragraph("texto"));
        let body = s.clean_body(&raw);
        assert!(!s.has_boilerplate(&body));
        assert_eq!(body, long_paragraph("texto").trim());
    }

    #[test]
    fn test_body_drops_consecutive_duplicate_paragraphs() {
        let p = long_paragraph("La Corte Suprema confirmó el fallo.");
        let raw = format!("{p}\n\n{}\n{p}", p.to_uppercase());
        let body = environmental().clean_body(&raw);
        assert_eq!(body.matches("\n\n").count(), 0);
    }

    #[test]
    fn test_body_keeps_non_consecutive_repeats() {
        let a = long_paragraph("alfa");
        let b = long_paragraph("beta");
        let body = environmental().clean_body(&format!("{a}\n{b}\n{a}"));
        assert_eq!(body.split("\n\n").count(), 3);
    }

    #[test]
    fn test_body_too_short() {
        let err = environmental()
            .sanitize_body("Breve nota. contacto@tribunalambiental.cl")
            .unwrap_err();
        assert_eq!(err, ParseError::BodyTooShort);
    }

    #[test]
    fn test_body_idempotent() {
        let s = environmental();
        let inputs = [
            format!("  {}\n\n\n{}  Compartir en Facebook", long_paragraph("uno"), long_paragraph("dos")),
            format!("{}\ncontacto@tribunalambiental.cl.\n{}", long_paragraph("x"), long_paragraph("x")),
            "solo\ttabs\ty   espacios".to_string(),
        ];
        for raw in inputs {
            let once = s.clean_body(&raw);
            assert_eq!(s.clean_body(&once), once);
        }
    }

    #[test]
    fn test_shared_denylist_always_applies() {
        let s = Sanitizer::from_catalogue(&[], &[]).unwrap();
        let body = s.clean_body(&format!("{} Compartir en WhatsApp Imprimir noticia", long_paragraph("texto")));
        assert!(!body.contains("WhatsApp"));
        assert!(!body.contains("Imprimir"));
    }

    #[test]
    fn test_unknown_denylist_is_rejected() {
        assert!(Sanitizer::from_catalogue(&["nope".to_string()], &[]).is_err());
        assert!(Sanitizer::from_catalogue(&[], &["(unclosed".to_string()]).is_err());
    }
}
