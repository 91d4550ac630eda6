use log::debug;
use std::collections::HashSet;

use crate::config::QueryConfig;
use crate::error::{RefineError, Result};
use crate::refine::model::{BibliographicRecord, Query, QueryType};
use crate::refine::tokens;

/// Hard upper bound on query length, in characters.
pub const MAX_QUERY_LEN: usize = 120;

/// Minimum number of characters carried by non-stopword tokens.
const MIN_MEANINGFUL_CHARS: usize = 3;

/// Titles longer than this are searched by their main title only.
const LONG_TITLE: usize = 60;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "with", "was", "were", "this", "that", "its", "into", "not", "no",
];

const FREE_ACCESS_MARKERS: &[&str] = &["site:edu", "site:gov", "site:archive.org", "free full text"];

/// Extra terms appended when the templates cannot fill the requested count.
const FILLERS: &[&str] = &["full text", "online", "pdf download", "summary", "overview", "citation"];

/// Fields a query template may draw from.
struct Parts {
    title: String,
    surname: String,
    author: String,
    year: String,
    publication: String,
    doi: String,
}

type Template = fn(&Parts, &str) -> Option<String>;

fn quoted(title: &str) -> Option<String> {
    if title.is_empty() {
        None
    } else {
        Some(format!("\"{}\"", title))
    }
}

fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<&str>>()
        .join(" ")
}

const PRIMARY_TEMPLATES: &[Template] = &[
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), p.year.as_str()])),
    |p, _| (!p.doi.is_empty()).then(|| format!("\"{}\"", p.doi)),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "site:edu"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "filetype:pdf"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "site:archive.org"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "free full text"])),
    |p, t| quoted(t).and_then(|q| (!p.publication.is_empty()).then(|| join(&[q.as_str(), p.publication.as_str()]))),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "site:gov"])),
    |p, t| (!t.is_empty()).then(|| join(&[p.surname.as_str(), t, p.year.as_str(), "pdf"])),
    |p, t| (t.is_empty() && !p.author.is_empty()).then(|| join(&[p.author.as_str(), p.publication.as_str(), p.year.as_str()])),
    |p, t| (t.is_empty() && !p.surname.is_empty()).then(|| join(&[p.surname.as_str(), p.publication.as_str(), "site:edu"])),
    |p, t| (t.is_empty() && !p.publication.is_empty()).then(|| join(&[p.publication.as_str(), p.year.as_str(), "free full text"])),
];

const SECONDARY_TEMPLATES: &[Template] = &[
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "review"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "review site:edu"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "critique analysis"])),
    |_, t| quoted(t).map(|q| join(&[q.as_str(), "review site:jstor.org"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "discussion scholarly"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "book review"])),
    |_, t| quoted(t).map(|q| join(&[q.as_str(), "commentary site:muse.jhu.edu"])),
    |p, t| quoted(t).map(|q| join(&[q.as_str(), p.surname.as_str(), "criticism"])),
    |p, t| (t.is_empty() && !p.surname.is_empty()).then(|| join(&[p.surname.as_str(), p.publication.as_str(), "review"])),
    |p, t| (t.is_empty() && !p.publication.is_empty()).then(|| join(&[p.publication.as_str(), p.year.as_str(), "review analysis site:edu"])),
];

/// Surname used in queries.
///
/// For "Last, First" the surname is everything before the comma, reduced to
/// its first token; particles are not special-cased, so "van der Berg, A."
/// yields "van". Without a comma the last token is used. Only the first of
/// several authors joined by "and" or ";" is considered.
pub fn extract_surname(author: &str) -> String {
    let first_author = author
        .split(" and ")
        .next()
        .unwrap_or(author)
        .split(';')
        .next()
        .unwrap_or(author)
        .split(" et al")
        .next()
        .unwrap_or(author)
        .trim();

    let candidate = if let Some((before, _)) = first_author.split_once(',') {
        before.split_whitespace().next().unwrap_or("")
    } else {
        first_author.split_whitespace().last().unwrap_or("")
    };

    candidate
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '\'')
        .to_string()
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Whether `text` is worth sending to the search backend.
pub fn validate_query(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || text.chars().count() > MAX_QUERY_LEN {
        return false;
    }
    let meaningful: Vec<String> = tokens(text)
        .into_iter()
        .filter(|t| t.chars().count() > 1 && !is_stopword(t))
        .collect();
    let chars: usize = meaningful.iter().map(|t| t.chars().count()).sum();
    !meaningful.is_empty() && chars >= MIN_MEANINGFUL_CHARS
}

fn clean(text: &str) -> String {
    text.replace(['"', '\u{201c}', '\u{201d}'], "")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Main title when the full title is long and carries a subtitle.
fn core_title(title: &str) -> String {
    let title = clean(title);
    if title.chars().count() > LONG_TITLE {
        if let Some((main, _)) = title.split_once(':') {
            let main = main.trim();
            if validate_query(main) {
                return main.to_string();
            }
        }
    }
    title
}

/// Keeps whole words of `text` up to `budget` characters.
fn shorten_words(text: &str, budget: usize) -> String {
    let mut out = String::new();
    for word in text.split_whitespace() {
        let extra = if out.is_empty() { 0 } else { 1 };
        if out.chars().count() + extra + word.chars().count() > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Cuts a query to the length limit at a word boundary, dropping any quote
/// left unbalanced by the cut.
fn truncate_query(text: &str) -> String {
    if text.chars().count() <= MAX_QUERY_LEN {
        return text.to_string();
    }
    let mut cut = shorten_words(text, MAX_QUERY_LEN);
    if cut.is_empty() {
        cut = text.chars().take(MAX_QUERY_LEN).collect();
    }
    if cut.matches('"').count() % 2 == 1 {
        cut = cut.replace('"', "");
    }
    cut
}

/// Appends `term` to `base`, shortening `base` so the result stays within the limit.
fn append_term(base: &str, term: &str) -> String {
    let budget = MAX_QUERY_LEN.saturating_sub(term.chars().count() + 1);
    let mut head = if base.chars().count() <= budget {
        base.to_string()
    } else {
        shorten_words(base, budget)
    };
    if head.matches('"').count() % 2 == 1 {
        head = head.replace('"', "");
    }
    if head.is_empty() {
        term.to_string()
    } else {
        format!("{} {}", head, term)
    }
}

/// Renders a template, shortening the title first when the result is too long.
fn render(template: Template, parts: &Parts) -> Option<String> {
    let full = template(parts, &parts.title)?;
    let len = full.chars().count();
    let text = if len > MAX_QUERY_LEN && !parts.title.is_empty() {
        let overflow = len - MAX_QUERY_LEN;
        let budget = parts.title.chars().count().saturating_sub(overflow);
        let short = shorten_words(&parts.title, budget);
        if short.is_empty() {
            truncate_query(&full)
        } else {
            truncate_query(&template(parts, &short)?)
        }
    } else {
        full
    };
    let text = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    validate_query(&text).then_some(text)
}

fn is_free_access(text: &str) -> bool {
    let lower = text.to_lowercase();
    FREE_ACCESS_MARKERS.iter().any(|m| lower.contains(m))
}

fn plan(parts: &Parts, templates: &[Template], count: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let base: Vec<String> = templates
        .iter()
        .filter_map(|t| render(*t, parts))
        .filter(|q| seen.insert(q.clone()))
        .collect();
    if base.is_empty() {
        return Vec::new();
    }

    let mut out: Vec<String> = base.iter().take(count).cloned().collect();
    let mut i = 0;
    while out.len() < count {
        let seed = &base[i % base.len()];
        let filler = FILLERS[(i / base.len()) % FILLERS.len()];
        out.push(append_term(seed, filler));
        i += 1;
    }
    out
}

/// Plans `primary_query_count` primary and `secondary_query_count` secondary
/// queries for one reference.
///
/// Missing optional fields only narrow the templates used; the call fails with
/// `InputMissing` when the record has no usable text at all.
pub fn generate_queries(bib: &BibliographicRecord, config: &QueryConfig) -> Result<Vec<Query>> {
    if !bib.has_usable_text() {
        return Err(RefineError::InputMissing(bib.rid));
    }

    let parts = Parts {
        title: core_title(&bib.title),
        surname: extract_surname(&bib.author),
        author: clean(&bib.author),
        year: bib.year.trim().to_string(),
        publication: clean(&bib.publication),
        doi: bib.doi.as_deref().map(clean).unwrap_or_default(),
    };

    let mut primary = plan(&parts, PRIMARY_TEMPLATES, config.primary_query_count);
    let mut secondary = plan(&parts, SECONDARY_TEMPLATES, config.secondary_query_count);

    if primary.len() < config.primary_query_count || secondary.len() < config.secondary_query_count {
        // No template produced a meaningful query; fall back to the bare text.
        let fallback = [parts.title.as_str(), parts.author.as_str(), parts.publication.as_str(), parts.doi.as_str()]
            .iter()
            .map(|f| truncate_query(f))
            .find(|f| validate_query(f))
            .ok_or(RefineError::InputMissing(bib.rid))?;
        while primary.len() < config.primary_query_count {
            primary.push(append_term(&fallback, FILLERS[primary.len() % FILLERS.len()]));
        }
        while secondary.len() < config.secondary_query_count {
            secondary.push(append_term(&fallback, "review"));
        }
    }

    if !primary.is_empty() && !primary.iter().any(|q| is_free_access(q)) {
        let last = primary.len() - 1;
        primary[last] = append_term(&primary[last], "site:edu");
    }

    debug!(
        "Planned {} primary and {} secondary queries for reference {}",
        primary.len(),
        secondary.len(),
        bib.rid
    );

    let number = |(i, text): (usize, String), query_type| Query {
        text,
        query_type,
        rid: bib.rid,
        query_number: i as u32 + 1,
    };
    let mut queries: Vec<Query> = primary
        .into_iter()
        .enumerate()
        .map(|q| number(q, QueryType::Primary))
        .collect();
    queries.extend(
        secondary
            .into_iter()
            .enumerate()
            .map(|q| number(q, QueryType::Secondary)),
    );
    Ok(queries)
}
