use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};

/// Default reference table, versioned with the source.
const BUILTIN_TABLE: &str = include_str!("../../data/taxonomy.csv");

pub const INDUSTRY: &str = "Industry";
pub const PROJECT_TYPE: &str = "Project Type";

/// Similarity required to snap model output onto a canonical term (0.0 - 1.0).
const SNAP_THRESHOLD: f64 = 0.92;

/// Categories scoring at least this share of the best one are included in prompt context.
const CATEGORY_SHARE: f64 = 0.8;

/// Terms listed per category in prompt context.
const CONTEXT_TERMS_PER_CATEGORY: usize = 20;

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("failed to read taxonomy table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("taxonomy table contains no usable rows")]
    Empty,
}

/// Controlled vocabulary a field is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    /// Terms in any skill category.
    Skills,
    ProjectTypes,
    Industries,
    /// Names of the skill categories themselves.
    SkillCategories,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyEntry {
    pub canonical: String,
    pub category: String,
    pub aliases: Vec<String>,
}

impl TaxonomyEntry {
    fn in_vocabulary(&self, vocabulary: Vocabulary) -> bool {
        match vocabulary {
            Vocabulary::Industries => self.category == INDUSTRY,
            Vocabulary::ProjectTypes => self.category == PROJECT_TYPE,
            Vocabulary::Skills => self.category != INDUSTRY && self.category != PROJECT_TYPE,
            Vocabulary::SkillCategories => false,
        }
    }
}

/// One canonical term found in a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct TermMatch {
    pub canonical: String,
    pub category: String,
    pub occurrences: usize,
    /// Byte offset of the first occurrence in the lowercased text.
    pub first_offset: usize,
    words: usize,
}

/// Outcome of snapping a model value onto the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum Snap {
    Exact(String),
    Near { canonical: String, score: f64 },
    Unmatched,
}

#[derive(Debug, Clone)]
struct Pattern {
    needle: String,
    entry: usize,
}

/// Immutable, load-once reference vocabulary.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
    /// Longest first, then alphabetical, so specific terms win over substrings.
    patterns: Vec<Pattern>,
    lookup: HashMap<String, Vec<usize>>,
    categories: Vec<String>,
}

impl Taxonomy {
    /// The table embedded at build time.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_table(BUILTIN_TABLE)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let table = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_table(&table)
    }

    /// Build from `category,canonical,aliases` rows (aliases separated by `|`).
    ///
    /// Malformed and duplicate rows are skipped with a warning.
    pub fn from_table(table: &str) -> Result<Self, TaxonomyError> {
        let mut entries: Vec<TaxonomyEntry> = Vec::new();
        let mut seen: HashMap<(String, String), usize> = HashMap::new();

        for (index, line) in table.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let columns = split_row(line);
            if index == 0 && columns.first().is_some_and(|c| c.eq_ignore_ascii_case("category")) {
                continue;
            }
            if columns.len() < 2 || columns.len() > 3 {
                warn!(line = line_no, "Skipping taxonomy row with {} columns", columns.len());
                continue;
            }

            let category = columns[0].trim().to_string();
            let canonical = columns[1].trim().to_string();
            if category.is_empty() || canonical.is_empty() {
                warn!(line = line_no, "Skipping taxonomy row with empty category or term");
                continue;
            }

            let key = (category.to_lowercase(), canonical.to_lowercase());
            if seen.contains_key(&key) {
                warn!(line = line_no, term = %canonical, category = %category, "Skipping duplicate canonical term");
                continue;
            }
            seen.insert(key, entries.len());

            let aliases = columns
                .get(2)
                .map(|raw| {
                    raw.split('|')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            entries.push(TaxonomyEntry {
                canonical,
                category,
                aliases,
            });
        }

        if entries.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        let taxonomy = Self::index(entries);
        info!(
            terms = taxonomy.entries.len(),
            patterns = taxonomy.patterns.len(),
            categories = taxonomy.categories.len(),
            "Taxonomy loaded"
        );
        Ok(taxonomy)
    }

    fn index(entries: Vec<TaxonomyEntry>) -> Self {
        let mut lookup: HashMap<String, Vec<usize>> = HashMap::new();
        let mut patterns = Vec::new();
        let mut categories: Vec<String> = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            if entry.category != INDUSTRY
                && entry.category != PROJECT_TYPE
                && !categories.contains(&entry.category)
            {
                categories.push(entry.category.clone());
            }

            for term in std::iter::once(&entry.canonical).chain(entry.aliases.iter()) {
                let needle = term.to_lowercase();
                let owners = lookup.entry(needle.clone()).or_default();
                if owners.contains(&i) {
                    continue;
                }
                // An alias resolves to one canonical term per category.
                if owners.iter().any(|&o| entries[o].category == entry.category) {
                    warn!(alias = %term, category = %entry.category, "Ignoring alias already claimed in category");
                    continue;
                }
                owners.push(i);
                patterns.push(Pattern { needle, entry: i });
            }
        }

        patterns.sort_by(|a, b| {
            b.needle
                .len()
                .cmp(&a.needle.len())
                .then_with(|| a.needle.cmp(&b.needle))
                .then_with(|| a.entry.cmp(&b.entry))
        });

        Self {
            entries,
            patterns,
            lookup,
            categories,
        }
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn skill_categories(&self) -> &[String] {
        &self.categories
    }

    /// Canonical terms mentioned in `text`, in order of first appearance.
    ///
    /// Each canonical term appears once regardless of how many aliases or
    /// occurrences matched. A span claimed by a longer term is not matched again.
    pub fn enrich(&self, text: &str) -> Vec<TermMatch> {
        let haystack = text.to_lowercase();
        let mut taken = vec![false; haystack.len()];
        let mut found: BTreeMap<usize, TermMatch> = BTreeMap::new();

        for pattern in &self.patterns {
            let mut from = 0;
            while let Some(pos) = haystack[from..].find(&pattern.needle) {
                let start = from + pos;
                let end = start + pattern.needle.len();
                from = start + pattern.needle.len().max(1);

                if !is_word_boundary(&haystack, start, end) || taken[start..end].iter().any(|t| *t) {
                    continue;
                }
                taken[start..end].iter_mut().for_each(|t| *t = true);

                let entry = &self.entries[pattern.entry];
                found
                    .entry(pattern.entry)
                    .and_modify(|m| {
                        m.occurrences += 1;
                        m.first_offset = m.first_offset.min(start);
                    })
                    .or_insert_with(|| TermMatch {
                        canonical: entry.canonical.clone(),
                        category: entry.category.clone(),
                        occurrences: 1,
                        first_offset: start,
                        words: entry.canonical.split_whitespace().count(),
                    });
            }
        }

        let mut matches: Vec<TermMatch> = found.into_values().collect();
        matches.sort_by(|a, b| {
            a.first_offset
                .cmp(&b.first_offset)
                .then_with(|| a.canonical.cmp(&b.canonical))
        });
        matches
    }

    /// Map a model-produced value onto its canonical term, if one is close enough.
    pub fn snap(&self, value: &str, vocabulary: Vocabulary) -> Snap {
        let needle = value.trim().to_lowercase();
        if needle.is_empty() {
            return Snap::Unmatched;
        }

        if vocabulary == Vocabulary::SkillCategories {
            return self.snap_category(&needle);
        }

        if let Some(owners) = self.lookup.get(&needle) {
            if let Some(&i) = owners.iter().find(|&&i| self.entries[i].in_vocabulary(vocabulary)) {
                return Snap::Exact(self.entries[i].canonical.clone());
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.in_vocabulary(vocabulary) {
                continue;
            }
            for term in std::iter::once(&entry.canonical).chain(entry.aliases.iter()) {
                let score = jaro_winkler(&needle, &term.to_lowercase());
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((i, score));
                }
            }
        }

        match best {
            Some((i, score)) if score >= SNAP_THRESHOLD => Snap::Near {
                canonical: self.entries[i].canonical.clone(),
                score,
            },
            _ => Snap::Unmatched,
        }
    }

    fn snap_category(&self, needle: &str) -> Snap {
        let mut best: Option<(&String, f64)> = None;
        for category in &self.categories {
            let lowered = category.to_lowercase();
            if lowered == needle {
                return Snap::Exact(category.clone());
            }
            let score = jaro_winkler(needle, &lowered);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((category, score));
            }
        }
        match best {
            Some((category, score)) if score >= SNAP_THRESHOLD => Snap::Near {
                canonical: category.clone(),
                score,
            },
            _ => Snap::Unmatched,
        }
    }

    /// Relevance of each skill category, weighting multi-word terms higher.
    pub fn category_scores(&self, matches: &[TermMatch]) -> Vec<(String, f64)> {
        let mut scores: Vec<(String, f64)> = Vec::new();
        for m in matches {
            if !self.categories.contains(&m.category) {
                continue;
            }
            let weight = m.occurrences as f64 * (1.0 + 0.1 * m.words as f64);
            match scores.iter_mut().find(|(c, _)| *c == m.category) {
                Some((_, score)) => *score += weight,
                None => scores.push((m.category.clone(), weight)),
            }
        }
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores
    }

    /// Top categories within the share threshold of the best one.
    pub fn top_categories(&self, text: &str, max_categories: usize) -> Vec<String> {
        let scores = self.category_scores(&self.enrich(text));
        let Some(best) = scores.first().map(|(_, s)| *s) else {
            return Vec::new();
        };
        scores
            .into_iter()
            .filter(|(_, score)| *score >= best * CATEGORY_SHARE)
            .take(max_categories)
            .map(|(category, _)| category)
            .collect()
    }

    /// Prompt section steering the model toward canonical terms for the
    /// categories this resume is most about. Empty when nothing matched.
    pub fn prompt_context(&self, text: &str, max_categories: usize) -> String {
        let categories = self.top_categories(text, max_categories);
        if categories.is_empty() {
            return String::new();
        }

        let mut context = String::from("SKILLS TAXONOMY REFERENCE:\n");
        for category in &categories {
            let terms: Vec<&str> = self
                .entries
                .iter()
                .filter(|e| &e.category == category)
                .map(|e| e.canonical.as_str())
                .collect();
            let shown = terms.len().min(CONTEXT_TERMS_PER_CATEGORY);
            context.push_str(&format!("- {}: {}", category, terms[..shown].join(", ")));
            if terms.len() > shown {
                context.push_str(&format!(", and {} more", terms.len() - shown));
            }
            context.push('\n');
        }
        context.push_str("Prefer these canonical names when the resume mentions an equivalent term.\n");
        context
    }
}

fn is_word_boundary(haystack: &str, start: usize, end: usize) -> bool {
    let before = haystack[..start].chars().next_back();
    let after = haystack[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

/// Split one CSV row, honouring double-quoted cells.
fn split_row(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}
