use std::borrow::Cow;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use logscope_types::{LogField, LogLevel, LogRecord};

use crate::error::FilterError;

/// Compiled form of a pattern under a given set of flags
#[derive(Clone, Debug)]
struct Matcher {
    /// Unanchored, for "contains" matching
    find: Regex,

    /// Anchored at both ends, for whole-value matching
    whole: Regex,
}

impl Matcher {
    fn compile(field: LogField, pattern: &str, match_case: bool, regex: bool) -> Result<Self, FilterError> {
        let source = if regex {
            Cow::Borrowed(pattern)
        } else {
            Cow::Owned(regex::escape(pattern))
        };

        let build = |source: &str| {
            RegexBuilder::new(source)
                .case_insensitive(!match_case)
                .build()
                .map_err(|source| FilterError::InvalidPattern {
                    field,
                    pattern: pattern.to_string(),
                    source,
                })
        };

        Ok(Self {
            find: build(&source)?,
            whole: build(&format!(r"\A(?:{source})\z"))?,
        })
    }
}

/// Text match rule for a single record field
///
/// A disabled filter matches everything. Absent field values are treated as
/// empty strings.
#[derive(Clone, Debug)]
pub struct PropertyFilter {
    field: LogField,
    enabled: bool,
    match_case: bool,
    regex: bool,
    whole_word: bool,
    inverse: bool,
    pattern: String,
    matcher: Matcher,
}

impl PropertyFilter {
    /// Create a disabled, case-insensitive, literal filter with an empty pattern
    pub fn new(field: LogField) -> Self {
        let matcher = Matcher::compile(field, "", false, false)
            .unwrap_or_else(|_| unreachable!("an escaped empty pattern always compiles"));

        Self {
            field,
            enabled: false,
            match_case: false,
            regex: false,
            whole_word: false,
            inverse: false,
            pattern: String::new(),
            matcher,
        }
    }

    pub fn field(&self) -> LogField {
        self.field
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = enabled;
        self
    }

    /// Whether matching is case-sensitive
    pub fn is_match_case(&self) -> bool {
        self.match_case
    }

    /// Recompiles the current pattern; on failure nothing changes
    pub fn set_match_case(&mut self, match_case: bool) -> Result<&mut Self, FilterError> {
        self.matcher = Matcher::compile(self.field, &self.pattern, match_case, self.regex)?;
        self.match_case = match_case;
        Ok(self)
    }

    /// Whether the pattern is a regular expression rather than literal text
    pub fn is_regex(&self) -> bool {
        self.regex
    }

    /// Recompiles the current pattern; on failure nothing changes
    pub fn set_regex(&mut self, regex: bool) -> Result<&mut Self, FilterError> {
        self.matcher = Matcher::compile(self.field, &self.pattern, self.match_case, regex)?;
        self.regex = regex;
        Ok(self)
    }

    /// Whether the pattern must match the entire value instead of a part of it
    pub fn is_whole_word(&self) -> bool {
        self.whole_word
    }

    pub fn set_whole_word(&mut self, whole_word: bool) -> &mut Self {
        self.whole_word = whole_word;
        self
    }

    /// Whether the match result is negated
    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    pub fn set_inverse(&mut self, inverse: bool) -> &mut Self {
        self.inverse = inverse;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Compiles and stores a new pattern; on failure nothing changes
    pub fn set_pattern(&mut self, pattern: impl Into<String>) -> Result<&mut Self, FilterError> {
        let pattern = pattern.into();
        self.matcher = Matcher::compile(self.field, &pattern, self.match_case, self.regex)?;
        self.pattern = pattern;
        Ok(self)
    }

    /// Check a record against this filter
    pub fn matches(&self, record: &LogRecord) -> bool {
        if !self.enabled {
            return true;
        }

        self.matches_value(&self.field.value(record))
    }

    /// Check a raw field value, ignoring the enabled flag
    pub fn matches_value(&self, value: &str) -> bool {
        let result = if self.whole_word {
            self.matcher.whole.is_match(value)
        } else {
            self.matcher.find.is_match(value)
        };

        result != self.inverse
    }

    /// Persistable snapshot of this filter
    pub fn settings(&self) -> PropertyFilterSettings {
        PropertyFilterSettings {
            field: self.field,
            enabled: self.enabled,
            match_case: self.match_case,
            regex: self.regex,
            whole_word: self.whole_word,
            inverse: self.inverse,
            pattern: self.pattern.clone(),
        }
    }

    /// Apply all settings at once; on failure nothing changes
    pub fn apply(&mut self, settings: &PropertyFilterSettings) -> Result<(), FilterError> {
        let matcher = Matcher::compile(self.field, &settings.pattern, settings.match_case, settings.regex)?;

        self.matcher = matcher;
        self.enabled = settings.enabled;
        self.match_case = settings.match_case;
        self.regex = settings.regex;
        self.whole_word = settings.whole_word;
        self.inverse = settings.inverse;
        self.pattern = settings.pattern.clone();
        Ok(())
    }
}

/// Conjunction of one [`PropertyFilter`] per [`LogField`]
#[derive(Clone, Debug)]
pub struct LogFilter {
    /// Indexed by [`LogField::index`]
    filters: Vec<PropertyFilter>,
}

impl LogFilter {
    /// Create a filter with every property filter disabled
    pub fn new() -> Self {
        Self {
            filters: LogField::ALL.iter().copied().map(PropertyFilter::new).collect(),
        }
    }

    /// Filter passing only records at `level` or above
    pub fn at_least(level: LogLevel) -> Self {
        let pattern = LogLevel::ALL
            .iter()
            .filter(|l| **l >= level)
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("|");

        let mut filter = Self::new();
        filter.get_mut(LogField::Level).apply(&PropertyFilterSettings {
            field: LogField::Level,
            enabled: true,
            match_case: true,
            regex: true,
            whole_word: true,
            inverse: false,
            pattern,
        })
        .unwrap_or_else(|_| unreachable!("level names form a valid alternation"));
        filter
    }

    /// All property filters in field order
    pub fn filters(&self) -> &[PropertyFilter] {
        &self.filters
    }

    /// The property filter for `field`
    pub fn get(&self, field: LogField) -> &PropertyFilter {
        let filter = &self.filters[field.index()];
        debug_assert_eq!(filter.field(), field);
        filter
    }

    pub fn get_mut(&mut self, field: LogField) -> &mut PropertyFilter {
        let filter = &mut self.filters[field.index()];
        debug_assert_eq!(filter.field(), field);
        filter
    }

    /// Check if a record passes every property filter
    pub fn matches(&self, record: &LogRecord) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Check if any property filter is enabled
    pub fn is_active(&self) -> bool {
        self.filters.iter().any(PropertyFilter::is_enabled)
    }

    /// Persistable snapshot of every property filter
    pub fn settings(&self) -> FilterSettings {
        FilterSettings(self.filters.iter().map(PropertyFilter::settings).collect())
    }

    /// Build a filter from persisted settings
    ///
    /// Fields missing from `settings` keep their defaults; a later entry for
    /// the same field overrides an earlier one.
    pub fn from_settings(settings: &FilterSettings) -> Result<Self, FilterError> {
        let mut filter = Self::new();
        for entry in &settings.0 {
            filter.get_mut(entry.field).apply(entry)?;
        }
        Ok(filter)
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted form of a [`PropertyFilter`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFilterSettings {
    pub field: LogField,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub match_case: bool,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub whole_word: bool,
    #[serde(default)]
    pub inverse: bool,
    #[serde(default)]
    pub pattern: String,
}

/// Persisted form of a [`LogFilter`]: an ordered list of per-field settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSettings(pub Vec<PropertyFilterSettings>);
