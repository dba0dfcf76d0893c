//! Task-line library for Markdown vaults.
//!
//! Documents stay the only source of truth: the scanner re-derives every task,
//! category, and group from the text on each pass, the reconciler carries
//! identity and sticky flags across passes, and the writer rewrites exactly one
//! line when a task changes.

pub mod core {
    use crate::storage::RelPath;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub Uuid);

    impl TaskId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CategoryId(pub Uuid);

    impl CategoryId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for CategoryId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GroupId(pub Uuid);

    impl GroupId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for GroupId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum Priority {
        Urgent,
        High,
        #[default]
        Medium,
        Low,
    }

    impl Priority {
        pub fn as_str(&self) -> &'static str {
            match self {
                Priority::Urgent => "urgent",
                Priority::High => "high",
                Priority::Medium => "medium",
                Priority::Low => "low",
            }
        }
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RecurrenceKind {
        Daily,
        Weekly,
        Monthly,
    }

    /// Repeat rule read from a `🔁 every N unit` phrase. `interval` is at least 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Recurrence {
        pub kind: RecurrenceKind,
        pub interval: u32,
    }

    /* ------------------------------ Candidates ------------------------------ */

    /// What one line yields before it is placed in the corpus (no ids, no position).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TaskCandidate {
        pub title: String,
        pub priority: Priority,
        pub completed: bool,
        pub completed_at: Option<DateTime<Utc>>,
        pub due_at: Option<DateTime<Utc>>,
        pub recurrence: Option<Recurrence>,
        /// Raw tag text as matched on the line, e.g. `#todo/work/deep-dive`.
        pub tag: String,
        pub group_key: Option<String>,
        pub category_key: Option<String>,
        /// Segments beyond group/category, slash-joined.
        pub sub_tag: Option<String>,
    }

    /* ------------------------------- Entities ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Task {
        pub id: TaskId,
        pub title: String,
        pub priority: Priority,
        pub completed: bool,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub completed_at: Option<DateTime<Utc>>,
        pub sort_order: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub category_id: Option<CategoryId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub recurrence: Option<Recurrence>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub next_due_at: Option<DateTime<Utc>>,
        /// Opaque provenance, `markdown:<path>`.
        pub source: String,
        pub source_tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_file: Option<RelPath>,
        /// 1-based.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_line: Option<usize>,
        /// Set only when the task names a group but no category.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub group_tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub sub_tag: Option<String>,
    }

    impl Task {
        /// `file:line:lower-cased title`. Two scans agree on a task only if all three match.
        pub fn reconciliation_key(&self) -> String {
            format!(
                "{}:{}:{}",
                self.source_file.as_ref().map(RelPath::as_str).unwrap_or(""),
                self.source_line.map(|l| l.to_string()).unwrap_or_default(),
                self.title.to_lowercase()
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CategoryGroup {
        pub id: GroupId,
        pub name: String,
        pub sort_order: usize,
        /// Sticky: lives only in memory, never in the documents.
        pub collapsed: bool,
        /// Sticky, seeded from `Settings::archived_groups` the first time a group is seen.
        pub archived: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_group_key: Option<String>,
    }

    impl CategoryGroup {
        pub fn reconciliation_key(&self) -> String {
            self.source_group_key
                .clone()
                .unwrap_or_else(|| self.name.to_lowercase())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Category {
        pub id: CategoryId,
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub emoji: Option<String>,
        /// Position within the owning group.
        pub sort_order: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub group_id: Option<GroupId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_group_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_category_key: Option<String>,
    }

    impl Category {
        pub fn reconciliation_key(&self) -> String {
            format!(
                "{}/{}",
                self.source_group_key.as_deref().unwrap_or(""),
                self.source_category_key
                    .clone()
                    .unwrap_or_else(|| self.name.to_lowercase())
            )
        }
    }

    /* ------------------------------- Slugs ------------------------------- */

    const DEFAULT_EMOJI: &[(&str, &str)] = &[
        ("school", "🎓"),
        ("programming", "💻"),
        ("personal", "🏠"),
        ("apps", "📱"),
        ("learning", "📚"),
        ("work", "💼"),
        ("tech", "⚙️"),
        ("health", "💪"),
        ("finance", "💰"),
    ];

    pub fn default_emoji(slug: &str) -> Option<&'static str> {
        DEFAULT_EMOJI
            .iter()
            .find(|(key, _)| *key == slug)
            .map(|(_, glyph)| *glyph)
    }

    /// `deep-dive` → `Deep Dive`, `side_project` → `Side Project`.
    pub fn display_name_from_slug(slug: &str) -> String {
        let mut out = String::with_capacity(slug.len());
        let mut prev_word = false;
        for ch in slug.chars() {
            let ch = if ch == '-' || ch == '_' { ' ' } else { ch };
            let is_word = ch.is_ascii_alphanumeric();
            if is_word && !prev_word {
                out.push(ch.to_ascii_uppercase());
            } else {
                out.push(ch);
            }
            prev_word = is_word;
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn slug_display_names() {
            assert_eq!(display_name_from_slug("deep-dive"), "Deep Dive");
            assert_eq!(display_name_from_slug("side_project"), "Side Project");
            assert_eq!(display_name_from_slug("work"), "Work");
            assert_eq!(display_name_from_slug("2fa-setup"), "2fa Setup");
        }

        #[test]
        fn emoji_table_is_keyed_by_slug() {
            assert_eq!(default_emoji("health"), Some("💪"));
            assert_eq!(default_emoji("garden"), None);
        }
    }
}

pub mod tags {
    //! Tag grammar: a configured prefix optionally followed by `/segment` parts,
    //! each segment `[A-Za-z0-9_-]+`.
    //!
    //! The prefix is matched literally with `nom::bytes::complete::tag`, so a
    //! prefix such as `#to.do` or `+todo` needs no escaping.

    use nom::{
        IResult,
        bytes::complete::{tag, take_while1},
        character::complete::char,
        combinator::{all_consuming, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many0,
        sequence::{pair, preceded},
    };

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn is_segment_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    fn segment(i: &str) -> PResult<'_, &str> {
        preceded(char('/'), take_while1(is_segment_char))(i)
    }

    /// `prefix(/segment)*` anchored at the start of the input.
    fn loose_tag<'a, 'p>(prefix: &'p str) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i| recognize(pair(tag(prefix), many0(segment)))(i)
    }

    /// Loose match that refuses to end inside a longer word (`#todoist` is not `#todo`).
    pub(crate) fn tag_token<'a, 'p>(prefix: &'p str) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i| {
            let (rest, matched) = loose_tag(prefix)(i)?;
            if matched.is_empty() || rest.starts_with(is_segment_char) {
                return Err(nom::Err::Error(VerboseError {
                    errors: vec![(rest, VerboseErrorKind::Context("tag-boundary"))],
                }));
            }
            Ok((rest, matched))
        }
    }

    pub fn is_valid_tag(prefix: &str, candidate: &str) -> bool {
        !prefix.is_empty() && all_consuming(loose_tag(prefix))(candidate).is_ok()
    }

    /// First tag occurrence on the line that validates, scanning left to right.
    pub fn extract_tag<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
        if prefix.is_empty() {
            return None;
        }
        let token = tag_token(prefix);
        line.char_indices()
            .filter_map(|(idx, _)| token(&line[idx..]).ok().map(|(_, t)| t))
            .find(|t| is_valid_tag(prefix, t))
    }

    /// Segments after the prefix, lower-cased, empty parts dropped.
    pub fn split_tag_segments(tag: &str, prefix: &str) -> Vec<String> {
        tag.get(prefix.len()..)
            .unwrap_or("")
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect()
    }

}

pub mod parser {
    //! Line parser for tag-annotated checklist items.
    //!
    //! Shape: an optional `- [m]` checkbox (or a plain `- #tag` list item), one tag,
    //! and inline metadata glyphs anywhere on the line. Every sub-extraction reads
    //! the raw line independently, so their order on the line does not matter.
    //! Malformed metadata degrades to "absent"; nothing here returns an error.

    use crate::core::*;
    use crate::tags::{PResult, extract_tag, split_tag_segments, tag_token};
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use nom::{
        bytes::complete::{tag, tag_no_case, take_till1, take_while_m_n, take_while1},
        character::complete::{char, digit1, multispace0, multispace1, one_of, satisfy, space0, space1},
        combinator::{opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, pair, preceded, terminated, tuple},
    };

    /* ----------------------------- Glyph table ----------------------------- */

    /// Glyph → field mapping. Every sentinel the parser and writer know lives here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Glyphs {
        pub done: &'static str,
        pub due: &'static str,
        pub recurrence: &'static str,
        /// Checked in order; the first glyph present decides the priority.
        pub priorities: &'static [(&'static str, Priority)],
        pub recurrence_units: &'static [(&'static str, RecurrenceKind)],
    }

    pub const GLYPHS: Glyphs = Glyphs {
        done: "✅",
        due: "📅",
        recurrence: "🔁",
        priorities: &[
            ("⏫", Priority::Urgent),
            ("🔺", Priority::Urgent),
            ("🔼", Priority::High),
            ("🔽", Priority::Low),
        ],
        recurrence_units: &[
            ("day", RecurrenceKind::Daily),
            ("days", RecurrenceKind::Daily),
            ("daily", RecurrenceKind::Daily),
            ("week", RecurrenceKind::Weekly),
            ("weeks", RecurrenceKind::Weekly),
            ("weekly", RecurrenceKind::Weekly),
            ("month", RecurrenceKind::Monthly),
            ("months", RecurrenceKind::Monthly),
            ("monthly", RecurrenceKind::Monthly),
        ],
    };

    impl Default for Glyphs {
        fn default() -> Self {
            GLYPHS
        }
    }

    impl Glyphs {
        /// Glyph written for a priority; medium has none.
        pub fn priority_glyph(&self, priority: Priority) -> Option<&'static str> {
            if priority == Priority::Medium {
                return None;
            }
            self.priorities
                .iter()
                .find(|(_, p)| *p == priority)
                .map(|(g, _)| *g)
        }

        pub fn priority_of(&self, line: &str) -> Priority {
            self.priorities
                .iter()
                .find(|(g, _)| line.contains(g))
                .map(|(_, p)| *p)
                .unwrap_or_default()
        }

        fn recurrence_unit(&self, unit: &str) -> Option<RecurrenceKind> {
            let unit = unit.to_lowercase();
            self.recurrence_units
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, kind)| *kind)
        }
    }

    /* ------------------------- Public entry points ------------------------- */

    pub fn parse_line(line: &str, tag_prefix: &str) -> Option<TaskCandidate> {
        parse_line_with(line, tag_prefix, &GLYPHS)
    }

    pub fn parse_line_with(line: &str, tag_prefix: &str, glyphs: &Glyphs) -> Option<TaskCandidate> {
        let trimmed = line.trim();
        if trimmed.is_empty() || tag_prefix.is_empty() || !trimmed.contains(tag_prefix) {
            return None;
        }

        let mark = checkbox(trimmed).ok().map(|(_, mark)| mark);
        if mark.is_none() && plain_tag_item(trimmed).is_err() {
            return None;
        }

        let tag = extract_tag(trimmed, tag_prefix)?;
        let title = clean_title(trimmed, tag_prefix, glyphs);
        if title.is_empty() {
            return None;
        }

        let segments = split_tag_segments(tag, tag_prefix);
        let completed = mark.is_some_and(is_done_mark);
        let completed_at = if completed {
            find_first(trimmed, stamp(glyphs.done)).and_then(parse_iso_date)
        } else {
            None
        };

        Some(TaskCandidate {
            title,
            priority: glyphs.priority_of(trimmed),
            completed,
            completed_at,
            due_at: due_date(trimmed, glyphs),
            recurrence: recurrence(trimmed, glyphs),
            tag: tag.to_string(),
            group_key: segments.first().cloned(),
            category_key: segments.get(1).cloned(),
            sub_tag: (segments.len() >= 3).then(|| segments[2..].join("/")),
        })
    }

    /// Display title: the line with markers, tags, and metadata removed, links
    /// unwrapped, and whitespace collapsed. Metadata goes first so no gaps survive.
    pub fn clean_title(trimmed: &str, tag_prefix: &str, glyphs: &Glyphs) -> String {
        let body = checkbox(trimmed).map(|(rest, _)| rest).unwrap_or(trimmed);
        let body = list_marker(body).map(|(rest, _)| rest).unwrap_or(body);

        let text = strip_all(body, tag_token(tag_prefix));
        let text = strip_all(&text, stamp(glyphs.done));
        let text = strip_all(&text, stamp(glyphs.due));
        let text = strip_all(&text, recurrence_phrase(glyphs));
        let text = strip_all(&text, priority_glyph(glyphs));
        let text = replace_all(&text, wiki_link);
        let text = replace_all(&text, markdown_link);

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn is_done_mark(mark: char) -> bool {
        matches!(mark, 'x' | 'X' | '-')
    }

    /* ----------------------------- Line shapes ----------------------------- */

    /// `- [m] ` at the start of the line; yields the mark.
    pub(crate) fn checkbox(i: &str) -> PResult<'_, char> {
        let (i, _) = space0(i)?;
        let (i, _) = one_of("-*+")(i)?;
        let (i, _) = space0(i)?;
        let (i, mark) = delimited(char('['), satisfy(|c| c != '\n' && c != '\r'), char(']'))(i)?;
        let (i, _) = space0(i)?;
        Ok((i, mark))
    }

    /// Leading `- `, `* ` or `+ ` list marker (indentation included).
    pub(crate) fn list_marker(i: &str) -> PResult<'_, &str> {
        recognize(tuple((space0, one_of("-*+"), space1)))(i)
    }

    fn plain_tag_item(i: &str) -> PResult<'_, char> {
        preceded(pair(one_of("-*+"), space1), char('#'))(i)
    }

    /* ------------------------------ Metadata ------------------------------ */

    fn is_word_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    fn digits<'a>(n: usize) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(n, n, |c: char| c.is_ascii_digit())
    }

    fn iso_date_shape(i: &str) -> PResult<'_, &str> {
        recognize(tuple((digits(4), char('-'), digits(2), char('-'), digits(2))))(i)
    }

    /// `glyph YYYY-MM-DD`; yields the date text.
    pub(crate) fn stamp<'a>(glyph: &'static str) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i| preceded(pair(tag(glyph), multispace0), iso_date_shape)(i)
    }

    /// `🔁 [every] [N] unit`; yields the optional count and the unit word.
    fn recurrence_phrase<'a>(
        glyphs: &Glyphs,
    ) -> impl Fn(&'a str) -> PResult<'a, (Option<&'a str>, &'a str)> {
        let glyph = glyphs.recurrence;
        move |i| {
            let (i, _) = tag(glyph)(i)?;
            let (i, _) = multispace0(i)?;
            let (i, _) = opt(terminated(tag_no_case("every"), multispace1))(i)?;
            let (i, count) = opt(terminated(digit1, multispace1))(i)?;
            let (i, unit) = take_while1(is_word_char)(i)?;
            Ok((i, (count, unit)))
        }
    }

    fn priority_glyph<'a>(glyphs: &Glyphs) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        let table = glyphs.priorities;
        move |i: &'a str| {
            for (glyph, _) in table {
                if let Some(rest) = i.strip_prefix(glyph) {
                    return Ok((rest, &i[..glyph.len()]));
                }
            }
            Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("priority-glyph"))],
            }))
        }
    }

    fn wiki_link(i: &str) -> PResult<'_, &str> {
        delimited(tag("[["), take_till1(|c: char| c == ']'), tag("]]"))(i)
    }

    fn markdown_link(i: &str) -> PResult<'_, &str> {
        terminated(
            delimited(char('['), take_till1(|c: char| c == ']'), char(']')),
            delimited(char('('), take_till1(|c: char| c == ')'), char(')')),
        )(i)
    }

    fn parse_iso_date(text: &str) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(Utc.from_utc_datetime(&midnight))
    }

    /// First word-bounded ISO date after the due glyph.
    fn due_date(line: &str, glyphs: &Glyphs) -> Option<DateTime<Utc>> {
        let start = line.find(glyphs.due)?;
        let tail = &line[start..];
        let mut prev: Option<char> = None;
        for (idx, ch) in tail.char_indices() {
            if !prev.is_some_and(is_word_char) {
                if let Ok((rest, date)) = iso_date_shape(&tail[idx..]) {
                    if !rest.starts_with(is_word_char) {
                        return parse_iso_date(date);
                    }
                }
            }
            prev = Some(ch);
        }
        None
    }

    fn recurrence(line: &str, glyphs: &Glyphs) -> Option<Recurrence> {
        let (count, unit) = find_first(line, recurrence_phrase(glyphs))?;
        let kind = glyphs.recurrence_unit(unit)?;
        let interval = count
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1);
        Some(Recurrence { kind, interval })
    }

    /* ------------------------------- Utils ------------------------------- */

    /// Output of the leftmost position where `parser` matches.
    pub(crate) fn find_first<'a, O>(
        input: &'a str,
        parser: impl Fn(&'a str) -> PResult<'a, O>,
    ) -> Option<O> {
        input
            .char_indices()
            .find_map(|(idx, _)| parser(&input[idx..]).ok().map(|(_, out)| out))
    }

    /// Drops every non-overlapping match of `parser`, scanning left to right.
    pub(crate) fn strip_all<'a, O>(
        input: &'a str,
        parser: impl Fn(&'a str) -> PResult<'a, O>,
    ) -> String {
        replace_all(input, |i| parser(i).map(|(rest, _)| (rest, "")))
    }

    /// Replaces every non-overlapping match of `parser` with the text it yields.
    pub(crate) fn replace_all<'a>(
        input: &'a str,
        parser: impl Fn(&'a str) -> PResult<'a, &'a str>,
    ) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(ch) = rest.chars().next() {
            match parser(rest) {
                Ok((after, replacement)) if after.len() < rest.len() => {
                    out.push_str(replacement);
                    rest = after;
                }
                _ => {
                    out.push(ch);
                    rest = &rest[ch.len_utf8()..];
                }
            }
        }
        out
    }

}

pub mod storage {
    //! Document Store capability.
    //!
    //! Documents are addressed by `RelPath`, a POSIX-like path from the vault root.
    //! The scanner reads through this trait and the writer writes through it, so
    //! neither knows whether the vault lives on disk or in memory.

    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        cell::RefCell,
        collections::BTreeSet,
        fmt, fs, io,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};

    /* ---------------------------- Value Objects ---------------------------- */

    /// A POSIX-like relative path from the vault root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RelPath(pub String);

    impl RelPath {
        pub fn new(path: impl Into<String>) -> Self {
            let raw: String = path.into();
            let normalized = raw.replace('\\', "/");
            Self(normalized.trim_start_matches('/').to_string())
        }
        pub fn as_str(&self) -> &str {
            &self.0
        }
        pub fn join(&self, segment: &str) -> Self {
            if self.0.is_empty() {
                Self(segment.to_string())
            } else {
                Self(format!("{}/{}", self.0, segment))
            }
        }
        pub fn parent(&self) -> Option<Self> {
            let (parent, _) = self.0.rsplit_once('/')?;
            Some(Self(parent.to_string()))
        }
        pub fn file_name(&self) -> Option<&str> {
            if self.0.is_empty() {
                None
            } else {
                self.0.rsplit('/').next()
            }
        }
        pub fn extension(&self) -> Option<&str> {
            let name = self.file_name()?;
            let (stem, ext) = name.rsplit_once('.')?;
            (!stem.is_empty()).then_some(ext)
        }
        /// Appends `.ext` unless the path already ends with it.
        pub fn with_default_extension(&self, ext: &str) -> Self {
            if self.extension() == Some(ext) {
                self.clone()
            } else {
                Self(format!("{}.{}", self.0, ext))
            }
        }
    }

    impl fmt::Display for RelPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Timestamps a store can report without reading the document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DocumentMeta {
        pub created_at: Option<DateTime<Utc>>,
        pub modified_at: Option<DateTime<Utc>>,
    }

    /// Which files count as documents and which directories are never entered.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScanPolicy {
        #[serde(default)]
        pub extensions: Vec<String>,
        #[serde(default)]
        pub ignore_dirs: Vec<String>,
        #[serde(default)]
        pub follow_symlinks: bool,
    }

    impl Default for ScanPolicy {
        fn default() -> Self {
            Self {
                extensions: vec!["md".into()],
                ignore_dirs: vec![
                    ".git".into(),
                    ".obsidian".into(),
                    ".trash".into(),
                    "node_modules".into(),
                    "target".into(),
                ],
                follow_symlinks: false,
            }
        }
    }

    impl ScanPolicy {
        pub fn is_document(&self, path: &Path) -> bool {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
        }

        pub fn is_ignored_dir(&self, name: &str) -> bool {
            self.ignore_dirs.iter().any(|d| d == name)
        }

        /// `path` with the first document extension appended unless it already has one.
        pub fn document_path(&self, path: &RelPath) -> RelPath {
            match path.extension() {
                Some(ext) if self.extensions.iter().any(|e| e == ext) => path.clone(),
                _ => path.with_default_extension(self.extensions.first().map_or("md", String::as_str)),
            }
        }
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("document {0} not found")]
        NotFound(RelPath),
        #[error("i/o error on {path}: {source}")]
        Io {
            path: RelPath,
            #[source]
            source: io::Error,
        },
    }

    impl StoreError {
        fn io(path: &RelPath, source: io::Error) -> Self {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(path.clone())
            } else {
                StoreError::Io {
                    path: path.clone(),
                    source,
                }
            }
        }
    }

    /* -------------------------------- Trait -------------------------------- */

    pub trait DocumentStore {
        /// Every document in a stable order.
        fn list_documents(&self) -> Result<Vec<RelPath>, StoreError>;

        fn exists(&self, doc: &RelPath) -> bool;

        fn read_text(&self, doc: &RelPath) -> Result<String, StoreError>;

        /// Replaces an existing document's text; `NotFound` if it is gone.
        fn write_text(&self, doc: &RelPath, text: &str) -> Result<(), StoreError>;

        fn metadata(&self, doc: &RelPath) -> Result<DocumentMeta, StoreError>;

        /// Returns the document at `path`, creating it (and its parent folders) empty if
        /// needed. A path without a document extension gets one appended first.
        fn ensure_document(&self, path: &RelPath) -> Result<RelPath, StoreError>;
    }

    /* ------------------------------ Filesystem ------------------------------ */

    /// Vault rooted at a directory on disk.
    ///
    /// Documents are read strictly as UTF-8. A file that is not valid UTF-8 fails
    /// `read_text` with `StoreError::Io` on every scan, so it shows up as an
    /// unreadable document rather than being rewritten with replacement characters.
    #[derive(Debug, Clone)]
    pub struct FsStore {
        root: PathBuf,
        policy: ScanPolicy,
    }

    impl FsStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self::with_policy(root, ScanPolicy::default())
        }

        pub fn with_policy(root: impl Into<PathBuf>, policy: ScanPolicy) -> Self {
            Self {
                root: root.into(),
                policy,
            }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn policy(&self) -> &ScanPolicy {
            &self.policy
        }

        pub fn abs_path(&self, rel: &RelPath) -> PathBuf {
            if rel.0.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&rel.0)
            }
        }

        /// Inverse of `abs_path` for paths under the root.
        pub fn rel_path(&self, abs: &Path) -> Option<RelPath> {
            let rel = abs.strip_prefix(&self.root).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            (!parts.is_empty()).then(|| RelPath(parts.join("/")))
        }

        fn visit_dir(&self, dir: &Path, out: &mut Vec<RelPath>) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_symlink() && !self.policy.follow_symlinks {
                    continue;
                }
                let is_dir = if file_type.is_symlink() {
                    path.is_dir()
                } else {
                    file_type.is_dir()
                };
                if is_dir {
                    let name = entry.file_name();
                    if self.policy.is_ignored_dir(&name.to_string_lossy()) {
                        continue;
                    }
                    if let Err(err) = self.visit_dir(&path, out) {
                        warn!(dir = %path.display(), %err, "skipping unreadable directory");
                    }
                } else if self.policy.is_document(&path) {
                    if let Some(rel) = self.rel_path(&path) {
                        out.push(rel);
                    }
                }
            }
            Ok(())
        }
    }

    fn system_time_utc(t: io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
        t.ok().map(DateTime::<Utc>::from)
    }

    impl DocumentStore for FsStore {
        fn list_documents(&self) -> Result<Vec<RelPath>, StoreError> {
            let mut out = Vec::new();
            self.visit_dir(&self.root, &mut out)
                .map_err(|source| StoreError::io(&RelPath::new(""), source))?;
            out.sort();
            debug!(root = %self.root.display(), count = out.len(), "listed documents");
            Ok(out)
        }

        fn exists(&self, doc: &RelPath) -> bool {
            self.abs_path(doc).is_file()
        }

        fn read_text(&self, doc: &RelPath) -> Result<String, StoreError> {
            fs::read_to_string(self.abs_path(doc)).map_err(|e| StoreError::io(doc, e))
        }

        fn write_text(&self, doc: &RelPath, text: &str) -> Result<(), StoreError> {
            if !self.exists(doc) {
                return Err(StoreError::NotFound(doc.clone()));
            }
            fs::write(self.abs_path(doc), text).map_err(|e| StoreError::io(doc, e))
        }

        fn metadata(&self, doc: &RelPath) -> Result<DocumentMeta, StoreError> {
            let meta = fs::metadata(self.abs_path(doc)).map_err(|e| StoreError::io(doc, e))?;
            Ok(DocumentMeta {
                created_at: system_time_utc(meta.created()),
                modified_at: system_time_utc(meta.modified()),
            })
        }

        fn ensure_document(&self, path: &RelPath) -> Result<RelPath, StoreError> {
            let path = self.policy.document_path(path);
            let abs = self.abs_path(&path);
            if abs.is_file() {
                return Ok(path);
            }
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(&path, e))?;
            }
            fs::write(&abs, "").map_err(|e| StoreError::io(&path, e))?;
            debug!(path = %path, "created document");
            Ok(path)
        }
    }

    /* ------------------------------- Memory ------------------------------- */

    #[derive(Debug, Clone, Default)]
    struct MemoryDocument {
        text: String,
        meta: DocumentMeta,
    }

    /// In-memory vault; documents list in insertion order. Reads of paths marked
    /// with `fail_reads` return an I/O error.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        docs: RefCell<IndexMap<RelPath, MemoryDocument>>,
        failing: RefCell<BTreeSet<RelPath>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_document(self, path: &str, text: &str) -> Self {
            self.insert(path, text);
            self
        }

        pub fn insert(&self, path: &str, text: &str) {
            let mut docs = self.docs.borrow_mut();
            let doc = docs.entry(RelPath::new(path)).or_default();
            doc.text = text.to_string();
        }

        pub fn remove(&self, path: &str) {
            self.docs.borrow_mut().shift_remove(&RelPath::new(path));
        }

        pub fn set_metadata(&self, path: &str, meta: DocumentMeta) {
            if let Some(doc) = self.docs.borrow_mut().get_mut(&RelPath::new(path)) {
                doc.meta = meta;
            }
        }

        pub fn fail_reads(&self, path: &str) {
            self.failing.borrow_mut().insert(RelPath::new(path));
        }

        pub fn text(&self, path: &str) -> Option<String> {
            self.docs
                .borrow()
                .get(&RelPath::new(path))
                .map(|d| d.text.clone())
        }
    }

    impl DocumentStore for MemoryStore {
        fn list_documents(&self) -> Result<Vec<RelPath>, StoreError> {
            Ok(self.docs.borrow().keys().cloned().collect())
        }

        fn exists(&self, doc: &RelPath) -> bool {
            self.docs.borrow().contains_key(doc)
        }

        fn read_text(&self, doc: &RelPath) -> Result<String, StoreError> {
            if self.failing.borrow().contains(doc) {
                return Err(StoreError::Io {
                    path: doc.clone(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "read refused"),
                });
            }
            self.docs
                .borrow()
                .get(doc)
                .map(|d| d.text.clone())
                .ok_or_else(|| StoreError::NotFound(doc.clone()))
        }

        fn write_text(&self, doc: &RelPath, text: &str) -> Result<(), StoreError> {
            let mut docs = self.docs.borrow_mut();
            let entry = docs
                .get_mut(doc)
                .ok_or_else(|| StoreError::NotFound(doc.clone()))?;
            entry.text = text.to_string();
            entry.meta.modified_at = Some(Utc::now());
            Ok(())
        }

        fn metadata(&self, doc: &RelPath) -> Result<DocumentMeta, StoreError> {
            self.docs
                .borrow()
                .get(doc)
                .map(|d| d.meta)
                .ok_or_else(|| StoreError::NotFound(doc.clone()))
        }

        fn ensure_document(&self, path: &RelPath) -> Result<RelPath, StoreError> {
            let path = ScanPolicy::default().document_path(path);
            let mut docs = self.docs.borrow_mut();
            if !docs.contains_key(&path) {
                let now = Utc::now();
                docs.insert(
                    path.clone(),
                    MemoryDocument {
                        text: String::new(),
                        meta: DocumentMeta {
                            created_at: Some(now),
                            modified_at: Some(now),
                        },
                    },
                );
            }
            Ok(path)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn relpath_helpers() {
            let p = RelPath::new("/Projects\\work/plan.md");
            assert_eq!(p.as_str(), "Projects/work/plan.md");
            assert_eq!(p.file_name(), Some("plan.md"));
            assert_eq!(p.extension(), Some("md"));
            assert_eq!(p.parent(), Some(RelPath::new("Projects/work")));
            assert_eq!(RelPath::new("Inbox").with_default_extension("md").as_str(), "Inbox.md");
            assert_eq!(RelPath::new("a.md").with_default_extension("md").as_str(), "a.md");
            assert_eq!(RelPath::new(".md").extension(), None);
            assert_eq!(RelPath::new("notes").join("a.md").as_str(), "notes/a.md");
        }

        #[test]
        fn fs_store_lists_documents_sorted_and_skips_ignored_dirs() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("b/nested")).unwrap();
            fs::create_dir_all(root.join(".obsidian")).unwrap();
            fs::write(root.join("b/nested/z.md"), "z").unwrap();
            fs::write(root.join("a.md"), "a").unwrap();
            fs::write(root.join("b/readme.txt"), "txt").unwrap();
            fs::write(root.join(".obsidian/cache.md"), "ignored").unwrap();

            let store = FsStore::new(root);
            let docs = store.list_documents().expect("list");
            assert_eq!(docs, vec![RelPath::new("a.md"), RelPath::new("b/nested/z.md")]);
        }

        #[test]
        fn fs_store_read_write_and_not_found() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FsStore::new(tmp.path());
            let doc = RelPath::new("inbox/Todo.md");

            assert!(matches!(store.read_text(&doc), Err(StoreError::NotFound(_))));
            assert!(matches!(
                store.write_text(&doc, "x"),
                Err(StoreError::NotFound(_))
            ));

            store.ensure_document(&doc).expect("ensure");
            assert!(store.exists(&doc));
            assert_eq!(store.read_text(&doc).unwrap(), "");

            store.write_text(&doc, "- [ ] #todo x\n").unwrap();
            assert_eq!(store.read_text(&doc).unwrap(), "- [ ] #todo x\n");
            assert!(store.metadata(&doc).unwrap().modified_at.is_some());
        }

        #[test]
        fn ensure_document_appends_the_document_extension() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FsStore::new(tmp.path());
            let doc = store.ensure_document(&RelPath::new("Inbox/Capture")).expect("ensure");
            assert_eq!(doc, RelPath::new("Inbox/Capture.md"));
            assert!(tmp.path().join("Inbox/Capture.md").is_file());
            assert!(!tmp.path().join("Inbox/Capture").exists());

            let memory = MemoryStore::new();
            let doc = memory.ensure_document(&RelPath::new("Capture")).expect("ensure");
            assert_eq!(doc, RelPath::new("Capture.md"));
            assert_eq!(memory.text("Capture.md").as_deref(), Some(""));
            assert_eq!(
                memory.ensure_document(&RelPath::new("Capture.md")).unwrap(),
                RelPath::new("Capture.md")
            );
        }

        #[test]
        fn fs_store_refuses_non_utf8_documents() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("latin1.md"), [0x2d, 0x20, 0xe9, 0xff, 0x0a]).unwrap();
            let store = FsStore::new(tmp.path());
            assert!(matches!(
                store.read_text(&RelPath::new("latin1.md")),
                Err(StoreError::Io { .. })
            ));
        }

        #[test]
        fn memory_store_preserves_insertion_order_and_fails_on_demand() {
            let store = MemoryStore::new()
                .with_document("z.md", "z")
                .with_document("a.md", "a");
            assert_eq!(
                store.list_documents().unwrap(),
                vec![RelPath::new("z.md"), RelPath::new("a.md")]
            );
            store.fail_reads("a.md");
            assert!(matches!(
                store.read_text(&RelPath::new("a.md")),
                Err(StoreError::Io { .. })
            ));
            assert_eq!(store.read_text(&RelPath::new("z.md")).unwrap(), "z");
        }
    }
}

pub mod config {
    //! User settings, stored as JSON at `<vault>/.mdtodo/settings.json`.

    use crate::storage::RelPath;
    use crate::watch::DebouncePolicy;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    pub const DEFAULT_TAG_PREFIX: &str = "#todo";
    pub const DEFAULT_INBOX_FILE: &str = "Todo Inbox.md";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        /// Root of the tag grammar.
        pub tag_prefix: String,
        /// Quick-add target, relative to the vault root.
        pub inbox_file: String,
        /// Group keys that start out archived and collapsed.
        pub archived_groups: Vec<String>,
        /// Presentation filter; the core never applies it.
        pub show_completed: bool,
        /// Quiet period before a burst of file events triggers one re-scan.
        pub debounce_ms: u64,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
                inbox_file: DEFAULT_INBOX_FILE.to_string(),
                archived_groups: vec![],
                show_completed: true,
                debounce_ms: 120,
            }
        }
    }

    impl Settings {
        pub fn path_in(vault_root: &Path) -> PathBuf {
            vault_root.join(".mdtodo").join("settings.json")
        }

        /// Defaults when the file is absent; an error when it is unreadable or malformed.
        pub fn load(vault_root: &Path) -> Result<Self> {
            let path = Self::path_in(vault_root);
            if !path.exists() {
                return Ok(Self::default());
            }
            let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json(&text).with_context(|| format!("parsing {:?}", path))
        }

        pub fn from_json(text: &str) -> Result<Self> {
            let parsed: Settings = serde_json::from_str(text)?;
            Ok(parsed.normalized())
        }

        pub fn save(&self, vault_root: &Path) -> Result<()> {
            let path = Self::path_in(vault_root);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            let json = serde_json::to_string_pretty(self)?;
            fs::write(&path, json).with_context(|| format!("writing {:?}", path))
        }

        pub fn normalized(mut self) -> Self {
            self.tag_prefix = self.tag_prefix.trim().to_string();
            if self.tag_prefix.is_empty() {
                self.tag_prefix = DEFAULT_TAG_PREFIX.to_string();
            }
            self.inbox_file = self.inbox_file.trim().to_string();
            if self.inbox_file.is_empty() {
                self.inbox_file = DEFAULT_INBOX_FILE.to_string();
            }
            self.archived_groups = self
                .archived_groups
                .iter()
                .map(|g| g.trim().to_lowercase())
                .filter(|g| !g.is_empty())
                .collect();
            self
        }

        pub fn is_archived_group(&self, group_key: &str) -> bool {
            self.archived_groups.iter().any(|g| g == group_key)
        }

        /// Inbox document, always with a `.md` extension.
        pub fn inbox_path(&self) -> RelPath {
            RelPath::new(self.inbox_file.as_str()).with_default_extension("md")
        }

        pub fn debounce(&self) -> DebouncePolicy {
            DebouncePolicy {
                window: Duration::from_millis(self.debounce_ms),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_file_yields_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let s = Settings::load(tmp.path()).expect("load");
            assert_eq!(s, Settings::default());
            assert_eq!(s.inbox_path().as_str(), "Todo Inbox.md");
        }

        #[test]
        fn partial_json_fills_defaults_and_normalizes() {
            let s = Settings::from_json(
                r#"{ "tagPrefix": "  ", "inboxFile": "Inbox/Capture", "archivedGroups": [" Old ", ""] }"#,
            )
            .expect("parse");
            assert_eq!(s.tag_prefix, "#todo");
            assert_eq!(s.inbox_path().as_str(), "Inbox/Capture.md");
            assert_eq!(s.archived_groups, vec!["old".to_string()]);
            assert!(s.show_completed);
            assert!(s.is_archived_group("old"));
        }

        #[test]
        fn save_then_load_round_trips() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let s = Settings {
                tag_prefix: "#task".into(),
                debounce_ms: 250,
                ..Settings::default()
            };
            s.save(tmp.path()).expect("save");
            let loaded = Settings::load(tmp.path()).expect("load");
            assert_eq!(loaded, s);
            assert_eq!(loaded.debounce().window, Duration::from_millis(250));
        }

        #[test]
        fn malformed_file_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = Settings::path_in(tmp.path());
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "{ not json").unwrap();
            let err = Settings::load(tmp.path()).unwrap_err();
            assert!(format!("{err:#}").contains("parsing"));
        }
    }
}

/* ---------------------------------------------------------------------------
 * Scan → reconcile
 * ------------------------------------------------------------------------- */

pub mod scanner {
    use crate::config::Settings;
    use crate::core::*;
    use crate::parser::parse_line;
    use crate::storage::{DocumentMeta, DocumentStore, RelPath, StoreError};
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ScanResult {
        pub tasks: Vec<Task>,
        pub categories: Vec<Category>,
        pub category_groups: Vec<CategoryGroup>,
    }

    /// A document that could not be read; it contributed nothing to the scan.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ScanFailure {
        pub document: RelPath,
        pub message: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ScanReport {
        pub result: ScanResult,
        pub failures: Vec<ScanFailure>,
        pub documents_scanned: usize,
    }

    impl ScanReport {
        pub fn is_partial(&self) -> bool {
            !self.failures.is_empty()
        }

        /// One line naming every unreadable document, or `None` for a clean scan.
        pub fn failure_summary(&self) -> Option<String> {
            if self.failures.is_empty() {
                return None;
            }
            let noun = if self.failures.len() == 1 {
                "document"
            } else {
                "documents"
            };
            let detail: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{} ({})", f.document, f.message))
                .collect();
            Some(format!(
                "{} {} could not be read: {}",
                self.failures.len(),
                noun,
                detail.join("; ")
            ))
        }
    }

    /// Scan every document. Only a listing failure is an error; unreadable
    /// documents are skipped and reported in `ScanReport::failures`.
    pub fn scan<S: DocumentStore + ?Sized>(store: &S, settings: &Settings) -> Result<ScanReport, StoreError> {
        scan_at(store, settings, Utc::now())
    }

    pub fn scan_at<S: DocumentStore + ?Sized>(
        store: &S,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<ScanReport, StoreError> {
        let prefix = settings.tag_prefix.as_str();
        let documents = store.list_documents()?;
        info!(documents = documents.len(), prefix, "scan started");

        let mut acc = Accumulator::default();
        let mut failures = Vec::new();

        for doc in &documents {
            let text = match store.read_text(doc) {
                Ok(text) => text,
                Err(err) => {
                    warn!(document = %doc, %err, "skipping unreadable document");
                    failures.push(ScanFailure {
                        document: doc.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            let mut meta: Option<DocumentMeta> = None;
            for (idx, line) in text.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() || !trimmed.contains(prefix) {
                    continue;
                }
                let Some(candidate) = parse_line(trimmed, prefix) else {
                    continue;
                };
                let meta = *meta.get_or_insert_with(|| store.metadata(doc).unwrap_or_default());
                acc.push(candidate, doc, idx + 1, meta, now, settings);
            }
        }

        let result = acc.finish();
        info!(
            tasks = result.tasks.len(),
            categories = result.categories.len(),
            groups = result.category_groups.len(),
            failures = failures.len(),
            "scan finished"
        );
        Ok(ScanReport {
            result,
            failures,
            documents_scanned: documents.len(),
        })
    }

    #[derive(Default)]
    struct Accumulator {
        groups: IndexMap<String, CategoryGroup>,
        categories: IndexMap<(String, String), Category>,
        tasks: Vec<Task>,
    }

    impl Accumulator {
        fn group_for(&mut self, key: &str, settings: &Settings) -> GroupId {
            let next = self.groups.len();
            self.groups
                .entry(key.to_string())
                .or_insert_with(|| {
                    let archived = settings.is_archived_group(key);
                    debug!(group = key, archived, "new group");
                    CategoryGroup {
                        id: GroupId::new(),
                        name: display_name_from_slug(key),
                        sort_order: next,
                        collapsed: archived,
                        archived,
                        source_group_key: Some(key.to_string()),
                    }
                })
                .id
        }

        fn category_for(&mut self, group_key: &str, category_key: &str, group_id: GroupId) -> CategoryId {
            let composite = (group_key.to_string(), category_key.to_string());
            if let Some(existing) = self.categories.get(&composite) {
                return existing.id;
            }
            let within_group = self
                .categories
                .keys()
                .filter(|(g, _)| g == group_key)
                .count();
            let category = Category {
                id: CategoryId::new(),
                name: display_name_from_slug(category_key),
                emoji: default_emoji(category_key).map(str::to_string),
                sort_order: within_group,
                group_id: Some(group_id),
                source_group_key: Some(group_key.to_string()),
                source_category_key: Some(category_key.to_string()),
            };
            let id = category.id;
            self.categories.insert(composite, category);
            id
        }

        fn push(
            &mut self,
            candidate: TaskCandidate,
            doc: &RelPath,
            line: usize,
            meta: DocumentMeta,
            now: DateTime<Utc>,
            settings: &Settings,
        ) {
            let mut category_id = None;
            if let Some(group_key) = candidate.group_key.as_deref() {
                let group_id = self.group_for(group_key, settings);
                if let Some(category_key) = candidate.category_key.as_deref() {
                    category_id = Some(self.category_for(group_key, category_key, group_id));
                }
            }

            let created_at = meta.created_at.unwrap_or(now);
            let updated_at = meta.modified_at.unwrap_or(created_at);
            let group_tag = if category_id.is_none() {
                candidate.group_key.clone()
            } else {
                None
            };

            self.tasks.push(Task {
                id: TaskId::new(),
                title: candidate.title,
                priority: candidate.priority,
                completed: candidate.completed,
                created_at,
                updated_at,
                completed_at: candidate.completed_at,
                sort_order: self.tasks.len(),
                category_id,
                recurrence: candidate.recurrence,
                next_due_at: candidate.due_at,
                source: format!("markdown:{}", doc),
                source_tag: candidate.tag,
                source_file: Some(doc.clone()),
                source_line: Some(line),
                group_tag,
                sub_tag: candidate.sub_tag,
            });
        }

        fn finish(self) -> ScanResult {
            let mut category_groups: Vec<CategoryGroup> = self.groups.into_values().collect();
            category_groups.sort_by_key(|g| g.sort_order);

            // Stable: categories sharing a within-group position keep first-seen order.
            let mut categories: Vec<Category> = self.categories.into_values().collect();
            categories.sort_by_key(|c| c.sort_order);

            ScanResult {
                tasks: self.tasks,
                categories,
                category_groups,
            }
        }
    }

}

pub mod reconcile {
    //! Carries identity and sticky flags from the previous snapshot into a fresh scan.
    //!
    //! Apply in order: groups, then categories (their group ids are re-resolved
    //! against the merged groups), then tasks. Keys are matched first-seen-wins on
    //! the previous side and each previous id is claimed at most once, so
    //! duplicate keys never share an id.

    use crate::core::*;
    use crate::scanner::ScanResult;
    use std::collections::{HashMap, HashSet};
    use tracing::debug;

    fn index_by_key<T, K: Fn(&T) -> String>(items: &[T], key: K) -> HashMap<String, &T> {
        let mut map = HashMap::new();
        for item in items {
            map.entry(key(item)).or_insert(item);
        }
        map
    }

    pub fn reconcile_groups(previous: &[CategoryGroup], scanned: Vec<CategoryGroup>) -> Vec<CategoryGroup> {
        let mut prev = index_by_key(previous, CategoryGroup::reconciliation_key);
        scanned
            .into_iter()
            .enumerate()
            .map(|(idx, mut group)| {
                if let Some(old) = prev.remove(&group.reconciliation_key()) {
                    group.id = old.id;
                    group.collapsed = old.collapsed;
                    group.archived = old.archived;
                }
                group.sort_order = idx;
                group
            })
            .collect()
    }

    pub fn reconcile_categories(
        previous: &[Category],
        merged_groups: &[CategoryGroup],
        scanned: Vec<Category>,
    ) -> Vec<Category> {
        let group_ids: HashMap<&str, GroupId> = merged_groups
            .iter()
            .filter_map(|g| g.source_group_key.as_deref().map(|k| (k, g.id)))
            .collect();
        let mut prev = index_by_key(previous, Category::reconciliation_key);
        scanned
            .into_iter()
            .enumerate()
            .map(|(idx, mut category)| {
                if let Some(old) = prev.remove(&category.reconciliation_key()) {
                    category.id = old.id;
                }
                if let Some(key) = category.source_group_key.as_deref() {
                    category.group_id = group_ids.get(key).copied();
                }
                category.sort_order = idx;
                category
            })
            .collect()
    }

    pub fn reconcile_tasks(previous: &[Task], scanned: Vec<Task>) -> Vec<Task> {
        let mut prev = index_by_key(previous, Task::reconciliation_key);
        scanned
            .into_iter()
            .enumerate()
            .map(|(idx, mut task)| {
                if let Some(old) = prev.remove(&task.reconciliation_key()) {
                    task.id = old.id;
                }
                task.sort_order = idx;
                task
            })
            .collect()
    }

    /// All three merges. Task category ids are rewritten to the merged category
    /// ids so they keep pointing into the merged collection.
    pub fn reconcile(previous: &ScanResult, scanned: ScanResult) -> ScanResult {
        let ScanResult {
            tasks,
            categories,
            category_groups,
        } = scanned;

        let category_groups = reconcile_groups(&previous.category_groups, category_groups);

        let scanned_ids: Vec<CategoryId> = categories.iter().map(|c| c.id).collect();
        let categories = reconcile_categories(&previous.categories, &category_groups, categories);
        let remap: HashMap<CategoryId, CategoryId> = scanned_ids
            .into_iter()
            .zip(categories.iter().map(|c| c.id))
            .collect();

        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                task.category_id = task.category_id.and_then(|id| remap.get(&id).copied());
                task
            })
            .collect();
        let tasks = reconcile_tasks(&previous.tasks, tasks);

        let known: HashSet<TaskId> = previous.tasks.iter().map(|t| t.id).collect();
        let kept = tasks.iter().filter(|t| known.contains(&t.id)).count();
        debug!(tasks = tasks.len(), kept, "reconciled");

        ScanResult {
            tasks,
            categories,
            category_groups,
        }
    }

}

/* ---------------------------------------------------------------------------
 * Writing back
 * ------------------------------------------------------------------------- */

pub mod writer {
    //! Line-scoped edits to the documents tasks came from.
    //!
    //! Every operation reads the whole document fresh, edits one line (or appends
    //! one), and writes the whole document back. Bytes outside the edited line,
    //! line endings included, are left as they were. The writer never touches the
    //! in-memory collections; callers re-scan after an applied write.

    use crate::config::Settings;
    use crate::core::*;
    use crate::parser::{GLYPHS, checkbox, find_first, is_done_mark, stamp};
    use crate::storage::{DocumentStore, RelPath, StoreError};
    use crate::tags::{PResult, extract_tag};
    use chrono::{Local, NaiveDate};
    use nom::{
        character::complete::{char, multispace0, one_of, space0, space1},
        combinator::recognize,
        sequence::{delimited, pair, tuple},
    };
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info};

    /* ------------------------------ Outcomes ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WriteOutcome {
        Applied,
        NotApplied(NotApplied),
    }

    impl WriteOutcome {
        pub fn is_applied(&self) -> bool {
            matches!(self, WriteOutcome::Applied)
        }
    }

    /// Why a write was a no-op. Not a fault: the document is untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum NotApplied {
        #[error("task has no source file or line")]
        NoSource,
        #[error("source document no longer exists")]
        FileMissing,
        #[error("source line is out of range")]
        LineOutOfRange,
        #[error("title is blank")]
        BlankTitle,
        #[error("no such task")]
        UnknownTask,
    }

    /// Payload for a quick-add.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct NewTask {
        pub title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub category_id: Option<CategoryId>,
        #[serde(default)]
        pub priority: Priority,
    }

    /* ----------------------------- Line buffer ----------------------------- */

    /// A document split into lines, each remembering its own terminator.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct LineBuffer {
        lines: Vec<(String, &'static str)>,
    }

    impl LineBuffer {
        pub fn parse(text: &str) -> Self {
            let lines = text
                .split_inclusive('\n')
                .map(|piece| {
                    if let Some(body) = piece.strip_suffix("\r\n") {
                        (body.to_string(), "\r\n")
                    } else if let Some(body) = piece.strip_suffix('\n') {
                        (body.to_string(), "\n")
                    } else {
                        (piece.to_string(), "")
                    }
                })
                .collect();
            Self { lines }
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }

        /// 1-based.
        pub fn line(&self, number: usize) -> Option<&str> {
            let idx = number.checked_sub(1)?;
            self.lines.get(idx).map(|(body, _)| body.as_str())
        }

        pub fn set_line(&mut self, number: usize, body: String) -> bool {
            match number.checked_sub(1).and_then(|idx| self.lines.get_mut(idx)) {
                Some(slot) => {
                    slot.0 = body;
                    true
                }
                None => false,
            }
        }

        /// Splices the line out. Removing an unterminated last line also drops the
        /// terminator of the line before it.
        pub fn remove_line(&mut self, number: usize) -> bool {
            let Some(idx) = number.checked_sub(1).filter(|idx| *idx < self.lines.len()) else {
                return false;
            };
            let (_, ending) = self.lines.remove(idx);
            if ending.is_empty() {
                if let Some(last) = self.lines.last_mut() {
                    last.1 = "";
                }
            }
            true
        }

        pub fn push_line(&mut self, body: String) {
            let eol = self.eol();
            if let Some(last) = self.lines.last_mut() {
                if last.1.is_empty() {
                    last.1 = eol;
                }
            }
            self.lines.push((body, eol));
        }

        /// The document's line ending: the first one seen, `\n` if there is none.
        pub fn eol(&self) -> &'static str {
            self.lines
                .iter()
                .map(|(_, ending)| *ending)
                .find(|ending| !ending.is_empty())
                .unwrap_or("\n")
        }

        pub fn render(&self) -> String {
            let mut out = String::new();
            for (body, ending) in &self.lines {
                out.push_str(body);
                out.push_str(ending);
            }
            out
        }
    }

    /* ----------------------------- Line edits ----------------------------- */

    /// `- [m]` with a mark the writer understands; yields the prefix before `[`.
    fn known_checkbox(i: &str) -> PResult<'_, &str> {
        let (i, lead) = recognize(tuple((space0, one_of("-*+"), space0)))(i)?;
        let (i, _) = delimited(char('['), one_of(" xX-"), char(']'))(i)?;
        Ok((i, lead))
    }

    fn bullet(i: &str) -> PResult<'_, &str> {
        recognize(tuple((space0, one_of("-*+"), space1)))(i)
    }

    fn completion_stamp(i: &str) -> PResult<'_, &str> {
        recognize(stamp(GLYPHS.done))(i)
    }

    fn spaced_completion_stamp(i: &str) -> PResult<'_, &str> {
        recognize(pair(multispace0, stamp(GLYPHS.done)))(i)
    }

    fn mark(checked: bool) -> char {
        if checked { 'x' } else { ' ' }
    }

    /// Sets the checkbox to `[x]`/`[ ]`, adding one after the bullet (or a whole
    /// `- [ ]` prefix) when the line has none.
    pub fn normalize_checkbox(line: &str, checked: bool) -> String {
        let m = mark(checked);
        if let Ok((rest, lead)) = known_checkbox(line) {
            format!("{lead}[{m}]{rest}")
        } else if let Ok((rest, lead)) = bullet(line) {
            format!("{lead}[{m}] {rest}")
        } else {
            format!("- [{m}] {line}")
        }
    }

    pub fn remove_completion_date(line: &str) -> String {
        crate::parser::strip_all(line, spaced_completion_stamp)
    }

    /// Replaces any completion stamp with one for `date`, at the end of the line.
    pub fn add_completion_date(line: &str, date: NaiveDate) -> String {
        format!(
            "{} {} {}",
            remove_completion_date(line),
            GLYPHS.done,
            date.format("%Y-%m-%d")
        )
    }

    /// `prefix/group/category`, `prefix/group`, or the bare prefix.
    pub fn tag_for_category(category_id: Option<CategoryId>, categories: &[Category], prefix: &str) -> String {
        let Some(category) = category_id.and_then(|id| categories.iter().find(|c| c.id == id)) else {
            return prefix.to_string();
        };
        match (
            category.source_group_key.as_deref(),
            category.source_category_key.as_deref(),
        ) {
            (Some(group), Some(cat)) => format!("{prefix}/{group}/{cat}"),
            (Some(group), None) => format!("{prefix}/{group}"),
            _ => prefix.to_string(),
        }
    }

    /* ------------------------------- Writer ------------------------------- */

    pub struct TaskWriter<'s, S: DocumentStore + ?Sized> {
        store: &'s S,
        tag_prefix: String,
        inbox: RelPath,
        today: Option<NaiveDate>,
    }

    impl<'s, S: DocumentStore + ?Sized> TaskWriter<'s, S> {
        pub fn new(store: &'s S, settings: &Settings) -> Self {
            Self {
                store,
                tag_prefix: settings.tag_prefix.clone(),
                inbox: settings.inbox_path(),
                today: None,
            }
        }

        /// Pins the date written into completion stamps.
        pub fn with_today(mut self, today: NaiveDate) -> Self {
            self.today = Some(today);
            self
        }

        fn today(&self) -> NaiveDate {
            self.today.unwrap_or_else(|| Local::now().date_naive())
        }

        pub fn toggle_complete(&self, task: &Task, completed: bool) -> Result<WriteOutcome, StoreError> {
            let today = self.today();
            self.update_document(task, "toggle", |buf, number| {
                let Some(line) = buf.line(number) else {
                    return false;
                };
                let next = normalize_checkbox(line, completed);
                let next = if completed {
                    add_completion_date(&next, today)
                } else {
                    remove_completion_date(&next)
                };
                buf.set_line(number, next)
            })
        }

        /// Rebuilds the line as `- [m] <tag> <title>`; only the checkbox state and,
        /// for a checked line, its completion stamp survive.
        pub fn edit_task_title(&self, task: &Task, title: &str) -> Result<WriteOutcome, StoreError> {
            let title = title.trim();
            if title.is_empty() {
                return Ok(self.not_applied(task, NotApplied::BlankTitle));
            }
            let prefix = self.tag_prefix.as_str();
            self.update_document(task, "edit", |buf, number| {
                let Some(line) = buf.line(number) else {
                    return false;
                };
                let tag = extract_tag(line, prefix).unwrap_or(prefix);
                let checked = checkbox(line).is_ok_and(|(_, m)| is_done_mark(m));
                let mut next = format!("- [{}] {} {}", mark(checked), tag, title);
                if checked {
                    if let Some(stamp) = find_first(line, completion_stamp) {
                        next.push(' ');
                        next.push_str(stamp);
                    }
                }
                buf.set_line(number, next)
            })
        }

        pub fn delete_task(&self, task: &Task) -> Result<WriteOutcome, StoreError> {
            self.update_document(task, "delete", |buf, number| buf.remove_line(number))
        }

        /// Appends `- [ ] <tag> <title>[ glyph]` to the inbox document, creating it
        /// (and its folders) if needed.
        pub fn add_task(&self, new: &NewTask, categories: &[Category]) -> Result<WriteOutcome, StoreError> {
            let title = new.title.trim();
            if title.is_empty() {
                debug!("add skipped: blank title");
                return Ok(WriteOutcome::NotApplied(NotApplied::BlankTitle));
            }
            let tag = tag_for_category(new.category_id, categories, &self.tag_prefix);
            let mut line = format!("- [ ] {tag} {title}");
            if let Some(glyph) = GLYPHS.priority_glyph(new.priority) {
                line.push(' ');
                line.push_str(glyph);
            }

            let doc = self.store.ensure_document(&self.inbox)?;
            let mut buf = LineBuffer::parse(&self.store.read_text(&doc)?);
            buf.push_line(line);
            self.store.write_text(&doc, &buf.render())?;
            info!(document = %doc, line = buf.len(), "task added");
            Ok(WriteOutcome::Applied)
        }

        fn not_applied(&self, task: &Task, reason: NotApplied) -> WriteOutcome {
            debug!(task = %task.id, %reason, "write not applied");
            WriteOutcome::NotApplied(reason)
        }

        fn update_document(
            &self,
            task: &Task,
            op: &str,
            mutate: impl FnOnce(&mut LineBuffer, usize) -> bool,
        ) -> Result<WriteOutcome, StoreError> {
            let (Some(doc), Some(number)) = (task.source_file.as_ref(), task.source_line) else {
                return Ok(self.not_applied(task, NotApplied::NoSource));
            };
            if !self.store.exists(doc) {
                return Ok(self.not_applied(task, NotApplied::FileMissing));
            }
            let text = match self.store.read_text(doc) {
                Ok(text) => text,
                Err(StoreError::NotFound(_)) => return Ok(self.not_applied(task, NotApplied::FileMissing)),
                Err(err) => return Err(err),
            };

            let mut buf = LineBuffer::parse(&text);
            if number == 0 || number > buf.len() || !mutate(&mut buf, number) {
                return Ok(self.not_applied(task, NotApplied::LineOutOfRange));
            }
            match self.store.write_text(doc, &buf.render()) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => return Ok(self.not_applied(task, NotApplied::FileMissing)),
                Err(err) => return Err(err),
            }
            info!(op, document = %doc, line = number, "task line written");
            Ok(WriteOutcome::Applied)
        }
    }

}

/* ---------------------------------------------------------------------------
 * Coordinator, views, change feed
 * ------------------------------------------------------------------------- */

pub mod state {
    //! The one owner of the reconciled collections.

    use crate::config::Settings;
    use crate::core::*;
    use crate::reconcile::reconcile;
    use crate::scanner::{ScanReport, ScanResult, scan};
    use crate::storage::{DocumentStore, RelPath, StoreError};
    use crate::writer::{NewTask, NotApplied, TaskWriter, WriteOutcome};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::{collections::HashSet, fmt};
    use tracing::{info, warn};

    /// Read-only copy of the state handed to presentation code.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Snapshot {
        pub tasks: Vec<Task>,
        pub categories: Vec<Category>,
        pub category_groups: Vec<CategoryGroup>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub last_scan_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error_message: Option<String>,
    }

    /// One validated change to a task, expressed against the current collections.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Mutation {
        ToggleComplete { task_id: TaskId, completed: bool },
        EditTitle { task_id: TaskId, title: String },
        Delete { task_id: TaskId },
        Add(NewTask),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RescanSummary {
        pub tasks: usize,
        pub categories: usize,
        pub groups: usize,
        /// Tasks whose id carried over from the previous pass.
        pub kept: usize,
        pub failures: usize,
    }

    impl fmt::Display for RescanSummary {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{} tasks, {} categories, {} groups",
                self.tasks, self.categories, self.groups
            )?;
            if self.failures > 0 {
                write!(f, " ({} unreadable documents)", self.failures)?;
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct TodoState {
        current: Snapshot,
    }

    impl TodoState {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn snapshot(&self) -> Snapshot {
            self.current.clone()
        }

        pub fn view(&self) -> &Snapshot {
            &self.current
        }

        pub fn tasks(&self) -> &[Task] {
            &self.current.tasks
        }

        pub fn categories(&self) -> &[Category] {
            &self.current.categories
        }

        pub fn category_groups(&self) -> &[CategoryGroup] {
            &self.current.category_groups
        }

        pub fn error_message(&self) -> Option<&str> {
            self.current.error_message.as_deref()
        }

        pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
            self.current.last_scan_at
        }

        pub fn task(&self, id: TaskId) -> Option<&Task> {
            self.current.tasks.iter().find(|t| t.id == id)
        }

        pub fn find_task_at(&self, file: &RelPath, line: usize) -> Option<&Task> {
            self.current
                .tasks
                .iter()
                .find(|t| t.source_file.as_ref() == Some(file) && t.source_line == Some(line))
        }

        /// Scan, reconcile, replace. A listing failure leaves the collections as
        /// they were and records the message.
        pub fn rescan<S: DocumentStore + ?Sized>(
            &mut self,
            store: &S,
            settings: &Settings,
        ) -> Result<RescanSummary, StoreError> {
            match scan(store, settings) {
                Ok(report) => Ok(self.apply_scan(report, Utc::now())),
                Err(err) => {
                    warn!(%err, "scan failed; keeping previous snapshot");
                    self.current.error_message = Some(err.to_string());
                    Err(err)
                }
            }
        }

        /// Reconciles a finished scan into the state. Partial scans still apply.
        pub fn apply_scan(&mut self, report: ScanReport, at: DateTime<Utc>) -> RescanSummary {
            let error_message = report.failure_summary();
            let previous = ScanResult {
                tasks: std::mem::take(&mut self.current.tasks),
                categories: std::mem::take(&mut self.current.categories),
                category_groups: std::mem::take(&mut self.current.category_groups),
            };
            let merged = reconcile(&previous, report.result);
            let known: HashSet<TaskId> = previous.tasks.iter().map(|t| t.id).collect();
            let kept = merged.tasks.iter().filter(|t| known.contains(&t.id)).count();

            let summary = RescanSummary {
                tasks: merged.tasks.len(),
                categories: merged.categories.len(),
                groups: merged.category_groups.len(),
                kept,
                failures: report.failures.len(),
            };
            self.current = Snapshot {
                tasks: merged.tasks,
                categories: merged.categories,
                category_groups: merged.category_groups,
                last_scan_at: Some(at),
                error_message,
            };
            info!(%summary, kept, "state replaced");
            summary
        }

        pub fn apply<S: DocumentStore + ?Sized>(
            &mut self,
            store: &S,
            settings: &Settings,
            mutation: Mutation,
        ) -> Result<WriteOutcome, StoreError> {
            let writer = TaskWriter::new(store, settings);
            self.apply_with(&writer, store, settings, mutation)
        }

        /// Runs the mutation through `writer`, then re-scans if it applied. A failed
        /// re-scan is logged; the write itself still counts as applied.
        pub fn apply_with<S: DocumentStore + ?Sized>(
            &mut self,
            writer: &TaskWriter<'_, S>,
            store: &S,
            settings: &Settings,
            mutation: Mutation,
        ) -> Result<WriteOutcome, StoreError> {
            let outcome = match &mutation {
                Mutation::ToggleComplete { task_id, completed } => match self.task(*task_id) {
                    Some(task) => writer.toggle_complete(task, *completed)?,
                    None => WriteOutcome::NotApplied(NotApplied::UnknownTask),
                },
                Mutation::EditTitle { task_id, title } => match self.task(*task_id) {
                    Some(task) => writer.edit_task_title(task, title)?,
                    None => WriteOutcome::NotApplied(NotApplied::UnknownTask),
                },
                Mutation::Delete { task_id } => match self.task(*task_id) {
                    Some(task) => writer.delete_task(task)?,
                    None => WriteOutcome::NotApplied(NotApplied::UnknownTask),
                },
                Mutation::Add(new) => writer.add_task(new, &self.current.categories)?,
            };

            if outcome.is_applied() {
                if let Err(err) = self.rescan(store, settings) {
                    warn!(%err, "re-scan after write failed");
                }
            }
            Ok(outcome)
        }

        /// Flips the sticky collapsed flag; false if the group is unknown.
        pub fn toggle_group_collapsed(&mut self, id: GroupId) -> bool {
            match self.current.category_groups.iter_mut().find(|g| g.id == id) {
                Some(group) => {
                    group.collapsed = !group.collapsed;
                    true
                }
                None => false,
            }
        }

        pub fn set_group_archived(&mut self, id: GroupId, archived: bool) -> bool {
            match self.current.category_groups.iter_mut().find(|g| g.id == id) {
                Some(group) => {
                    group.archived = archived;
                    true
                }
                None => false,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::MemoryStore;

        const DOC: &str = "Daily.md";

        fn loaded(text: &str) -> (MemoryStore, TodoState) {
            let store = MemoryStore::new().with_document(DOC, text);
            let mut state = TodoState::new();
            state.rescan(&store, &Settings::default()).expect("rescan");
            (store, state)
        }

        #[test]
        fn repeated_rescans_keep_ids_and_fields() {
            let (store, mut state) = loaded("- [ ] #todo/home Buy milk 📅 2025-05-01\n- [x] #todo Call mom\n");
            let before = state.snapshot();
            let summary = state.rescan(&store, &Settings::default()).unwrap();
            let after = state.snapshot();

            assert_eq!(summary.kept, 2);
            let strip = |s: &Snapshot| {
                s.tasks
                    .iter()
                    .map(|t| (t.id, t.title.clone(), t.completed, t.next_due_at, t.sort_order))
                    .collect::<Vec<_>>()
            };
            assert_eq!(strip(&before), strip(&after));
            assert_eq!(before.category_groups, after.category_groups);
        }

        #[test]
        fn kept_counts_only_carried_ids() {
            let (store, mut state) = loaded("- [ ] #todo Stay\n- [ ] #todo Rename me\n");
            store.insert(DOC, "- [ ] #todo Stay\n- [ ] #todo Renamed\n");
            let summary = state.rescan(&store, &Settings::default()).unwrap();
            assert_eq!(summary.tasks, 2);
            assert_eq!(summary.kept, 1);
        }

        #[test]
        fn toggling_keeps_identity_through_the_rescan() {
            let (store, mut state) = loaded("# List\n\n- [ ] #todo Buy milk\n");
            let id = state.tasks()[0].id;
            assert_eq!(state.tasks()[0].source_line, Some(3));

            let outcome = state
                .apply(
                    &store,
                    &Settings::default(),
                    Mutation::ToggleComplete {
                        task_id: id,
                        completed: true,
                    },
                )
                .unwrap();
            assert!(outcome.is_applied());
            assert_eq!(state.tasks()[0].id, id);
            assert!(state.tasks()[0].completed);
            assert!(state.tasks()[0].completed_at.is_some());
        }

        #[test]
        fn retitling_gives_a_new_identity() {
            let (store, mut state) = loaded("- [ ] #todo Old\n");
            let id = state.tasks()[0].id;
            state
                .apply(
                    &store,
                    &Settings::default(),
                    Mutation::EditTitle {
                        task_id: id,
                        title: "New".into(),
                    },
                )
                .unwrap();
            assert_eq!(state.tasks()[0].title, "New");
            assert_ne!(state.tasks()[0].id, id);
        }

        #[test]
        fn unknown_tasks_are_not_applied() {
            let (store, mut state) = loaded("- [ ] #todo A\n");
            let outcome = state
                .apply(&store, &Settings::default(), Mutation::Delete { task_id: TaskId::new() })
                .unwrap();
            assert_eq!(outcome, WriteOutcome::NotApplied(NotApplied::UnknownTask));
            assert_eq!(store.text(DOC).unwrap(), "- [ ] #todo A\n");
        }

        #[test]
        fn add_then_delete_round_trip() {
            let (store, mut state) = loaded("- [ ] #todo/work/admin File taxes\n");
            let category_id = state.categories()[0].id;
            state
                .apply(
                    &store,
                    &Settings::default(),
                    Mutation::Add(NewTask {
                        title: "Renew passport".into(),
                        category_id: Some(category_id),
                        priority: Priority::Low,
                    }),
                )
                .unwrap();
            assert_eq!(state.tasks().len(), 2);
            let added = state.tasks()[1].clone();
            assert_eq!(added.source_file, Some(RelPath::new("Todo Inbox.md")));
            assert_eq!(added.category_id, Some(category_id));
            assert_eq!(added.priority, Priority::Low);
            assert_eq!(state.find_task_at(&RelPath::new("Todo Inbox.md"), 1), Some(&added));

            state
                .apply(&store, &Settings::default(), Mutation::Delete { task_id: added.id })
                .unwrap();
            assert_eq!(state.tasks().len(), 1);
            assert_eq!(store.text("Todo Inbox.md").unwrap(), "");
        }

        #[test]
        fn sticky_group_flags_survive_rescans() {
            let (store, mut state) = loaded("- [ ] #todo/garden Weed\n");
            let gid = state.category_groups()[0].id;
            assert!(state.toggle_group_collapsed(gid));
            assert!(state.set_group_archived(gid, true));
            assert!(!state.toggle_group_collapsed(GroupId::new()));

            state.rescan(&store, &Settings::default()).unwrap();
            let group = &state.category_groups()[0];
            assert_eq!(group.id, gid);
            assert!(group.collapsed && group.archived);
        }

        #[test]
        fn partial_failures_apply_and_set_the_message() {
            let store = MemoryStore::new();
            for i in 0..50 {
                store.insert(&format!("n{i:02}.md"), &format!("- [ ] #todo T{i}\n"));
            }
            store.fail_reads("n03.md");
            let mut state = TodoState::new();
            let summary = state.rescan(&store, &Settings::default()).unwrap();
            assert_eq!(summary.tasks, 49);
            assert_eq!(summary.failures, 1);
            let message = state.error_message().expect("message");
            assert!(message.contains("n03.md"));
            assert!(state.last_scan_at().is_some());
        }

        struct Unlistable;

        impl DocumentStore for Unlistable {
            fn list_documents(&self) -> Result<Vec<RelPath>, StoreError> {
                Err(StoreError::Io {
                    path: RelPath::new(""),
                    source: std::io::Error::other("vault offline"),
                })
            }
            fn exists(&self, _: &RelPath) -> bool {
                false
            }
            fn read_text(&self, doc: &RelPath) -> Result<String, StoreError> {
                Err(StoreError::NotFound(doc.clone()))
            }
            fn write_text(&self, doc: &RelPath, _: &str) -> Result<(), StoreError> {
                Err(StoreError::NotFound(doc.clone()))
            }
            fn metadata(&self, doc: &RelPath) -> Result<crate::storage::DocumentMeta, StoreError> {
                Err(StoreError::NotFound(doc.clone()))
            }
            fn ensure_document(&self, path: &RelPath) -> Result<RelPath, StoreError> {
                Err(StoreError::NotFound(path.clone()))
            }
        }

        #[test]
        fn listing_failure_keeps_the_last_good_snapshot() {
            let (_store, mut state) = loaded("- [ ] #todo Keep me\n");
            let before = state.snapshot();
            assert!(state.rescan(&Unlistable, &Settings::default()).is_err());
            assert_eq!(state.tasks(), before.tasks.as_slice());
            assert!(state.error_message().unwrap().contains("vault offline"));
        }
    }
}

pub mod projectors {
    //! Read-only views over a snapshot for presentation code.

    use crate::core::*;
    use crate::state::Snapshot;
    use serde::Serialize;

    pub const UNCATEGORIZED: &str = "Uncategorized";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum TaskFilter {
        #[default]
        All,
        Group(GroupId),
        Category(CategoryId),
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GroupView<'s> {
        pub group: &'s CategoryGroup,
        pub categories: Vec<&'s Category>,
    }

    /// Tasks in sortOrder that pass `filter`; completed ones only if asked for.
    pub fn visible_tasks<'s>(snapshot: &'s Snapshot, filter: TaskFilter, show_completed: bool) -> Vec<&'s Task> {
        let mut tasks: Vec<&Task> = match filter {
            TaskFilter::All => snapshot.tasks.iter().collect(),
            TaskFilter::Category(id) => snapshot
                .tasks
                .iter()
                .filter(|t| t.category_id == Some(id))
                .collect(),
            TaskFilter::Group(id) => {
                let group_key = snapshot
                    .category_groups
                    .iter()
                    .find(|g| g.id == id)
                    .and_then(|g| g.source_group_key.as_deref());
                let in_group: Vec<CategoryId> = snapshot
                    .categories
                    .iter()
                    .filter(|c| c.group_id == Some(id))
                    .map(|c| c.id)
                    .collect();
                snapshot
                    .tasks
                    .iter()
                    .filter(|t| {
                        t.category_id.is_some_and(|c| in_group.contains(&c))
                            || (group_key.is_some() && t.group_tag.as_deref() == group_key)
                    })
                    .collect()
            }
        };
        if !show_completed {
            tasks.retain(|t| !t.completed);
        }
        tasks.sort_by_key(|t| t.sort_order);
        tasks
    }

    pub fn categories_by_group(snapshot: &Snapshot) -> Vec<GroupView<'_>> {
        let mut groups: Vec<&CategoryGroup> = snapshot.category_groups.iter().collect();
        groups.sort_by_key(|g| g.sort_order);
        groups
            .into_iter()
            .map(|group| {
                let mut categories: Vec<&Category> = snapshot
                    .categories
                    .iter()
                    .filter(|c| c.group_id == Some(group.id))
                    .collect();
                categories.sort_by_key(|c| c.sort_order);
                GroupView { group, categories }
            })
            .collect()
    }

    /// Categories with no group, or whose group is not in the snapshot.
    pub fn ungrouped_categories(snapshot: &Snapshot) -> Vec<&Category> {
        let mut out: Vec<&Category> = snapshot
            .categories
            .iter()
            .filter(|c| {
                c.group_id
                    .is_none_or(|gid| !snapshot.category_groups.iter().any(|g| g.id == gid))
            })
            .collect();
        out.sort_by_key(|c| c.sort_order);
        out
    }

    pub fn category_label(snapshot: &Snapshot, id: Option<CategoryId>) -> &str {
        id.and_then(|id| snapshot.categories.iter().find(|c| c.id == id))
            .map(|c| c.name.as_str())
            .unwrap_or(UNCATEGORIZED)
    }

    pub fn group_by_key<'s>(snapshot: &'s Snapshot, key: &str) -> Option<&'s CategoryGroup> {
        let key = key.to_lowercase();
        snapshot
            .category_groups
            .iter()
            .find(|g| g.reconciliation_key() == key)
    }

    /// Looks up `group/category` by slug.
    pub fn category_by_key<'s>(snapshot: &'s Snapshot, key: &str) -> Option<&'s Category> {
        let key = key.to_lowercase();
        snapshot
            .categories
            .iter()
            .find(|c| c.reconciliation_key() == key)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::Settings;
        use crate::state::TodoState;
        use crate::storage::MemoryStore;

        fn snapshot() -> Snapshot {
            let store = MemoryStore::new().with_document(
                "a.md",
                "- [ ] #todo/work/admin File taxes\n- [x] #todo/work/admin Pay rent\n- [ ] #todo/work Standup\n- [ ] #todo/home/garden Weed\n- [ ] #todo Loose end\n",
            );
            let mut state = TodoState::new();
            state.rescan(&store, &Settings::default()).expect("rescan");
            state.snapshot()
        }

        fn titles(tasks: &[&Task]) -> Vec<String> {
            tasks.iter().map(|t| t.title.clone()).collect()
        }

        #[test]
        fn filters_by_group_including_group_tagged_tasks() {
            let snap = snapshot();
            let work = group_by_key(&snap, "Work").expect("work");
            let tasks = visible_tasks(&snap, TaskFilter::Group(work.id), true);
            assert_eq!(titles(&tasks), vec!["File taxes", "Pay rent", "Standup"]);

            let hidden = visible_tasks(&snap, TaskFilter::Group(work.id), false);
            assert_eq!(titles(&hidden), vec!["File taxes", "Standup"]);
        }

        #[test]
        fn filters_by_category_and_labels() {
            let snap = snapshot();
            let garden = category_by_key(&snap, "home/garden").expect("garden");
            let tasks = visible_tasks(&snap, TaskFilter::Category(garden.id), true);
            assert_eq!(titles(&tasks), vec!["Weed"]);
            assert_eq!(category_label(&snap, Some(garden.id)), "Garden");
            assert_eq!(category_label(&snap, None), UNCATEGORIZED);
            assert_eq!(visible_tasks(&snap, TaskFilter::All, true).len(), 5);
        }

        #[test]
        fn groups_list_their_categories() {
            let mut snap = snapshot();
            let views = categories_by_group(&snap);
            let shape: Vec<(&str, Vec<&str>)> = views
                .iter()
                .map(|v| {
                    (
                        v.group.name.as_str(),
                        v.categories.iter().map(|c| c.name.as_str()).collect(),
                    )
                })
                .collect();
            assert_eq!(
                shape,
                vec![("Work", vec!["Admin"]), ("Home", vec!["Garden"])]
            );
            assert!(ungrouped_categories(&snap).is_empty());

            snap.category_groups.retain(|g| g.name != "Home");
            let orphans = ungrouped_categories(&snap);
            assert_eq!(orphans.len(), 1);
            assert_eq!(orphans[0].name, "Garden");
        }
    }
}

pub mod watch {
    //! Debounced change notifications for a vault on disk.
    //!
    //! A debounced batch only says which paths were touched. A path that still
    //! exists is reported as changed and one that is gone as removed, so a rename
    //! shows up as one of each.

    use crate::storage::{RelPath, ScanPolicy};
    use anyhow::{Context, Result};
    use notify::RecursiveMode;
    use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
    use std::{
        collections::BTreeSet,
        ops::ControlFlow,
        path::{Path, PathBuf},
        sync::mpsc,
        time::Duration,
    };
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebouncePolicy {
        pub window: Duration,
    }

    impl Default for DebouncePolicy {
        fn default() -> Self {
            Self {
                window: Duration::from_millis(120),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub enum DocumentEvent {
        Changed(RelPath),
        Removed(RelPath),
    }

    impl DocumentEvent {
        pub fn path(&self) -> &RelPath {
            match self {
                DocumentEvent::Changed(p) | DocumentEvent::Removed(p) => p,
            }
        }
    }

    /// True for document-type files under `root` outside ignored directories.
    pub fn is_document_event_path(root: &Path, path: &Path, policy: &ScanPolicy) -> bool {
        let Ok(rel) = path.strip_prefix(root) else {
            return false;
        };
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            let name = component.as_os_str().to_string_lossy();
            if components.peek().is_some() && policy.is_ignored_dir(&name) {
                return false;
            }
        }
        policy.is_document(rel)
    }

    /// Deduplicated document events for one batch of touched paths.
    pub fn classify<I>(root: &Path, policy: &ScanPolicy, paths: I) -> Vec<DocumentEvent>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut events = BTreeSet::new();
        for path in paths {
            if !is_document_event_path(root, &path, policy) {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = RelPath::new(rel.to_string_lossy().into_owned());
            if path.exists() {
                events.insert(DocumentEvent::Changed(rel));
            } else {
                events.insert(DocumentEvent::Removed(rel));
            }
        }
        events.into_iter().collect()
    }

    /// Absolute, symlink-free form of `root`. The watcher reports absolute paths,
    /// so event paths only strip against a root in this form.
    pub fn resolve_root(root: &Path) -> Result<PathBuf> {
        root.canonicalize()
            .with_context(|| format!("resolving vault root {:?}", root))
    }

    /// Blocks, calling `on_batch` once per debounced burst that touched at least
    /// one document, until it returns `ControlFlow::Break`.
    pub fn watch_vault<F>(root: &Path, scan_policy: &ScanPolicy, debounce: DebouncePolicy, mut on_batch: F) -> Result<()>
    where
        F: FnMut(Vec<DocumentEvent>) -> ControlFlow<()>,
    {
        let root = resolve_root(root)?;
        let root = root.as_path();
        let (tx, rx) = mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(debounce.window, tx).context("creating file watcher")?;
        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {:?}", root))?;
        info!(root = %root.display(), window_ms = debounce.window.as_millis() as u64, "watching vault");

        for result in rx {
            match result {
                Ok(events) => {
                    let batch = classify(root, scan_policy, events.into_iter().map(|e| e.path));
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(events = batch.len(), "document batch");
                    if on_batch(batch).is_break() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "file watcher error"),
            }
        }
        Ok(())
    }

}
