//! Tag-Kind Matcher: maps raw OSM tags to abstract "kinds".
//!
//! Grounded on the original `TagFilter` (`filters.py`): each rule line
//! associates a `(variant, key[=value])` tag predicate with a kind name,
//! optionally guarded by a secondary "context" predicate over the
//! surrounding tag set (spec.md §4.2's superset grammar).

use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;

use thiserror::Error;

use crate::model::{Tags, Variant};

/// Whether a context predicate must hold in both tag maps or just one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStrength {
    /// The context predicate must hold in both maps.
    Strong,
    /// The context predicate must hold in at least one map.
    Weak,
}

/// A tag predicate: either "key present" or "key equals value".
#[derive(Debug, Clone, PartialEq, Eq)]
enum TagPredicate {
    KeyPresent(String),
    KeyEquals(String, String),
}

impl TagPredicate {
    fn key(&self) -> &str {
        match self {
            Self::KeyPresent(key) | Self::KeyEquals(key, _) => key,
        }
    }

    fn matches(&self, tags: &Tags) -> bool {
        match self {
            Self::KeyPresent(key) => tags.contains_key(key),
            Self::KeyEquals(key, value) => tags.get(key).is_some_and(|v| v == value),
        }
    }

    fn parse(field: &str) -> Self {
        match field.split_once('=') {
            Some((key, value)) => Self::KeyEquals(key.to_owned(), value.to_owned()),
            None => Self::KeyPresent(field.to_owned()),
        }
    }
}

/// One entry of the Tag-Kind Matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TagRule {
    variant: Option<Variant>,
    kind: String,
    predicate: TagPredicate,
    context: Option<TagPredicate>,
}

impl TagRule {
    fn applies_to(&self, variant: Variant) -> bool {
        self.variant.is_none_or(|v| v == variant)
    }
}

/// Error parsing a tag-rule file (spec.md §7, "Input malformed").
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatcherError {
    /// A rule line had fewer than two whitespace-separated fields.
    #[error("rule line {line}: expected at least `<variant> <kind> <key>`, got {text:?}")]
    TooFewFields {
        /// 1-based line number.
        line: usize,
        /// The offending line text.
        text: String,
    },
    /// The variant field did not start with `n`, `w`, `r`, or `a`.
    #[error("rule line {line}: unknown variant {variant:?}")]
    UnknownVariant {
        /// 1-based line number.
        line: usize,
        /// The offending variant token.
        variant: String,
    },
    /// A `+context` suffix appeared on both the kind and the key field,
    /// which spec.md §9 calls out as ambiguous rather than guessable.
    #[error("rule line {line}: context specified on both kind and key")]
    AmbiguousContext {
        /// 1-based line number.
        line: usize,
    },
}

/// Maps raw OSM tags to abstract kinds per a loaded rule file.
#[derive(Debug, Clone, Default)]
pub struct TagKindMatcher {
    rules: Vec<TagRule>,
    relevant_keys: BTreeSet<String>,
}

fn split_context(field: &str) -> Result<(&str, Option<&str>), ()> {
    match field.split_once('+') {
        Some((head, ctx)) if !ctx.is_empty() => Ok((head, Some(ctx))),
        Some(_) => Err(()),
        None => Ok((field, None)),
    }
}

impl TagKindMatcher {
    /// Loads rules from a reader, one rule per line. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn load<R: BufRead>(reader: R) -> Result<Self, MatcherError> {
        let mut matcher = Self::default();
        for (idx, line) in reader.lines().enumerate() {
            let line_number = idx + 1;
            let text = line.unwrap_or_default();
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            matcher.load_line(line_number, trimmed)?;
        }
        Ok(matcher)
    }

    fn load_line(&mut self, line_number: usize, trimmed: &str) -> Result<(), MatcherError> {
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(MatcherError::TooFewFields {
                line: line_number,
                text: trimmed.to_owned(),
            });
        }
        let variant_field = fields[0].to_lowercase();
        let variant_initial = variant_field.chars().next().unwrap_or('a');
        let variant = if variant_initial == 'a' {
            None
        } else {
            Some(Variant::from_initial(variant_initial).ok_or_else(|| {
                MatcherError::UnknownVariant {
                    line: line_number,
                    variant: fields[0].to_owned(),
                }
            })?)
        };

        let (kind_field, kind_ctx) =
            split_context(fields[1]).map_err(|()| MatcherError::AmbiguousContext {
                line: line_number,
            })?;
        let (key_field, key_ctx) =
            split_context(fields[2]).map_err(|()| MatcherError::AmbiguousContext {
                line: line_number,
            })?;
        if kind_ctx.is_some() && key_ctx.is_some() {
            return Err(MatcherError::AmbiguousContext { line: line_number });
        }

        let predicate = TagPredicate::parse(key_field);
        let context = kind_ctx.or(key_ctx).map(TagPredicate::parse);

        self.relevant_keys.insert(predicate.key().to_owned());
        self.rules.push(TagRule {
            variant,
            kind: kind_field.to_owned(),
            predicate,
            context,
        });
        Ok(())
    }

    /// The union of every rule's left-hand key; used by the Watched-Object
    /// Store to strip irrelevant tags before persisting.
    #[must_use]
    pub fn relevant_keys(&self) -> &BTreeSet<String> {
        &self.relevant_keys
    }

    /// Filters `tags` down to the relevant-key set (spec.md P3).
    #[must_use]
    pub fn filter_relevant(&self, tags: &Tags) -> Tags {
        if self.relevant_keys.is_empty() {
            return tags.clone();
        }
        tags.iter()
            .filter(|(k, _)| self.relevant_keys.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// `true` when no rules are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn context_holds(context: &TagPredicate, tags: &Tags) -> bool {
        context.matches(tags)
    }

    fn context_satisfied(
        context: &Option<TagPredicate>,
        tags: &Tags,
        ctx_tags: &Tags,
        strength: ContextStrength,
    ) -> bool {
        match context {
            None => true,
            Some(context) => match strength {
                ContextStrength::Strong => {
                    Self::context_holds(context, tags) && Self::context_holds(context, ctx_tags)
                }
                ContextStrength::Weak => {
                    Self::context_holds(context, tags) || Self::context_holds(context, ctx_tags)
                }
            },
        }
    }

    /// Kinds whose predicate matches `tags`, with no context evaluation
    /// (equivalent to `kinds_of_with_context` with an empty second map).
    #[must_use]
    pub fn kinds_of(&self, variant: Variant, tags: &Tags) -> BTreeSet<String> {
        self.kinds_of_with_context(variant, tags, &Tags::new(), ContextStrength::Weak)
    }

    /// Kinds whose predicate matches `tags`, evaluating any context
    /// predicate over `tags` and `ctx_tags` per `strength` (spec.md §4.2).
    #[must_use]
    pub fn kinds_of_with_context(
        &self,
        variant: Variant,
        tags: &Tags,
        ctx_tags: &Tags,
        strength: ContextStrength,
    ) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(variant))
            .filter(|rule| rule.predicate.matches(tags))
            .filter(|rule| Self::context_satisfied(&rule.context, tags, ctx_tags, strength))
            .map(|rule| rule.kind.clone())
            .collect()
    }

    /// Kinds whose selected option changed between `old_tags` and
    /// `new_tags` while the kind stayed present in both (spec.md §4.2
    /// `modified_kinds`): either the matched rule's value differs, or a
    /// different alternative rule for the same kind is now selected.
    #[must_use]
    pub fn modified_kinds(
        &self,
        variant: Variant,
        old_tags: &Tags,
        new_tags: &Tags,
        strength: ContextStrength,
    ) -> BTreeSet<String> {
        let old_kinds = self.kinds_of_with_context(variant, old_tags, new_tags, strength);
        let new_kinds = self.kinds_of_with_context(variant, new_tags, old_tags, strength);
        let still_present: BTreeSet<String> =
            old_kinds.intersection(&new_kinds).cloned().collect();

        let mut selected_keys: HashMap<&str, (BTreeSet<&str>, BTreeSet<&str>)> = HashMap::new();
        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(variant) && still_present.contains(&rule.kind))
        {
            let entry = selected_keys.entry(rule.kind.as_str()).or_default();
            if rule.predicate.matches(old_tags) {
                entry.0.insert(rule.predicate.key());
            }
            if rule.predicate.matches(new_tags) {
                entry.1.insert(rule.predicate.key());
            }
        }

        still_present
            .into_iter()
            .filter(|kind| {
                let Some((old_keys, new_keys)) = selected_keys.get(kind.as_str()) else {
                    return false;
                };
                if old_keys != new_keys {
                    return true;
                }
                old_keys.iter().any(|key| old_tags.get(*key) != new_tags.get(*key))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::io::Cursor;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[fixture]
    fn stop_matcher() -> TagKindMatcher {
        TagKindMatcher::load(Cursor::new("node stop highway=bus_stop\n")).expect("valid rules")
    }

    #[rstest]
    fn matches_key_value_rule(stop_matcher: TagKindMatcher) {
        let t = tags(&[("highway", "bus_stop")]);
        assert_eq!(
            stop_matcher.kinds_of(Variant::Node, &t),
            BTreeSet::from(["stop".to_owned()])
        );
    }

    #[rstest]
    fn non_matching_value_is_excluded(stop_matcher: TagKindMatcher) {
        let t = tags(&[("highway", "traffic_signals")]);
        assert!(stop_matcher.kinds_of(Variant::Node, &t).is_empty());
    }

    #[rstest]
    fn any_variant_rule_applies_everywhere() {
        let matcher =
            TagKindMatcher::load(Cursor::new("any name name\n")).expect("valid rules");
        let t = tags(&[("name", "Main Street")]);
        assert!(matcher.kinds_of(Variant::Way, &t).contains("name"));
        assert!(matcher.kinds_of(Variant::Relation, &t).contains("name"));
    }

    #[rstest]
    fn key_presence_rule_ignores_value() {
        let matcher = TagKindMatcher::load(Cursor::new("way lit lit\n")).expect("valid rules");
        assert!(matcher.kinds_of(Variant::Way, &tags(&[("lit", "yes")])).contains("lit"));
        assert!(matcher.kinds_of(Variant::Way, &tags(&[("lit", "no")])).contains("lit"));
    }

    #[rstest]
    fn context_on_key_requires_both_maps_under_strong() {
        let matcher =
            TagKindMatcher::load(Cursor::new("way crossing crossing+bicycle\n"))
                .expect("valid rules");
        let with_ctx = tags(&[("crossing", "traffic_signals"), ("bicycle", "yes")]);
        let without_ctx = tags(&[("crossing", "traffic_signals")]);
        assert!(matcher
            .kinds_of_with_context(Variant::Way, &with_ctx, &with_ctx, ContextStrength::Strong)
            .contains("crossing"));
        assert!(matcher
            .kinds_of_with_context(
                Variant::Way,
                &without_ctx,
                &without_ctx,
                ContextStrength::Strong
            )
            .is_empty());
    }

    #[rstest]
    fn context_weak_requires_only_one_map() {
        let matcher =
            TagKindMatcher::load(Cursor::new("way crossing crossing+bicycle\n"))
                .expect("valid rules");
        let with_ctx = tags(&[("crossing", "traffic_signals"), ("bicycle", "yes")]);
        let without_ctx = tags(&[("crossing", "traffic_signals")]);
        assert!(matcher
            .kinds_of_with_context(Variant::Way, &without_ctx, &with_ctx, ContextStrength::Weak)
            .contains("crossing"));
    }

    #[rstest]
    fn ambiguous_context_on_both_fields_is_rejected() {
        let err = TagKindMatcher::load(Cursor::new("way kind+a key+b\n")).unwrap_err();
        assert_eq!(err, MatcherError::AmbiguousContext { line: 1 });
    }

    #[rstest]
    fn too_few_fields_is_rejected() {
        let err = TagKindMatcher::load(Cursor::new("way kind\n")).unwrap_err();
        assert_eq!(
            err,
            MatcherError::TooFewFields {
                line: 1,
                text: "way kind".to_owned()
            }
        );
    }

    #[rstest]
    fn unknown_variant_is_rejected() {
        let err = TagKindMatcher::load(Cursor::new("zebra kind key\n")).unwrap_err();
        assert_eq!(
            err,
            MatcherError::UnknownVariant {
                line: 1,
                variant: "zebra".to_owned()
            }
        );
    }

    #[rstest]
    fn blank_and_comment_lines_are_skipped() {
        let matcher =
            TagKindMatcher::load(Cursor::new("\n# comment\nway lit lit\n")).expect("valid rules");
        assert!(matcher.kinds_of(Variant::Way, &tags(&[("lit", "yes")])).contains("lit"));
    }

    #[rstest]
    fn relevant_keys_is_union_of_rule_keys() {
        let matcher =
            TagKindMatcher::load(Cursor::new("way maxspeed maxspeed\nway lit lit\n"))
                .expect("valid rules");
        assert_eq!(
            matcher.relevant_keys(),
            &BTreeSet::from(["maxspeed".to_owned(), "lit".to_owned()])
        );
    }

    #[rstest]
    fn filter_relevant_drops_unlisted_keys() {
        let matcher = TagKindMatcher::load(Cursor::new("way lit lit\n")).expect("valid rules");
        let filtered =
            matcher.filter_relevant(&tags(&[("lit", "yes"), ("name", "Main")]));
        assert_eq!(filtered, tags(&[("lit", "yes")]));
    }

    #[rstest]
    fn modified_kinds_detects_value_change() {
        let matcher =
            TagKindMatcher::load(Cursor::new("way maxspeed maxspeed\n")).expect("valid rules");
        let old = tags(&[("maxspeed", "50")]);
        let new = tags(&[("maxspeed", "60")]);
        assert_eq!(
            matcher.modified_kinds(Variant::Way, &old, &new, ContextStrength::Weak),
            BTreeSet::from(["maxspeed".to_owned()])
        );
    }

    #[rstest]
    fn modified_kinds_is_empty_for_unchanged_value() {
        let matcher =
            TagKindMatcher::load(Cursor::new("way maxspeed maxspeed\n")).expect("valid rules");
        let same = tags(&[("maxspeed", "50")]);
        assert!(matcher
            .modified_kinds(Variant::Way, &same, &same, ContextStrength::Strong)
            .is_empty());
    }

    #[rstest]
    fn modified_kinds_detects_option_switch() {
        let matcher = TagKindMatcher::load(Cursor::new(
            "way crossing crossing=traffic_signals\nway crossing crossing=uncontrolled\n",
        ))
        .expect("valid rules");
        let old = tags(&[("crossing", "traffic_signals")]);
        let new = tags(&[("crossing", "uncontrolled")]);
        assert_eq!(
            matcher.modified_kinds(Variant::Way, &old, &new, ContextStrength::Weak),
            BTreeSet::from(["crossing".to_owned()])
        );
    }

    #[rstest]
    fn kinds_of_is_pure() {
        let matcher = TagKindMatcher::load(Cursor::new("way lit lit\n")).expect("valid rules");
        let t = tags(&[("lit", "yes")]);
        assert_eq!(
            matcher.kinds_of(Variant::Way, &t),
            matcher.kinds_of(Variant::Way, &t)
        );
    }
}
