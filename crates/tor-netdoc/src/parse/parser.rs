//! Rules describing which keywords, in which multiplicity and argument
//! shape, are permitted within a section of a document.
//!
//! A document format builds up a [`SectionRules`] (one per logical
//! section, such as a header, a body, or a footer) describing every
//! `Item` keyword it permits, then calls [`SectionRules::parse`] to
//! validate a stream of tokenized [`Item`](super::tokenize::Item)s
//! against those rules, producing a [`Section`] that the rest of the
//! parser can query by keyword.

use std::ops::{Bound, RangeBounds};

use super::keyword::Keyword;
use super::tokenize::{Item, MaybeItem};
use crate::err::NetdocErrorKind as EK;
use crate::Result;

/// Whether (and how) an [`Item`] with a given keyword may carry an object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ObjPolicy {
    /// The item must not have an object.
    Forbidden,
    /// The item may or may not have an object.
    Optional,
    /// The item must have an object.
    Required,
}

/// A rule describing how a single keyword may appear within a section.
///
/// Constructed via [`Keyword::rule`], and passed to
/// [`SectionRulesBuilder::add`].
#[derive(Clone, Debug)]
pub(crate) struct TokenFmtBuilder<K> {
    /// The keyword that this rule describes.
    kwd: K,
    /// Whether at least one item with this keyword must appear.
    required: bool,
    /// Whether more than one item with this keyword may appear.
    may_repeat: bool,
    /// The minimum permissible number of arguments.
    min_args: usize,
    /// The maximum permissible number of arguments (inclusive).
    max_args: usize,
    /// Whether (and how) this item may have an object.
    obj: ObjPolicy,
}

impl<K: Keyword> TokenFmtBuilder<K> {
    /// Start describing the rule for `kwd`: by default, the keyword is
    /// optional, may appear at most once, takes any number of arguments,
    /// and must not have an object.
    pub(crate) fn new(kwd: K) -> Self {
        TokenFmtBuilder {
            kwd,
            required: false,
            may_repeat: false,
            min_args: 0,
            max_args: usize::MAX,
            obj: ObjPolicy::Forbidden,
        }
    }

    /// Require that at least one item with this keyword appear in the
    /// section.
    pub(crate) fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Allow more than one item with this keyword to appear in the
    /// section.
    pub(crate) fn may_repeat(mut self) -> Self {
        self.may_repeat = true;
        self
    }

    /// Constrain the number of arguments this keyword's items may take.
    pub(crate) fn args<R: RangeBounds<usize>>(mut self, range: R) -> Self {
        self.min_args = match range.start_bound() {
            Bound::Included(n) => *n,
            Bound::Excluded(n) => n + 1,
            Bound::Unbounded => 0,
        };
        self.max_args = match range.end_bound() {
            Bound::Included(n) => *n,
            Bound::Excluded(n) => n.saturating_sub(1),
            Bound::Unbounded => usize::MAX,
        };
        self
    }

    /// Require that this keyword's items take no arguments.
    pub(crate) fn no_args(self) -> Self {
        self.args(0..=0)
    }

    /// Allow (but do not require) an object on this keyword's items.
    pub(crate) fn obj_optional(mut self) -> Self {
        self.obj = ObjPolicy::Optional;
        self
    }

    /// Require an object on this keyword's items.
    pub(crate) fn obj_required(mut self) -> Self {
        self.obj = ObjPolicy::Required;
        self
    }
}

/// Builder for the set of rules that apply within one section of a
/// document.
///
/// Constructed with [`SectionRules::builder`].
pub(crate) struct SectionRulesBuilder<K: Keyword> {
    /// One rule per recognized keyword, indexed by [`Keyword::idx`].
    rules: Vec<Option<TokenFmtBuilder<K>>>,
}

impl<K: Keyword> SectionRulesBuilder<K> {
    /// Add a rule to this builder.
    pub(crate) fn add(&mut self, rule: TokenFmtBuilder<K>) {
        let idx = rule.kwd.idx();
        self.rules[idx] = Some(rule);
    }

    /// Finalize this builder into a [`SectionRules`].
    pub(crate) fn build(self) -> SectionRules<K> {
        SectionRules { rules: self.rules }
    }
}

/// The complete set of rules describing which keywords (and in what
/// shape) may appear within one section of a document.
pub(crate) struct SectionRules<K: Keyword> {
    /// One rule per recognized keyword, indexed by [`Keyword::idx`].
    rules: Vec<Option<TokenFmtBuilder<K>>>,
}

impl<K: Keyword> SectionRules<K> {
    /// Begin describing the rules for a new section.
    pub(crate) fn builder() -> SectionRulesBuilder<K> {
        SectionRulesBuilder {
            rules: (0..K::n_vals()).map(|_| None).collect(),
        }
    }

    /// Parse every item yielded by `iter`, validating it against these
    /// rules, and return the resulting [`Section`].
    ///
    /// Returns an error as soon as an item violates its rule (wrong
    /// argument count, disallowed or missing object, a non-repeatable
    /// keyword appearing more than once), or if a [`required`](
    /// TokenFmtBuilder::required) keyword never appears.
    pub(crate) fn parse<'a, I>(&self, iter: I) -> Result<Section<'a, K>>
    where
        I: Iterator<Item = Result<Item<'a, K>>>,
    {
        let mut by_kwd: Vec<Vec<Item<'a, K>>> = (0..K::n_vals()).map(|_| Vec::new()).collect();
        let mut all = Vec::new();

        for item in iter {
            let item = item?;
            let idx = item.kwd().idx();
            if let Some(rule) = &self.rules[idx] {
                if !rule.may_repeat && !by_kwd[idx].is_empty() {
                    return Err(EK::DuplicateToken
                        .with_msg(item.kwd().to_str())
                        .at_pos(item.pos()));
                }
                let n_args = item.n_args();
                if n_args < rule.min_args {
                    return Err(EK::TooFewArguments
                        .with_msg(item.kwd().to_str())
                        .at_pos(item.pos()));
                }
                if n_args > rule.max_args {
                    return Err(EK::TooManyArguments
                        .with_msg(item.kwd().to_str())
                        .at_pos(item.pos()));
                }
                match rule.obj {
                    ObjPolicy::Forbidden if item.has_obj() => {
                        return Err(EK::UnexpectedObject
                            .with_msg(item.kwd().to_str())
                            .at_pos(item.pos()))
                    }
                    ObjPolicy::Required if !item.has_obj() => {
                        return Err(EK::MissingObject
                            .with_msg(item.kwd().to_str())
                            .at_pos(item.pos()))
                    }
                    _ => {}
                }
            }
            by_kwd[idx].push(item.clone());
            all.push(item);
        }

        for rule in self.rules.iter().flatten() {
            if rule.required && by_kwd[rule.kwd.idx()].is_empty() {
                return Err(EK::MissingToken.with_msg(rule.kwd.to_str()));
            }
        }

        Ok(Section { by_kwd, all })
    }
}

/// The result of validating a section of a document: a lookup table from
/// keyword to the item(s) with that keyword.
pub(crate) struct Section<'a, K: Keyword> {
    /// Items with a rule, indexed by [`Keyword::idx`].
    by_kwd: Vec<Vec<Item<'a, K>>>,
    /// Every item in the section, in the order it was encountered.
    all: Vec<Item<'a, K>>,
}

impl<'a, K: Keyword> Section<'a, K> {
    /// Return the first item in the section, in document order, if any.
    pub(crate) fn first_item(&self) -> Option<&Item<'a, K>> {
        self.all.first()
    }

    /// Return the last item in the section, in document order, if any.
    pub(crate) fn last_item(&self) -> Option<&Item<'a, K>> {
        self.all.last()
    }

    /// Return the first item with keyword `kwd`, if any appeared.
    pub(crate) fn get(&self, kwd: K) -> Option<&Item<'a, K>> {
        self.by_kwd[kwd.idx()].first()
    }

    /// Return every item with keyword `kwd`, in document order.
    pub(crate) fn slice(&self, kwd: K) -> &[Item<'a, K>] {
        &self.by_kwd[kwd.idx()]
    }

    /// Return the first item with keyword `kwd`, or an error if none
    /// appeared.
    ///
    /// The caller is expected to have marked `kwd` as
    /// [`required`](TokenFmtBuilder::required) when building the rules
    /// for this section; if it isn't, this function can still fail.
    pub(crate) fn required(&self, kwd: K) -> Result<&Item<'a, K>> {
        self.get(kwd)
            .ok_or_else(|| EK::MissingToken.with_msg(kwd.to_str()))
    }

    /// Return the first item with keyword `kwd`, wrapped so that its
    /// optional accessors return `None` rather than erroring when it's
    /// absent.
    pub(crate) fn maybe(&self, kwd: K) -> MaybeItem<'_, 'a, K> {
        MaybeItem::from_option(self.get(kwd))
    }
}
