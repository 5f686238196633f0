//! The [`Keyword`] trait, implemented by the enums generated by
//! `decl_keyword!`, used to identify the recognized keyword of an
//! [`Item`](super::tokenize::Item) appearing in a document.

use super::parser::TokenFmtBuilder;

/// A type that represents a set of recognized keywords, one per kind of
/// [`Item`](super::tokenize::Item) that can appear in some kind of
/// document.
///
/// Implementations are generated by the `decl_keyword!` macro; every
/// implementation includes an `UNRECOGNIZED` variant (and, for document
/// types that use annotations, an `ANN_UNRECOGNIZED` variant) to stand in
/// for any keyword string that the document format doesn't otherwise
/// recognize.
pub(crate) trait Keyword: Copy + Eq + std::fmt::Debug + 'static {
    /// Return the index of this keyword, for use as an array index.
    ///
    /// Guaranteed to be less than [`Keyword::n_vals`].
    fn idx(self) -> usize;

    /// Return the total number of distinct keyword values (including the
    /// unrecognized-keyword fallback(s)).
    fn n_vals() -> usize;

    /// Find the `Keyword` whose canonical representation is `s`.
    ///
    /// If `s` does not match any known keyword, returns the
    /// unrecognized-keyword fallback appropriate for `s` (based on
    /// whether `s` looks like an annotation keyword).
    fn from_str(s: &str) -> Self;

    /// Return the canonical string representation for this keyword.
    fn to_str(self) -> &'static str;

    /// Return true if this keyword is (or stands in for) an annotation,
    /// that is, a keyword beginning with `@`.
    fn is_annotation(self) -> bool {
        self.to_str().starts_with('@')
    }

    /// Begin describing the rules for how this keyword may be used within
    /// a section of a document.
    fn rule(self) -> TokenFmtBuilder<Self> {
        TokenFmtBuilder::new(self)
    }
}
