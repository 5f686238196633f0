//! Shared low-level machinery for parsing the network document
//! meta-format: tokenizing lines into [`tokenize::Item`]s, declaring the
//! recognized keyword set for a document type with `decl_keyword!`, and
//! validating a section's items against a [`parser::SectionRules`].

#[macro_use]
mod macros;
pub(crate) mod keyword;
pub(crate) mod parser;
pub(crate) mod tokenize;
