//! The `decl_keyword!` macro, used to declare the
//! [`Keyword`](super::keyword::Keyword) enum for a document type.

/// Declare an enum implementing [`Keyword`](crate::parse::keyword::Keyword).
///
/// ```ignore
/// decl_keyword! {
///     pub(crate) FruitKwd {
///         annotation "@tasty" => ANN_TASTY,
///         "accept" | "reject" => POLICY,
///         "apple" => APPLE,
///     }
/// }
/// ```
///
/// Every keyword string must appear in exactly one arm; a leading
/// `annotation` marks an arm as matching an annotation keyword (one that
/// begins with `@`), for documentation purposes only — whether a keyword
/// actually is an annotation is always decided from its spelling.
///
/// Besides the listed variants, the generated enum always gets two
/// catch-all variants, `UNRECOGNIZED` and `ANN_UNRECOGNIZED`, used for any
/// keyword string that doesn't match one of the given arms.
macro_rules! decl_keyword {
    {
        $(#[$meta:meta])*
        $vis:vis $name:ident {
            $(
                $(annotation)? $first:literal $(| $more:literal)* => $variant:ident
            ),+
            $(,)?
        }
    } => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
        #[allow(non_camel_case_types)]
        #[allow(clippy::exhaustive_enums)]
        $vis enum $name {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
            /// A non-annotation keyword that isn't one of the above.
            #[allow(missing_docs)]
            UNRECOGNIZED,
            /// An annotation keyword (beginning with `@`) that isn't one
            /// of the above.
            #[allow(missing_docs)]
            ANN_UNRECOGNIZED,
        }

        impl $name {
            /// Maps each recognized keyword's spellings to its variant.
            ///
            /// The first spelling listed for a variant is canonical, and
            /// is what [`Keyword::to_str`](crate::parse::keyword::Keyword::to_str) returns.
            const KEYWORD_TABLE: &'static [(&'static [&'static str], $name)] = &[
                $( (&[$first $(, $more)*], $name::$variant), )+
            ];
        }

        impl $crate::parse::keyword::Keyword for $name {
            fn idx(self) -> usize {
                self as usize
            }
            fn n_vals() -> usize {
                Self::KEYWORD_TABLE.len() + 2
            }
            fn from_str(s: &str) -> Self {
                for (strs, kwd) in Self::KEYWORD_TABLE {
                    if strs.iter().any(|&candidate| candidate == s) {
                        return *kwd;
                    }
                }
                if s.starts_with('@') {
                    $name::ANN_UNRECOGNIZED
                } else {
                    $name::UNRECOGNIZED
                }
            }
            fn to_str(self) -> &'static str {
                for (strs, kwd) in Self::KEYWORD_TABLE {
                    if *kwd == self {
                        return strs[0];
                    }
                }
                match self {
                    $name::ANN_UNRECOGNIZED => "@unrecognized",
                    _ => "unrecognized",
                }
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    decl_keyword! {
        /// A small keyword set used to exercise the tokenizer in tests.
        pub(crate) Fruit {
            annotation "@tasty" => ANN_TASTY,
            "apple" => APPLE,
            "banana" => BANANA,
            "cherry" | "plum" => STONEFRUIT,
            "orange" => ORANGE,
            "guava" => GUAVA,
        }
    }
}
