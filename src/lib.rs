//! A recursive-descent backtracking PEG engine with named back-references,
//! context-sensitive productions, and spliceable token trees.
//!
//! Grammars are declared through [`GrammarBuilder`], linked once into an
//! immutable [`Definition`], and matched against in-memory byte buffers,
//! producing a [`Token`] tree. The compact [`Pattern`] notation compiles to
//! the same node graph on demand. [`meld`] and [`burn`] splice overlapping
//! token trees, so a sub-range can be re-parsed with a refined grammar and
//! merged back.
//!
//! # Example
//!
//! ```rust
//! use graft::{GrammarBuilder, Pattern, node};
//!
//! // A grammar built by hand...
//! let mut b = GrammarBuilder::new();
//! b.rule("word", node::repeat(1, None, node::range(b'a', b'z')));
//! b.rule(
//!     "call",
//!     node::glue(vec![
//!         node::rule_ref("word"),
//!         node::chr(b'('),
//!         node::rule_ref("word"),
//!         node::chr(b')'),
//!     ]),
//! );
//! b.entry("call");
//! let def = b.build().unwrap();
//!
//! let input = b"print(hello)";
//! let call = def.matches(input).unwrap();
//! assert_eq!(call.children().len(), 2);
//! assert_eq!(call.children()[1].text(input), b"hello");
//!
//! // ...and the same shape from the pattern notation.
//! let p = Pattern::new("[a..z]+\\x28[a..z]+\\x29").unwrap();
//! assert!(p.is_match(b"print(hello)"));
//! ```

pub mod node;

mod grammar;
mod matcher;
mod pattern;
mod splice;
mod state;
mod token;

pub use grammar::{
    CaptureId, DefId, Definition, FlagId, GrammarBuilder, KeywordId, LinkError, Rule, RuleId,
    RuleKey,
};
pub use pattern::{CompileError, Pattern, compile_pattern};
pub use splice::{burn, glow, meld};
pub use state::{MatchState, line_col};
pub use token::Token;
