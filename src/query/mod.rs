//! Query templates and SQL composition.
//!
//! A [`QuerySpec`] carries a template with one `{filter}` slot plus the
//! caller's filter fragments, grouping flags, sort expressions and running-sum
//! columns. [`QueryComposer`] turns it into the final SQL text.

mod composer;
mod spec;

pub use composer::{ComposeError, QueryComposer, ROW_NUMBER_COLUMN};
pub use spec::{ColumnDecl, QuerySpec, FILTER_SLOT};
