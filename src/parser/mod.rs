pub mod adapter;
pub mod script;

pub use adapter::{DmlStatement, ScriptStatement, SqlScriptAdapter};
pub use script::split_statements;
