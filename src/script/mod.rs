//! Factory script compiler: lexer, parser, and flattening pass.
//!
//! `compile` turns script text into a [`Program`] whose statements are
//! addressable by position; `lint` validates without building a program.

pub mod ast;
mod compile;
pub mod lexer;
pub mod parser;

pub use ast::{ArgList, BinaryOp, Builtin, Expression, Instruction, Literal, Program, UnaryOp};

/// Validation or compilation failure for a factory script
#[derive(Debug, Clone, thiserror::Error)]
#[error("script error: {message}")]
pub struct ScriptError {
    message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<parser::ParseError> for ScriptError {
    fn from(err: parser::ParseError) -> Self {
        ScriptError::new(err.message)
    }
}

fn located(source: &str, err: parser::ParseError) -> ScriptError {
    let (line, col) = parser::Parser::offset_to_line_col(source, err.span.start);
    ScriptError::new(format!("line {}, column {}: {}", line, col, err.message))
}

/// Compile script text into an executable program.
pub fn compile(source: &str) -> Result<Program, ScriptError> {
    let statements = parser::Parser::new(source)
        .map_err(|e| located(source, e))?
        .parse_script()
        .map_err(|e| located(source, e))?;
    compile::flatten(&statements)
}

/// Validate script text without producing a program.
///
/// Returns `None` when the script is well formed. Label resolution is part
/// of validation: a script that parses but jumps nowhere is still invalid.
pub fn lint(source: &str) -> Option<ScriptError> {
    compile(source).err()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY_SCRIPT: &str = r#"
# bring up the unit, retry the burn-in once
attempts = 0
::burn_in
attempts = attempts + 1
rc = ssh.exec( host=part.hostname, cmd="burn-in --cycle 1" )
if rc != 0:
    if attempts < 2:
        goto burn_in
    fail( msg="burn-in failed twice" )
message( msg="burn-in passed" )
"#;

    #[test]
    fn compiles_realistic_script() {
        let program = compile(FACTORY_SCRIPT).unwrap();
        assert!(program.len() >= 7);
    }

    #[test]
    fn lint_accepts_valid_script() {
        assert!(lint(FACTORY_SCRIPT).is_none());
    }

    #[test]
    fn lint_reports_location() {
        let err = lint("x = 1\ny = = 2").unwrap();
        let text = err.to_string();
        assert!(text.contains("line 2"), "got: {}", text);
    }

    #[test]
    fn lint_catches_bad_goto() {
        assert!(lint("goto lost").is_some());
    }
}
