//! Loading front-end dumps
//!
//! The external front-end exports the typed AST as JSON, one file per program
//! (or per compiler pass when validating). Loading is the only I/O in the
//! library crates.

use crate::ast::Program;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Load a program dump from disk.
pub fn load_program(path: &Path) -> Result<Program, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Declaration, Expr, Program, VarDecl};
    use crate::types::Type;
    use std::sync::Arc;

    #[test]
    fn program_round_trips_through_json() {
        let program = Program {
            declarations: vec![Declaration::Constant(Arc::new(VarDecl {
                name: "WIDTH".to_string(),
                ty: Type::Int,
                init: Some(Expr::int(8)),
            }))],
        };
        let text = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&text).unwrap();
        assert_eq!(program, back);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_program(Path::new("/nonexistent/prog.json")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
