//! Stage renderers: turn a resolved configuration into the instructions
//! of the builder and runtime stages.
//!
//! Each renderer emits its instructions in a fixed order (base image,
//! system packages, environment, file operations, installs, cleanup) so
//! the least volatile layers come first.

pub mod builder;
pub mod packages;
pub mod runtime;

use crate::core::codegen::{Instruction, Keyword, Stage};
use crate::core::types::FileSpec;

/// Accumulates the instructions of one stage.
pub(crate) struct StageWriter {
    stage: Stage,
    out: Vec<Instruction>,
}

impl StageWriter {
    pub(crate) fn new(stage: Stage) -> Self {
        Self {
            stage,
            out: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, keyword: Keyword, args: impl Into<String>) {
        self.out.push(Instruction::new(self.stage, keyword, args));
    }

    /// `COPY` for every copy entry, then `ADD` for every fetch entry.
    /// Paths use the JSON array form so whitespace survives.
    pub(crate) fn file_operations(&mut self, copies: &[FileSpec], adds: &[FileSpec]) {
        for spec in copies {
            self.push(Keyword::Copy, paths(spec));
        }
        for spec in adds {
            match &spec.checksum {
                Some(checksum) => {
                    self.push(Keyword::Add, format!("--checksum={} {}", checksum, paths(spec)))
                }
                None => self.push(Keyword::Add, paths(spec)),
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<Instruction> {
        self.out
    }
}

fn paths(spec: &FileSpec) -> String {
    exec_form(&[spec.src.clone(), spec.dst.clone()])
}

/// JSON array form, as used by `ENTRYPOINT`, `CMD`, `COPY` and `ADD`.
pub(crate) fn exec_form(args: &[String]) -> String {
    serde_json::Value::from(args.to_vec()).to_string()
}

/// Single-quote a word for the shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Double-quote an `ENV`/`LABEL` value.
///
/// Quotes and backslashes are escaped; `\$` is kept as written so escaped
/// dollars stay literal.
pub fn value_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' if chars.peek() == Some(&'$') => out.push('\\'),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("requests>=2"), "'requests>=2'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_value_quote() {
        assert_eq!(value_quote("plain"), "\"plain\"");
        assert_eq!(value_quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(value_quote("C:\\dir"), "\"C:\\\\dir\"");
        assert_eq!(value_quote("\\$HOME"), "\"\\$HOME\"");
        assert_eq!(value_quote("$PATH:/x"), "\"$PATH:/x\"");
    }

    #[test]
    fn test_file_operations() {
        let mut w = StageWriter::new(Stage::Runtime);
        w.file_operations(
            &[FileSpec {
                src: "conf".into(),
                dst: "/etc/svc".into(),
                checksum: None,
            }],
            &[
                FileSpec {
                    src: "https://x/a.tgz".into(),
                    dst: "/opt/a.tgz".into(),
                    checksum: Some("sha256:ab".into()),
                },
                FileSpec {
                    src: "https://x/b".into(),
                    dst: "/opt/b".into(),
                    checksum: None,
                },
            ],
        );
        let lines: Vec<String> = w.finish().iter().map(|i| i.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                r#"COPY ["conf","/etc/svc"]"#,
                r#"ADD --checksum=sha256:ab ["https://x/a.tgz","/opt/a.tgz"]"#,
                r#"ADD ["https://x/b","/opt/b"]"#,
            ]
        );
    }

    #[test]
    fn test_file_operations_keep_whitespace_in_paths() {
        let mut w = StageWriter::new(Stage::Builder);
        w.file_operations(
            &[FileSpec {
                src: "my config.toml".into(),
                dst: "/etc/my app/config.toml".into(),
                checksum: None,
            }],
            &[],
        );
        let lines: Vec<String> = w.finish().iter().map(|i| i.to_string()).collect();
        assert_eq!(lines, vec![r#"COPY ["my config.toml","/etc/my app/config.toml"]"#]);
    }
}
