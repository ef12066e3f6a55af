//! Resolution of a function's command line into something spawnable.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Shell used for commands with `execute_direct = false`.
pub const SHELL: &str = "/bin/sh";

/// Fully resolved program, arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandLine {
    /// Resolve a rendered command (parameters already substituted).
    ///
    /// Direct commands look for the program in `scripts_dir` first, then use
    /// it as a path when it has more than one component, and finally search
    /// `PATH`. Non-direct commands are joined and handed to `/bin/sh -c`.
    pub fn resolve(
        rendered: &[String],
        execute_direct: bool,
        scripts_dir: Option<&Path>,
    ) -> Result<Self> {
        let current_dir = scripts_dir.map(Path::to_path_buf);

        if !execute_direct {
            if rendered.is_empty() {
                return Err(Error::Config("command is empty".to_string()));
            }
            return Ok(Self {
                program: PathBuf::from(SHELL),
                args: vec!["-c".to_string(), rendered.join(" ")],
                current_dir,
            });
        }

        let (program, args) = rendered
            .split_first()
            .ok_or_else(|| Error::Config("command is empty".to_string()))?;
        let path = Path::new(program);

        let in_scripts_dir = scripts_dir
            .filter(|_| path.is_relative())
            .map(|dir| dir.join(path))
            .filter(|candidate| candidate.is_file());

        let program = match in_scripts_dir {
            Some(candidate) => candidate,
            None if path.is_absolute() || path.components().count() > 1 => path.to_path_buf(),
            None => which::which(program).map_err(|e| {
                Error::Spawn(format!("executable '{}' not found: {}", program, e))
            })?,
        };

        Ok(Self {
            program,
            args: args.to_vec(),
            current_dir,
        })
    }

    /// Human-readable form for logs and errors.
    pub fn display(&self) -> String {
        let mut text = self.program.display().to_string();
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_shell_command_is_joined() {
        let command =
            CommandLine::resolve(&strings(&["echo", "Key", "$1"]), false, None).unwrap();
        assert_eq!(command.program, PathBuf::from(SHELL));
        assert_eq!(command.args, strings(&["-c", "echo Key $1"]));
    }

    #[test]
    fn test_scripts_dir_takes_precedence() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("input.sh"), "#!/bin/sh\ncat\n").unwrap();

        let command =
            CommandLine::resolve(&strings(&["input.sh", "--flag"]), true, Some(dir.path()))
                .unwrap();
        assert_eq!(command.program, dir.path().join("input.sh"));
        assert_eq!(command.args, strings(&["--flag"]));
        assert_eq!(command.current_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_absolute_path_used_as_is() {
        let command = CommandLine::resolve(&strings(&["/opt/udf/run"]), true, None).unwrap();
        assert_eq!(command.program, PathBuf::from("/opt/udf/run"));
    }

    #[test]
    fn test_unknown_program_is_spawn_error() {
        let err = CommandLine::resolve(&strings(&["no-such-program-execudf"]), true, None)
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)), "{:?}", err);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandLine::resolve(&[], true, None).is_err());
        assert!(CommandLine::resolve(&[], false, None).is_err());
    }
}
