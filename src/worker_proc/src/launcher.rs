//! How a worker process is started.

use std::{
    ffi::OsString,
    io,
    process::{Child, Command, Stdio},
};

/// Command line that starts a worker speaking the framed protocol on stdio.
#[derive(Debug, Clone, PartialEq)]
pub enum Launcher {
    /// A program on this machine.
    Local {
        /// Executable.
        program: OsString,
        /// Arguments.
        args: Vec<OsString>,
    },
    /// A shell command line, e.g. `ssh gpu-box inference-host`, run with `sh -c`.
    Remote {
        /// Command line.
        shell: String,
    },
}

impl Launcher {
    /// Local program with arguments.
    pub fn local<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Launcher::Local {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Shell command line.
    pub fn remote(shell: impl Into<String>) -> Self {
        Launcher::Remote {
            shell: shell.into(),
        }
    }

    /// Whether the worker runs behind a shell command and cannot read local files.
    pub fn is_remote(&self) -> bool {
        matches!(self, Launcher::Remote { .. })
    }

    fn command(&self) -> Command {
        match self {
            Launcher::Local { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            Launcher::Remote { shell } => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(shell);
                command
            }
        }
    }

    /// Starts the process with all three standard streams piped.
    pub fn spawn(&self) -> io::Result<Child> {
        self.command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}
