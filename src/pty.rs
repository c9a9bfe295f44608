use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub enum SpawnCommand {
    /// An interactive shell ($SHELL, falling back to /bin/sh).
    Shell,
    /// An interactive shell that `exec`s the given program as its single
    /// command, so the program replaces the shell and its exit code becomes
    /// the session's exit code.
    Program(String),
}

impl Default for SpawnCommand {
    fn default() -> Self {
        SpawnCommand::Shell
    }
}

impl SpawnCommand {
    /// Human-readable display of the command for listings and logs.
    pub fn display(&self) -> String {
        match self {
            SpawnCommand::Shell => default_shell(),
            SpawnCommand::Program(program) => program.clone(),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

pub struct Pty {
    pair: PtyPair,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
}

impl Pty {
    /// Build the shell command for a [`SpawnCommand`], inheriting the
    /// caller's environment plus a sane TERM.
    pub fn build_command(command: &SpawnCommand, cwd: &Path) -> CommandBuilder {
        let shell = default_shell();
        let mut cmd = CommandBuilder::new(&shell);
        if let SpawnCommand::Program(program) = command {
            cmd.arg("-i");
            cmd.arg("-c");
            cmd.arg(format!("exec {program}"));
        }
        cmd.cwd(cwd);
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        cmd
    }

    pub fn spawn(rows: u16, cols: u16, cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;

        Ok(Self {
            pair,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.pair.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.pair.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle so a monitor task can `wait()` on
    /// it. Returns `None` if already taken.
    pub fn take_child(&mut self) -> Option<Box<dyn portable_pty::Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pair
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}
