use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Filesystem sentinel approximating "the manager has been initialized on
/// this host" across worker processes that share no memory.
///
/// Acquisition uses `O_CREAT|O_EXCL` semantics (`create_new`), so at most
/// one worker can win the flag — two workers cannot both conclude "not yet
/// initialized" and each run an independent queue. The file's content is an
/// informational unix-millisecond timestamp; its mere existence is the
/// flag. A sentinel left behind by a crashed process is indistinguishable
/// from a live one — clear it with `release()` or by deleting the file.
#[derive(Clone, Debug)]
pub struct RunSentinel {
    path: PathBuf,
}

impl RunSentinel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default sentinel location: the user runtime dir when available,
    /// falling back to the system temp dir.
    pub fn default_path() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("muxd-manager.run")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically acquire the sentinel. Returns `Ok(true)` if this call
    /// created it, `Ok(false)` if it already existed.
    pub fn acquire(&self) -> std::io::Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                let _ = writeln!(file, "{now_ms}");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the sentinel currently exists. Existence is necessary but
    /// not sufficient evidence that commands will be accepted.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Informational timestamp written at acquisition, if readable.
    pub fn started_at_ms(&self) -> Option<u64> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        contents.trim().parse().ok()
    }

    /// Remove the sentinel. Missing file is not an error.
    pub fn release(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
