use crate::paths::AppPaths;
use crate::Result;
use std::path::{Path, PathBuf};

const CONSENT_COOKIE: &str = "youtube.com\tFALSE\t/\tFALSE\t0\tCONSENT\tYES+42\n";

/// Scratch resources opened for one task's engine invocations. The cookie
/// file is removed when the session is dropped, whichever way the executor
/// exits.
#[derive(Debug)]
pub struct TaskSession {
    cookie_path: PathBuf,
}

impl TaskSession {
    pub fn open(paths: &AppPaths, task_id: &str) -> Result<Self> {
        let dir = paths.sessions_dir();
        std::fs::create_dir_all(&dir)?;
        let cookie_path = paths.session_cookie_path(task_id);

        let mut contents = String::from("# Netscape HTTP Cookie File\n");
        contents.push_str(CONSENT_COOKIE);
        std::fs::write(&cookie_path, contents)?;
        Ok(Self { cookie_path })
    }

    pub fn cookie_path(&self) -> &Path {
        &self.cookie_path
    }
}

impl Drop for TaskSession {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.cookie_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.cookie_path.display(),
                    error = %e,
                    "failed to remove session cookie file"
                );
            }
        }
    }
}
