use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.db_dir().join("history.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn task_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("tasks")
    }

    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir().join(format!("{task_id}.jsonl"))
    }

    /// `n`-th rotated log of a task; 1 is the most recent.
    pub fn task_log_backup_path(&self, task_id: &str, n: usize) -> PathBuf {
        self.task_logs_dir().join(format!("{task_id}.{n}.jsonl"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.cache_dir().join("sessions")
    }

    pub fn session_cookie_path(&self, task_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{task_id}.cookies"))
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.task_logs_dir())?;
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }
}
