use std::path::{Path, PathBuf};

/// Manages the `.watchbench/` directory layout.
///
/// Everything watchbench writes besides the fixtures themselves lives under a
/// single data directory (default `.watchbench/`).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.watchbench/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the SQLite run history.
    pub fn history_db(&self) -> PathBuf {
        self.root.join("history.db")
    }

    /// Path to the per-invocation JSON results directory.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Path to one invocation's results file (e.g. `results/20261019T101500Z.json`).
    pub fn result_file(&self, run_id: &str) -> PathBuf {
        self.results_dir().join(format!("{run_id}.json"))
    }

    /// Create root and results/ if missing.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.results_dir())?;
        Ok(created)
    }

    /// Ensure the data directory is initialized, creating it if missing.
    /// Also appends it to .gitignore if a .gitignore exists next to it.
    pub fn ensure_initialized(&self) -> std::io::Result<()> {
        if self.init()? {
            tracing::debug!(root = %self.root.display(), "created data directory");
        }
        self.update_gitignore()?;
        Ok(())
    }

    /// Append the data directory to .gitignore if:
    /// 1. A .gitignore file exists in the data directory's parent
    /// 2. It doesn't already contain the entry
    pub fn update_gitignore(&self) -> std::io::Result<()> {
        let gitignore_dir = match self.root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let gitignore_path = gitignore_dir.join(".gitignore");

        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.to_string_lossy().to_string());
        let entry = format!("{dir_name}/");

        if gitignore_path.exists() {
            let contents = std::fs::read_to_string(&gitignore_path)?;
            let already_present = contents.lines().any(|line| {
                let trimmed = line.trim();
                trimmed == entry || trimmed == dir_name
            });
            if !already_present {
                let prefix = if contents.ends_with('\n') || contents.is_empty() {
                    ""
                } else {
                    "\n"
                };
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&gitignore_path)?;
                use std::io::Write;
                writeln!(file, "{prefix}{entry}")?;
            }
        }
        // If no .gitignore exists, don't create one
        Ok(())
    }
}
