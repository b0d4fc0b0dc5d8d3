use std::path::{Path, PathBuf};

use tracing::debug;

use crate::coordinator::BanRecord;
use crate::error::StateError;

/// Durable mirror of the ban table, one JSON record per line.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty table.
    pub async fn load(&self) -> Result<Vec<BanRecord>, StateError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| StateError::Parse {
                    path: self.path.clone(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    /// Writes a temporary sibling then renames it over the state file.
    pub async fn save<'a>(
        &self,
        records: impl IntoIterator<Item = &'a BanRecord>,
    ) -> Result<(), StateError> {
        let mut content = String::new();
        let mut count = 0;
        for record in records {
            let line = serde_json::to_string(record).map_err(StateError::Encode)?;
            content.push_str(&line);
            content.push('\n');
            count += 1;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        debug!(msg = "Saved ban table", path = %self.path.display(), count);
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
