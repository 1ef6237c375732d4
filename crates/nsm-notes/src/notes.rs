//! The note document managed by the session.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

const NOTE_EXTENSION: &str = ".txt";

/// A plain-text note stored next to the session's project path.
#[derive(Debug, Default)]
pub struct Note {
    path: Option<PathBuf>,
    content: String,
    dirty: bool,
}

impl Note {
    /// File backing the project at `project`: the project path plus `.txt`.
    #[must_use]
    pub fn file_for(project: &Path) -> PathBuf {
        let mut name = OsString::from(project.as_os_str());
        name.push(NOTE_EXTENSION);
        PathBuf::from(name)
    }

    /// Switch to the note for `project`, creating an empty one if needed.
    ///
    /// Unsaved changes to the previous note are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its directory cannot be created or read.
    pub fn open(&mut self, project: &Path) -> io::Result<()> {
        let path = Self::file_for(project);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::write(&path, "")?;
                String::new()
            }
            Err(e) => return Err(e),
        };
        self.path = Some(path);
        self.dirty = false;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if no note is open or the file cannot be written.
    pub fn save(&mut self) -> io::Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| io::Error::other("no note is open"))?;
        std::fs::write(path, &self.content)?;
        self.dirty = false;
        Ok(())
    }

    /// Append a line. Returns `true` when this made a clean note dirty.
    pub fn append(&mut self, line: &str) -> bool {
        self.content.push_str(line);
        self.content.push('\n');
        let newly_dirty = !self.dirty;
        self.dirty = true;
        newly_dirty
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }
}
