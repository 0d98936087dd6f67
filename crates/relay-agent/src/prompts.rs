//! Prompt files and per-agent transcripts.
//!
//! Base prompts are `<agent>.conv` files anywhere under the prompts
//! directory.  Each agent's transcript mirrors its base prompt's relative
//! path under `<prompts_dir>/.histo/`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::entities::{Conversation, Message, TRANSCRIPT_SEPARATOR};
use crate::error::{AgentError, Result};

/// File extension of prompt and transcript files.
pub const PROMPT_EXTENSION: &str = "conv";

/// Directory under the prompts root that holds transcripts.
pub const HISTORY_DIR: &str = ".histo";

/// Number of transcript turns `promptHisto` includes.
pub const HISTORY_WINDOW: usize = 12;

/// Locates base prompts and transcripts under one root directory.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    root: PathBuf,
}

impl PromptLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(agent: &str) -> String {
        format!("{agent}.{PROMPT_EXTENSION}")
    }

    /// Path of the agent's base prompt, if one exists.
    pub fn find_base_prompt(&self, agent: &str) -> Option<PathBuf> {
        let wanted = Self::file_name(agent);
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && entry.file_name() == HISTORY_DIR))
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_file() && entry.file_name() == wanted.as_str())
            .map(|entry| entry.into_path())
    }

    /// The agent's base prompt.
    pub fn base_prompt(&self, agent: &str) -> Result<Conversation> {
        let path = self.find_base_prompt(agent).ok_or_else(|| AgentError::PromptNotFound {
            agent: agent.to_string(),
            root: self.root.clone(),
        })?;
        debug!(agent, path = %path.display(), "loading base prompt");
        Conversation::load(&path)
    }

    /// The agent's transcript.
    pub fn transcript(&self, agent: &str) -> Transcript {
        let history_root = self.root.join(HISTORY_DIR);
        let path = self
            .find_base_prompt(agent)
            .and_then(|base| base.strip_prefix(&self.root).ok().map(|rel| history_root.join(rel)))
            .unwrap_or_else(|| history_root.join(Self::file_name(agent)));
        Transcript { path }
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// Append-only history of one agent's turns.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
}

impl Transcript {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored turns; a missing or unreadable file reads as empty.
    pub fn load(&self) -> Conversation {
        match Conversation::load(&self.path) {
            Ok(conv) => conv,
            Err(AgentError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Conversation::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable transcript, treating as empty");
                Conversation::new()
            }
        }
    }

    /// The last `n` stored turns.
    pub fn tail(&self, n: usize) -> Conversation {
        self.load().tail(n)
    }

    /// Append `message` unless it repeats the last stored turn exactly.
    /// Returns whether the transcript grew.
    ///
    /// Existing text is never rewritten: the new block is appended to the
    /// file even when the stored history does not parse.
    pub fn append(&self, message: &Message) -> Result<bool> {
        let existing = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        match Conversation::parse_transcript(&existing) {
            Ok(history) if history.last().is_some_and(|last| last.same_turn(message)) => {
                debug!(path = %self.path.display(), "skipping duplicate transcript turn");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "transcript does not parse, appending without duplicate check"
            ),
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if !existing.trim().is_empty() {
            write!(file, "\n\n{TRANSCRIPT_SEPARATOR}\n\n")?;
        }
        write!(file, "{}:{}", message.role, message.content)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Role;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn base_prompt_is_found_recursively() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("team/writer.conv"), "system: write well");
        let library = PromptLibrary::new(dir.path());

        let prompt = library.base_prompt("writer").unwrap();
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt.messages()[0].role, Role::System);

        let err = library.base_prompt("reader").unwrap_err();
        assert!(matches!(err, AgentError::PromptNotFound { .. }));
    }

    #[test]
    fn history_dir_is_not_searched_for_base_prompts() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join(".histo/ghost.conv"), "user: old");
        let library = PromptLibrary::new(dir.path());
        assert!(library.find_base_prompt("ghost").is_none());
    }

    #[test]
    fn transcript_mirrors_base_prompt_path() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("team/writer.conv"), "system: hi");
        let library = PromptLibrary::new(dir.path());

        assert_eq!(
            library.transcript("writer").path(),
            dir.path().join(".histo/team/writer.conv")
        );
        assert_eq!(
            library.transcript("loner").path(),
            dir.path().join(".histo/loner.conv")
        );
    }

    #[test]
    fn append_suppresses_exact_repeat_only() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = Transcript::at(dir.path().join("a.conv"));

        assert!(transcript.append(&Message::user("hello")).unwrap());
        assert!(!transcript.append(&Message::user("hello")).unwrap());
        assert!(transcript.append(&Message::assistant("hello")).unwrap());
        assert!(transcript.append(&Message::user("hello")).unwrap());

        assert_eq!(transcript.load().len(), 3);
    }

    #[test]
    fn unreadable_transcript_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conv");
        fs::write(&path, "no role prefix here").unwrap();

        let transcript = Transcript::at(&path);
        assert!(transcript.load().is_empty());
        assert!(Transcript::at(dir.path().join("missing.conv")).load().is_empty());
    }

    #[test]
    fn append_never_discards_unparsed_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.conv");
        let original = format!(
            "user:one\n\n{TRANSCRIPT_SEPARATOR}\n\nassistant:two\n\n{TRANSCRIPT_SEPARATOR}\n\nnarrator:three"
        );
        fs::write(&path, &original).unwrap();

        let transcript = Transcript::at(&path);
        assert!(transcript.append(&Message::user("four")).unwrap());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(&original));
        let blocks: Vec<&str> = text
            .split(TRANSCRIPT_SEPARATOR)
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect();
        assert_eq!(blocks, ["user:one", "assistant:two", "narrator:three", "user:four"]);
    }

    #[test]
    fn appended_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = Transcript::at(dir.path().join("nested/b.conv"));
        transcript.append(&Message::system("rules")).unwrap();
        transcript.append(&Message::assistant("multi\nline")).unwrap();

        let history = transcript.load();
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].content, "multi\nline");
    }
}
