//! Local transcript archive
//!
//! Writes the finished conversation to a markdown file in the user's
//! Documents folder, independent of remote persistence. The archive renders
//! the clean transcript: partial and hidden messages are left out.

use crate::message::{Channel, Message};
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Archive errors with contextual information
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Could not find Documents directory")]
    NoDocumentsDir,

    #[error("Transcript is empty")]
    EmptyTranscript,

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Default transcripts directory in the user's Documents folder
pub(crate) fn transcripts_dir() -> Option<PathBuf> {
    dirs::document_dir().map(|d| d.join("Colloquy").join("transcripts"))
}

fn ensure_transcripts_dir() -> Result<PathBuf, ArchiveError> {
    let dir = transcripts_dir().ok_or(ArchiveError::NoDocumentsDir)?;

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| ArchiveError::CreateDirectory {
            path: dir.clone(),
            source: e,
        })?;
        info!("Created transcripts directory: {:?}", dir);
    }

    Ok(dir)
}

/// Render the message log as a markdown transcript.
///
/// Each message becomes one line with a speaker label; the local channel is
/// "You", the remote channel "Them".
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Conversation {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M")
    ));
    for message in messages {
        let speaker = match message.channel {
            Channel::Local => "You",
            Channel::Remote => "Them",
        };
        out.push_str(&format!("**{}:** {}\n\n", speaker, message.text));
    }
    out
}

/// Save a rendered transcript to a timestamped markdown file.
///
/// Returns the path to the saved file.
pub fn save_transcript(messages: &[Message]) -> Result<PathBuf, ArchiveError> {
    if messages.is_empty() {
        return Err(ArchiveError::EmptyTranscript);
    }

    let dir = ensure_transcripts_dir()?;

    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let filename = format!("conversation-{}.md", timestamp);
    let filepath = dir.join(&filename);

    let mut file = fs::File::create(&filepath).map_err(|e| ArchiveError::CreateFile {
        path: filepath.clone(),
        source: e,
    })?;

    let rendered = render_transcript(messages);
    file.write_all(rendered.as_bytes())
        .map_err(|e| ArchiveError::WriteFile {
            path: filepath.clone(),
            source: e,
        })?;

    file.flush().map_err(|e| ArchiveError::WriteFile {
        path: filepath.clone(),
        source: e,
    })?;

    info!("Saved transcript to: {:?}", filepath);
    Ok(filepath)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_labels_channels() {
        let messages = vec![
            Message::manual(Channel::Local, "hello"),
            Message::manual(Channel::Remote, "hi there"),
        ];
        let rendered = render_transcript(&messages);
        assert!(rendered.contains("**You:** hello"));
        assert!(rendered.contains("**Them:** hi there"));
    }

    #[test]
    fn test_empty_log_is_rejected() {
        assert!(matches!(
            save_transcript(&[]),
            Err(ArchiveError::EmptyTranscript)
        ));
    }
}
