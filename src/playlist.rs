//! Playlist construction
//!
//! The output is a concat-demuxer list, one `file '<absolute path>'` line per entry. It is
//! regenerated from scratch on every rebuild and swapped in with a rename; a rebuild that
//! resolves no media leaves the previous file alone.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{content::ContentConfig, error::PlaylistError, phase::Phase, util::write_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub absolute_path: PathBuf,
    pub display_name: String,
}

impl PlaylistEntry {
    fn new(absolute_path: PathBuf) -> Self {
        let display_name = absolute_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            absolute_path,
            display_name,
        }
    }
}

/// Which list a rebuild ended up using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistSource {
    /// The list belonging to the phase (the sponsor loop for `neutral`)
    Phase,
    SponsorLoop,
    /// before, during and after concatenated
    AllCategories,
}

impl fmt::Display for PlaylistSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaylistSource::Phase => "phase list",
            PlaylistSource::SponsorLoop => "sponsor loop",
            PlaylistSource::AllCategories => "all categories",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub phase: Phase,
    pub source: PlaylistSource,
    pub entries: Vec<PlaylistEntry>,
}

/// Resolve candidate names against `base_dirs`, first hit wins. Absolute candidates are
/// taken as they are. Anything that does not exist is skipped.
pub fn resolve(candidates: &[String], base_dirs: &[PathBuf]) -> Vec<PlaylistEntry> {
    let mut entries = vec![];

    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }

        let path = Path::new(candidate);
        let found = if path.is_absolute() {
            path.is_file().then(|| path.to_path_buf())
        } else {
            base_dirs
                .iter()
                .map(|dir| dir.join(path))
                .find(|joined| joined.is_file())
        };

        match found {
            Some(found) => {
                let absolute = std::path::absolute(&found).unwrap_or(found);
                entries.push(PlaylistEntry::new(absolute));
            }
            None => warn!("skipping missing media {candidate}"),
        }
    }

    entries
}

/// Pick the entries for `phase`, falling back to the sponsor loop and then to every
/// category so that nothing resolvable is ever left unplayed.
pub fn select_media(
    phase: Phase,
    content: &ContentConfig,
    base_dirs: &[PathBuf],
) -> Result<(PlaylistSource, Vec<PlaylistEntry>), PlaylistError> {
    let mut chain = vec![(PlaylistSource::Phase, content.list_for(phase).to_vec())];
    if phase != Phase::Neutral {
        chain.push((PlaylistSource::SponsorLoop, content.sponsor_loop.clone()));
    }
    chain.push((PlaylistSource::AllCategories, content.all_categories()));

    for (source, candidates) in chain {
        if candidates.is_empty() {
            debug!("{source} for {phase} is empty");
            continue;
        }
        let entries = resolve(&candidates, base_dirs);
        if !entries.is_empty() {
            return Ok((source, entries));
        }
        debug!("{source} for {phase} resolved no media");
    }

    Err(PlaylistError::NoMedia { phase })
}

fn escape(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}

pub fn render(entries: &[PlaylistEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("file '{}'\n", escape(&entry.absolute_path)))
        .collect()
}

/// Writes the playlist file consumed by the external player
#[derive(Debug, Clone)]
pub struct PlaylistBuilder {
    base_dirs: Vec<PathBuf>,
    output: PathBuf,
}

impl PlaylistBuilder {
    pub fn new(base_dirs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            base_dirs,
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn rebuild(
        &self,
        phase: Phase,
        content: &ContentConfig,
    ) -> Result<RebuildReport, PlaylistError> {
        let (source, entries) = select_media(phase, content, &self.base_dirs)?;
        write_atomic(&self.output, render(&entries).as_bytes())?;

        info!(
            "wrote {} entries for {phase} ({source}) to {}",
            entries.len(),
            self.output.display()
        );
        Ok(RebuildReport {
            phase,
            source,
            entries,
        })
    }
}
