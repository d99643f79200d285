//! Integration tests for phase switching and playlist regeneration

use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use venue_fleet::{
    actors::playback::PlaybackHandle,
    content::ContentSource,
    error::{PhaseError, PlaylistError},
    phase::{Phase, PhaseChange, PhaseMachine, PhaseStore},
    playlist::{PlaylistBuilder, PlaylistSource},
};

use crate::helpers::*;

fn machine(dir: &Path) -> PhaseMachine {
    PhaseMachine::restore(
        PhaseStore::new(dir.join("phase")),
        PlaylistBuilder::new(vec![dir.to_path_buf()], dir.join("playlist.txt")),
        ContentSource::new(dir.join("content.json")),
    )
}

#[test]
fn test_phase_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_media(dir.path(), &["kickoff.mp4"]);
    write_content(
        dir.path(),
        r#"{"timeCategories": {"after": ["kickoff.mp4"]}}"#,
    );

    let mut first = machine(dir.path());
    assert_eq!(first.current(), Phase::Neutral);
    assert_matches!(first.set_phase(Phase::After), Ok(PhaseChange::Changed(_)));
    drop(first);

    let restored = machine(dir.path());
    assert_eq!(restored.current(), Phase::After);
}

#[test]
fn test_unresolvable_content_keeps_previous_playlist() {
    let dir = tempfile::tempdir().unwrap();
    write_media(dir.path(), &["loop.mp4"]);
    write_content(dir.path(), r#"{"sponsorLoop": ["loop.mp4"]}"#);

    let mut machine = machine(dir.path());
    machine.rebuild().unwrap();
    let before = std::fs::read(dir.path().join("playlist.txt")).unwrap();

    std::fs::remove_file(dir.path().join("loop.mp4")).unwrap();
    let result = machine.set_phase(Phase::During);

    assert_matches!(
        result,
        Err(PhaseError::Rebuild(PlaylistError::NoMedia { phase: Phase::During }))
    );
    // the phase change itself stands
    assert_eq!(machine.current(), Phase::During);
    assert_eq!(std::fs::read(dir.path().join("playlist.txt")).unwrap(), before);
}

#[test]
fn test_phase_list_falls_back_to_sponsor_loop() {
    let dir = tempfile::tempdir().unwrap();
    write_media(dir.path(), &["loop.mp4"]);
    write_content(
        dir.path(),
        r#"{"sponsorLoop": ["loop.mp4"], "timeCategories": {"before": ["missing.mp4"]}}"#,
    );

    let mut machine = machine(dir.path());
    let change = machine.set_phase(Phase::Before).unwrap();

    assert_matches!(change, PhaseChange::Changed(report) => {
        assert_eq!(report.source, PlaylistSource::SponsorLoop);
        assert_eq!(report.entries.len(), 1);
    });
}

#[tokio::test]
async fn test_content_edit_triggers_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    write_media(dir.path(), &["loop.mp4", "halftime.mp4"]);
    write_content(dir.path(), r#"{"sponsorLoop": ["loop.mp4"]}"#);

    let playback = PlaybackHandle::spawn(machine(dir.path()), Duration::from_millis(50));
    assert_eq!(playback.status().await.unwrap().rebuilds, 1);

    // mtime granularity can be coarse, change the length as well
    tokio::time::sleep(Duration::from_millis(20)).await;
    write_content(
        dir.path(),
        r#"{"sponsorLoop": ["loop.mp4", "halftime.mp4"]}"#,
    );

    let rebuilt = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = playback.status().await.unwrap();
            if status.rebuilds >= 2 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("content change was not picked up");

    assert_eq!(rebuilt.last_rebuild.unwrap().entries.len(), 2);
    playback.shutdown().await.unwrap();
}
