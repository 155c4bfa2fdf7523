//! Stand-in capture devices: a test tone for audio and a test pattern for
//! video.

use async_trait::async_trait;

use super::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};

pub const AUDIO_LABEL: &str = "test-tone";
pub const VIDEO_LABEL: &str = "test-pattern";

#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices {
    /// Refuse every request as if the user denied permission.
    deny: bool,
}

impl SyntheticDevices {
    pub fn new(deny: bool) -> Self {
        Self { deny }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NothingRequested);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, AUDIO_LABEL));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, VIDEO_LABEL));
        }
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_and_video() {
        let devices = SyntheticDevices::default();
        let stream = tokio_test::block_on(devices.get_user_media(MediaConstraints::default()))
            .unwrap();
        let labels: Vec<&str> = stream.tracks().iter().map(|t| t.label()).collect();
        assert_eq!(labels, vec![AUDIO_LABEL, VIDEO_LABEL]);
        assert!(stream.tracks().iter().all(|t| t.is_enabled() && !t.is_ended()));
    }

    #[test]
    fn test_honours_constraints() {
        let devices = SyntheticDevices::default();
        let audio_only = MediaConstraints {
            audio: true,
            video: false,
        };
        let stream = tokio_test::block_on(devices.get_user_media(audio_only)).unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.tracks()[0].kind(), TrackKind::Audio);

        let nothing = MediaConstraints {
            audio: false,
            video: false,
        };
        assert!(matches!(
            tokio_test::block_on(devices.get_user_media(nothing)),
            Err(MediaError::NothingRequested)
        ));
    }

    #[test]
    fn test_deny() {
        let devices = SyntheticDevices::new(true);
        assert!(matches!(
            tokio_test::block_on(devices.get_user_media(MediaConstraints::default())),
            Err(MediaError::PermissionDenied)
        ));
    }

    #[test]
    fn test_fresh_tracks_per_request() {
        let devices = SyntheticDevices::default();
        let a = tokio_test::block_on(devices.get_user_media(MediaConstraints::default())).unwrap();
        let b = tokio_test::block_on(devices.get_user_media(MediaConstraints::default())).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.tracks()[0].id(), b.tracks()[0].id());
    }
}
