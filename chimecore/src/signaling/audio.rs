//! Attendee presence, mute, volume and signal strength from audio frames.

use std::collections::HashMap;

use super::events::{Attendee, SignalStrengthUpdate, SignalingEvent, VolumeUpdate};
use crate::proto::signal_rtc::{AudioMetadataFrame, AudioStreamIdInfoFrame};

const MAX_VOLUME_DB: f32 = -14.0;
const MIN_VOLUME_DB: f32 = -42.0;
const MAX_SIGNAL_STRENGTH: f32 = 2.0;
const EPSILON: f32 = 1e-6;

/// Maps a volume reported as positive attenuation in dB onto 0..=1.
pub fn normalize_volume(volume: u32) -> f32 {
    let db = -(volume as f32);
    let normalized = 1.0 - (db - MAX_VOLUME_DB) / (MIN_VOLUME_DB - MAX_VOLUME_DB);
    normalized.clamp(0.0, 1.0)
}

pub fn normalize_signal_strength(signal_strength: u32) -> f32 {
    (signal_strength as f32 / MAX_SIGNAL_STRENGTH).clamp(0.0, 1.0)
}

fn changed(previous: Option<&f32>, current: f32) -> bool {
    previous.is_none_or(|p| (p - current).abs() >= EPSILON)
}

/// Tracks audio stream ids to attendees and turns frames into deduplicated events.
///
/// Stream ids are never reused within a meeting and arrive in order, so a
/// higher stream id for the same attendee means they rejoined.
#[derive(Debug, Default)]
pub struct AudioFrameAdapter {
    stream_to_attendee: HashMap<u32, String>,
    stream_to_external_id: HashMap<u32, String>,
    attendee_to_stream: HashMap<String, u32>,
    muted: HashMap<String, bool>,
    volumes: HashMap<String, f32>,
    signal_strengths: HashMap<String, f32>,
}

impl AudioFrameAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn attendee_for(&self, stream_id: u32, attendee_id: &str) -> Attendee {
        Attendee {
            attendee_id: attendee_id.to_string(),
            external_user_id: self
                .stream_to_external_id
                .get(&stream_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn on_stream_id_info(&mut self, frame: &AudioStreamIdInfoFrame) -> Vec<SignalingEvent> {
        let mut events = Vec::new();

        for stream in &frame.streams {
            let Some(stream_id) = stream.audio_stream_id else {
                log::debug!(target: "Signaling/Audio", "Stream info without audio stream id, skipping");
                continue;
            };

            if let Some(attendee_id) = &stream.attendee_id {
                let external_user_id = stream.external_user_id.clone().unwrap_or_default();
                if !self.attendee_to_stream.contains_key(attendee_id) {
                    events.push(SignalingEvent::AttendeeJoined(Attendee {
                        attendee_id: attendee_id.clone(),
                        external_user_id: external_user_id.clone(),
                    }));
                }
                self.attendee_to_stream.insert(attendee_id.clone(), stream_id);
                self.stream_to_attendee.insert(stream_id, attendee_id.clone());
                self.stream_to_external_id.insert(stream_id, external_user_id);
            }

            if let Some(muted) = stream.muted {
                let Some(attendee_id) = self.stream_to_attendee.get(&stream_id).cloned() else {
                    log::debug!(target: "Signaling/Audio", "Mute update for unknown stream {stream_id}, skipping");
                    continue;
                };
                let previous = self.muted.insert(attendee_id.clone(), muted);
                if previous != Some(muted) && (previous.is_some() || muted) {
                    let attendee = self.attendee_for(stream_id, &attendee_id);
                    events.push(if muted {
                        SignalingEvent::AttendeeMuted(attendee)
                    } else {
                        SignalingEvent::AttendeeUnmuted(attendee)
                    });
                }
            }

            if stream.attendee_id.is_none() && stream.muted.is_none() {
                if let Some(event) = self.remove_stream(stream_id, stream.dropped.unwrap_or(false)) {
                    events.push(event);
                }
            }
        }
        events
    }

    fn remove_stream(&mut self, stream_id: u32, dropped: bool) -> Option<SignalingEvent> {
        let attendee_id = self.stream_to_attendee.remove(&stream_id)?;
        let external_user_id = self.stream_to_external_id.remove(&stream_id).unwrap_or_default();
        if self.attendee_to_stream.get(&attendee_id) == Some(&stream_id) {
            self.attendee_to_stream.remove(&attendee_id);
        }

        let rejoined = self
            .stream_to_attendee
            .iter()
            .any(|(other, id)| *id == attendee_id && *other > stream_id);
        if rejoined {
            return None;
        }

        let attendee = Attendee {
            attendee_id,
            external_user_id,
        };
        Some(if dropped {
            SignalingEvent::AttendeeDropped(attendee)
        } else {
            SignalingEvent::AttendeeLeft(attendee)
        })
    }

    pub fn on_audio_metadata(&mut self, frame: &AudioMetadataFrame) -> Vec<SignalingEvent> {
        let mut volume_updates = Vec::new();
        let mut signal_updates = Vec::new();

        for state in &frame.attendee_states {
            let Some(stream_id) = state.audio_stream_id else {
                continue;
            };
            let Some(attendee_id) = self.stream_to_attendee.get(&stream_id).cloned() else {
                log::trace!(target: "Signaling/Audio", "Metadata for unknown stream {stream_id}");
                continue;
            };

            if let Some(volume) = state.volume {
                let normalized = normalize_volume(volume);
                if changed(self.volumes.get(&attendee_id), normalized) {
                    volume_updates.push(VolumeUpdate {
                        attendee: self.attendee_for(stream_id, &attendee_id),
                        normalized_volume: normalized,
                    });
                }
                self.volumes.insert(attendee_id.clone(), normalized);
            }

            if let Some(signal) = state.signal_strength {
                let normalized = normalize_signal_strength(signal);
                if changed(self.signal_strengths.get(&attendee_id), normalized) {
                    signal_updates.push(SignalStrengthUpdate {
                        attendee: self.attendee_for(stream_id, &attendee_id),
                        normalized_signal_strength: normalized,
                    });
                }
                self.signal_strengths.insert(attendee_id, normalized);
            }
        }

        let mut events = Vec::new();
        if !volume_updates.is_empty() {
            events.push(SignalingEvent::VolumeUpdates(volume_updates));
        }
        if !signal_updates.is_empty() {
            events.push(SignalingEvent::SignalStrengthChanges(signal_updates));
        }
        events
    }
}
