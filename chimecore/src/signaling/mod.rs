//! Signaling protocol: the I/O-free state machine and the pieces it uses.
//!
//! The machine consumes transport notifications and inbound messages and
//! answers with [`Action`]s. Executing them (sending, logging, feeding the
//! media pipeline) is the caller's job, which keeps every protocol decision
//! testable without a socket.

pub mod audio;
pub mod data_message;
pub mod events;
mod machine;

pub use audio::AudioFrameAdapter;
pub use data_message::{
    DataMessage, DataMessageReceived, DataMessageSendError, DataMessageSendErrorReason,
    DataMessageToSend,
};
pub use events::{
    Attendee, FailureReason, MediaParameters, RemoteVideoSource, SignalStrengthUpdate,
    SignalingEvent, TurnCredentials, VolumeUpdate,
};
pub use machine::{Action, MAX_MISSED_PINGS, SignalingConfig, SignalingMachine};
