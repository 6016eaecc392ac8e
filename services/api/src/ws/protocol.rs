//! Frames of the telephony media-stream protocol.
//!
//! Inbound frames are tagged by `event` and carry a decimal-string
//! `sequenceNumber`; outbound frames are the three the relay ever sends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("sequence number '{0}' is not a decimal integer")]
    InvalidSequence(String),
    #[error("frame {got} arrived after frame {last}")]
    OutOfOrder { got: u64, last: u64 },
}

/// A frame received from the telephony provider.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyFrame {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StreamStart,
    },
    Media {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: InboundMedia,
    },
    Mark {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        mark: MarkLabel,
    },
    Dtmf {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        dtmf: Dtmf,
    },
    Stop {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        stop: Option<StreamStop>,
    },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InboundMedia {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    /// Milliseconds since the stream started, as a decimal string.
    #[serde(default)]
    pub timestamp: Option<String>,
    pub payload: String,
}

impl InboundMedia {
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.timestamp.as_deref().and_then(|t| t.parse().ok())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MarkLabel {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Dtmf {
    #[serde(default)]
    pub track: Option<String>,
    pub digit: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStop {
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
}

impl TelephonyFrame {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn sequence_number(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::Start {
                sequence_number, ..
            }
            | Self::Media {
                sequence_number, ..
            }
            | Self::Mark {
                sequence_number, ..
            }
            | Self::Dtmf {
                sequence_number, ..
            }
            | Self::Stop {
                sequence_number, ..
            } => sequence_number.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Start { .. } => "start",
            Self::Media { .. } => "media",
            Self::Mark { .. } => "mark",
            Self::Dtmf { .. } => "dtmf",
            Self::Stop { .. } => "stop",
        }
    }
}

/// A frame sent to the telephony provider.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkLabel,
    },
    /// Drops every buffered audio frame on the provider side.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundFrame {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia { payload },
        }
    }

    pub fn mark(stream_sid: &str, name: String) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkLabel { name },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

/// Enforces strictly increasing sequence numbers on one direction of a stream.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    /// Accepts the frame's sequence number or explains why it must be dropped.
    ///
    /// Frames that carry no sequence number are always accepted.
    pub fn accept(&mut self, sequence_number: Option<&str>) -> Result<(), FrameError> {
        let Some(raw) = sequence_number else {
            return Ok(());
        };
        let got = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| FrameError::InvalidSequence(raw.to_string()))?;
        if let Some(last) = self.last {
            if got <= last {
                return Err(FrameError::OutOfOrder { got, last });
            }
        }
        self.last = Some(got);
        Ok(())
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}
