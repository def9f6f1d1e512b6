use std::collections::VecDeque;

use anyhow::Context;
use bytes::Bytes;
use codec_bus::buffer_flags;

use crate::config::RelayConfig;

pub struct AccessUnit {
    pub data: Bytes,
    pub presentation_time_us: i64,
    pub flags: u32,
}

/// Feeds access units to a decoding session.
pub enum AccessUnitSource {
    Synthetic {
        next: u32,
        frames: u32,
        interval_us: i64,
        key_frame_interval: u32,
    },
    AnnexB {
        units: VecDeque<Bytes>,
        next_pts: i64,
        interval_us: i64,
    },
}

impl AccessUnitSource {
    pub fn open(config: &RelayConfig) -> anyhow::Result<Self> {
        match &config.input {
            Some(path) => {
                let data = std::fs::read(path).with_context(|| format!("reading {}", path))?;
                let units = split_annex_b(Bytes::from(data));
                log::info!("{}: {} NAL units", path, units.len());
                Ok(AccessUnitSource::AnnexB {
                    units,
                    next_pts: 0,
                    interval_us: config.frame_interval_us,
                })
            }
            None => Ok(AccessUnitSource::Synthetic {
                next: 0,
                frames: config.frames,
                interval_us: config.frame_interval_us,
                key_frame_interval: config.key_frame_interval,
            }),
        }
    }

    pub fn next_access_unit(&mut self) -> Option<AccessUnit> {
        match self {
            AccessUnitSource::Synthetic {
                next,
                frames,
                interval_us,
                key_frame_interval,
            } => {
                if *next >= *frames {
                    return None;
                }
                let n = *next;
                *next += 1;
                let flags = if n % *key_frame_interval == 0 {
                    buffer_flags::KEY_FRAME
                } else {
                    0
                };
                Some(AccessUnit {
                    data: Bytes::from(format!("synthetic-au-{:06}", n)),
                    presentation_time_us: i64::from(n) * *interval_us,
                    flags,
                })
            }
            AccessUnitSource::AnnexB {
                units,
                next_pts,
                interval_us,
            } => {
                let data = units.pop_front()?;
                let flags = nal_flags(&data);
                let presentation_time_us = *next_pts;
                if flags & buffer_flags::CODEC_CONFIG == 0 {
                    *next_pts += *interval_us;
                }
                Some(AccessUnit {
                    data,
                    presentation_time_us,
                    flags,
                })
            }
        }
    }
}

/// Splits an H.264 Annex B stream at its start codes. Each unit keeps its
/// leading start code.
pub fn split_annex_b(data: Bytes) -> VecDeque<Bytes> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i);
            i += 3;
        } else {
            i += 1;
        }
    }
    if starts.is_empty() {
        return if data.is_empty() {
            VecDeque::new()
        } else {
            VecDeque::from([data])
        };
    }

    let mut units = VecDeque::with_capacity(starts.len());
    for (n, start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(data.len());
        units.push_back(data.slice(*start..end));
    }
    units
}

fn nal_flags(unit: &[u8]) -> u32 {
    let Some(header) = unit.get(3) else {
        return 0;
    };
    match header & 0x1f {
        5 => buffer_flags::KEY_FRAME,
        7 | 8 => buffer_flags::CODEC_CONFIG,
        _ => 0,
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
