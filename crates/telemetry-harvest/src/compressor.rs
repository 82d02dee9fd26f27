// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use flate2::write::GzEncoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::errors::CompressError;

pub const DEFAULT_GZIP_LEVEL: u32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Body encoding applied to every payload sent to the ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip(u32),
    Zstd(i32),
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip(DEFAULT_GZIP_LEVEL)
    }
}

impl Compression {
    /// Value of the `Content-Encoding` header matching this scheme.
    #[must_use]
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Compression::Gzip(_) => "GZIP",
            Compression::Zstd(_) => "zstd",
        }
    }

    /// Same scheme with a different level. Gzip levels are clamped to 0..=9.
    #[must_use]
    pub fn with_level(self, level: i32) -> Self {
        match self {
            Compression::Gzip(_) => {
                Compression::Gzip(u32::try_from(level.clamp(0, 9)).unwrap_or(DEFAULT_GZIP_LEVEL))
            }
            Compression::Zstd(_) => Compression::Zstd(level),
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        match self {
            Compression::Gzip(level) => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(*level));
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Zstd(level) => {
                let mut encoder = ZstdEncoder::new(Vec::new(), *level)?;
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Gzip(level) => write!(f, "gzip(level {level})"),
            Compression::Zstd(level) => write!(f, "zstd(level {level})"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gzip" | "gz" => Ok(Compression::Gzip(DEFAULT_GZIP_LEVEL)),
            "zstd" => Ok(Compression::Zstd(DEFAULT_ZSTD_LEVEL)),
            other => Err(format!("unsupported compression scheme: {other}")),
        }
    }
}
