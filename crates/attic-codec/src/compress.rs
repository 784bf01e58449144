// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::io::{Read, Write};

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FileCompression {
    None,
    #[default]
    Gzip,
}

impl FileCompression {
    pub fn compress(&self, data: &[u8], level: u32) -> io::Result<Vec<u8>> {
        match self {
            FileCompression::None => Ok(data.to_vec()),
            FileCompression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    pub fn decompress(&self, bytes: Bytes) -> io::Result<Vec<u8>> {
        match self {
            FileCompression::None => Ok(bytes.to_vec()),
            FileCompression::Gzip => {
                let mut decoder = GzDecoder::new(bytes.reader());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    pub fn file_suffix(&self) -> &'static str {
        match self {
            FileCompression::None => "jsonl",
            FileCompression::Gzip => "jsonl.gz",
        }
    }
}
