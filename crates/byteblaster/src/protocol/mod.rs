// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ByteBlaster wire protocol: XOR codec, checksums, models and the stream
//! decoder.

pub mod checksum;
pub mod decoder;
pub mod models;
pub mod xor;

pub use checksum::{calculate_checksum, inflate, looks_compressed, verify_checksum};
pub use decoder::{DecodeError, DecoderState, DecoderStats, ProtocolDecoder};
pub use models::{
    CompletedFile, Frame, QbtSegment, ServerAddr, ServerList, ServerListParseError,
    ServerParseError, FILLFILE_NAME,
};
pub use xor::{xor_decode, xor_encode, XorBuffer};
