//! `Accept-Encoding` negotiation and body encoding.
//!
//! Negotiation parses q-values, ignores `q=0` entries, and prefers brotli
//! over gzip at equal quality. Responses always carry
//! `Vary: Accept-Encoding`; `Content-Encoding` is only attached once an
//! encoded body is actually written.

use std::io::Write;

use crate::error::{Error, Result};

/// Encodings the response pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Brotli,
}

impl Encoding {
    /// Header token, None for identity.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
        }
    }

    /// Stable cache-key suffix.
    pub fn cache_suffix(&self) -> &'static str {
        match self {
            Encoding::Identity => "id",
            Encoding::Gzip => "gz",
            Encoding::Brotli => "br",
        }
    }
}

/// Picks the response encoding for an `Accept-Encoding` header.
pub fn negotiate(accept_encoding: Option<&str>) -> Encoding {
    let Some(raw) = accept_encoding else {
        return Encoding::Identity;
    };
    let mut best_gzip: Option<f64> = None;
    let mut best_brotli: Option<f64> = None;
    let mut wildcard: Option<f64> = None;
    for entry in raw.split(',') {
        let mut parts = entry.split(';');
        let name = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut quality = 1.0f64;
        for param in parts {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("q=") {
                quality = value.trim().parse().unwrap_or(0.0);
            }
        }
        if quality <= 0.0 {
            continue;
        }
        match name.as_str() {
            "br" => best_brotli = Some(best_brotli.map_or(quality, |q: f64| q.max(quality))),
            "gzip" | "x-gzip" => {
                best_gzip = Some(best_gzip.map_or(quality, |q: f64| q.max(quality)))
            }
            "*" => wildcard = Some(wildcard.map_or(quality, |q: f64| q.max(quality))),
            _ => {}
        }
    }
    // A wildcard admits both; named entries take their own quality.
    let brotli = best_brotli.or(wildcard);
    let gzip = best_gzip.or(wildcard);
    match (brotli, gzip) {
        (Some(b), Some(g)) if b >= g => Encoding::Brotli,
        (Some(_), Some(_)) => Encoding::Gzip,
        (Some(_), None) => Encoding::Brotli,
        (None, Some(_)) => Encoding::Gzip,
        (None, None) => Encoding::Identity,
    }
}

/// Encodes a finished body.
pub fn encode(encoding: Encoding, body: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(body)?;
                writer.flush()?;
            }
            Ok(out)
        }
    }
}

/// Decodes a body for round-trip tests.
pub fn decode(encoding: Encoding, body: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut out = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(body);
            std::io::Read::read_to_end(&mut decoder, &mut out)?;
            Ok(out)
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(body, 4096);
            std::io::Read::read_to_end(&mut reader, &mut out)
                .map_err(|err| Error::Internal(format!("brotli decode: {err}")))?;
            Ok(out)
        }
    }
}
