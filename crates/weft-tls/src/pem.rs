//! PEM parsing for certificates and private keys (RFC 7468).
//!
//! Legacy OpenSSL encryption headers (`Proc-Type`, `DEK-Info`) are kept on
//! the block so encrypted keys can be told apart from plain ones.

use base64::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum PemError {
    #[error("invalid PEM format: {0}")]
    InvalidFormat(String),
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("no PEM blocks found")]
    NoPemBlocks,
}

/// One `-----BEGIN LABEL-----` ... `-----END LABEL-----` block.
#[derive(Debug)]
pub struct PemBlock {
    pub label: String,
    /// RFC 1421 style `Name: value` lines between the BEGIN marker and the
    /// base64 body.
    pub headers: Vec<(String, String)>,
    pub contents: Vec<u8>,
}

impl PemBlock {
    /// True for `ENCRYPTED PRIVATE KEY` blocks and for legacy blocks carrying
    /// `Proc-Type: 4,ENCRYPTED`.
    pub fn is_encrypted(&self) -> bool {
        self.label == "ENCRYPTED PRIVATE KEY"
            || self.headers.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case("Proc-Type") && value.contains("ENCRYPTED")
            })
    }
}

/// Parses every PEM block in `input`. Text outside blocks is ignored.
pub fn parse_pem(input: &[u8]) -> Result<Vec<PemBlock>, PemError> {
    let text = std::str::from_utf8(input)
        .map_err(|_| PemError::InvalidFormat("not valid UTF-8".to_string()))?;

    let mut blocks = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let Some(label) = marker(line.trim(), "-----BEGIN ") else {
            continue;
        };
        let label = label.to_string();
        let mut headers = Vec::new();
        let mut body = String::new();
        let mut terminated = false;

        for line in lines.by_ref() {
            let line = line.trim();
            if let Some(end_label) = marker(line, "-----END ") {
                if end_label != label {
                    return Err(PemError::InvalidFormat(format!(
                        "mismatched PEM markers: BEGIN {label} but END {end_label}"
                    )));
                }
                terminated = true;
                break;
            }
            if body.is_empty() {
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                    continue;
                }
            }
            body.push_str(line);
        }

        if !terminated {
            return Err(PemError::InvalidFormat(format!("missing END {label} marker")));
        }
        let contents = BASE64_STANDARD.decode(body.as_bytes())?;
        blocks.push(PemBlock {
            label,
            headers,
            contents,
        });
    }

    if blocks.is_empty() {
        return Err(PemError::NoPemBlocks);
    }
    Ok(blocks)
}

fn marker<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix("-----")
}
