use std::ops::Range;

use anyhow::Context;
use serde::Deserialize;
use serde_with::{serde_as, Bytes};
use sha1::{Digest, Sha1};

use crate::layout::PieceHash;

const MAX_NESTING_DEPTH: usize = 64;

/// Multiple File Mode info
#[derive(Debug, Deserialize)]
pub struct File {
    /// A list containing one or more string elements that together represent the path and filename.
    /// "dir1/dir2/file.ext" -> ["dir1", "dir2", "file.ext"]
    pub path: Vec<String>,
    /// Length of the file in bytes
    pub length: u64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Info {
    /// Filename (Single File Mode) / Name of the directory (Multi File Mode)
    pub name: String,
    /// Concatenated piece hashes (20-byte SHA1 hash values). Must be a multiple of 20
    #[serde_as(as = "Bytes")]
    pub pieces: Vec<u8>,
    /// Number of bytes in each piece
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// Length of the file in bytes (Single File Mode)
    #[serde(default)]
    pub length: Option<u64>,
    /// A list of Files (Multi File Mode)
    #[serde(default)]
    pub files: Option<Vec<File>>,
    /// External peer source (Can be either 0 or 1)
    #[serde(default)]
    pub private: Option<u8>,
}

impl Info {
    /// Files are laid out back to back, so the content length is the sum of their lengths
    pub fn total_length(&self) -> anyhow::Result<u64> {
        match (self.length, self.files.as_deref()) {
            (Some(length), _) => Ok(length),
            (None, Some(files)) => files.iter().try_fold(0u64, |total, file| {
                total
                    .checked_add(file.length)
                    .context("total length of the files overflows u64")
            }),
            (None, None) => anyhow::bail!("Malformed torrent file: both 'files' and 'length' fields are missing"),
        }
    }

    pub fn piece_hashes(&self) -> anyhow::Result<Vec<PieceHash>> {
        anyhow::ensure!(
            self.pieces.len() % 20 == 0,
            "length of 'pieces' is not a multiple of 20: {}",
            self.pieces.len()
        );

        self.pieces
            .chunks_exact(20)
            .map(|piece_hash| try_into!(piece_hash, PieceHash))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct MetaInfo {
    /// Description of the file(s) of the torrent
    pub info: Info,
    /// The announce URL of the tracker. Trackerless torrents don't have one
    #[serde(default)]
    pub announce: Option<String>,
    /// The string encoding that is used in the info.pieces
    #[serde(default)]
    pub encoding: Option<String>,
    /// A list of annouce URLs of trackers. Is used if the multitracker specification is supported
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The creation time of the torrent (UNIX epoch format)
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<u64>,
    /// Free-form comments of the author
    #[serde(default)]
    pub comment: Option<String>,
    /// Name and version of the program used to create the Metainfo file
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

/// Immutable description of the torrent's content
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    name: String,
    info_hash: [u8; 20],
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<PieceHash>,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<u64>,
    encoding: Option<String>,
    private: bool,
}

impl TorrentDescriptor {
    pub fn new(
        info_hash: [u8; 20],
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<PieceHash>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(piece_length > 0, "piece length must be positive");
        try_into!(piece_length, usize)?;

        let expected_pieces = total_length.div_ceil(piece_length);
        anyhow::ensure!(
            expected_pieces == piece_hashes.len() as u64,
            "expected {} piece hashes for {} bytes split into {}-byte pieces, got {}",
            expected_pieces,
            total_length,
            piece_length,
            piece_hashes.len()
        );
        try_into!(piece_hashes.len(), u32)?;

        Ok(TorrentDescriptor {
            name: String::new(),
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
            announce: None,
            announce_list: Vec::new(),
            comment: None,
            created_by: None,
            creation_date: None,
            encoding: None,
            private: false,
        })
    }

    /// Parses a bencoded torrent file
    pub fn from_bytes(torrent_file: &[u8]) -> anyhow::Result<Self> {
        let meta_info: MetaInfo =
            serde_bencode::from_bytes(torrent_file).context("error while parsing the torrent file")?;

        let info_span = info_dict_span(torrent_file).context("error while locating the info dictionary")?;
        let info_hash: [u8; 20] = Sha1::digest(&torrent_file[info_span]).into();

        let piece_hashes = meta_info.info.piece_hashes()?;
        let total_length = meta_info.info.total_length()?;

        let mut descriptor = TorrentDescriptor::new(info_hash, meta_info.info.piece_length, total_length, piece_hashes)
            .context("inconsistent torrent info")?;
        descriptor.name = meta_info.info.name;
        descriptor.private = meta_info.info.private == Some(1);
        descriptor.announce = meta_info.announce;
        descriptor.announce_list = meta_info.announce_list.unwrap_or_default();
        descriptor.comment = meta_info.comment;
        descriptor.created_by = meta_info.created_by;
        descriptor.creation_date = meta_info.creation_date;
        descriptor.encoding = meta_info.encoding;

        Ok(descriptor)
    }

    /// Loads a torrent file either from an http(s) URL or from the local filesystem
    #[tracing::instrument(level = "error", err(level = "debug"))]
    pub async fn load(source: &str) -> anyhow::Result<Self> {
        let torrent_file = if source.starts_with("http://") || source.starts_with("https://") {
            reqwest::get(source)
                .await
                .context("requesting the torrent file")?
                .error_for_status()
                .context("the torrent file server returned an error")?
                .bytes()
                .await
                .context("unable to get the torrent file body")?
                .to_vec()
        } else if source.starts_with("magnet:") {
            anyhow::bail!("magnet links aren't supported: piece hashes are needed upfront");
        } else {
            tokio::fs::read(source)
                .await
                .with_context(|| format!("error while reading the torrent file: {source}"))?
        };

        Self::from_bytes(&torrent_file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA1 hash of the original bencoded info dictionary
    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_hashes(&self) -> &[PieceHash] {
        &self.piece_hashes
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn announce_list(&self) -> &[Vec<String>] {
        &self.announce_list
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    /// UNIX timestamp
    pub fn creation_date(&self) -> Option<u64> {
        self.creation_date
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn is_private(&self) -> bool {
        self.private
    }
}

/// Finds the exact bytes of the top-level `info` value.
///
/// The info hash must be computed over these bytes as they are, since re-encoding the parsed
/// struct would drop unknown keys and normalize the key order.
fn info_dict_span(torrent_file: &[u8]) -> anyhow::Result<Range<usize>> {
    anyhow::ensure!(
        torrent_file.first() == Some(&b'd'),
        "torrent file is not a bencoded dictionary"
    );

    let mut pos = 1;
    loop {
        match torrent_file.get(pos) {
            Some(b'e') => anyhow::bail!("torrent file has no 'info' dictionary"),
            Some(_) => {
                let (key, value_start) = parse_string(torrent_file, pos)?;
                let value_end = skip_value(torrent_file, value_start, 1)?;
                if key == b"info" {
                    return Ok(value_start..value_end);
                }
                pos = value_end;
            }
            None => anyhow::bail!("unexpected end of the torrent file"),
        }
    }
}

/// Returns the payload of a bencoded string and the position right after it
fn parse_string(data: &[u8], pos: usize) -> anyhow::Result<(&[u8], usize)> {
    let delimiter = data[pos..]
        .iter()
        .position(|byte| *byte == b':')
        .map(|offset| pos + offset)
        .with_context(|| format!("expected a string at {pos}"))?;
    let length: usize = std::str::from_utf8(&data[pos..delimiter])
        .ok()
        .and_then(|length| length.parse().ok())
        .with_context(|| format!("bad string length at {pos}"))?;

    let start = delimiter + 1;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .with_context(|| format!("string at {pos} runs past the end of the torrent file"))?;

    Ok((&data[start..end], end))
}

/// Returns the position right after the bencoded value that starts at `pos`
fn skip_value(data: &[u8], pos: usize, depth: usize) -> anyhow::Result<usize> {
    anyhow::ensure!(depth <= MAX_NESTING_DEPTH, "torrent file is nested too deeply");

    match data.get(pos) {
        Some(b'i') => data[pos..]
            .iter()
            .position(|byte| *byte == b'e')
            .map(|offset| pos + offset + 1)
            .with_context(|| format!("expected closing delimiter for integer at {pos}")),
        Some(b'l' | b'd') => {
            // Dictionary keys are strings, so keys and values can be skipped the same way
            let mut pos = pos + 1;
            loop {
                match data.get(pos) {
                    Some(b'e') => return Ok(pos + 1),
                    Some(_) => pos = skip_value(data, pos, depth + 1)?,
                    None => anyhow::bail!("unterminated list or dictionary"),
                }
            }
        }
        Some(b'0'..=b'9') => parse_string(data, pos).map(|(_, end)| end),
        Some(other) => anyhow::bail!("unexpected byte {:#04x} at {}", other, pos),
        None => anyhow::bail!("unexpected end of the torrent file"),
    }
}
