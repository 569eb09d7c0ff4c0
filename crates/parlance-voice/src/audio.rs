//! Joining synthesized fragments into a single clip.
//!
//! MP3 streams are sequences of self-contained frames, so fragments can be
//! appended as they are once any leading ID3v2 tag is removed from all but
//! the first. WAV fragments each carry their own RIFF header; their PCM
//! payloads are merged under one rewritten header taken from the first
//! fragment.

use parlance_types::AudioEncoding;

/// Concatenates `clips` in order. Returns `None` if nothing usable remains.
pub fn concat_clips(encoding: AudioEncoding, clips: &[Vec<u8>]) -> Option<Vec<u8>> {
    let clips: Vec<&[u8]> = clips
        .iter()
        .map(Vec::as_slice)
        .filter(|c| !c.is_empty())
        .collect();
    if clips.is_empty() {
        return None;
    }

    match encoding {
        AudioEncoding::Mp3 => Some(concat_mp3(&clips)),
        AudioEncoding::Wav => concat_wav(&clips),
    }
}

fn concat_mp3(clips: &[&[u8]]) -> Vec<u8> {
    let total = clips.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(total);
    for (i, clip) in clips.iter().enumerate() {
        if i == 0 {
            out.extend_from_slice(clip);
        } else {
            out.extend_from_slice(&clip[id3v2_len(clip)..]);
        }
    }
    out
}

/// Length of a leading ID3v2 tag, or 0 if there is none.
fn id3v2_len(clip: &[u8]) -> usize {
    if clip.len() < 10 || &clip[..3] != b"ID3" {
        return 0;
    }
    // Tag size is a 28-bit syncsafe integer excluding the 10-byte header.
    let size = clip[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7f));
    let footer = if clip[5] & 0x10 != 0 { 10 } else { 0 };
    (10 + size + footer).min(clip.len())
}

struct WavParts<'a> {
    fmt: &'a [u8],
    data: &'a [u8],
}

fn parse_wav(bytes: &[u8]) -> Option<WavParts<'_>> {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }

    let mut fmt = None;
    let mut pos = 12usize;
    while pos.checked_add(8)? <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().ok()?) as usize;
        let start = pos + 8;
        // Streaming encoders may leave the size unset; clamp to what we have.
        let end = start.saturating_add(size).min(bytes.len());

        match id {
            b"fmt " => fmt = Some(&bytes[start..end]),
            b"data" => {
                return Some(WavParts {
                    fmt: fmt?,
                    data: &bytes[start..end],
                })
            }
            _ => {}
        }
        pos = start.saturating_add(size).saturating_add(size & 1);
    }
    None
}

fn concat_wav(clips: &[&[u8]]) -> Option<Vec<u8>> {
    let mut fmt: Option<&[u8]> = None;
    let mut payloads: Vec<&[u8]> = Vec::with_capacity(clips.len());

    for (i, clip) in clips.iter().enumerate() {
        let Some(parts) = parse_wav(clip) else {
            tracing::warn!(fragment = i, "skipping malformed wav fragment");
            continue;
        };
        match fmt {
            None => fmt = Some(parts.fmt),
            Some(first) if first != parts.fmt => {
                tracing::warn!(fragment = i, "skipping wav fragment with mismatched format");
                continue;
            }
            Some(_) => {}
        }
        payloads.push(parts.data);
    }

    let fmt = fmt?;
    let data_len: usize = payloads.iter().map(|p| p.len()).sum();
    if data_len == 0 {
        return None;
    }
    let fmt_pad = fmt.len() & 1;
    let riff_len = 4 + (8 + fmt.len() + fmt_pad) + (8 + data_len);

    let mut out = Vec::with_capacity(8 + riff_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&u32::try_from(riff_len).ok()?.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&u32::try_from(fmt.len()).ok()?.to_le_bytes());
    out.extend_from_slice(fmt);
    if fmt_pad == 1 {
        out.push(0);
    }
    out.extend_from_slice(b"data");
    out.extend_from_slice(&u32::try_from(data_len).ok()?.to_le_bytes());
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    Some(out)
}
