//! svndiff0 window codec
//!
//! DELTA representations store their payload as an svndiff stream: the
//! magic `SVN\0`, then windows.  Each window carries five variable-length
//! integers (source view offset and length, target view length,
//! instruction byte count, new-data byte count) followed by the
//! instruction bytes and the new data.  Instructions copy from the source
//! view, from the already-reconstructed part of the target view
//! (possibly self-overlapping), or from the new-data stream.

use crate::error::{FsError, Result};

const MAGIC: &[u8; 4] = b"SVN\0";

/// Target bytes encoded per window.
pub const WINDOW_SIZE: usize = 100 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub sview_offset: u64,
    pub sview_len: usize,
    pub tview_len: usize,
    pub instructions: Vec<Instruction>,
    pub new_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Copy `len` bytes from source-view offset `offset`.
    CopySource { offset: u64, len: usize },
    /// Copy `len` bytes from target-view offset `offset`; may overlap
    /// the bytes being produced (pattern fill).
    CopyTarget { offset: u64, len: usize },
    /// Copy `len` bytes from the window's new-data stream.
    CopyNew { len: usize },
}

fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut bytes = [0u8; 10];
    let mut n = 0;
    loop {
        bytes[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i == 0 { 0 } else { 0x80 };
        out.push(bytes[i] | cont);
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| FsError::corrupt("Unexpected end of svndiff input"))?;
        *pos += 1;
        if value > u64::MAX >> 7 {
            return Err(FsError::corrupt("svndiff integer too large"));
        }
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn push_instruction(out: &mut Vec<u8>, instr: &Instruction) {
    let (selector, len, offset) = match *instr {
        Instruction::CopySource { offset, len } => (0u8, len, Some(offset)),
        Instruction::CopyTarget { offset, len } => (1u8, len, Some(offset)),
        Instruction::CopyNew { len } => (2u8, len, None),
    };
    if len > 0 && len < 64 {
        out.push((selector << 6) | len as u8);
    } else {
        out.push(selector << 6);
        push_varint(out, len as u64);
    }
    if let Some(offset) = offset {
        push_varint(out, offset);
    }
}

fn read_instruction(data: &[u8], pos: &mut usize) -> Result<Instruction> {
    let byte = *data
        .get(*pos)
        .ok_or_else(|| FsError::corrupt("Unexpected end of svndiff instructions"))?;
    *pos += 1;
    let selector = byte >> 6;
    let mut len = (byte & 0x3f) as u64;
    if len == 0 {
        len = read_varint(data, pos)?;
    }
    let len = len as usize;
    match selector {
        0 => Ok(Instruction::CopySource {
            offset: read_varint(data, pos)?,
            len,
        }),
        1 => Ok(Instruction::CopyTarget {
            offset: read_varint(data, pos)?,
            len,
        }),
        2 => Ok(Instruction::CopyNew { len }),
        _ => Err(FsError::corrupt("Invalid svndiff instruction selector")),
    }
}

/// Serialize a complete svndiff0 stream.
pub fn encode(windows: &[Window]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    for w in windows {
        let mut instr_bytes = Vec::new();
        for instr in &w.instructions {
            push_instruction(&mut instr_bytes, instr);
        }
        push_varint(&mut out, w.sview_offset);
        push_varint(&mut out, w.sview_len as u64);
        push_varint(&mut out, w.tview_len as u64);
        push_varint(&mut out, instr_bytes.len() as u64);
        push_varint(&mut out, w.new_data.len() as u64);
        out.extend_from_slice(&instr_bytes);
        out.extend_from_slice(&w.new_data);
    }
    out
}

/// Parse a complete svndiff stream into windows.
pub fn decode(data: &[u8]) -> Result<Vec<Window>> {
    if data.len() < 4 || &data[..3] != b"SVN" {
        return Err(FsError::corrupt("svndiff has no 'SVN' signature"));
    }
    if data[3] != 0 {
        return Err(FsError::corrupt(format!(
            "Unsupported svndiff version {}",
            data[3]
        )));
    }
    let mut pos = 4;
    let mut windows = Vec::new();
    while pos < data.len() {
        let sview_offset = read_varint(data, &mut pos)?;
        let sview_len = read_varint(data, &mut pos)? as usize;
        let tview_len = read_varint(data, &mut pos)? as usize;
        let instr_len = read_varint(data, &mut pos)? as usize;
        let new_len = read_varint(data, &mut pos)? as usize;
        if pos + instr_len + new_len > data.len() {
            return Err(FsError::corrupt("svndiff window overruns its stream"));
        }
        let instr_data = &data[pos..pos + instr_len];
        let mut ipos = 0;
        let mut instructions = Vec::new();
        while ipos < instr_data.len() {
            instructions.push(read_instruction(instr_data, &mut ipos)?);
        }
        pos += instr_len;
        let new_data = data[pos..pos + new_len].to_vec();
        pos += new_len;
        windows.push(Window {
            sview_offset,
            sview_len,
            tview_len,
            instructions,
            new_data,
        });
    }
    Ok(windows)
}

/// Apply one window against the full source text, appending the
/// reconstructed target view to `target`.
pub fn apply_window(window: &Window, source: &[u8], target: &mut Vec<u8>) -> Result<()> {
    let sview_start = window.sview_offset as usize;
    let sview_end = sview_start + window.sview_len;
    if sview_end > source.len() {
        return Err(FsError::corrupt("svndiff source view outside source"));
    }
    let sview = &source[sview_start..sview_end];

    let tview_start = target.len();
    let mut new_pos = 0;
    for instr in &window.instructions {
        match *instr {
            Instruction::CopySource { offset, len } => {
                let off = offset as usize;
                if off + len > sview.len() {
                    return Err(FsError::corrupt("svndiff copy outside source view"));
                }
                target.extend_from_slice(&sview[off..off + len]);
            }
            Instruction::CopyTarget { offset, len } => {
                let off = tview_start + offset as usize;
                if off > target.len() {
                    return Err(FsError::corrupt("svndiff copy outside target view"));
                }
                // Byte-at-a-time: the region may overlap what we are
                // producing, which is how pattern fills are encoded.
                for i in 0..len {
                    let b = target[off + i];
                    target.push(b);
                }
            }
            Instruction::CopyNew { len } => {
                if new_pos + len > window.new_data.len() {
                    return Err(FsError::corrupt("svndiff copy outside new data"));
                }
                target.extend_from_slice(&window.new_data[new_pos..new_pos + len]);
                new_pos += len;
            }
        }
    }
    if target.len() - tview_start != window.tview_len {
        return Err(FsError::corrupt(
            "svndiff window produced wrong target view length",
        ));
    }
    Ok(())
}

/// Apply a whole stream against `source`, yielding the full target text.
pub fn apply(data: &[u8], source: &[u8]) -> Result<Vec<u8>> {
    let mut target = Vec::new();
    for window in decode(data)? {
        apply_window(&window, source, &mut target)?;
    }
    Ok(target)
}

/// Encode `target` as a delta against `source`.
///
/// Source and target are chunked into parallel 100 KiB views.  Within a
/// view pair, the common prefix and suffix are emitted as source copies
/// and only the differing middle travels as new data, which keeps
/// append-style edits cheap without a full matching pass.
pub fn encode_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut windows = Vec::new();
    let mut offset = 0usize;
    loop {
        let tview_end = (offset + WINDOW_SIZE).min(target.len());
        let tview = &target[offset.min(target.len())..tview_end];
        // A window beyond the end of the source gets an empty view at
        // offset zero; a nonzero offset with no length would not pass
        // the reader's bounds checks.
        let (sview_offset, sview) = if offset < source.len() {
            let sview_end = (offset + WINDOW_SIZE).min(source.len());
            (offset as u64, &source[offset..sview_end])
        } else {
            (0u64, &[][..])
        };

        let mut instructions = Vec::new();
        let mut new_data = Vec::new();

        let prefix = common_prefix(sview, tview);
        let suffix = common_suffix(&sview[prefix..], &tview[prefix..]);
        if prefix > 0 {
            instructions.push(Instruction::CopySource {
                offset: 0,
                len: prefix,
            });
        }
        let middle = &tview[prefix..tview.len() - suffix];
        if !middle.is_empty() {
            instructions.push(Instruction::CopyNew { len: middle.len() });
            new_data.extend_from_slice(middle);
        }
        if suffix > 0 {
            instructions.push(Instruction::CopySource {
                offset: (sview.len() - suffix) as u64,
                len: suffix,
            });
        }

        windows.push(Window {
            sview_offset,
            sview_len: sview.len(),
            tview_len: tview.len(),
            instructions,
            new_data,
        });

        offset = tview_end;
        if offset >= target.len() {
            break;
        }
    }
    encode(&windows)
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip_small_edit() {
        let source = b"The quick brown fox jumps over the lazy dog".to_vec();
        let target = b"The quick red fox jumps over the lazy dog!".to_vec();
        let diff = encode_delta(&source, &target);
        assert_eq!(apply(&diff, &source).unwrap(), target);
    }

    #[test]
    fn test_delta_vs_empty_source() {
        let target = b"brand new contents\n".to_vec();
        let diff = encode_delta(&[], &target);
        assert_eq!(apply(&diff, &[]).unwrap(), target);
    }

    #[test]
    fn test_delta_empty_target() {
        let diff = encode_delta(b"something", &[]);
        assert_eq!(apply(&diff, b"something").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_append_only_edit_stays_small() {
        let source = vec![b'x'; 50_000];
        let mut target = source.clone();
        target.push(b'y');
        let diff = encode_delta(&source, &target);
        // One copy instruction plus one byte of new data, not a recopy.
        assert!(diff.len() < 64, "diff unexpectedly large: {}", diff.len());
        assert_eq!(apply(&diff, &source).unwrap(), target);
    }

    #[test]
    fn test_target_much_longer_than_source() {
        // Later windows fall entirely beyond the source.
        let source = b"short base".to_vec();
        let target: Vec<u8> = (0..(WINDOW_SIZE * 2 + 17)).map(|i| (i % 256) as u8).collect();
        let diff = encode_delta(&source, &target);
        assert_eq!(apply(&diff, &source).unwrap(), target);
    }

    #[test]
    fn test_multi_window_roundtrip() {
        let source: Vec<u8> = (0..(WINDOW_SIZE * 2 + 777))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut target = source.clone();
        target[3] = 0xff;
        target[WINDOW_SIZE + 10] = 0xfe;
        target.extend_from_slice(b"tail");
        let diff = encode_delta(&source, &target);
        assert_eq!(apply(&diff, &source).unwrap(), target);
    }

    #[test]
    fn test_self_overlapping_target_copy() {
        // A pattern fill: 1 byte of new data expanded to 9 bytes.
        let window = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 9,
            instructions: vec![
                Instruction::CopyNew { len: 1 },
                Instruction::CopyTarget { offset: 0, len: 8 },
            ],
            new_data: vec![b'a'],
        };
        let data = encode(&[window]);
        assert_eq!(apply(&data, &[]).unwrap(), b"aaaaaaaaa".to_vec());
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        assert!(apply(b"XXX\0", &[]).is_err());
        assert!(apply(b"SVN\x02", &[]).is_err());
    }

    #[test]
    fn test_rejects_truncated_window() {
        let diff = encode_delta(b"abc", b"abcdef");
        assert!(apply(&diff[..diff.len() - 2], b"abc").is_err());
    }
}
