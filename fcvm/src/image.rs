//! ELF64 image parsing and building. Only the execution view is consumed:
//! `PT_LOAD` segments, the entry point, and `PT_INTERP`/`PT_DYNAMIC` for
//! classifying static, static-PIE and dynamic programs.

use thiserror::Error;

pub const EM_X86_64: u16 = 62;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid ELF program (binary too small)")]
    TooSmall,
    #[error("invalid ELF program ({0})")]
    BadHeader(&'static str),
    #[error("invalid ELF program (truncated segment)")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Static,
    StaticPie,
    Dynamic,
}

impl BinaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryKind::Static => "static",
            BinaryKind::StaticPie => "static-pie",
            BinaryKind::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub entry: u64,
    pub segments: Vec<Segment>,
    pub interpreter: Option<String>,
    pub kind: BinaryKind,
}

impl Image {
    /// Highest mapped address, used to place the heap.
    pub fn load_end(&self) -> u64 {
        self.segments.iter().map(|s| s.vaddr + s.memsz).max().unwrap_or(0)
    }
}

/// Cheap sniff used to distinguish a raw program from an archive payload.
pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == [0x7f, b'E', b'L', b'F']
}

fn u16le(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}
fn u32le(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}
fn u64le(b: &[u8], off: usize) -> u64 {
    let mut x = [0u8; 8];
    x.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(x)
}

pub fn parse(bytes: &[u8]) -> Result<Image, ImageError> {
    if bytes.len() < 128 {
        return Err(ImageError::TooSmall);
    }
    if !is_elf(bytes) {
        return Err(ImageError::BadHeader("bad magic"));
    }
    if bytes[4] != 2 {
        return Err(ImageError::BadHeader("not 64-bit"));
    }
    if bytes[5] != 1 {
        return Err(ImageError::BadHeader("not little-endian"));
    }
    let e_type = u16le(bytes, 16);
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(ImageError::BadHeader("not an executable"));
    }
    if u16le(bytes, 18) != EM_X86_64 {
        return Err(ImageError::BadHeader("wrong machine"));
    }
    let entry = u64le(bytes, 24);
    let phoff = u64le(bytes, 32) as usize;
    let phentsize = u16le(bytes, 54) as usize;
    let phnum = u16le(bytes, 56) as usize;
    if phentsize < PHDR_SIZE || phoff.checked_add(phentsize * phnum).map_or(true, |end| end > bytes.len()) {
        return Err(ImageError::BadHeader("bad program headers"));
    }

    let mut segments = Vec::new();
    let mut interpreter = None;
    let mut is_dyn_linked = false;
    for i in 0..phnum {
        let ph = &bytes[phoff + i * phentsize..phoff + (i + 1) * phentsize];
        let p_type = u32le(ph, 0);
        let p_offset = u64le(ph, 8) as usize;
        let p_vaddr = u64le(ph, 16);
        let p_filesz = u64le(ph, 32) as usize;
        let p_memsz = u64le(ph, 40);
        match p_type {
            PT_LOAD => {
                let end = p_offset.checked_add(p_filesz).ok_or(ImageError::Truncated)?;
                if end > bytes.len() || p_memsz < p_filesz as u64 {
                    return Err(ImageError::Truncated);
                }
                segments.push(Segment {
                    vaddr: p_vaddr,
                    data: bytes[p_offset..end].to_vec(),
                    memsz: p_memsz,
                });
            }
            PT_INTERP => {
                let end = p_offset.checked_add(p_filesz).ok_or(ImageError::Truncated)?;
                if end > bytes.len() {
                    return Err(ImageError::Truncated);
                }
                let raw = &bytes[p_offset..end];
                let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
                interpreter = Some(String::from_utf8_lossy(raw).into_owned());
            }
            PT_DYNAMIC => is_dyn_linked = true,
            _ => {}
        }
    }
    if segments.is_empty() {
        return Err(ImageError::BadHeader("no loadable segments"));
    }
    let kind = if interpreter.is_some() {
        BinaryKind::Dynamic
    } else if e_type == ET_DYN || is_dyn_linked {
        BinaryKind::StaticPie
    } else {
        BinaryKind::Static
    };
    Ok(Image { entry, segments, interpreter, kind })
}

/// Build a single-segment executable image. Used by the assembler and by
/// tooling that produces guests out-of-tree.
pub fn build(base_vaddr: u64, code: &[u8], entry: u64, interpreter: Option<&str>) -> Vec<u8> {
    let nph = if interpreter.is_some() { 2 } else { 1 };
    let interp_bytes: Vec<u8> = interpreter
        .map(|s| {
            let mut v = s.as_bytes().to_vec();
            v.push(0);
            v
        })
        .unwrap_or_default();

    let interp_off = EHDR_SIZE + nph * PHDR_SIZE;
    let code_off = interp_off + interp_bytes.len();
    let mut out = vec![0u8; code_off + code.len()];

    // ehdr
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // 64-bit
    out[5] = 1; // little-endian
    out[6] = 1; // version
    out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
    out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&entry.to_le_bytes());
    out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out[56..58].copy_from_slice(&(nph as u16).to_le_bytes());

    let mut phoff = EHDR_SIZE;
    if !interp_bytes.is_empty() {
        write_phdr(&mut out, phoff, PT_INTERP, interp_off as u64, 0, interp_bytes.len() as u64, interp_bytes.len() as u64);
        phoff += PHDR_SIZE;
        out[interp_off..interp_off + interp_bytes.len()].copy_from_slice(&interp_bytes);
    }
    write_phdr(&mut out, phoff, PT_LOAD, code_off as u64, base_vaddr, code.len() as u64, code.len() as u64);
    out[code_off..].copy_from_slice(code);
    out
}

fn write_phdr(out: &mut [u8], at: usize, p_type: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    out[at..at + 4].copy_from_slice(&p_type.to_le_bytes());
    out[at + 4..at + 8].copy_from_slice(&5u32.to_le_bytes()); // R+X
    out[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
    out[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
    out[at + 24..at + 32].copy_from_slice(&vaddr.to_le_bytes());
    out[at + 32..at + 40].copy_from_slice(&filesz.to_le_bytes());
    out[at + 40..at + 48].copy_from_slice(&memsz.to_le_bytes());
    out[at + 48..at + 56].copy_from_slice(&4096u64.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_roundtrip() {
        let code = vec![0x2f; 200]; // enough to clear the 128-byte floor
        let elf = build(0x400000, &code, 0x400010, None);
        assert!(is_elf(&elf));
        let img = parse(&elf).unwrap();
        assert_eq!(img.entry, 0x400010);
        assert_eq!(img.kind, BinaryKind::Static);
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].vaddr, 0x400000);
        assert_eq!(img.segments[0].data, code);
    }

    #[test]
    fn interp_marks_dynamic() {
        let elf = build(0x400000, &[0x2f; 200], 0x400000, Some("/lib/loader"));
        let img = parse(&elf).unwrap();
        assert_eq!(img.kind, BinaryKind::Dynamic);
        assert_eq!(img.interpreter.as_deref(), Some("/lib/loader"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse(&[0u8; 64]), Err(ImageError::TooSmall)));
        let mut junk = vec![0u8; 256];
        junk[0..4].copy_from_slice(b"\x7fELF");
        junk[4] = 1; // 32-bit
        assert!(parse(&junk).is_err());
    }
}
