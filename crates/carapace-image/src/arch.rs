//! Host architecture and emulation support.
//!
//! An image built for a foreign architecture can still run when the kernel
//! has a persistent, enabled `binfmt_misc` entry whose magic matches that
//! architecture's ELF header.

use std::fs;
use std::path::{Path, PathBuf};

/// SIF architecture codes and their names.
const SIF_ARCHES: &[(&str, &str)] = &[
    ("01", "386"),
    ("02", "amd64"),
    ("03", "arm"),
    ("04", "arm64"),
    ("05", "ppc64"),
    ("06", "ppc64le"),
    ("07", "mips"),
    ("08", "mipsle"),
    ("09", "mips64"),
    ("10", "mips64le"),
    ("11", "s390x"),
    ("12", "riscv64"),
];

/// Architectures a host runs natively besides its own.
const COMPATIBLE: &[(&str, &[&str])] = &[("amd64", &["386"]), ("arm64", &["arm"])];

/// Leading ELF bytes (ident, e_type, e_machine) of executables per architecture.
const ELF_MAGIC: &[(&str, &str)] = &[
    ("386", "7f454c4601010100000000000000000002000300"),
    ("amd64", "7f454c4602010100000000000000000002003e00"),
    ("arm", "7f454c4601010100000000000000000002002800"),
    ("arm64", "7f454c460201010000000000000000000200b700"),
    ("ppc64", "7f454c4602020100000000000000000000020015"),
    ("ppc64le", "7f454c4602010100000000000000000002001500"),
    ("mips", "7f454c4601020100000000000000000000020008"),
    ("mipsle", "7f454c4601010100000000000000000002000800"),
    ("mips64", "7f454c4602020100000000000000000000020008"),
    ("mips64le", "7f454c4602010100000000000000000002000800"),
    ("s390x", "7f454c4602020100000000000000000000020016"),
    ("riscv64", "7f454c460201010000000000000000000200f300"),
];

/// Name of a SIF architecture code such as `"02"`.
#[must_use]
pub fn sif_arch_name(code: &str) -> Option<&'static str> {
    SIF_ARCHES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// SIF code of an architecture name such as `"amd64"`.
#[must_use]
pub fn sif_arch_code(name: &str) -> Option<&'static str> {
    SIF_ARCHES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(code, _)| *code)
}

/// Architecture of the running host, in SIF naming.
#[must_use]
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "powerpc64" => "ppc64",
        "mips" if cfg!(target_endian = "little") => "mipsle",
        "mips" => "mips",
        "mips64" if cfg!(target_endian = "little") => "mips64le",
        "mips64" => "mips64",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        _ => "unknown",
    }
}

fn elf_magic(arch: &str) -> Option<Vec<u8>> {
    ELF_MAGIC
        .iter()
        .find(|(a, _)| *a == arch)
        .and_then(|(_, magic)| hex::decode(magic).ok())
}

/// Decides whether images of a given architecture can run on this host.
#[derive(Debug, Clone)]
pub struct ArchOracle {
    host: String,
    binfmt_dir: PathBuf,
}

impl ArchOracle {
    /// Oracle for the running host, reading binfmt entries from `binfmt_dir`.
    pub fn new(binfmt_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host_arch().to_string(),
            binfmt_dir: binfmt_dir.into(),
        }
    }

    /// Pretend to be a different host architecture.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Host architecture name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether `arch` runs natively, through a compatibility mode or
    /// through a registered emulator.
    #[must_use]
    pub fn is_compatible(&self, arch: &str) -> bool {
        if arch == self.host {
            return true;
        }
        let native = COMPATIBLE
            .iter()
            .any(|(host, others)| *host == self.host && others.contains(&arch));
        native || self.is_emulated(arch)
    }

    /// Whether a persistent, enabled binfmt_misc entry handles `arch`.
    #[must_use]
    pub fn is_emulated(&self, arch: &str) -> bool {
        let Some(magic) = elf_magic(arch) else {
            return false;
        };

        if let Ok(status) = fs::read_to_string(self.binfmt_dir.join("status")) {
            if status.trim() != "enabled" {
                return false;
            }
        }

        let Ok(entries) = fs::read_dir(&self.binfmt_dir) else {
            return false;
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| !matches!(e.file_name().to_str(), Some("status" | "register")))
            .filter_map(|e| BinfmtEntry::load(&e.path()))
            .any(|entry| {
                let hit = entry.handles(&magic);
                if hit {
                    tracing::debug!(arch, interpreter = %entry.interpreter, "Found binfmt emulator");
                }
                hit
            })
    }
}

/// A parsed `/proc/sys/fs/binfmt_misc/<name>` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BinfmtEntry {
    enabled: bool,
    interpreter: String,
    flags: String,
    offset: u64,
    magic: Vec<u8>,
    mask: Option<Vec<u8>>,
}

impl BinfmtEntry {
    fn load(path: &Path) -> Option<Self> {
        Self::parse(&fs::read_to_string(path).ok()?)
    }

    fn parse(content: &str) -> Option<Self> {
        let mut entry = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line == "enabled" {
                entry.enabled = true;
            } else if let Some(v) = line.strip_prefix("interpreter ") {
                entry.interpreter = v.to_string();
            } else if let Some(v) = line.strip_prefix("flags:") {
                entry.flags = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("offset ") {
                entry.offset = v.trim().parse().ok()?;
            } else if let Some(v) = line.strip_prefix("magic ") {
                entry.magic = hex::decode(v.trim()).ok()?;
            } else if let Some(v) = line.strip_prefix("mask ") {
                entry.mask = Some(hex::decode(v.trim()).ok()?);
            }
        }
        // Extension-based registrations carry no magic.
        if entry.magic.is_empty() {
            return None;
        }
        Some(entry)
    }

    fn persistent(&self) -> bool {
        self.flags.contains('F')
    }

    fn handles(&self, elf: &[u8]) -> bool {
        if !self.enabled || !self.persistent() || self.offset != 0 || self.magic.len() > elf.len() {
            return false;
        }
        self.magic.iter().enumerate().all(|(i, m)| {
            let mask = self.mask.as_ref().and_then(|k| k.get(i)).copied().unwrap_or(0xff);
            m & mask == elf[i] & mask
        })
    }
}
