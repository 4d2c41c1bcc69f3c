//! Hjson session files.
//!
//! ```hjson
//! {
//!   base: "0x60000000"
//!   profile: s29gl128p
//!   steps: [
//!     { op: "erase_sector", addr: "0x60020000" }
//!     { op: "program", addr: "0x60020000", image: "firmware.bin" }
//!     { op: "verify", addr: "0x60020000", image: "firmware.bin" }
//!   ]
//! }
//! ```

use std::num::ParseIntError;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cfi_nor::mock::Fault;
use cfi_nor::NorId;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_BASE: u32 = 0x6000_0000;

/// Parses `0x`-prefixed hex or plain decimal, `_` separators allowed.
pub fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim().replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

fn number<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    match Number::deserialize(d)? {
        Number::Int(n) => u32::try_from(n).map_err(serde::de::Error::custom),
        Number::Text(s) => parse_u32(&s).map_err(serde::de::Error::custom),
    }
}

fn optional_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    number(d).map(Some)
}

fn default_base() -> u32 {
    DEFAULT_BASE
}

fn default_profile() -> String {
    "s29gl128p".into()
}

fn erased() -> u8 {
    0xFF
}

#[derive(Debug, Deserialize)]
pub struct SessionFile {
    #[serde(default = "default_base", deserialize_with = "number")]
    pub base: u32,
    /// Built-in profile name, or `auto` to pick one from the autoselect id.
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub max_toggle_polls: Option<u32>,
    #[serde(default)]
    pub pad_odd_length: Option<bool>,
    /// Id the simulated device reports.
    #[serde(default)]
    pub id: Option<IdSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct IdSpec {
    #[serde(deserialize_with = "number")]
    pub manufacturer: u32,
    pub device: [String; 3],
}

impl IdSpec {
    pub fn to_id(&self) -> Result<NorId> {
        let mut device = [0u16; 3];
        for (word, text) in device.iter_mut().zip(&self.device) {
            *word = parse_u32(text)
                .ok()
                .and_then(|v| u16::try_from(v).ok())
                .with_context(|| format!("bad device id word `{text}`"))?;
        }
        Ok(NorId {
            manufacturer: u16::try_from(self.manufacturer).context("manufacturer id")?,
            device,
        })
    }
}

#[derive(Clone, Copy, Debug, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    TimeoutStuck,
    TimeoutRace,
    Hang,
}

impl FaultKind {
    pub fn to_fault(self, after: u32) -> Fault {
        match self {
            Self::TimeoutStuck => Fault::TimeoutStuck { after },
            Self::TimeoutRace => Fault::TimeoutRace,
            Self::Hang => Fault::Hang,
        }
    }
}

/// Bytes a program or verify step works on.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Payload {
    /// File path, relative to the session file.
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Fill byte used together with `len` when there is no image.
    #[serde(default)]
    pub fill: Option<u8>,
    #[serde(default, deserialize_with = "optional_number")]
    pub len: Option<u32>,
}

impl Payload {
    pub fn bytes(&self, dir: &Path) -> Result<Vec<u8>> {
        match (&self.image, self.fill, self.len) {
            (Some(image), _, len) => {
                let path = dir.join(image);
                let mut data = std::fs::read(&path)
                    .with_context(|| format!("reading image {}", path.display()))?;
                if let Some(len) = len {
                    data.truncate(len as usize);
                }
                Ok(data)
            }
            (None, Some(fill), Some(len)) => Ok(vec![fill; len as usize]),
            _ => bail!("payload needs `image` or `fill` + `len`"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    EraseChip,
    EraseSector {
        #[serde(deserialize_with = "number")]
        addr: u32,
    },
    Program {
        #[serde(deserialize_with = "number")]
        addr: u32,
        #[serde(flatten)]
        payload: Payload,
    },
    Verify {
        #[serde(deserialize_with = "number")]
        addr: u32,
        #[serde(flatten)]
        payload: Payload,
    },
    BlankCheck {
        #[serde(deserialize_with = "number")]
        addr: u32,
        #[serde(deserialize_with = "number")]
        len: u32,
        #[serde(default = "erased")]
        pattern: u8,
    },
    /// Arms a fault for the next operation, or the next one at `addr`.
    Fault {
        kind: FaultKind,
        #[serde(default, deserialize_with = "optional_number")]
        addr: Option<u32>,
        #[serde(default)]
        after: u32,
    },
    Reset,
    ReadId,
}

impl SessionFile {
    pub fn parse(text: &str) -> Result<Self> {
        deser_hjson::from_str(text).context("parsing session file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_numbers() {
        assert_eq!(parse_u32("0x6000_0000"), Ok(0x6000_0000));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn parses_session_with_all_step_kinds() {
        let session = SessionFile::parse(
            r#"{
                base: "0x60000000"
                profile: s29gl256p
                max_toggle_polls: 5000
                steps: [
                    { op: "erase_chip" }
                    { op: "erase_sector", addr: "0x60020000" }
                    { op: "fault", kind: "timeout_stuck", after: 2, addr: "0x60020004" }
                    { op: "program", addr: "0x60020000", fill: 0, len: 16 }
                    { op: "verify", addr: "0x60020000", fill: 0, len: 4 }
                    { op: "blank_check", addr: "0x60040000", len: 256 }
                    { op: "reset" }
                    { op: "read_id" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(session.base, 0x6000_0000);
        assert_eq!(session.profile, "s29gl256p");
        assert_eq!(session.max_toggle_polls, Some(5000));
        assert_eq!(session.steps.len(), 8);
        assert!(matches!(
            session.steps[2],
            Step::Fault {
                kind: FaultKind::TimeoutStuck,
                addr: Some(0x6002_0004),
                after: 2
            }
        ));
        match &session.steps[3] {
            Step::Program { addr, payload } => {
                assert_eq!(*addr, 0x6002_0000);
                assert_eq!(payload.bytes(Path::new(".")).unwrap(), vec![0u8; 16]);
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(
            session.steps[5],
            Step::BlankCheck { pattern: 0xFF, len: 256, .. }
        ));
    }

    #[test]
    fn defaults_apply_to_empty_session() {
        let session = SessionFile::parse("{}").unwrap();
        assert_eq!(session.base, DEFAULT_BASE);
        assert_eq!(session.profile, "s29gl128p");
        assert!(session.steps.is_empty());
    }

    #[test]
    fn payload_without_source_is_rejected() {
        assert!(Payload::default().bytes(Path::new(".")).is_err());
    }

    #[test]
    fn id_words_convert_to_nor_id() {
        let id = IdSpec {
            manufacturer: 0x20,
            device: ["0x227E".into(), "0x2221".into(), "0x2201".into()],
        };
        assert_eq!(
            id.to_id().unwrap(),
            NorId {
                manufacturer: NorId::MICRON,
                device: [0x227E, 0x2221, 0x2201],
            }
        );
    }
}
