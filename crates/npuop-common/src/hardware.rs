//! Hardware profile of the target accelerator and the platform query seam.
//!
//! A [`HardwareProfile`] is created once per compile session, either from a
//! [`PlatformQuery`] implementation, from the compile-info JSON that the graph
//! runtime hands to tiling functions, or from a `PlatformConfig`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Result, TilingError};

/// DMA block size in bytes on every supported SoC.
pub const DEFAULT_ALIGN_BYTES: u64 = 32;

/// SoC architecture tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocTag {
    Ascend910B,
    Ascend910_93,
    Ascend910_95,
    Ascend310P,
    Ascend310B,
}

impl SocTag {
    pub const ALL: [SocTag; 5] = [
        Self::Ascend910B,
        Self::Ascend910_93,
        Self::Ascend910_95,
        Self::Ascend310P,
        Self::Ascend310B,
    ];

    pub fn capabilities(self) -> &'static SocCapabilities {
        match self {
            Self::Ascend910B => &CAPABILITIES[0],
            Self::Ascend910_93 => &CAPABILITIES[1],
            Self::Ascend910_95 => &CAPABILITIES[2],
            Self::Ascend310P => &CAPABILITIES[3],
            Self::Ascend310B => &CAPABILITIES[4],
        }
    }
}

impl fmt::Display for SocTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascend910B => write!(f, "Ascend910B"),
            Self::Ascend910_93 => write!(f, "Ascend910_93"),
            Self::Ascend910_95 => write!(f, "Ascend910_95"),
            Self::Ascend310P => write!(f, "Ascend310P"),
            Self::Ascend310B => write!(f, "Ascend310B"),
        }
    }
}

impl FromStr for SocTag {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ascend910b" | "910b" => Ok(Self::Ascend910B),
            "ascend910_93" | "910_93" => Ok(Self::Ascend910_93),
            "ascend910_95" | "910_95" => Ok(Self::Ascend910_95),
            "ascend310p" | "310p" => Ok(Self::Ascend310P),
            "ascend310b" | "310b" => Ok(Self::Ascend310B),
            _ => Err(format!("unknown SoC version: {s}")),
        }
    }
}

/// Which kernel families a SoC has compiled variants for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocCapabilities {
    pub soc: SocTag,
    /// Register-based vector micro-architecture.
    pub regbase: bool,
    pub bf16: bool,
    /// Erf-based GELU approximation kernels.
    pub erf_approximation: bool,
    pub default_core_count: u64,
    pub default_ub_bytes: u64,
}

static CAPABILITIES: [SocCapabilities; 5] = [
    SocCapabilities {
        soc: SocTag::Ascend910B,
        regbase: false,
        bf16: true,
        erf_approximation: true,
        default_core_count: 48,
        default_ub_bytes: 196_608,
    },
    SocCapabilities {
        soc: SocTag::Ascend910_93,
        regbase: false,
        bf16: true,
        erf_approximation: true,
        default_core_count: 48,
        default_ub_bytes: 196_608,
    },
    SocCapabilities {
        soc: SocTag::Ascend910_95,
        regbase: true,
        bf16: true,
        erf_approximation: true,
        default_core_count: 64,
        default_ub_bytes: 262_144,
    },
    SocCapabilities {
        soc: SocTag::Ascend310P,
        regbase: false,
        bf16: false,
        erf_approximation: false,
        default_core_count: 8,
        default_ub_bytes: 262_144,
    },
    SocCapabilities {
        soc: SocTag::Ascend310B,
        regbase: false,
        bf16: true,
        erf_approximation: true,
        default_core_count: 1,
        default_ub_bytes: 262_144,
    },
];

/// Capability oracle exposed by the host runtime.
pub trait PlatformQuery {
    /// Number of vector cores.
    fn core_count(&self) -> u64;
    /// Fast on-chip buffer (UB) size per core, in bytes.
    fn local_memory_size(&self) -> u64;
    fn soc_version(&self) -> SocTag;
}

/// A fixed answer to every platform query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPlatform {
    pub soc: SocTag,
    pub core_count: u64,
    pub ub_bytes: u64,
}

impl StaticPlatform {
    /// The SoC's stock core count and UB size.
    pub fn stock(soc: SocTag) -> Self {
        let caps = soc.capabilities();
        Self { soc, core_count: caps.default_core_count, ub_bytes: caps.default_ub_bytes }
    }
}

impl PlatformQuery for StaticPlatform {
    fn core_count(&self) -> u64 {
        self.core_count
    }

    fn local_memory_size(&self) -> u64 {
        self.ub_bytes
    }

    fn soc_version(&self) -> SocTag {
        self.soc
    }
}

/// Immutable per-session hardware limits consumed by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub core_count: u64,
    pub ub_bytes: u64,
    pub align_bytes: u64,
    pub soc: SocTag,
    pub regbase: bool,
}

impl HardwareProfile {
    pub fn new(soc: SocTag, core_count: u64, ub_bytes: u64) -> Self {
        Self {
            core_count,
            ub_bytes,
            align_bytes: DEFAULT_ALIGN_BYTES,
            soc,
            regbase: soc.capabilities().regbase,
        }
    }

    /// Query the platform oracle once and freeze the answers.
    pub fn query(platform: &dyn PlatformQuery) -> Result<Self> {
        let profile =
            Self::new(platform.soc_version(), platform.core_count(), platform.local_memory_size());
        profile.check()?;
        debug!(soc = %profile.soc, cores = profile.core_count, ub = profile.ub_bytes, "hardware profile queried");
        Ok(profile)
    }

    pub fn with_align_bytes(mut self, align_bytes: u64) -> Self {
        self.align_bytes = align_bytes;
        self
    }

    pub fn capabilities(&self) -> &'static SocCapabilities {
        self.soc.capabilities()
    }

    /// Reject profiles no plan could be computed for.
    pub fn check(&self) -> Result<()> {
        if self.core_count == 0 {
            return Err(TilingError::Schema(format!("{}: core count is 0", self.soc)));
        }
        if self.ub_bytes == 0 {
            return Err(TilingError::Schema(format!("{}: UB size is 0", self.soc)));
        }
        if self.align_bytes == 0 || !self.align_bytes.is_power_of_two() {
            return Err(TilingError::Schema(format!(
                "{}: alignment {} is not a power of two",
                self.soc, self.align_bytes
            )));
        }
        Ok(())
    }
}

impl Default for HardwareProfile {
    fn default() -> Self {
        let caps = SocTag::Ascend910B.capabilities();
        Self::new(SocTag::Ascend910B, caps.default_core_count, caps.default_ub_bytes)
    }
}

// ---------------------------------------------------------------------------
// Compile info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct HardwareInfo {
    #[serde(rename = "UB_SIZE")]
    ub_size: u64,
    #[serde(rename = "CORE_NUM")]
    core_num: u64,
}

/// Compile-info document handed to tiling functions by the graph runtime,
/// e.g. `{"hardware_info": {"UB_SIZE": 196608, "CORE_NUM": 48}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileInfo {
    hardware_info: HardwareInfo,
    #[serde(default)]
    soc_version: Option<String>,
}

impl CompileInfo {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TilingError::Schema(format!("invalid compile info: {e}")))
    }

    /// Build a profile; `fallback_soc` is used when the document names none.
    pub fn to_profile(&self, fallback_soc: SocTag) -> Result<HardwareProfile> {
        let soc = match &self.soc_version {
            Some(name) => name.parse::<SocTag>().map_err(TilingError::Schema)?,
            None => fallback_soc,
        };
        let profile = HardwareProfile::new(soc, self.hardware_info.core_num, self.hardware_info.ub_size);
        profile.check()?;
        debug!(
            soc = %soc,
            cores = profile.core_count,
            ub = profile.ub_bytes,
            named = self.soc_version.is_some(),
            "hardware profile built from compile info"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_static_platform() {
        let profile = HardwareProfile::query(&StaticPlatform::stock(SocTag::Ascend910_95)).unwrap();
        assert_eq!(profile.core_count, 64);
        assert_eq!(profile.ub_bytes, 262_144);
        assert!(profile.regbase);
        assert_eq!(profile.align_bytes, 32);
    }

    #[test]
    fn zero_cores_rejected() {
        let platform = StaticPlatform { soc: SocTag::Ascend910B, core_count: 0, ub_bytes: 1024 };
        assert!(HardwareProfile::query(&platform).is_err());
    }

    #[test]
    fn compile_info_json() {
        let info = CompileInfo::parse(r#"{"hardware_info": {"UB_SIZE": 196608, "CORE_NUM": 48}}"#)
            .unwrap();
        let profile = info.to_profile(SocTag::Ascend910B).unwrap();
        assert_eq!(profile, HardwareProfile::default());

        let info = CompileInfo::parse(
            r#"{"hardware_info": {"UB_SIZE": 262144, "CORE_NUM": 8}, "soc_version": "Ascend310P"}"#,
        )
        .unwrap();
        assert_eq!(info.to_profile(SocTag::Ascend910B).unwrap().soc, SocTag::Ascend310P);
    }

    #[test]
    fn compile_info_missing_field() {
        let err = CompileInfo::parse(r#"{"hardware_info": {"UB_SIZE": 1}}"#).unwrap_err();
        assert!(matches!(err, TilingError::Schema(_)));
    }

    #[test]
    fn soc_display_roundtrip() {
        for soc in SocTag::ALL {
            assert_eq!(soc.to_string().parse::<SocTag>().unwrap(), soc);
            assert_eq!(soc.capabilities().soc, soc);
        }
        assert!(!SocTag::Ascend310P.capabilities().bf16);
    }
}
