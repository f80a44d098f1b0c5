//! Snapshot format versions and the device limits they impose.
//!
//! Older snapshot formats can only describe a bounded number of
//! interrupt-bearing devices. Firecracker v0.23 had 16 IRQ lines with virtio
//! devices using lines 5 to 23, so at most 11 devices could be attached: the
//! root drive plus 10 more. Every device beyond the root drive takes one line
//! and lines are never reused.

/// Device ceiling of the v0.23 snapshot format.
pub const FC_V0_23_MAX_DEVICES_ATTACHED: usize = 11;

/// Known ceilings, keyed by exact version string.
const DEVICE_CEILINGS: &[(&str, usize)] = &[("0.23.0", FC_V0_23_MAX_DEVICES_ATTACHED)];

/// What to do with a target version missing from the ceiling table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownVersion {
    /// Let the monitor decide; no local limit applies.
    #[default]
    Unconstrained,
    /// Refuse to snapshot for versions we know nothing about.
    Reject,
}

impl UnknownVersion {
    /// Parse `allow` or `reject` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow" | "unconstrained" => Some(Self::Unconstrained),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Decides whether an instance with a given device count may be serialized
/// for a target snapshot format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompatPolicy {
    unknown: UnknownVersion,
}

impl CompatPolicy {
    pub fn new(unknown: UnknownVersion) -> Self {
        Self { unknown }
    }

    /// Device ceiling for `version`, if the table knows it.
    pub fn ceiling(version: &str) -> Option<usize> {
        DEVICE_CEILINGS
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, ceiling)| *ceiling)
    }

    /// Versions with a known ceiling.
    pub fn known_versions() -> impl Iterator<Item = &'static str> {
        DEVICE_CEILINGS.iter().map(|(v, _)| *v)
    }

    /// Check `devices` attached devices against the target `version`.
    ///
    /// No version means the monitor's native format, which is always allowed.
    pub fn evaluate(&self, version: Option<&str>, devices: usize) -> Verdict {
        let Some(version) = version else {
            return Verdict::Allowed;
        };

        match Self::ceiling(version) {
            Some(ceiling) if devices > ceiling => Verdict::Rejected(format!(
                "Too many devices attached: {devices} devices, version {version} supports at most {ceiling}"
            )),
            Some(_) => Verdict::Allowed,
            None => match self.unknown {
                UnknownVersion::Unconstrained => Verdict::Allowed,
                UnknownVersion::Reject => {
                    Verdict::Rejected(format!("unknown snapshot version {version}"))
                }
            },
        }
    }
}
