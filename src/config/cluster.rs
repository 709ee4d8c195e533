//! Per-cluster job ceilings.

/// Ceiling on `cedar`, which has no practical per-user limit.
pub const CEDAR_CEILING: usize = 999;

/// Ceiling everywhere else: the hard limit is 1000 queued-or-running jobs
/// per user, and jobs submitted by hand need some room too.
pub const DEFAULT_CEILING: usize = 950;

/// Cluster identity as declared by the environment (`CC_CLUSTER`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cluster {
    Cedar,
    Graham,
    Beluga,
    Other(String),
    /// Nothing declared.
    Unknown,
}

impl Cluster {
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") => Cluster::Unknown,
            Some("cedar") => Cluster::Cedar,
            Some("graham") => Cluster::Graham,
            Some("beluga") => Cluster::Beluga,
            Some(other) => Cluster::Other(other.to_string()),
        }
    }

    /// Most jobs this crate lets one identity occupy at once.
    pub fn ceiling(&self) -> usize {
        match self {
            Cluster::Cedar => CEDAR_CEILING,
            _ => DEFAULT_CEILING,
        }
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cluster::Cedar => write!(f, "cedar"),
            Cluster::Graham => write!(f, "graham"),
            Cluster::Beluga => write!(f, "beluga"),
            Cluster::Other(name) => write!(f, "{name}"),
            Cluster::Unknown => write!(f, "unknown"),
        }
    }
}
