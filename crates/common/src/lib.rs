use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque key-value bag stored alongside an allocation.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Released,
    Expired,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Active => "active",
            AllocationStatus::Released => "released",
            AllocationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AllocationStatus::Active),
            "released" => Ok(AllocationStatus::Released),
            "expired" => Ok(AllocationStatus::Expired),
            other => Err(format!("unknown allocation status: {}", other)),
        }
    }
}

/// Username/secret pair handed through to the command execution layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub port: u16,
    pub owner_id: String,
    pub credentials: Option<Credentials>,
    pub allocated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_verification: DateTime<Utc>,
    pub status: AllocationStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Closed port range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    min: u16,
    max: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = String;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        Self::new(raw.min, raw.max)
    }
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, String> {
        if min == 0 {
            return Err("port range must not include port 0".to_string());
        }
        if min > max {
            return Err(format!("invalid port range {}-{}: min exceeds max", min, max));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn len(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        u32::from(self.max - self.min) + 1
    }

    /// Only a range built field by field can be inverted; `new` and deserialization refuse it.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.min..=self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once('-')
            .ok_or_else(|| format!("expected MIN-MAX, got {}", s))?;
        let min = min
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid min port: {}", e))?;
        let max = max
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid max port: {}", e))?;
        Self::new(min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_ports: u32,
    pub available: u32,
    pub active: u32,
    pub released: u32,
    pub expired: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub owner_id: String,
    pub credentials: Option<Credentials>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub port: u16,
    pub allocation: Allocation,
}

/// Body shared by release, heartbeat and verify calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortOwnerRequest {
    pub port: u16,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCredentialsRequest {
    pub port: u16,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortQuery {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatOutcome {
    /// The `(port, owner)` pair matched an active allocation.
    Matched,
    /// Only the port matched; the owner id differs from the stored one.
    Degraded,
    /// Nothing was active on the port, so a new allocation was created.
    Registered,
    /// Nothing was recorded.
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub port: u16,
    pub outcome: HeartbeatOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub is_owner: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsResponse {
    pub port: u16,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub checked_at: DateTime<Utc>,
    pub healthy: Vec<u16>,
    pub unhealthy: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
