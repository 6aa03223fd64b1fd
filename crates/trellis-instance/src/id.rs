//! Instance and task identifiers.
//!
//! The canonical instance-id string is `<safeRunSpecId>.<prefix><uuid>`
//! where the safe form replaces `/` with `_` and the uuid is RFC-4122
//! version 1 (time based, process-stable node id). Task ids append a
//! container-name suffix for pods.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::timestamp::context::Context;
use uuid::{Timestamp, Uuid};

use trellis_core::PathId;

/// Raised when an id string does not match the expected shape.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed id `{0}`")]
pub struct MatchError(pub String);

/// The two accepted instance-id prefixes. `Legacy` covers ids minted by
/// earlier releases and must stay parseable forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPrefix {
    Instance,
    Legacy,
}

impl IdPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance-",
            Self::Legacy => "marathon-",
        }
    }
}

/// Identifier of one run-spec replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub run_spec_id: PathId,
    pub prefix: IdPrefix,
    pub uuid: Uuid,
}

fn node_id() -> &'static [u8; 6] {
    static NODE: OnceLock<[u8; 6]> = OnceLock::new();
    NODE.get_or_init(|| {
        let pid = std::process::id().to_be_bytes();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos()
            .to_be_bytes();
        // Multicast bit set per RFC 4122 for non-MAC node ids.
        [pid[0] | 0x01, pid[1], pid[2], pid[3], nanos[2], nanos[3]]
    })
}

fn uuid_context() -> &'static Context {
    static CONTEXT: OnceLock<Context> = OnceLock::new();
    CONTEXT.get_or_init(|| Context::new(0))
}

impl InstanceId {
    /// Mint a fresh id for a replica of `run_spec_id`.
    pub fn fresh(run_spec_id: PathId) -> Self {
        Self {
            run_spec_id,
            prefix: IdPrefix::Instance,
            uuid: Uuid::new_v1(Timestamp::now(uuid_context()), node_id()),
        }
    }

    /// The reservation id a resident instance claims volumes under.
    pub fn simplified(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}",
            self.run_spec_id.safe_path(),
            self.prefix.as_str(),
            self.uuid
        )
    }
}

impl FromStr for InstanceId {
    type Err = MatchError;

    // Accepts `^(.+)\.(instance-|marathon-)([^.]+)$`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, tail) = s.rsplit_once('.').ok_or_else(|| MatchError(s.to_string()))?;
        let (prefix, raw_uuid) = if let Some(rest) = tail.strip_prefix("instance-") {
            (IdPrefix::Instance, rest)
        } else if let Some(rest) = tail.strip_prefix("marathon-") {
            (IdPrefix::Legacy, rest)
        } else {
            return Err(MatchError(s.to_string()));
        };
        let uuid = Uuid::parse_str(raw_uuid).map_err(|_| MatchError(s.to_string()))?;
        let run_spec_id =
            PathId::from_safe(head).map_err(|_| MatchError(s.to_string()))?;
        Ok(Self {
            run_spec_id,
            prefix,
            uuid,
        })
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|e: MatchError| D::Error::custom(e))
    }
}

/// Identifier of one task within an instance. Apps run a single anonymous
/// task; pod tasks carry their container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub instance: InstanceId,
    pub container: Option<String>,
}

impl TaskId {
    pub fn for_instance(instance: InstanceId) -> Self {
        Self {
            instance,
            container: None,
        }
    }

    pub fn for_container(instance: InstanceId, container: impl Into<String>) -> Self {
        Self {
            instance,
            container: Some(container.into()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(name) => write!(f, "{}.{name}", self.instance),
            None => write!(f, "{}", self.instance),
        }
    }
}

impl FromStr for TaskId {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(instance) = s.parse::<InstanceId>() {
            return Ok(Self {
                instance,
                container: None,
            });
        }
        let (head, container) = s.rsplit_once('.').ok_or_else(|| MatchError(s.to_string()))?;
        let instance = head.parse::<InstanceId>()?;
        Ok(Self {
            instance,
            container: Some(container.to_string()),
        })
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.instance, &self.container).cmp(&(&other.instance, &other.container))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|e: MatchError| D::Error::custom(e))
    }
}
