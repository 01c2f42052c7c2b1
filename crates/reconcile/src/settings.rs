use std::time::Duration;

use apiary_sync::CarryForward;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    /// Linear scan of referencing kinds on every query.
    #[default]
    Scan,
    /// Incrementally maintained reverse index.
    Reverse,
}

impl IndexMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scan" => Some(Self::Scan),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub conflict_attempts: usize,
    pub remote_timeout: Duration,
    pub workers: usize,
    /// `None` disables the periodic resync.
    pub resync: Option<Duration>,
    pub requeue: Duration,
    pub carry_forward: CarryForward,
    pub reference_index: IndexMode,
    pub skip_unchanged_metadata: bool,
    pub queue_cap: usize,
    pub watch_namespace: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            conflict_attempts: 5,
            remote_timeout: Duration::from_millis(10_000),
            workers: 4,
            resync: Some(Duration::from_secs(300)),
            requeue: Duration::from_secs(10),
            carry_forward: CarryForward::default(),
            reference_index: IndexMode::Scan,
            skip_unchanged_metadata: false,
            queue_cap: 2048,
            watch_namespace: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            conflict_attempts: num("APIARY_CONFLICT_ATTEMPTS").map(|n| n.max(1) as usize).unwrap_or(d.conflict_attempts),
            remote_timeout: num("APIARY_REMOTE_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.remote_timeout),
            workers: num("APIARY_WORKERS").map(|n| n.max(1) as usize).unwrap_or(d.workers),
            resync: match num("APIARY_RESYNC_SECS") {
                Some(0) => None,
                Some(n) => Some(Duration::from_secs(n)),
                None => d.resync,
            },
            requeue: num("APIARY_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.requeue),
            carry_forward: get("APIARY_CARRY_FORWARD").map(|s| CarryForward::parse(&s)).unwrap_or(d.carry_forward),
            reference_index: get("APIARY_REFERENCE_INDEX").and_then(|s| IndexMode::parse(&s)).unwrap_or(d.reference_index),
            skip_unchanged_metadata: get("APIARY_SKIP_UNCHANGED_METADATA")
                .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
                .unwrap_or(d.skip_unchanged_metadata),
            queue_cap: num("APIARY_QUEUE_CAP").map(|n| n.max(1) as usize).unwrap_or(d.queue_cap),
            watch_namespace: get("APIARY_WATCH_NAMESPACE").filter(|s| !s.trim().is_empty()),
        }
    }
}
