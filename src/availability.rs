// MIT License - Copyright (c) 2026 Peter Wright
// Per-entity last-seen tracking and online/offline transitions

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::devices::Mac;
use crate::error::{GatewayError, Result};

/// Shortest interval between two availability sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Saved availability data older than this is ignored at startup.
pub const STALE_STATE: Duration = Duration::from_secs(60 * 60);

/// An entity went online or offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityChange {
    pub mac: Mac,
    pub available: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    timeout: Duration,
    last_seen: Option<DateTime<Utc>>,
    available: bool,
}

/// Tracks when each registered entity was last heard from.
///
/// Entities start unavailable and only come online with their first report.
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    entries: BTreeMap<Mac, Entry>,
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `mac`, or update its timeout if already tracked.
    pub fn track(&mut self, mac: &Mac, timeout: Duration) {
        self.entries
            .entry(mac.clone())
            .and_modify(|e| e.timeout = timeout)
            .or_insert(Entry {
                timeout,
                last_seen: None,
                available: false,
            });
    }

    pub fn forget(&mut self, mac: &Mac) {
        self.entries.remove(mac);
    }

    /// Record a report from `mac`. Returns a change if it was offline.
    pub fn record_seen(&mut self, mac: &Mac, now: DateTime<Utc>) -> Option<AvailabilityChange> {
        let Some(entry) = self.entries.get_mut(mac) else {
            debug!("Ignoring report from untracked {mac}");
            return None;
        };
        entry.last_seen = Some(entry.last_seen.map_or(now, |prev| prev.max(now)));
        if entry.available {
            return None;
        }
        entry.available = true;
        info!("{mac} is online");
        Some(AvailabilityChange {
            mac: mac.clone(),
            available: true,
        })
    }

    /// Mark every entity whose timeout elapsed as unavailable. Each entity is
    /// reported once per transition, however often the sweep runs.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AvailabilityChange> {
        let mut changes = Vec::new();
        for (mac, entry) in &mut self.entries {
            if !entry.available {
                continue;
            }
            let Some(last_seen) = entry.last_seen else {
                continue;
            };
            let elapsed = (now - last_seen).to_std().unwrap_or(Duration::ZERO);
            if elapsed > entry.timeout {
                entry.available = false;
                warn!("{mac} has not reported for {}s, marking offline", elapsed.as_secs());
                changes.push(AvailabilityChange {
                    mac: mac.clone(),
                    available: false,
                });
            }
        }
        changes
    }

    /// Smallest tracked timeout, never below [`MIN_SWEEP_INTERVAL`].
    pub fn sweep_interval(&self) -> Duration {
        self.entries
            .values()
            .map(|e| e.timeout)
            .min()
            .unwrap_or(MIN_SWEEP_INTERVAL)
            .max(MIN_SWEEP_INTERVAL)
    }

    pub fn is_available(&self, mac: &Mac) -> bool {
        self.entries.get(mac).is_some_and(|e| e.available)
    }

    pub fn last_seen(&self, mac: &Mac) -> Option<DateTime<Utc>> {
        self.entries.get(mac).and_then(|e| e.last_seen)
    }

    pub fn timeout(&self, mac: &Mac) -> Option<Duration> {
        self.entries.get(mac).map(|e| e.timeout)
    }

    /// Capture last-seen data for the state file.
    pub fn snapshot(&self, now: DateTime<Utc>) -> SavedState {
        let sensors = self
            .entries
            .iter()
            .filter_map(|(mac, e)| {
                e.last_seen.map(|last_seen| {
                    (
                        mac.clone(),
                        SavedEntry {
                            last_seen,
                            online: e.available,
                        },
                    )
                })
            })
            .collect();
        SavedState {
            modified: now,
            sensors,
        }
    }

    /// Apply saved data to tracked entities. Stale data is ignored. Returns
    /// the number of entities restored.
    pub fn restore(&mut self, saved: &SavedState, now: DateTime<Utc>) -> usize {
        let age = (now - saved.modified).to_std().unwrap_or(Duration::ZERO);
        if age > STALE_STATE {
            warn!("Ignoring stale state data ({}s old)", age.as_secs());
            return 0;
        }
        let mut restored = 0;
        for (mac, saved_entry) in &saved.sensors {
            if let Some(entry) = self.entries.get_mut(mac) {
                entry.last_seen = Some(saved_entry.last_seen);
                entry.available = saved_entry.online;
                restored += 1;
            }
        }
        restored
    }
}

/// On-disk availability state, written on shutdown and reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub sensors: BTreeMap<Mac, SavedEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedEntry {
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

impl SavedState {
    /// Read the state file. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(GatewayError::Persistence {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text).map(Some).map_err(|e| GatewayError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self).map_err(|e| GatewayError::Serialize(e.to_string()))?;
        crate::registry::write_atomic(path, &text)
    }
}
