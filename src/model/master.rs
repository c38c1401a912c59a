//! Masters: the named workers on the workshop roster.

use serde::{Deserialize, Serialize};

/// A worker on the roster, identified by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Master {
    pub name: String,
    pub skill_level: i64,
    pub active: bool,
    /// Recomputed after every task save.
    pub total_tasks: i64,
    pub completed_tasks: i64,
}

/// Roster entry as configured: name plus skill level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RosterEntry {
    pub name: String,
    #[serde(default = "default_skill_level")]
    pub skill_level: i64,
}

fn default_skill_level() -> i64 {
    1
}

/// The workshop's standing roster, seeded when the engine schema is first created.
pub fn default_roster() -> Vec<RosterEntry> {
    [
        ("Pan Min", 3),
        ("Huang Shangbin", 3),
        ("Qian Wei", 2),
        ("Jiang Huaidong", 3),
        ("Jiang Feng", 2),
        ("Xie Shougang", 3),
        ("Zhou Bo", 2),
        ("Qin Long", 2),
        ("Wang Zhangliang", 3),
        ("Ye Peijun", 2),
        ("Li Xue", 2),
        ("Ang Hongtao", 3),
        ("Liu Qing", 2),
        ("Wang Jialong", 2),
        ("Ye Jianhui", 3),
        ("Wei Zhen", 2),
        ("Yang Tong", 2),
    ]
    .into_iter()
    .map(|(name, skill_level)| RosterEntry {
        name: name.to_string(),
        skill_level,
    })
    .collect()
}
