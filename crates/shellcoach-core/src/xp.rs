//! XP formula and level progression
//!
//! XP for a passed exercise is `floor(base * multiplier)` where the
//! multiplier rewards difficulty and first-try solves and penalizes hint
//! usage. Levels are cumulative-XP thresholds over a fixed table.

/// `(cumulative_xp_threshold, title)` — constant for the process lifetime.
pub const LEVEL_TABLE: [(u32, &str); 17] = [
    (0, "Newbie"),
    (50, "Curious Cat"),
    (150, "Script Kiddie"),
    (300, "Terminal Apprentice"),
    (500, "Shell Wrangler"),
    (750, "Pipe Plumber"),
    (1050, "Regex Ranger"),
    (1400, "Sysadmin Acolyte"),
    (1800, "Root Whisperer"),
    (2250, "Kernel Sage"),
    (2750, "Daemon Tamer"),
    (3300, "Syscall Sorcerer"),
    (3900, "Namespace Ninja"),
    (4550, "Container Captain"),
    (5250, "Cluster Commander"),
    (6000, "Infra Overlord"),
    (6500, "BDFL"),
];

/// Multiplier never drops below this, no matter how many hints were burned.
const MULTIPLIER_FLOOR: f64 = 0.25;

/// Level information for a given XP total
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    pub level: usize,
    pub title: &'static str,
    pub current_xp: u32,
    pub level_floor: u32,
    pub level_ceiling: u32,
}

impl LevelInfo {
    pub fn xp_in_level(&self) -> u32 {
        self.current_xp - self.level_floor
    }

    pub fn xp_for_level(&self) -> u32 {
        self.level_ceiling - self.level_floor
    }

    /// Fractional progress toward the next level; 1.0 at the top level.
    pub fn progress(&self) -> f64 {
        if self.xp_for_level() == 0 {
            return 1.0;
        }
        f64::from(self.xp_in_level()) / f64::from(self.xp_for_level())
    }
}

/// Determine level info from total XP.
///
/// Picks the greatest index whose threshold is `<= total_xp`.
pub fn level_info(total_xp: u32) -> LevelInfo {
    let mut level = 0;
    for (i, (threshold, _)) in LEVEL_TABLE.iter().enumerate() {
        if total_xp >= *threshold {
            level = i;
        } else {
            break;
        }
    }

    let (level_floor, title) = LEVEL_TABLE[level];
    let level_ceiling = if level + 1 < LEVEL_TABLE.len() {
        LEVEL_TABLE[level + 1].0
    } else {
        level_floor
    };

    LevelInfo {
        level,
        title,
        current_xp: total_xp,
        level_floor,
        level_ceiling,
    }
}

/// Hint penalty: 0 hints → 0.00, 1 → 0.10, 2 → 0.30, 3+ → 0.50.
fn hint_penalty(hints_used: u32) -> f64 {
    match hints_used {
        0 => 0.0,
        1 => 0.10,
        2 => 0.30,
        _ => 0.50,
    }
}

/// Calculate XP earned for completing an exercise.
///
/// multiplier = 1.0
///   + (difficulty - 1) * 0.10
///   + 0.50 if first_try
///   - hint penalty
/// floored at 0.25; final XP is `floor(base * multiplier)`.
pub fn calculate_xp(base_xp: u32, difficulty: u32, first_try: bool, hints_used: u32) -> u32 {
    let mut multiplier = 1.0;
    multiplier += f64::from(difficulty.saturating_sub(1)) * 0.10;
    if first_try {
        multiplier += 0.50;
    }
    multiplier -= hint_penalty(hints_used);
    multiplier = multiplier.max(MULTIPLIER_FLOOR);
    (f64::from(base_xp) * multiplier).floor() as u32
}
