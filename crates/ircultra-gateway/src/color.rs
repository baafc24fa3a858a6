//! Display color allocation. Deterministic in the seed `alias|ip`: the
//! seed hashes to a starting slot, the probe prefers palette entries no
//! live session is using, and an exhausted palette falls back to a
//! procedurally generated HSL color (still seed-deterministic).

use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

pub const PALETTE: [&str; 32] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324", "#fffac8", "#800000", "#aaffc3",
    "#808000", "#ffd8b1", "#000075", "#a9a9a9", "#2f4f4f", "#ff7f50", "#6495ed", "#dc143c",
    "#00ced1", "#ff8c00", "#8fbc8f", "#483d8b", "#20b2aa", "#9370db", "#3eb489", "#cd5c5c",
];

fn seed_hash(seed: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    hasher.finish()
}

/// Pick a color for `alias|ip`, avoiding colors already in use when the
/// palette still has free entries.
pub fn pick_color(alias: &str, ip: &str, in_use: &HashSet<String>) -> String {
    let seed = format!("{alias}|{ip}");
    let hash = seed_hash(&seed);
    let start = (hash % PALETTE.len() as u64) as usize;

    for offset in 0..PALETTE.len() {
        let candidate = PALETTE[(start + offset) % PALETTE.len()];
        if !in_use.contains(candidate) {
            return candidate.to_string();
        }
    }

    // Palette exhausted: procedural HSL, still a pure function of the seed.
    let hue = hash % 360;
    let saturation = 55 + (hash >> 16) % 35;
    let lightness = 45 + (hash >> 32) % 20;
    format!("hsl({hue}, {saturation}%, {lightness}%)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_color() {
        let none = HashSet::new();
        assert_eq!(
            pick_color("alpha", "1.2.3.4", &none),
            pick_color("alpha", "1.2.3.4", &none)
        );
    }

    #[test]
    fn prefers_unused_palette_entries() {
        let none = HashSet::new();
        let first = pick_color("alpha", "1.2.3.4", &none);

        let mut used = HashSet::new();
        used.insert(first.clone());
        let second = pick_color("alpha", "1.2.3.4", &used);
        assert_ne!(first, second);
        assert!(PALETTE.contains(&second.as_str()));
    }

    #[test]
    fn exhausted_palette_falls_back_to_hsl() {
        let all: HashSet<String> = PALETTE.iter().map(|c| c.to_string()).collect();
        let color = pick_color("alpha", "1.2.3.4", &all);
        assert!(color.starts_with("hsl("));
        // Fallback stays deterministic too.
        assert_eq!(color, pick_color("alpha", "1.2.3.4", &all));
    }
}
