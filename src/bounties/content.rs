//! Built-in game content: criminal roster, star map, rewards, ships.

use crate::bounties::bounty::ShipLoadout;
use crate::bounties::criminal::Criminal;
use crate::bounties::generator::BountyContent;
use crate::error::{BountyError, Result};
use rand::RngCore;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};

/// Credits per system per tech level.
const REWARD_PER_SYSTEM_PER_LEVEL: u64 = 100;

/// (name, security level, neighbours). Security level is the lowest tech
/// level a bounty may start or end in the system.
const SYSTEMS: &[(&str, u8, &[&str])] = &[
    ("Keren", 1, &["Gate", "Talidor", "Mirage"]),
    ("Gate", 1, &["Keren", "Cornucopia", "Augmenta"]),
    ("Talidor", 1, &["Keren", "Prospero", "Nesoc"]),
    ("Mirage", 2, &["Keren", "Buer", "Pescal Inartu"]),
    ("Cornucopia", 2, &["Gate", "Debdes"]),
    ("Augmenta", 3, &["Gate", "Gresthen", "Kaamo"]),
    ("Prospero", 3, &["Talidor", "Vacuus"]),
    ("Nesoc", 4, &["Talidor", "Wah'Norr"]),
    ("Buer", 4, &["Mirage", "Cerberus"]),
    ("Pescal Inartu", 5, &["Mirage", "Ni'mrosh"]),
    ("Debdes", 5, &["Cornucopia", "Gresthen"]),
    ("Gresthen", 6, &["Augmenta", "Debdes", "Ni'mrosh"]),
    ("Kaamo", 6, &["Augmenta", "Vacuus"]),
    ("Vacuus", 7, &["Prospero", "Kaamo", "Wah'Norr"]),
    ("Wah'Norr", 8, &["Nesoc", "Vacuus", "Cerberus"]),
    ("Cerberus", 9, &["Buer", "Wah'Norr", "Ni'mrosh"]),
    ("Ni'mrosh", 10, &["Pescal Inartu", "Gresthen", "Cerberus"]),
];

const CRIMINALS: &[(&str, &str, &[&str])] = &[
    ("Ganfor Doss", "terran", &["ganfor"]),
    ("Kehnor Vhal", "vossk", &["kehnor", "the butcher"]),
    ("Iris Kessane", "midorian", &["iris"]),
    ("Tobiah Marsh", "terran", &["toby"]),
    ("Sket Ulomar", "nivelian", &["sket"]),
    ("Vera Quell", "terran", &[]),
    ("Drossk", "vossk", &[]),
    ("Lyra Tessaly", "midorian", &["lyra"]),
    ("Orrin Fell", "neutral", &["orrin"]),
    ("Maku Daan", "nivelian", &["maku"]),
    ("Hesh Kolvar", "neutral", &["hesh"]),
    ("Pellan Rue", "terran", &["pellan"]),
];

/// (min tech level, hull, weapons, modules)
const SHIPS: &[(u8, &str, &[&str], &[&str])] = &[
    (1, "Lancer", &["Pulse Laser"], &[]),
    (1, "Talon", &["Mass Driver"], &["Shield Booster"]),
    (3, "Kite", &["Pulse Laser", "Mass Driver"], &["Armour Plate"]),
    (5, "Reaver", &["Ion Cannon", "Pulse Laser"], &["Shield Booster"]),
    (7, "Warden", &["Rail Gun", "Ion Cannon"], &["Armour Plate", "Cloak"]),
    (9, "Dreadcaller", &["Rail Gun", "Rail Gun", "Plasma Lance"], &["Cloak"]),
];

/// Content compiled into the binary.
#[derive(Debug, Clone)]
pub struct StaticContent {
    criminals: Vec<Criminal>,
    security: HashMap<String, u8>,
    links: HashMap<String, Vec<String>>,
}

impl Default for StaticContent {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticContent {
    pub fn new() -> Self {
        let criminals = CRIMINALS
            .iter()
            .map(|(name, faction, aliases)| {
                Criminal::new(*name, *faction).with_aliases(aliases.iter().copied())
            })
            .collect();

        let mut security = HashMap::new();
        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        for (name, level, neighbours) in SYSTEMS {
            security.insert((*name).to_owned(), *level);
            for n in *neighbours {
                links.entry((*name).to_owned()).or_default().push((*n).to_owned());
                let back = links.entry((*n).to_owned()).or_default();
                if !back.iter().any(|b| b == name) {
                    back.push((*name).to_owned());
                }
            }
        }
        for adjacent in links.values_mut() {
            adjacent.sort();
            adjacent.dedup();
        }

        Self {
            criminals,
            security,
            links,
        }
    }

    /// Canonical system name for a case-insensitive query.
    pub fn system_name(&self, query: &str) -> Option<&str> {
        let query = query.trim();
        self.security
            .keys()
            .find(|s| s.eq_ignore_ascii_case(query))
            .map(String::as_str)
    }
}

impl BountyContent for StaticContent {
    fn criminals(&self) -> &[Criminal] {
        &self.criminals
    }

    fn random_system(&self, tech_level: u8, rng: &mut dyn RngCore) -> Option<String> {
        let mut eligible: Vec<&String> = self
            .security
            .iter()
            .filter(|(_, level)| **level <= tech_level)
            .map(|(name, _)| name)
            .collect();
        // Sorted so a seeded rng gives repeatable picks.
        eligible.sort();
        eligible.choose(rng).map(|s| (*s).clone())
    }

    /// Breadth-first search, so routes are shortest and never repeat a system.
    fn find_route(&self, start: &str, end: &str) -> Result<Vec<String>> {
        let start = self
            .system_name(start)
            .ok_or_else(|| BountyError::NotFound(format!("system '{start}'")))?;
        let end = self
            .system_name(end)
            .ok_or_else(|| BountyError::NotFound(format!("system '{end}'")))?;

        let mut previous: HashMap<&str, &str> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if current == end {
                let mut route = vec![end.to_owned()];
                let mut at = end;
                while let Some(prev) = previous.get(at) {
                    route.push((*prev).to_owned());
                    at = *prev;
                }
                route.reverse();
                return Ok(route);
            }
            for next in self.links.get(current).into_iter().flatten() {
                if seen.insert(next.as_str()) {
                    previous.insert(next.as_str(), current);
                    queue.push_back(next.as_str());
                }
            }
        }
        Err(BountyError::NotFound(format!("a route from {start} to {end}")))
    }

    fn has_system(&self, name: &str) -> bool {
        self.security.contains_key(name)
    }

    fn reward_for(&self, route_len: usize, tech_level: u8) -> u64 {
        let len = u64::try_from(route_len).unwrap_or(u64::MAX);
        len.saturating_mul(REWARD_PER_SYSTEM_PER_LEVEL)
            .saturating_mul(u64::from(tech_level.max(1)))
    }

    fn ship_for(&self, tech_level: u8, rng: &mut dyn RngCore) -> Option<ShipLoadout> {
        let eligible: Vec<_> = SHIPS.iter().filter(|s| s.0 <= tech_level).collect();
        eligible.choose(rng).map(|(_, hull, weapons, modules)| ShipLoadout {
            hull: (*hull).to_owned(),
            weapons: weapons.iter().map(|w| (*w).to_owned()).collect(),
            modules: modules.iter().map(|m| (*m).to_owned()).collect(),
        })
    }
}
