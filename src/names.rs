//! Instance name generation
//!
//! Every clone gets a fresh human-readable name such as `brave-falcon-3fa9`.
//! The random suffix keeps names unique across groups sharing one datacenter.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "calm", "clever", "crisp", "eager", "fancy", "gentle", "happy",
    "jolly", "keen", "lively", "lucky", "mellow", "nimble", "proud", "quiet", "rapid", "silent",
    "steady", "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "cedar", "comet", "falcon", "fjord", "glacier", "harbor", "heron",
    "lagoon", "lynx", "maple", "meadow", "nebula", "otter", "pine", "quartz", "raven", "ridge",
    "river", "summit", "thistle", "tundra", "willow", "zephyr",
];

/// Source of unique VM instance names
pub trait NameGenerator: Send + Sync {
    /// Produce a new instance name
    fn generate(&self) -> String;
}

/// Adjective-noun names with a 4 hex digit random suffix
#[derive(Clone, Debug, Default)]
pub struct RandomNames;

impl NameGenerator for RandomNames {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("vm");
        let suffix: u16 = rng.gen();
        format!("{}-{}-{:04x}", adjective, noun, suffix)
    }
}
