//! Subdomain generation: `adjective-noun`, drawn from fixed word lists with
//! a cryptographically strong RNG.

use rand::seq::SliceRandom;

pub const ADJECTIVES: &[&str] = &[
    "able", "acid", "agile", "alert", "alive", "ample", "ancient", "arid", "avid", "awake",
    "basic", "bold", "brave", "brief", "bright", "broad", "busy", "calm", "chief", "civil",
    "clean", "clear", "clever", "close", "cold", "cool", "cosmic", "crisp", "curly", "curious",
    "dapper", "dark", "daring", "deep", "dense", "direct", "distant", "dry", "eager", "early",
    "easy", "elder", "epic", "even", "exact", "fair", "famous", "fancy", "fast", "fierce",
    "fine", "firm", "fit", "flat", "fleet", "fluid", "fond", "fresh", "frozen", "full",
    "gentle", "giant", "glad", "gold", "good", "grand", "great", "green", "happy", "hardy",
    "harsh", "heavy", "honest", "huge", "humble", "icy", "ideal", "jolly", "keen", "kind",
    "large", "legal", "light", "lively", "loud", "loyal", "lucky", "lunar", "mellow", "merry",
    "mighty", "mild", "mobile", "modern", "moist", "neat", "new", "noble", "odd", "old",
];

pub const NOUNS: &[&str] = &[
    "anchor", "arrow", "badger", "basin", "beacon", "bear", "bird", "bridge", "brook", "canyon",
    "castle", "cedar", "cloud", "comet", "condor", "coral", "cove", "crane", "crater", "creek",
    "delta", "desert", "dune", "eagle", "echo", "ember", "falcon", "fern", "field", "fjord",
    "forest", "fox", "garden", "glacier", "glade", "harbor", "hawk", "hill", "horizon", "island",
    "jungle", "lagoon", "lake", "lantern", "leaf", "lion", "marsh", "meadow", "mesa", "moon",
    "moss", "mountain", "oak", "ocean", "orchid", "otter", "owl", "panther", "peak", "pebble",
    "pine", "plain", "plateau", "pond", "prairie", "quarry", "rabbit", "raven", "reef", "ridge",
    "river", "rock", "sage", "sand", "shore", "sky", "slope", "spring", "star", "stone",
    "stream", "summit", "swan", "tide", "tiger", "timber", "trail", "tundra", "valley", "viper",
    "wave", "whale", "willow", "wind", "wolf", "wren", "canopy", "cliff", "drift", "grove",
];

/// Draws one adjective and one noun from a cryptographically secure RNG and
/// joins them with a hyphen, e.g. `"brave-tiger"`.
///
/// `thread_rng` is seeded from the OS CSPRNG, unlike a timestamp-seeded
/// generator, which makes subdomains unguessable from launch time.
pub fn generate_subdomain() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("ADJECTIVES is non-empty");
    let noun = NOUNS.choose(&mut rng).expect("NOUNS is non-empty");
    format!("{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn shape_matches_adjective_hyphen_noun() {
        for _ in 0..10_000 {
            let subdomain = generate_subdomain();
            let mut parts = subdomain.split('-');
            let adjective = parts.next().expect("adjective half");
            let noun = parts.next().expect("noun half");
            assert!(parts.next().is_none(), "subdomain had extra segments: {subdomain}");
            assert!(ADJECTIVES.contains(&adjective), "unknown adjective: {adjective}");
            assert!(NOUNS.contains(&noun), "unknown noun: {noun}");
        }
    }

    #[test]
    fn draws_are_not_constant() {
        let samples: HashSet<String> = (0..200).map(|_| generate_subdomain()).collect();
        assert!(samples.len() > 1, "RNG produced the same subdomain every time");
    }
}
