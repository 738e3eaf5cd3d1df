//! Diceware-style passphrase generation and sign-in validation.
//!
//! Sign-up generates a passphrase the person memorises; sign-in accepts one
//! typed back and checks it is plausible before paying the KDF cost. The
//! rule matches the original behaviour: at least eight words, every word on
//! the list.

use rand::Rng;

use crate::error::IdentityError;

/// Minimum accepted word count for sign-in. Eight words from this list is
/// comfortably past 100 bits.
pub const MIN_WORDS: usize = 8;

/// Default word count for generated passphrases.
pub const DEFAULT_WORDS: usize = 13;

/// 256 words, 8 bits each.
static WORDS: [&str; 256] = [
    "acorn", "alloy", "amber", "anchor", "anvil", "apron", "arrow", "aspen",
    "atlas", "autumn", "badge", "bagel", "bamboo", "banjo", "barley", "basil",
    "beacon", "bellow", "birch", "bishop", "bison", "blanket", "blossom", "bolt",
    "bonnet", "border", "bottle", "bramble", "brass", "breeze", "brick", "bridge",
    "bronze", "brook", "bucket", "bundle", "burrow", "butter", "cabin", "cactus",
    "camel", "candle", "canoe", "canvas", "canyon", "carbon", "cargo", "carpet",
    "castle", "cedar", "cellar", "chalk", "channel", "chapel", "cherry", "chisel",
    "cider", "cinder", "citrus", "clover", "cobalt", "cocoa", "comet", "compass",
    "copper", "coral", "cotton", "cradle", "crater", "cricket", "crystal", "cumin",
    "current", "cypress", "dagger", "dahlia", "daisy", "dapple", "debris", "delta",
    "denim", "dewdrop", "dinghy", "dollar", "dolphin", "domino", "donkey", "drift",
    "dune", "dusk", "eagle", "easel", "echo", "elbow", "ember", "emerald",
    "engine", "estate", "fabric", "falcon", "fennel", "ferry", "fiddle", "fig",
    "finch", "fjord", "flint", "flora", "fossil", "fountain", "fox", "freight",
    "frost", "gable", "galaxy", "garlic", "gazelle", "geyser", "ginger", "glacier",
    "goblet", "goose", "granite", "grape", "gravel", "grove", "guitar", "gull",
    "hammer", "hamper", "harbor", "harvest", "hazel", "heron", "hickory", "hinge",
    "hollow", "honey", "hoop", "hornet", "husk", "icicle", "indigo", "ingot",
    "iris", "island", "ivory", "jacket", "jaguar", "jasmine", "jelly", "jigsaw",
    "jubilee", "juniper", "kayak", "kernel", "kettle", "kiln", "kiosk", "kiwi",
    "lagoon", "lantern", "lapel", "larch", "latch", "lava", "lemon", "lichen",
    "lilac", "linen", "lintel", "lizard", "lobster", "locket", "loft", "lunar",
    "mango", "mantle", "maple", "marble", "meadow", "melon", "mesa", "mineral",
    "mint", "mosaic", "mulberry", "mural", "mustard", "napkin", "nectar", "nickel",
    "nimbus", "nutmeg", "oasis", "ocean", "octopus", "olive", "onyx", "orchard",
    "osprey", "otter", "oyster", "paddle", "pagoda", "palm", "panther", "parsley",
    "pebble", "pelican", "pepper", "pigeon", "pillar", "pine", "pistachio", "plank",
    "plaza", "plum", "pocket", "pond", "poplar", "prairie", "prism", "pumpkin",
    "quarry", "quartz", "quill", "quilt", "raccoon", "radish", "raft", "raven",
    "reef", "ribbon", "ridge", "ripple", "river", "robin", "rustic", "saddle",
    "saffron", "sage", "salmon", "sandal", "sapphire", "satchel", "seagull", "shale",
    "shutter", "sierra", "silver", "sketch", "slate", "sparrow", "spruce", "summit",
];

/// Generate a space-separated passphrase of `words` list words.
pub fn generate_passphrase(words: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..words)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate a typed-back passphrase: at least [`MIN_WORDS`] words, all from
/// the list. Case- and surrounding-whitespace-insensitive.
pub fn validate_passphrase(passphrase: &str) -> Result<(), IdentityError> {
    let words: Vec<&str> = passphrase.split_whitespace().collect();
    if words.len() < MIN_WORDS {
        return Err(IdentityError::WeakPassphrase(format!(
            "need at least {MIN_WORDS} words, got {}",
            words.len()
        )));
    }
    for word in &words {
        let lowered = word.to_lowercase();
        if !WORDS.contains(&lowered.as_str()) {
            return Err(IdentityError::WeakPassphrase(format!(
                "'{word}' is not a word from the passphrase list"
            )));
        }
    }
    Ok(())
}
