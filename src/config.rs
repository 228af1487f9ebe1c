use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};

use crate::game::WORDS_PER_GAME;
use crate::types::ServerConfig;
use crate::wordset::WordSets;

const DEFAULT_WORDS: &str = "\
AFRICA AGENT AIR ALIEN ALPS AMAZON AMBULANCE AMERICA ANGEL ANTARCTICA APPLE ARM ATLANTIS
AUSTRALIA AZTEC BACK BALL BAND BANK BAR BARK BAT BATTERY BEACH BEAR BEAT BED BEIJING BELL
BELT BERLIN BERMUDA BERRY BILL BLOCK BOARD BOLT BOMB BOND BOOM BOOT BOTTLE BOW BOX BRIDGE
BRUSH BUCK BUFFALO BUG BUGLE BUTTON CALF CANADA CAP CAPITAL CAR CARD CARROT CASINO CAST CAT
CELL CENTAUR CENTER CHAIR CHANGE CHARGE CHECK CHEST CHICK CHINA CHOCOLATE CHURCH CIRCLE CLIFF
CLOAK CLUB CODE COLD COMIC COMPOUND CONCERT CONDUCTOR CONTRACT COOK COPPER COTTON COURT COVER
CRANE CRASH CRICKET CROSS CROWN CYCLE CZECH DANCE DATE DAY DEATH DECK DEGREE DIAMOND DICE
DINOSAUR DISEASE DOCTOR DOG DRAFT DRAGON DRESS DRILL DROP DUCK DWARF EAGLE EGYPT EMBASSY
ENGINE ENGLAND EUROPE EYE FACE FAIR FALL FAN FENCE FIELD FIGHTER FIGURE FILE FILM FIRE FISH
FLUTE FLY FOOT FORCE FOREST FORK FRANCE GAME GAS GENIUS GERMANY GHOST GIANT GLASS GLOVE GOLD
GRACE GRASS GREECE GREEN GROUND HAM HAND HAWK HEAD HEART HELICOPTER HIMALAYAS HOLE HOLLYWOOD
HONEY HOOD HOOK HORN HORSE HOSPITAL HOTEL ICE INDIA IRON IVORY JACK JAM JET JUPITER
KANGAROO KETCHUP KEY KID KING KIWI KNIFE KNIGHT LAB LAP LASER LAWYER LEAD LEMON LEPRECHAUN
LIFE LIGHT LIMOUSINE LINE LINK LION LITTER LOCK LOG LONDON LUCK MAIL MAMMOTH MAPLE
MARBLE MARCH MASS MATCH MERCURY MEXICO MICROSCOPE MILLIONAIRE MINE MINT MISSILE MODEL MOLE
MOON MOSCOW MOUNT MOUSE MOUTH MUG NAIL NEEDLE NET NIGHT NINJA NOTE NOVEL NURSE NUT
OCTOPUS OIL OLIVE OLYMPUS OPERA ORANGE ORGAN PALM PAN PANTS PAPER PARACHUTE PARK PART PASS
PASTE PENGUIN PHOENIX PIANO PIE PILOT PIN PIPE PIRATE PISTOL PIT PITCH PLANE PLASTIC PLATE
PLATYPUS PLAY PLOT POINT POISON POLE POLICE POOL PORT POST POUND PRESS PRINCESS PUMPKIN PUPIL
PYRAMID QUEEN RABBIT RACKET RAY REVOLUTION RING ROBIN ROBOT ROCK ROME ROOT ROSE ROULETTE ROUND
ROW RULER SATELLITE SATURN SCALE SCHOOL SCIENTIST SCORPION SCREEN SEAL SERVER SHADOW
SHAKESPEARE SHARK SHIP SHOE SHOP SHOT SINK SKYSCRAPER SLIP SLUG SMUGGLER SNOW SNOWMAN SOCK
SOLDIER SOUL SOUND SPACE SPELL SPIDER SPIKE SPINE SPOT SPRING SPY SQUARE STADIUM STAFF STAR
STATE STICK STOCK STRAW STREAM STRIKE STRING SUB SUIT SUPERHERO SWING SWITCH TABLE TABLET TAG
TAIL TAP TEACHER TELESCOPE TEMPLE THEATER THIEF THUMB TICK TIE TIME TOKYO TOOTH TORCH TOWER
TRACK TRAIN TRIANGLE TRIP TRUNK TUBE TURKEY UNDERTAKER UNICORN VACUUM VAN VET WAKE WALL WAR
WASHER WASHINGTON WATCH WATER WAVE WEB WELL WHALE WHIP WIND WITCH WORM YARD";

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() -> anyhow::Result<()> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).context("Failed to create config directory")?;
    }

    let server_path = config_path("server.json");
    if !server_path.exists() {
        let defaults = serde_json::to_string_pretty(&ServerConfig::default())?;
        fs::write(&server_path, defaults).context("Failed to write default server.json")?;
    }

    let words_path = config_path("words.txt");
    if !words_path.exists() {
        let words: Vec<&str> = DEFAULT_WORDS.split_whitespace().collect();
        fs::write(&words_path, words.join("\n") + "\n").context("Failed to write default words.txt")?;
    }
    Ok(())
}

/// Load the server configuration. `CHECKPOINT_PASSWORD` overrides the file.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
    let path = config_path("server.json");
    let data = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut config: ServerConfig = serde_json::from_str(&data).context("Failed to parse server.json")?;
    if let Ok(pw) = std::env::var("CHECKPOINT_PASSWORD") {
        config.checkpoint_password = pw;
    }
    Ok(config)
}

/// Load the default word pool, one word per line.
pub fn load_default_words(word_sets: &WordSets) -> anyhow::Result<Arc<[String]>> {
    let path = config_path("words.txt");
    let data = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_words(&data, word_sets)
}

fn parse_words(data: &str, word_sets: &WordSets) -> anyhow::Result<Arc<[String]>> {
    let lines: Vec<&str> = data.lines().collect();
    let (id, words) = word_sets.canonicalize(&lines)?;
    if words.len() < WORDS_PER_GAME {
        bail!("default word list needs at least {} words", WORDS_PER_GAME);
    }
    tracing::info!(words = words.len(), id = %id, "Loaded default word set");
    Ok(words)
}

pub fn port() -> anyhow::Result<u16> {
    std::env::var("PORT")
        .unwrap_or_else(|_| "9091".to_string())
        .parse()
        .context("Invalid PORT")
}

/// Database directory. An empty `DB_DIR` runs without persistence.
pub fn db_dir() -> Option<PathBuf> {
    match std::env::var("DB_DIR") {
        Ok(dir) if dir.is_empty() => None,
        Ok(dir) => Some(PathBuf::from(dir)),
        Err(_) => Some(Path::new(".").join("db")),
    }
}

/// Peer to copy the database from, when set.
pub fn bootstrap_url() -> Option<String> {
    std::env::var("BOOTSTRAP_URL").ok().filter(|u| !u.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_words_are_a_valid_pool() {
        let sets = WordSets::new();
        let data = DEFAULT_WORDS.split_whitespace().collect::<Vec<_>>().join("\n");
        let words = parse_words(&data, &sets).unwrap();
        assert!(words.len() >= 4 * WORDS_PER_GAME);
    }

    #[test]
    fn test_short_word_list_is_rejected() {
        let sets = WordSets::new();
        assert!(parse_words("ONE\nTWO\n\nTHREE\n", &sets).is_err());
        assert!(parse_words("", &sets).is_err());
    }

    #[test]
    fn test_server_config_defaults_fill_missing_fields() {
        let config: ServerConfig = serde_json::from_str(r#"{"checkpointPassword": "hunter2"}"#).unwrap();
        assert_eq!(config.checkpoint_password, "hunter2");
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.poll_timeout().as_secs(), 15);
        assert_eq!(config.eviction().max_age, chrono::TimeDelta::hours(12));
    }
}
