//! Voice catalog entries and ranked voice selection.

use serde::{Deserialize, Serialize};

/// One entry of the synthesis engine's voice catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    /// BCP 47 style tag, e.g. `en-US`.
    pub language: String,
    pub uri: String,
}

/// Exact-match predicate for the preferred-voice list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMatcher {
    Name(String),
    Uri(String),
}

impl VoiceMatcher {
    pub fn matches(&self, voice: &Voice) -> bool {
        match self {
            Self::Name(name) => voice.name == *name,
            Self::Uri(uri) => voice.uri == *uri,
        }
    }
}

/// Ranked voice preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePreferences {
    /// Known good voices, best first.
    pub preferred: Vec<VoiceMatcher>,
    /// Name words marking a male voice.
    pub male_tokens: Vec<String>,
    /// Name words marking a high quality voice.
    pub quality_tokens: Vec<String>,
    /// Language tag prefix counted as English.
    pub language_prefix: String,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        let words = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };
        Self {
            preferred: ["am_michael", "am_fenrir", "bm_george", "am_puck", "bm_fable"]
                .into_iter()
                .map(|name| VoiceMatcher::Name(name.into()))
                .collect(),
            male_tokens: words(&[
                "male", "man", "guy", "am", "bm", "david", "mark", "daniel", "george",
                "michael", "adam",
            ]),
            quality_tokens: words(&["natural", "neural", "premium", "enhanced"]),
            language_prefix: "en".into(),
        }
    }
}

impl VoicePreferences {
    fn is_english(&self, voice: &Voice) -> bool {
        voice
            .language
            .to_ascii_lowercase()
            .starts_with(&self.language_prefix.to_ascii_lowercase())
    }
}

/// Pick the best voice from `catalog`.
///
/// Ranking: preferred list in order, then English male + quality, then
/// English male, then any English, then the first voice. `None` only for an
/// empty catalog.
pub fn pick_voice<'a>(catalog: &'a [Voice], prefs: &VoicePreferences) -> Option<&'a Voice> {
    let preferred = prefs
        .preferred
        .iter()
        .find_map(|m| catalog.iter().find(|v| m.matches(v)));
    if preferred.is_some() {
        return preferred;
    }

    let english = || catalog.iter().filter(|v| prefs.is_english(v));

    english()
        .find(|v| has_token(v, &prefs.male_tokens) && has_token(v, &prefs.quality_tokens))
        .or_else(|| english().find(|v| has_token(v, &prefs.male_tokens)))
        .or_else(|| english().next())
        .or_else(|| catalog.first())
}

/// Whole-word, case-insensitive match, so "female" never counts as "male".
fn has_token(voice: &Voice, tokens: &[String]) -> bool {
    voice
        .name
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| tokens.iter().any(|t| t.eq_ignore_ascii_case(word)))
}
