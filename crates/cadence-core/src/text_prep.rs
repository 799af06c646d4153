//! Text preparation for speech — sentence extraction and markup cleaning.
//!
//! Pure functions, no I/O.

use regex::Regex;
use std::sync::LazyLock;

// Compiled once, reused across calls.
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`]+`").unwrap());
static RE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+•]|\d+[.)])[ \t]+").unwrap());
static RE_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_BOLD_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__([^_]+)__").unwrap());
static RE_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static RE_ITALIC_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_([^_]+)_").unwrap());
static RE_DASH_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_]{2,}|[—–]").unwrap());
static RE_SYMBOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[*#@$%^&()_+=\[\]{}|\\<>/~`"]"#).unwrap());
static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Sentence-terminal punctuation.
pub fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// True if `text` (ignoring trailing whitespace) ends in terminal punctuation.
pub fn ends_with_terminal(text: &str) -> bool {
    text.trim_end().chars().next_back().is_some_and(is_terminal)
}

/// Append a period to `text` unless it already ends a sentence.
///
/// Blank text is left alone so flushing an empty buffer speaks nothing.
pub fn ensure_terminal(text: &mut String) {
    if text.trim().is_empty() || ends_with_terminal(text) {
        return;
    }
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
    text.push('.');
}

/// Take the first complete sentence off the front of `buffer`.
///
/// A sentence runs up to and including the first `.`, `!` or `?`. Returns the
/// trimmed sentence and the tail after the terminator and any whitespace
/// following it. With no terminator the sentence is `None` and the remainder
/// is the whole buffer.
pub fn extract_sentence(buffer: &str) -> (Option<&str>, &str) {
    match buffer.find(is_terminal) {
        Some(pos) => {
            // Terminators are ASCII, so pos + 1 is a char boundary.
            let end = pos + 1;
            (Some(buffer[..end].trim()), buffer[end..].trim_start())
        }
        None => (None, buffer),
    }
}

/// Strip markup and symbols a synthesis engine would otherwise read aloud.
///
/// Handles: links, inline code, list bullets, bold/italic (`**`, `*`, `__`,
/// `_`), dash runs, stray symbol punctuation, whitespace runs. Returns an
/// empty string when nothing pronounceable is left.
pub fn clean_for_speech(text: &str) -> String {
    let mut c = RE_LINK.replace_all(text, "$1").into_owned();
    c = RE_INLINE_CODE.replace_all(&c, "").into_owned();
    c = RE_BULLET.replace_all(&c, "").into_owned();
    c = RE_BOLD.replace_all(&c, "$1").into_owned();
    c = RE_BOLD_UNDERSCORE.replace_all(&c, "$1").into_owned();
    c = RE_ITALIC.replace_all(&c, "$1").into_owned();
    c = RE_ITALIC_UNDERSCORE.replace_all(&c, "$1").into_owned();
    c = RE_DASH_RUN.replace_all(&c, " ").into_owned();
    c = RE_SYMBOLS.replace_all(&c, "").into_owned();
    c = RE_WHITESPACE.replace_all(&c, " ").into_owned();

    let c = c.trim();
    if !c.chars().any(char::is_alphanumeric) {
        return String::new();
    }
    c.to_string()
}

/// Split text into sentences the same way the playback controller consumes a
/// buffer: repeated [`extract_sentence`], with any unterminated tail last.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut rest = text;
    loop {
        match extract_sentence(rest) {
            (Some(sentence), tail) => {
                sentences.push(sentence.to_string());
                rest = tail;
            }
            (None, tail) => {
                let tail = tail.trim();
                if !tail.is_empty() {
                    sentences.push(tail.to_string());
                }
                return sentences;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── extract_sentence ────────────────────────────────────────────

    #[test]
    fn extracts_first_sentence() {
        let (sentence, rest) = extract_sentence("Hello world. More text");
        assert_eq!(sentence, Some("Hello world."));
        assert_eq!(rest, "More text");
    }

    #[test]
    fn no_terminator_leaves_buffer() {
        let (sentence, rest) = extract_sentence("no punctuation yet");
        assert_eq!(sentence, None);
        assert_eq!(rest, "no punctuation yet");
    }

    #[test]
    fn terminator_at_end_of_buffer() {
        let (sentence, rest) = extract_sentence("  Is it done?");
        assert_eq!(sentence, Some("Is it done?"));
        assert_eq!(rest, "");
    }

    #[test]
    fn terminator_without_following_space() {
        let (sentence, rest) = extract_sentence("Wow!Next");
        assert_eq!(sentence, Some("Wow!"));
        assert_eq!(rest, "Next");
    }

    #[test]
    fn skips_newlines_after_terminator() {
        let (sentence, rest) = extract_sentence("One.\n\nTwo.");
        assert_eq!(sentence, Some("One."));
        assert_eq!(rest, "Two.");
    }

    #[test]
    fn handles_multibyte_text() {
        let (sentence, rest) = extract_sentence("Café ouvert. Déjà vu");
        assert_eq!(sentence, Some("Café ouvert."));
        assert_eq!(rest, "Déjà vu");
    }

    // ── ends_with_terminal / ensure_terminal ────────────────────────

    #[test]
    fn detects_trailing_terminal() {
        assert!(ends_with_terminal("Done. "));
        assert!(ends_with_terminal("Really?"));
        assert!(!ends_with_terminal("trailing"));
        assert!(!ends_with_terminal(""));
    }

    #[test]
    fn appends_period_when_missing() {
        let mut text = "trailing fragment  ".to_string();
        ensure_terminal(&mut text);
        assert_eq!(text, "trailing fragment.");

        let mut done = "Already done!".to_string();
        ensure_terminal(&mut done);
        assert_eq!(done, "Already done!");

        let mut blank = "   ".to_string();
        ensure_terminal(&mut blank);
        assert_eq!(blank, "   ");
    }

    // ── clean_for_speech ────────────────────────────────────────────

    #[test]
    fn strips_markup_and_dash_runs() {
        assert_eq!(
            clean_for_speech("**Warning:** check _this_ — now"),
            "Warning: check this now"
        );
    }

    #[test]
    fn strips_bold_and_italic() {
        assert_eq!(clean_for_speech("this is **bold** and *italic*"), "this is bold and italic");
        assert_eq!(clean_for_speech("__strong__ words"), "strong words");
    }

    #[test]
    fn strips_bullets_per_line() {
        assert_eq!(clean_for_speech("- first\n* second\n2. third"), "first second third");
    }

    #[test]
    fn collapses_dash_runs() {
        assert_eq!(clean_for_speech("above --- below"), "above below");
        assert_eq!(clean_for_speech("well-known"), "well-known");
    }

    #[test]
    fn strips_symbols() {
        assert_eq!(clean_for_speech("## Heading (draft) [v2] <ok>"), "Heading draft v2 ok");
        assert_eq!(clean_for_speech("say \"hi\" @ 5% ~ now"), "say hi 5 now");
    }

    #[test]
    fn strips_links_and_inline_code() {
        assert_eq!(
            clean_for_speech("click [here](https://example.com) to run `make`."),
            "click here to run ."
        );
    }

    #[test]
    fn symbol_only_text_cleans_to_empty() {
        assert_eq!(clean_for_speech("***"), "");
        assert_eq!(clean_for_speech("."), "");
        assert_eq!(clean_for_speech(""), "");
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(
            clean_for_speech("Hello, how are you today?"),
            "Hello, how are you today?"
        );
    }

    // ── split_sentences ─────────────────────────────────────────────

    #[test]
    fn split_sentences_basic() {
        let s = split_sentences("Hello world. How are you? I am fine!");
        assert_eq!(s, vec!["Hello world.", "How are you?", "I am fine!"]);
    }

    #[test]
    fn split_sentences_keeps_tail() {
        let s = split_sentences("Really? Yes! OK. Done");
        assert_eq!(s, vec!["Really?", "Yes!", "OK.", "Done"]);
    }

    #[test]
    fn split_sentences_empty() {
        assert!(split_sentences("   ").is_empty());
    }
}
