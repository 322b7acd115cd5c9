use lazy_static::lazy_static;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

/// Part-of-speech classes recognized by the analyzer. Everything except
/// `Content` is a closed class and is never indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    Conjunction,
    Preposition,
    Pronoun,
    ShortAdjective,
    Interjection,
    Gerund,
    Particle,
    Content,
}

impl WordClass {
    pub fn is_indexable(self) -> bool {
        self == WordClass::Content
    }
}

/// One morphological reading of a surface word.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub lemma: String,
    pub class: WordClass,
}

/// Morphological analyzer: surface word -> candidate normalized forms with
/// part-of-speech tags. Implementations must be stateless per call so many
/// fetch tasks can share one instance.
pub trait MorphAnalyzer: Send + Sync {
    fn analyze(&self, word: &str) -> Vec<Analysis>;
}

lazy_static! {
    static ref TOKEN_STRIP: Regex = Regex::new(r"[^\p{L}\s]").expect("valid regex");
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
    static ref FUNCTION_WORDS: HashMap<&'static str, WordClass> = {
        use WordClass::*;
        let mut m = HashMap::new();
        for w in [
            "and", "but", "or", "nor", "yet", "so", "because", "although", "though",
            "while", "whereas", "if", "unless", "until", "since", "than", "whether",
            "once", "when", "whenever", "where", "wherever", "after", "before", "as",
        ] {
            m.insert(w, Conjunction);
        }
        for w in [
            "of", "in", "to", "for", "with", "on", "at", "from", "by", "about",
            "into", "onto", "over", "under", "between", "through", "during",
            "against", "among", "within", "without", "toward", "towards", "upon",
            "across", "behind", "beyond", "near", "off", "above", "below", "along",
            "around", "down", "up", "out", "per", "via",
        ] {
            m.insert(w, Preposition);
        }
        for w in [
            "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us",
            "them", "my", "your", "his", "its", "our", "their", "mine", "yours",
            "hers", "ours", "theirs", "myself", "yourself", "himself", "herself",
            "itself", "ourselves", "yourselves", "themselves", "this", "that",
            "these", "those", "who", "whom", "whose", "which", "what", "anyone",
            "someone", "everyone", "nobody", "anybody", "anything", "something",
            "everything", "nothing", "each", "either", "neither", "both", "few",
            "some", "any", "all", "one", "none",
        ] {
            m.insert(w, Pronoun);
        }
        // Articles and other determiners ride with the particle class.
        for w in ["the", "a", "an", "not", "no", "too", "very", "just", "only"] {
            m.insert(w, Particle);
        }
        for w in [
            "oh", "ah", "wow", "ouch", "hey", "hmm", "oops", "alas", "uh", "um",
            "er", "yeah", "hello", "hi",
        ] {
            m.insert(w, Interjection);
        }
        m
    };
}

/// Default analyzer: closed classes come from a static function-word table,
/// every other word yields one content reading, its stem.
pub struct StemmerAnalyzer;

impl MorphAnalyzer for StemmerAnalyzer {
    fn analyze(&self, word: &str) -> Vec<Analysis> {
        if let Some(&class) = FUNCTION_WORDS.get(word) {
            return vec![Analysis { lemma: word.to_string(), class }];
        }
        vec![Analysis {
            lemma: STEMMER.stem(word).to_string(),
            class: WordClass::Content,
        }]
    }
}

/// Maps text to lemma -> occurrence count. NFKC-normalizes, lowercases,
/// strips everything outside the letter alphabet, then analyzes each
/// whitespace token and drops closed-class readings. Pure; each call owns
/// its accumulator.
pub fn lemmatize(text: &str) -> HashMap<String, u32> {
    lemmatize_with(&StemmerAnalyzer, text)
}

pub fn lemmatize_with(analyzer: &dyn MorphAnalyzer, text: &str) -> HashMap<String, u32> {
    let normalized = text.nfkc().collect::<String>().to_lowercase();
    let cleaned = TOKEN_STRIP.replace_all(&normalized, "");
    let mut counts: HashMap<String, u32> = HashMap::new();
    for word in cleaned.split_whitespace() {
        for analysis in analyzer.analyze(word) {
            if !analysis.class.is_indexable() {
                continue;
            }
            *counts.entry(analysis.lemma).or_insert(0) += 1;
        }
    }
    counts
}
