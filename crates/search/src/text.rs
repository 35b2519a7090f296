//! Tokenizing, term processing and bounded edit distance.

use std::collections::BTreeMap;

use smallvec::SmallVec;

fn fold_char(ch: char) -> char { if ch == 'ä' { 'a' } else { ch } }

/// `text` with the characters the tokenizer folds replaced one for one, so
/// char positions in the result are positions in `text`.
pub fn fold(text: &str) -> String { text.chars().map(fold_char).collect() }

/// Split text into lowercase ASCII alphanumeric tokens. `ä` folds to `a`;
/// every other character is a separator.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in text.chars().map(fold_char) {
        if ch.is_ascii_alphanumeric() {
            cur.push(ch.to_ascii_lowercase());
        } else if !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() { out.push(cur); }
    out
}

/// Expansion table keyed the way tokens come out of [`tokenize`].
pub fn normalize_expansions(expansions: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
    expansions.iter().map(|(k, v)| (fold(k).to_lowercase(), v.clone())).collect()
}

/// Terms a token is indexed under: the expansion list when one is
/// configured for it, otherwise the token itself. `expansions` must be
/// keyed by [`normalize_expansions`].
pub fn index_terms(token: &str, expansions: &BTreeMap<String, Vec<String>>) -> SmallVec<[String; 2]> {
    match expansions.get(token) {
        Some(terms) if !terms.is_empty() => terms.iter().map(|t| t.to_ascii_lowercase()).collect(),
        _ => smallvec::smallvec![token.to_string()],
    }
}

/// Whether `a` and `b` are within `max` edits (insert, delete, substitute).
pub fn levenshtein_within(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    // length difference is a lower bound on the distance
    if a.len().abs_diff(b.len()) > max { return false; }

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ac) in a.iter().enumerate() {
        let mut diag = row[0];
        row[0] = i + 1;
        let mut row_min = row[0];
        for (j, bc) in b.iter().enumerate() {
            let up = row[j + 1];
            let cost = usize::from(ac != bc);
            row[j + 1] = (up + 1).min(row[j] + 1).min(diag + cost);
            diag = up;
            row_min = row_min.min(row[j + 1]);
        }
        // no cell in this row can come back under the bound
        if row_min > max { return false; }
    }
    row[b.len()] <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_punctuation() {
        assert_eq!(tokenize("Spearphishing <Link>, T1566.002"), vec!["spearphishing", "link", "t1566", "002"]);
        assert_eq!(tokenize("  \\<b\\>  "), vec!["b"]);
        assert!(tokenize("...---").is_empty());
    }

    #[test]
    fn tokenize_folds_a_umlaut() {
        assert_eq!(tokenize("Doppelgänging"), vec!["doppelganging"]);
        // other non-ascii letters separate
        assert_eq!(tokenize("café"), vec!["caf"]);
    }

    #[test]
    fn expansions_replace_token() {
        let mut ex = BTreeMap::new();
        ex.insert("powershell".to_string(), vec!["powershell".to_string(), "shell".to_string()]);
        assert_eq!(index_terms("powershell", &ex).as_slice(), ["powershell", "shell"]);
        assert_eq!(index_terms("bash", &ex).as_slice(), ["bash"]);
    }

    #[test]
    fn fold_keeps_char_positions() {
        assert_eq!(fold("Doppelgänging"), "Doppelganging");
        assert_eq!(fold("Doppelgänging").chars().count(), "Doppelgänging".chars().count());
    }

    #[test]
    fn expansion_keys_match_tokens() {
        let mut ex = BTreeMap::new();
        ex.insert("PowerShell".to_string(), vec!["powershell".to_string(), "Shell".to_string()]);
        ex.insert("Doppelgänging".to_string(), vec!["doppelganging".to_string(), "ganging".to_string()]);
        let ex = normalize_expansions(&ex);
        assert_eq!(index_terms("powershell", &ex).as_slice(), ["powershell", "shell"]);
        assert_eq!(index_terms("doppelganging", &ex).as_slice(), ["doppelganging", "ganging"]);
    }

    #[test]
    fn edit_distance_bounds() {
        assert!(levenshtein_within("phishing", "phishing", 0));
        assert!(levenshtein_within("phising", "phishing", 1));
        assert!(levenshtein_within("t1058", "t1059", 1));
        assert!(!levenshtein_within("t1058", "t1069", 1));
        assert!(!levenshtein_within("a", "abcdef", 2));
        assert!(levenshtein_within("", "ab", 2));
    }
}
